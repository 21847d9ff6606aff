use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{Chat, Message, Sender, Turn};
use crate::repositories::{ChatRepository, RepositoryError};
use crate::services::auth_service::IdentityProvider;
use crate::services::backoff::BackoffConfig;
use crate::services::completion_service::{CompletionSource, StreamChunk};

/// Committed in place of an assistant answer cancelled before any text arrived.
pub const CANCELLED_SENTINEL: &str = "Response cancelled";

const EVENT_CAPACITY: usize = 256;

/// Lifecycle of the outstanding request of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingFirstToken,
    Streaming,
    Committing,
    Cancelled,
    Failed,
}

impl Phase {
    /// Whether `cancel()` has anything to act on.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Phase::AwaitingFirstToken | Phase::Streaming)
    }
}

/// Events emitted by a session for decoupled UI updates.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged(Phase),
    ChatCreated { chat_id: String },
    UserMessageAdded(Message),
    /// The optimistic user message could not be persisted and was removed.
    UserMessageRetracted { message_id: String },
    Fragment { text: String },
    AssistantCommitted(Message),
    /// The assistant message stays in the transcript but was not persisted.
    CommitFailed { message: Message, error: String },
    StreamFailed { notice: String },
}

/// How one request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Completed(Message),
    Cancelled(Message),
    Failed(String),
    CommitFailed { message: Message, error: String },
}

impl RequestOutcome {
    /// The assistant message this request produced, persisted or not.
    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::Completed(m) | Self::Cancelled(m) => Some(m),
            Self::CommitFailed { message, .. } => Some(message),
            Self::Failed(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No signed-in user to own the chat")]
    NoActiveSession,

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Session has no chat yet")]
    NoChat,

    #[error(transparent)]
    Store(#[from] RepositoryError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Extra attempts for an assistant commit that failed transiently
    pub commit_retries: u32,
    /// Pause before each commit retry
    pub commit_backoff: BackoffConfig,
    pub cancelled_text: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            commit_retries: 1,
            commit_backoff: BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(2)),
            cancelled_text: CANCELLED_SENTINEL.to_string(),
        }
    }
}

/// Consistent copy of the session state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub chat_id: Option<String>,
    pub phase: Phase,
    pub messages: Vec<Message>,
    /// Text received so far for the in-flight answer (kept after a failure).
    pub streaming_text: String,
    /// Transient user-facing notice, e.g. a stream error.
    pub notice: Option<String>,
}

struct SessionState {
    chat_id: Option<String>,
    messages: Vec<Message>,
    accumulated: String,
    phase: Phase,
    notice: Option<String>,
    active_token: Option<CancellationToken>,
}

impl SessionState {
    fn empty() -> Self {
        Self {
            chat_id: None,
            messages: Vec::new(),
            accumulated: String::new(),
            phase: Phase::Idle,
            notice: None,
            active_token: None,
        }
    }

    /// Creation time for the next message; never earlier than the last one.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        self.messages
            .last()
            .map_or(now, |last| last.created_at.max(now))
    }
}

enum Ending {
    Completed,
    Cancelled,
}

enum Next {
    Cancelled,
    Chunk(Option<StreamChunk>),
}

struct Shared {
    store: Arc<dyn ChatRepository>,
    completions: Arc<dyn CompletionSource>,
    identity: Arc<dyn IdentityProvider>,
    config: SessionConfig,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&self, state: &mut SessionState, phase: Phase) {
        if state.phase != phase {
            state.phase = phase;
            self.emit(SessionEvent::PhaseChanged(phase));
        }
    }

    fn cancel(&self) -> bool {
        let state = self.state.lock();
        match (&state.active_token, state.phase.is_cancellable()) {
            (Some(token), true) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    fn append(&self, text: &str) {
        let mut state = self.state.lock();
        if state.phase == Phase::AwaitingFirstToken {
            self.set_phase(&mut state, Phase::Streaming);
        }
        state.accumulated.push_str(text);
        self.emit(SessionEvent::Fragment {
            text: text.to_string(),
        });
    }

    fn fail(&self, reason: &str) -> RequestOutcome {
        let notice = format!("Stream error!: {reason}");
        let mut state = self.state.lock();
        state.active_token = None;
        self.set_phase(&mut state, Phase::Failed);
        state.notice = Some(notice.clone());
        self.emit(SessionEvent::StreamFailed {
            notice: notice.clone(),
        });
        self.set_phase(&mut state, Phase::Idle);
        warn!(%reason, "Completion stream failed");
        RequestOutcome::Failed(notice)
    }

    async fn finish(&self, chat_id: &str, ending: Ending) -> RequestOutcome {
        let message = {
            let mut state = self.state.lock();
            state.active_token = None;
            if matches!(ending, Ending::Cancelled) {
                self.set_phase(&mut state, Phase::Cancelled);
            }
            self.set_phase(&mut state, Phase::Committing);

            let content = if state.accumulated.is_empty() {
                self.config.cancelled_text.clone()
            } else {
                state.accumulated.clone()
            };
            Message::new(chat_id, Sender::Assistant, content, state.next_timestamp())
        };

        let persisted = self.persist_with_retry(&message).await;

        let mut state = self.state.lock();
        state.messages.push(message.clone());
        state.accumulated.clear();
        let outcome = match persisted {
            Ok(()) => {
                debug!(chat_id, message_id = %message.id, "Assistant message committed");
                self.emit(SessionEvent::AssistantCommitted(message.clone()));
                match ending {
                    Ending::Completed => RequestOutcome::Completed(message),
                    Ending::Cancelled => RequestOutcome::Cancelled(message),
                }
            }
            Err(e) => {
                warn!(chat_id, error = ?e, "Assistant message could not be persisted");
                let error = e.to_string();
                state.notice = Some(format!("Could not save the answer: {error}"));
                self.emit(SessionEvent::CommitFailed {
                    message: message.clone(),
                    error: error.clone(),
                });
                RequestOutcome::CommitFailed { message, error }
            }
        };
        self.set_phase(&mut state, Phase::Idle);
        outcome
    }

    async fn persist_with_retry(&self, message: &Message) -> Result<(), RepositoryError> {
        let mut attempt = 0;
        loop {
            match self.store.add_message(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.commit_retries => {
                    let delay = self.config.commit_backoff.delay(attempt);
                    attempt += 1;
                    warn!(error = ?e, attempt, ?delay, "Retrying assistant commit");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// One in-flight request: its token and the task that will commit it.
struct ActiveRequest {
    token: CancellationToken,
    handle: JoinHandle<RequestOutcome>,
}

async fn run_request(
    shared: Arc<Shared>,
    chat_id: String,
    history: Vec<Turn>,
    token: CancellationToken,
) -> RequestOutcome {
    let opened = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = shared.completions.stream_completion(history) => Some(result),
    };

    let mut stream = match opened {
        None => return shared.finish(&chat_id, Ending::Cancelled).await,
        Some(Ok(stream)) => stream,
        Some(Err(e)) => return shared.fail(&e.to_string()),
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => Next::Cancelled,
            chunk = stream.next() => Next::Chunk(chunk),
        };

        match next {
            Next::Cancelled => {
                // Dropping the stream closes the transport.
                drop(stream);
                debug!(chat_id = %chat_id, "Request cancelled");
                return shared.finish(&chat_id, Ending::Cancelled).await;
            }
            Next::Chunk(Some(StreamChunk::Text(text))) => {
                if !text.is_empty() {
                    shared.append(&text);
                }
            }
            Next::Chunk(Some(StreamChunk::Done)) | Next::Chunk(None) => {
                drop(stream);
                if shared.state.lock().accumulated.is_empty() {
                    return shared.fail("empty response");
                }
                return shared.finish(&chat_id, Ending::Completed).await;
            }
            Next::Chunk(Some(StreamChunk::Error(reason))) => {
                return shared.fail(&reason);
            }
        }
    }
}

/// Cloneable handle that cancels the session's in-flight request.
#[derive(Clone)]
pub struct SessionCanceller {
    shared: Arc<Shared>,
}

impl SessionCanceller {
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }
}

/// Streaming chat session for one chat screen.
///
/// Owns the lifecycle of at most one outstanding "ask the assistant" request:
/// it persists the user message, streams the answer, and commits the
/// assistant message exactly once, whether the stream completes or is
/// cancelled. Used both for brand new chats (the chat row is created with the
/// first message) and for chats opened with [`ChatSession::open`].
pub struct ChatSession {
    shared: Arc<Shared>,
    active: Option<ActiveRequest>,
}

impl ChatSession {
    /// Session for a new chat; the chat row is created on the first prompt.
    pub fn new(
        store: Arc<dyn ChatRepository>,
        completions: Arc<dyn CompletionSource>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self::with_config(store, completions, identity, SessionConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn ChatRepository>,
        completions: Arc<dyn CompletionSource>,
        identity: Arc<dyn IdentityProvider>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                store,
                completions,
                identity,
                config,
                state: Mutex::new(SessionState::empty()),
                events,
            }),
            active: None,
        }
    }

    /// Load an existing chat into the session, replacing whatever it held.
    pub async fn open(&mut self, chat_id: &str) -> Result<(), SessionError> {
        self.supersede().await;

        if self.shared.store.get_chat(chat_id).await?.is_none() {
            return Err(RepositoryError::not_found("chat", chat_id).into());
        }
        let messages = self.shared.store.list_messages(chat_id).await?;

        let mut state = self.shared.state.lock();
        *state = SessionState::empty();
        state.chat_id = Some(chat_id.to_string());
        state.messages = messages;
        info!(chat_id, messages = state.messages.len(), "Opened chat");
        Ok(())
    }

    /// Drop the current chat and start over with an empty one.
    pub async fn start_new_chat(&mut self) {
        self.supersede().await;
        *self.shared.state.lock() = SessionState::empty();
        self.shared.emit(SessionEvent::PhaseChanged(Phase::Idle));
    }

    /// Send a prompt and start streaming the answer.
    ///
    /// Any request still in flight is cancelled and its commit awaited first.
    /// Returns once the user message is persisted and the request is running;
    /// use [`ChatSession::wait`] or [`ChatSession::subscribe`] to follow it.
    pub async fn send_prompt(&mut self, text: &str) -> Result<(), SessionError> {
        if text.is_empty() {
            return Err(SessionError::EmptyPrompt);
        }

        self.supersede().await;

        let shared = self.shared.clone();
        let existing = shared.state.lock().chat_id.clone();
        let (chat_id, new_owner) = match existing {
            Some(id) => (id, None),
            None => {
                let owner = shared
                    .identity
                    .current_user_id()
                    .ok_or(SessionError::NoActiveSession)?;
                (Uuid::new_v4().to_string(), Some(owner))
            }
        };

        let user_message = {
            let mut state = shared.state.lock();
            let message = Message::new(&chat_id, Sender::User, text, state.next_timestamp());
            state.messages.push(message.clone());
            state.notice = None;
            message
        };
        shared.emit(SessionEvent::UserMessageAdded(user_message.clone()));

        if let Some(owner) = new_owner {
            let chat = Chat {
                id: chat_id.clone(),
                owner_id: owner,
                archived: false,
                created_at: user_message.created_at,
            };
            if let Err(e) = shared.store.add_chat(chat).await {
                self.retract(&user_message);
                return Err(e.into());
            }
            shared.state.lock().chat_id = Some(chat_id.clone());
            shared.emit(SessionEvent::ChatCreated {
                chat_id: chat_id.clone(),
            });
            info!(chat_id = %chat_id, "Created chat");
        }

        if let Err(e) = shared.store.add_message(user_message.clone()).await {
            self.retract(&user_message);
            return Err(e.into());
        }

        let token = CancellationToken::new();
        let history: Vec<Turn> = {
            let mut state = shared.state.lock();
            state.accumulated.clear();
            state.active_token = Some(token.clone());
            shared.set_phase(&mut state, Phase::AwaitingFirstToken);
            state.messages.iter().map(Turn::from).collect()
        };

        debug!(chat_id = %chat_id, turns = history.len(), "Requesting completion");
        let handle = tokio::spawn(run_request(shared, chat_id, history, token.clone()));
        self.active = Some(ActiveRequest { token, handle });
        Ok(())
    }

    /// Request cancellation of the in-flight answer.
    ///
    /// Only acts while awaiting or receiving fragments; the partial text (or
    /// the cancellation sentinel) is still committed.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Cancel the in-flight answer and wait for its commit.
    pub async fn cancel_and_wait(&mut self) -> Option<RequestOutcome> {
        self.cancel();
        self.wait().await
    }

    /// Wait for the in-flight request, if any, to finish.
    pub async fn wait(&mut self) -> Option<RequestOutcome> {
        let active = self.active.take()?;
        self.join(active).await
    }

    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            shared: self.shared.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.state.lock();
        SessionSnapshot {
            chat_id: state.chat_id.clone(),
            phase: state.phase,
            messages: state.messages.clone(),
            streaming_text: state.accumulated.clone(),
            notice: state.notice.clone(),
        }
    }

    pub fn chat_id(&self) -> Option<String> {
        self.shared.state.lock().chat_id.clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// Delete this session's chat (messages included) and reset to a new chat.
    pub async fn delete_chat(&mut self) -> Result<(), SessionError> {
        let chat_id = self.chat_id().ok_or(SessionError::NoChat)?;
        self.supersede().await;
        self.shared.store.delete_chat(&chat_id).await?;
        info!(chat_id = %chat_id, "Deleted chat");
        self.start_new_chat().await;
        Ok(())
    }

    pub async fn set_archived(&self, archived: bool) -> Result<(), SessionError> {
        let chat_id = self.chat_id().ok_or(SessionError::NoChat)?;
        self.shared.store.set_archived(&chat_id, archived).await?;
        debug!(chat_id = %chat_id, archived, "Updated archived flag");
        Ok(())
    }

    pub async fn is_archived(&self) -> Result<bool, SessionError> {
        let chat_id = self.chat_id().ok_or(SessionError::NoChat)?;
        let chat = self
            .shared
            .store
            .get_chat(&chat_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("chat", &chat_id))?;
        Ok(chat.archived)
    }

    fn retract(&self, message: &Message) {
        self.shared
            .state
            .lock()
            .messages
            .retain(|m| m.id != message.id);
        self.shared.emit(SessionEvent::UserMessageRetracted {
            message_id: message.id.clone(),
        });
    }

    /// Cancel the active request and wait for its commit.
    async fn supersede(&mut self) -> Option<RequestOutcome> {
        let active = self.active.take()?;
        active.token.cancel();
        self.join(active).await
    }

    async fn join(&self, active: ActiveRequest) -> Option<RequestOutcome> {
        match active.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(error = ?e, "Request task ended abnormally");
                let mut state = self.shared.state.lock();
                state.active_token = None;
                self.shared.set_phase(&mut state, Phase::Idle);
                None
            }
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        // The task keeps running and commits what it has.
        if let Some(active) = &self.active {
            active.token.cancel();
        }
    }
}
