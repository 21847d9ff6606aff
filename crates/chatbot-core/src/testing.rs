//! Scripted collaborators for exercising sessions and chat lists in tests.
//!
//! Only available with the `test-utils` feature (always on for this crate's
//! own tests).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::models::{Chat, Message, Turn};
use crate::repositories::{
    BoxFuture, ChangeEvent, ChangeFeed, ChangeStream, ChatRepository, FeedError, RepositoryError,
    RepositoryResult, TableRef,
};
use crate::services::auth_service::{AuthError, IdentityProvider};
use crate::services::completion_service::{
    CompletionError, CompletionSource, ResponseStream, StreamChunk,
};

/// Identity with a fixed user (or none).
#[derive(Clone, Debug, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
    token: Option<String>,
}

impl StaticIdentity {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            token: None,
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.clone()
    }

    fn access_token(&self) -> BoxFuture<'static, Result<Option<String>, AuthError>> {
        let token = self.token.clone();
        Box::pin(async move { Ok(token) })
    }
}

/// One completion request as seen by a test.
///
/// Fragments are pushed by the test; dropping the request ends the stream.
pub struct ScriptedRequest {
    pub history: Vec<Turn>,
    chunks: mpsc::Sender<StreamChunk>,
}

impl ScriptedRequest {
    pub async fn text(&mut self, text: &str) {
        let _ = self.chunks.send(StreamChunk::Text(text.to_string())).await;
    }

    pub async fn done(&mut self) {
        let _ = self.chunks.send(StreamChunk::Done).await;
    }

    pub async fn fail(&mut self, reason: &str) {
        let _ = self.chunks.send(StreamChunk::Error(reason.to_string())).await;
    }

    /// Resolves once the session has dropped the stream.
    pub async fn closed(&self) {
        self.chunks.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.chunks.is_closed()
    }
}

/// Completion source driven step by step from the test.
#[derive(Clone)]
pub struct ScriptedCompletion {
    requests_tx: mpsc::UnboundedSender<ScriptedRequest>,
    requests_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedRequest>>>,
    open_failure: Arc<Mutex<Option<String>>>,
    opened: Arc<AtomicUsize>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            requests_tx,
            requests_rx: Arc::new(tokio::sync::Mutex::new(requests_rx)),
            open_failure: Arc::new(Mutex::new(None)),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The next call to `stream_completion` fails before streaming.
    pub fn fail_next_open(&self, message: impl Into<String>) {
        *self.open_failure.lock() = Some(message.into());
    }

    /// Wait for the session to open its next stream.
    pub async fn next_request(&self) -> ScriptedRequest {
        self.requests_rx
            .lock()
            .await
            .recv()
            .await
            .expect("scripted completion source dropped")
    }

    /// Number of streams requested so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSource for ScriptedCompletion {
    fn stream_completion(
        &self,
        history: Vec<Turn>,
    ) -> BoxFuture<'static, Result<ResponseStream, CompletionError>> {
        self.opened.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = self.open_failure.lock().take() {
            return Box::pin(async move {
                Err(CompletionError::Rejected {
                    status: 500,
                    message,
                })
            });
        }

        let (chunks, rx) = mpsc::channel(32);
        let _ = self.requests_tx.send(ScriptedRequest { history, chunks });

        Box::pin(async move {
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            });
            Ok(stream.boxed())
        })
    }
}

/// Store wrapper that injects `BackendUnavailable` failures.
#[derive(Clone)]
pub struct FlakyRepository {
    inner: Arc<dyn ChatRepository>,
    add_chat_failures: Arc<AtomicU32>,
    user_message_failures: Arc<AtomicU32>,
    assistant_message_failures: Arc<AtomicU32>,
    assistant_attempts: Arc<AtomicU32>,
}

impl FlakyRepository {
    pub fn new(inner: Arc<dyn ChatRepository>) -> Self {
        Self {
            inner,
            add_chat_failures: Arc::new(AtomicU32::new(0)),
            user_message_failures: Arc::new(AtomicU32::new(0)),
            assistant_message_failures: Arc::new(AtomicU32::new(0)),
            assistant_attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn fail_add_chat(&self, times: u32) {
        self.add_chat_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_user_messages(&self, times: u32) {
        self.user_message_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_assistant_messages(&self, times: u32) {
        self.assistant_message_failures.store(times, Ordering::SeqCst);
    }

    /// Assistant `add_message` calls seen so far, failed ones included.
    pub fn assistant_attempts(&self) -> u32 {
        self.assistant_attempts.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected() -> BoxFuture<'static, RepositoryResult<()>> {
        Box::pin(async { Err(RepositoryError::unavailable("injected failure")) })
    }
}

impl ChatRepository for FlakyRepository {
    fn add_chat(&self, chat: Chat) -> BoxFuture<'static, RepositoryResult<()>> {
        if Self::take_failure(&self.add_chat_failures) {
            return Self::injected();
        }
        self.inner.add_chat(chat)
    }

    fn get_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Chat>>> {
        self.inner.get_chat(id)
    }

    fn delete_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        self.inner.delete_chat(id)
    }

    fn list_chats(
        &self,
        owner_id: &str,
        archived: bool,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Chat>>> {
        self.inner.list_chats(owner_id, archived)
    }

    fn set_archived(&self, id: &str, archived: bool) -> BoxFuture<'static, RepositoryResult<()>> {
        self.inner.set_archived(id, archived)
    }

    fn add_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>> {
        let counter = if message.is_user() {
            &self.user_message_failures
        } else {
            self.assistant_attempts.fetch_add(1, Ordering::SeqCst);
            &self.assistant_message_failures
        };
        if Self::take_failure(counter) {
            return Self::injected();
        }
        self.inner.add_message(message)
    }

    fn list_messages(&self, chat_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        self.inner.list_messages(chat_id)
    }

    fn first_two_messages(
        &self,
        chat_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        self.inner.first_two_messages(chat_id)
    }
}

/// One subscription handed out by [`ScriptedFeed`].
pub struct FeedSubscription {
    events: mpsc::UnboundedSender<Result<ChangeEvent, FeedError>>,
}

impl FeedSubscription {
    pub fn send(&self, event: ChangeEvent) {
        let _ = self.events.send(Ok(event));
    }

    /// Deliver an error; the subscriber treats the subscription as lost.
    pub fn fail(self, error: FeedError) {
        let _ = self.events.send(Err(error));
    }
}

/// Change feed whose subscriptions are controlled by the test.
#[derive(Clone)]
pub struct ScriptedFeed {
    subscriptions_tx: mpsc::UnboundedSender<FeedSubscription>,
    subscriptions_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FeedSubscription>>>,
    subscribe_count: Arc<AtomicUsize>,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        let (subscriptions_tx, subscriptions_rx) = mpsc::unbounded_channel();
        Self {
            subscriptions_tx,
            subscriptions_rx: Arc::new(tokio::sync::Mutex::new(subscriptions_rx)),
            subscribe_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn next_subscription(&self) -> FeedSubscription {
        self.subscriptions_rx
            .lock()
            .await
            .recv()
            .await
            .expect("scripted feed dropped")
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_count.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed for ScriptedFeed {
    fn subscribe(&self, _table: TableRef) -> BoxFuture<'static, Result<ChangeStream, FeedError>> {
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        let (events, rx) = mpsc::unbounded_channel();
        let _ = self.subscriptions_tx.send(FeedSubscription { events });

        Box::pin(async move {
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            });
            Ok(stream.boxed())
        })
    }
}
