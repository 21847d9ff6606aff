use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::ChatSummary;
use crate::repositories::{
    ChangeEvent, ChangeFeed, ChangeKind, ChatRecord, ChatRepository, RepositoryResult, TableRef,
};
use crate::services::backoff::BackoffConfig;

/// Visible chat summaries for one owner and one list (active or archived).
///
/// Kept in sync with the chat table through a change feed. Any update or
/// delete of a chat removes it from the list; the list it now belongs to
/// picks it up on its next resync.
pub struct ChatListReconciler {
    store: Arc<dyn ChatRepository>,
    owner_id: String,
    archived: bool,
    summaries: watch::Sender<Vec<ChatSummary>>,
}

impl ChatListReconciler {
    pub fn new(
        store: Arc<dyn ChatRepository>,
        owner_id: impl Into<String>,
        archived: bool,
    ) -> Self {
        let (summaries, _) = watch::channel(Vec::new());
        Self {
            store,
            owner_id: owner_id.into(),
            archived,
            summaries,
        }
    }

    pub fn summaries(&self) -> Vec<ChatSummary> {
        self.summaries.borrow().clone()
    }

    /// Receives the full list after every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatSummary>> {
        self.summaries.subscribe()
    }

    fn remove(&self, chat_id: &str) -> bool {
        self.summaries.send_if_modified(|list| {
            let before = list.len();
            list.retain(|s| s.chat_id != chat_id);
            list.len() != before
        })
    }

    /// Drop every summary of `chat_id`. Returns whether anything was removed.
    pub fn on_chat_deleted(&self, chat_id: &str) -> bool {
        let removed = self.remove(chat_id);
        debug!(chat_id, removed, "Chat deleted");
        removed
    }

    /// Any update takes the chat out of the current list.
    pub fn on_chat_updated(&self, chat_id: &str, new_state: Option<&ChatRecord>) -> bool {
        let removed = self.remove(chat_id);
        debug!(
            chat_id,
            archived = ?new_state.and_then(|r| r.archived),
            removed,
            "Chat updated"
        );
        removed
    }

    pub fn apply(&self, event: &ChangeEvent) {
        let Some(chat_id) = event.chat_id() else {
            warn!(kind = ?event.kind, "Change without chat id");
            return;
        };

        match event.kind {
            // New chats have no preview yet; the next resync lists them.
            ChangeKind::Insert => debug!(chat_id, "Ignoring chat insert"),
            ChangeKind::Update => {
                self.on_chat_updated(chat_id, event.new_record.as_ref());
            }
            ChangeKind::Delete => {
                self.on_chat_deleted(chat_id);
            }
        }
    }

    /// Rebuild the list from the store. Returns the number of summaries.
    pub async fn resync(&self) -> RepositoryResult<usize> {
        let chats = self.store.list_chats(&self.owner_id, self.archived).await?;

        let mut list = Vec::with_capacity(chats.len());
        for chat in &chats {
            let preview = self.store.first_two_messages(&chat.id).await?;
            if let Some(summary) = ChatSummary::from_preview(chat, &preview) {
                list.push(summary);
            }
        }

        let count = list.len();
        self.summaries.send_replace(list);
        debug!(owner_id = %self.owner_id, archived = self.archived, count, "Chat list resynced");
        Ok(count)
    }

    /// Follow `feed` until `shutdown` fires.
    ///
    /// Every (re)subscription is followed by a full resync. A lost
    /// subscription is retried with exponential backoff.
    pub async fn run(
        &self,
        feed: Arc<dyn ChangeFeed>,
        backoff: BackoffConfig,
        shutdown: CancellationToken,
    ) {
        let mut attempt: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = feed.subscribe(TableRef::chats()) => result,
            };

            match subscribed {
                Ok(mut stream) => match self.resync().await {
                    Ok(count) => {
                        attempt = 0;
                        info!(archived = self.archived, count, "Chat list subscribed");

                        loop {
                            let next = tokio::select! {
                                biased;
                                _ = shutdown.cancelled() => return,
                                next = stream.next() => next,
                            };
                            match next {
                                Some(Ok(event)) => self.apply(&event),
                                Some(Err(e)) => {
                                    warn!(error = ?e, "Chat change subscription lost");
                                    break;
                                }
                                None => {
                                    warn!("Chat change subscription ended");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = ?e, "Chat list resync failed"),
                },
                Err(e) => warn!(error = ?e, "Chat change subscription failed"),
            }

            let delay = backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(?delay, attempt, "Reconnecting chat change subscription");

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(archived = self.archived, "Chat list reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chat, Message, Sender};
    use crate::repositories::InMemoryChatRepository;
    use chrono::{Duration, Utc};

    async fn seed(store: &InMemoryChatRepository, id: &str, offset: i64, with_messages: bool) {
        let mut chat = Chat::new(id, "u1");
        chat.created_at = Utc::now() + Duration::seconds(offset);
        store.add_chat(chat).await.unwrap();
        if with_messages {
            let now = Utc::now();
            store
                .add_message(Message::new(id, Sender::User, format!("q {id}"), now))
                .await
                .unwrap();
            store
                .add_message(Message::new(id, Sender::Assistant, format!("a {id}"), now))
                .await
                .unwrap();
        }
    }

    fn ids(reconciler: &ChatListReconciler) -> Vec<String> {
        reconciler
            .summaries()
            .into_iter()
            .map(|s| s.chat_id)
            .collect()
    }

    #[tokio::test]
    async fn test_resync_builds_previews_newest_first() {
        let store = InMemoryChatRepository::new();
        seed(&store, "old", -10, true).await;
        seed(&store, "new", 10, true).await;
        seed(&store, "empty", 20, false).await;

        let reconciler = ChatListReconciler::new(Arc::new(store), "u1", false);
        assert_eq!(reconciler.resync().await.unwrap(), 2);
        assert_eq!(ids(&reconciler), vec!["new", "old"]);

        let first = &reconciler.summaries()[0];
        assert_eq!(first.user_line, "q new");
        assert_eq!(first.assistant_line.as_deref(), Some("a new"));
    }

    #[tokio::test]
    async fn test_on_chat_deleted_is_idempotent() {
        let store = InMemoryChatRepository::new();
        seed(&store, "c1", 0, true).await;
        seed(&store, "c2", 1, true).await;
        let reconciler = ChatListReconciler::new(Arc::new(store), "u1", false);
        reconciler.resync().await.unwrap();

        assert!(reconciler.on_chat_deleted("c1"));
        let after_first = reconciler.summaries();
        assert!(!reconciler.on_chat_deleted("c1"));
        assert_eq!(reconciler.summaries(), after_first);
        assert_eq!(ids(&reconciler), vec!["c2"]);
    }

    #[tokio::test]
    async fn test_update_removes_and_insert_is_ignored() {
        let store = InMemoryChatRepository::new();
        seed(&store, "c1", 0, true).await;
        let reconciler = ChatListReconciler::new(Arc::new(store), "u1", false);
        reconciler.resync().await.unwrap();

        reconciler.apply(&ChangeEvent::inserted(&Chat::new("c9", "u1")));
        assert_eq!(ids(&reconciler), vec!["c1"]);

        let old = Chat::new("c1", "u1");
        let mut chat = old.clone();
        chat.archived = true;
        reconciler.apply(&ChangeEvent::updated(&old, &chat));
        assert!(reconciler.summaries().is_empty());
    }

    #[tokio::test]
    async fn test_observers_see_every_change() {
        let store = InMemoryChatRepository::new();
        seed(&store, "c1", 0, true).await;
        let reconciler = ChatListReconciler::new(Arc::new(store), "u1", false);
        let mut rx = reconciler.subscribe();

        reconciler.resync().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 1);

        reconciler.on_chat_deleted("c1");
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_empty());

        reconciler.on_chat_deleted("c1");
        assert!(!rx.has_changed().unwrap());
    }
}
