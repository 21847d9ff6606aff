use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::chat_repository::BoxFuture;
use crate::models::Chat;

/// Table a change subscription is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `public.chat`, the only table the chat lists listen to.
    pub fn chats() -> Self {
        Self::new("public", "chat")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Chat row as carried by a change notification.
///
/// Delete notifications usually only carry the primary key, so everything but
/// the id is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatRecord {
    #[serde(rename = "cid")]
    pub id: String,
    #[serde(rename = "user_id", default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub archived: Option<bool>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<&Chat> for ChatRecord {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id.clone(),
            owner_id: Some(chat.owner_id.clone()),
            archived: Some(chat.archived),
            created_at: Some(chat.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub old_record: Option<ChatRecord>,
    pub new_record: Option<ChatRecord>,
}

impl ChangeEvent {
    pub fn inserted(chat: &Chat) -> Self {
        Self {
            kind: ChangeKind::Insert,
            old_record: None,
            new_record: Some(chat.into()),
        }
    }

    pub fn updated(old: &Chat, new: &Chat) -> Self {
        Self {
            kind: ChangeKind::Update,
            old_record: Some(old.into()),
            new_record: Some(new.into()),
        }
    }

    pub fn deleted(chat: &Chat) -> Self {
        Self {
            kind: ChangeKind::Delete,
            old_record: Some(chat.into()),
            new_record: None,
        }
    }

    /// Id of the chat the event is about.
    pub fn chat_id(&self) -> Option<&str> {
        self.new_record
            .as_ref()
            .or(self.old_record.as_ref())
            .map(|r| r.id.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Failed to connect to change feed: {message}")]
    Connect { message: String },

    #[error("Change feed protocol error: {message}")]
    Protocol { message: String },

    #[error("Change feed closed: {reason}")]
    Closed { reason: String },

    #[error("Change feed subscriber lagged behind by {0} events")]
    Lagged(u64),

    #[error("No change feed for table {0}")]
    UnknownTable(String),

    #[error("Failed to decode change: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Ends (or yields an error) when the subscription is lost.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// Source of insert/update/delete notifications for a table.
pub trait ChangeFeed: Send + Sync + 'static {
    fn subscribe(&self, table: TableRef) -> BoxFuture<'static, Result<ChangeStream, FeedError>>;
}

/// In-process change feed fed by the local repositories.
#[derive(Clone)]
pub struct LocalChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl LocalChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is fine; nobody is looking at a chat list.
        if self.sender.send(event).is_err() {
            debug!("Chat change published without subscribers");
        }
    }
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeFeed for LocalChangeFeed {
    fn subscribe(&self, table: TableRef) -> BoxFuture<'static, Result<ChangeStream, FeedError>> {
        let receiver = (table.table == "chat").then(|| self.sender.subscribe());

        Box::pin(async move {
            let Some(mut receiver) = receiver else {
                return Err(FeedError::UnknownTable(format!(
                    "{}.{}",
                    table.schema, table.table
                )));
            };

            let stream: ChangeStream = Box::pin(async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(event) => yield Ok(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Local change feed subscriber lagged");
                            yield Err(FeedError::Lagged(skipped));
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            });

            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_local_feed_delivers_published_events() {
        let feed = LocalChangeFeed::new(8);
        let mut stream = feed.subscribe(TableRef::chats()).await.unwrap();

        let chat = Chat::new("c1", "u1");
        feed.publish(ChangeEvent::deleted(&chat));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.chat_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_local_feed_rejects_other_tables() {
        let feed = LocalChangeFeed::new(8);
        let result = feed.subscribe(TableRef::new("public", "message")).await;
        assert!(matches!(result, Err(FeedError::UnknownTable(_))));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_loses_subscription() {
        let feed = LocalChangeFeed::new(1);
        let mut stream = feed.subscribe(TableRef::chats()).await.unwrap();

        let chat = Chat::new("c1", "u1");
        feed.publish(ChangeEvent::inserted(&chat));
        feed.publish(ChangeEvent::deleted(&chat));

        assert!(matches!(stream.next().await, Some(Err(FeedError::Lagged(_)))));
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_chat_record_decodes_key_only_row() {
        let record: ChatRecord = serde_json::from_value(serde_json::json!({"cid": "c9"})).unwrap();
        assert_eq!(record.id, "c9");
        assert!(record.owner_id.is_none());
        assert!(record.archived.is_none());
    }
}
