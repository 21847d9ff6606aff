use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
///
/// The assistant is stored as `"model"`, the role name the generative API
/// uses, so rows written by older clients keep decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "model", alias = "assistant")]
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "model",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Sender::User),
            "model" | "assistant" => Some(Sender::Assistant),
            _ => None,
        }
    }
}

/// One turn in a conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "mid")]
    pub id: String,
    pub chat_id: String,
    pub sender: Sender,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        chat_id: impl Into<String>,
        sender: Sender,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            sender,
            content: content.into(),
            created_at,
        }
    }

    pub fn is_user(&self) -> bool {
        self.sender == Sender::User
    }
}

/// A conversation container, created lazily with its first user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(rename = "cid")]
    pub id: String,
    #[serde(rename = "user_id")]
    pub owner_id: String,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            archived: false,
            created_at: Utc::now(),
        }
    }
}

/// Chat list entry: first user line and first assistant line of a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub chat_id: String,
    pub user_line: String,
    pub assistant_line: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChatSummary {
    /// Build a summary from a chat and its first (up to two) messages.
    /// Returns `None` when the chat has no user message yet.
    pub fn from_preview(chat: &Chat, preview: &[Message]) -> Option<Self> {
        let user_line = preview.iter().find(|m| m.is_user())?.content.clone();
        let assistant_line = preview
            .iter()
            .find(|m| m.sender == Sender::Assistant)
            .map(|m| m.content.clone());

        Some(Self {
            chat_id: chat.id.clone(),
            user_line,
            assistant_line,
            created_at: chat.created_at,
        })
    }
}

/// `{role, text}` pair handed to a completion source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Sender,
    pub text: String,
}

impl From<&Message> for Turn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.sender,
            text: message.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_uses_backend_column_names() {
        let msg = Message::new("chat-1", Sender::Assistant, "Hi", Utc::now());
        let json = serde_json::to_value(&msg).unwrap();

        assert!(json.get("mid").is_some());
        assert_eq!(json["chat_id"], "chat-1");
        assert_eq!(json["sender"], "model");
    }

    #[test]
    fn test_sender_accepts_assistant_alias() {
        let sender: Sender = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(sender, Sender::Assistant);
        assert_eq!(Sender::parse("model"), Some(Sender::Assistant));
        assert_eq!(Sender::parse("system"), None);
    }

    #[test]
    fn test_chat_decodes_row_without_archived() {
        let chat: Chat = serde_json::from_value(serde_json::json!({
            "cid": "c1",
            "user_id": "u1",
            "created_at": "2025-01-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(chat.id, "c1");
        assert_eq!(chat.owner_id, "u1");
        assert!(!chat.archived);
    }

    #[test]
    fn test_summary_from_preview() {
        let chat = Chat::new("c1", "u1");
        let now = Utc::now();
        let preview = vec![
            Message::new("c1", Sender::User, "Hello", now),
            Message::new("c1", Sender::Assistant, "Hi there!", now),
        ];

        let summary = ChatSummary::from_preview(&chat, &preview).unwrap();
        assert_eq!(summary.user_line, "Hello");
        assert_eq!(summary.assistant_line.as_deref(), Some("Hi there!"));
    }

    #[test]
    fn test_summary_requires_user_line() {
        let chat = Chat::new("c1", "u1");
        assert!(ChatSummary::from_preview(&chat, &[]).is_none());

        let only_user = vec![Message::new("c1", Sender::User, "Hello", Utc::now())];
        let summary = ChatSummary::from_preview(&chat, &only_user).unwrap();
        assert!(summary.assistant_line.is_none());
    }
}
