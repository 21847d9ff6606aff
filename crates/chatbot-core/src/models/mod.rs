pub mod chat_list;
pub mod chat_session;
pub mod message;

pub use chat_list::ChatListReconciler;
pub use chat_session::{
    CANCELLED_SENTINEL, ChatSession, Phase, RequestOutcome, SessionCanceller, SessionConfig,
    SessionError, SessionEvent, SessionSnapshot,
};
pub use message::{Chat, ChatSummary, Message, Sender, Turn};
