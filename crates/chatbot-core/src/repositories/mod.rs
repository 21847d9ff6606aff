pub mod change_feed;
pub mod chat_repository;
pub mod chat_sqlite_repository;
pub mod error;
pub mod in_memory_repository;
pub mod supabase_repository;

pub use change_feed::{
    ChangeEvent, ChangeFeed, ChangeKind, ChangeStream, ChatRecord, FeedError, LocalChangeFeed,
    TableRef,
};
pub use chat_repository::{BoxFuture, ChatRepository};
pub use chat_sqlite_repository::ChatSqliteRepository;
pub use error::{RepositoryError, RepositoryResult};
pub use in_memory_repository::InMemoryChatRepository;
pub use supabase_repository::SupabaseChatRepository;
