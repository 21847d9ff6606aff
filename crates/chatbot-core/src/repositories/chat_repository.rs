use std::future::Future;
use std::pin::Pin;

use super::error::RepositoryResult;
use crate::models::{Chat, Message};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Persistence for chats and their messages.
///
/// Every call is asynchronous and may fail; callers must not assume success.
pub trait ChatRepository: Send + Sync + 'static {
    /// Insert a new chat row
    fn add_chat(&self, chat: Chat) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Load a single chat by ID
    fn get_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Chat>>>;

    /// Delete a chat together with all of its messages
    fn delete_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Chats of one owner with the given archived flag, newest first
    fn list_chats(
        &self,
        owner_id: &str,
        archived: bool,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Chat>>>;

    /// Move a chat between the active and archived lists
    fn set_archived(&self, id: &str, archived: bool) -> BoxFuture<'static, RepositoryResult<()>>;

    /// Append a message to its chat
    fn add_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>>;

    /// All messages of a chat, oldest first
    fn list_messages(&self, chat_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>>;

    /// The two oldest messages of a chat, used for list previews
    fn first_two_messages(
        &self,
        chat_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>>;
}
