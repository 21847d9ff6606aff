use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::change_feed::{ChangeEvent, LocalChangeFeed};
use super::chat_repository::{BoxFuture, ChatRepository};
use super::error::{RepositoryError, RepositoryResult};
use crate::models::{Chat, Message};

#[derive(Default)]
struct Tables {
    chats: HashMap<String, Chat>,
    // Insertion order is kept so equal timestamps still list in write order.
    messages: Vec<Message>,
}

/// In-memory repository for chats and messages
/// Useful for testing and development
#[derive(Clone)]
pub struct InMemoryChatRepository {
    tables: Arc<Mutex<Tables>>,
    feed: Option<LocalChangeFeed>,
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            feed: None,
        }
    }

    /// Publish chat-table changes to `feed`.
    pub fn with_change_feed(mut self, feed: LocalChangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn message_count(&self) -> usize {
        self.tables.lock().messages.len()
    }

    pub fn chat_count(&self) -> usize {
        self.tables.lock().chats.len()
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            feed.publish(event);
        }
    }
}

impl Default for InMemoryChatRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatRepository for InMemoryChatRepository {
    fn add_chat(&self, chat: Chat) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();

        Box::pin(async move {
            {
                let mut tables = this.tables.lock();
                if tables.chats.contains_key(&chat.id) {
                    return Err(RepositoryError::Rejected {
                        status: 409,
                        message: format!("chat {} already exists", chat.id),
                    });
                }
                tables.chats.insert(chat.id.clone(), chat.clone());
            }

            this.publish(ChangeEvent::inserted(&chat));
            Ok(())
        })
    }

    fn get_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Chat>>> {
        let tables = self.tables.clone();
        let id = id.to_string();

        Box::pin(async move { Ok(tables.lock().chats.get(&id).cloned()) })
    }

    fn delete_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        let id = id.to_string();

        Box::pin(async move {
            let removed = {
                let mut tables = this.tables.lock();
                let removed = tables
                    .chats
                    .remove(&id)
                    .ok_or_else(|| RepositoryError::not_found("chat", &id))?;
                tables.messages.retain(|m| m.chat_id != id);
                removed
            };

            this.publish(ChangeEvent::deleted(&removed));
            Ok(())
        })
    }

    fn list_chats(
        &self,
        owner_id: &str,
        archived: bool,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Chat>>> {
        let tables = self.tables.clone();
        let owner_id = owner_id.to_string();

        Box::pin(async move {
            let mut result: Vec<Chat> = tables
                .lock()
                .chats
                .values()
                .filter(|c| c.owner_id == owner_id && c.archived == archived)
                .cloned()
                .collect();

            // Sort by created_at descending
            result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            Ok(result)
        })
    }

    fn set_archived(&self, id: &str, archived: bool) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        let id = id.to_string();

        Box::pin(async move {
            let (old, new) = {
                let mut tables = this.tables.lock();
                let chat = tables
                    .chats
                    .get_mut(&id)
                    .ok_or_else(|| RepositoryError::not_found("chat", &id))?;
                let old = chat.clone();
                chat.archived = archived;
                (old, chat.clone())
            };

            this.publish(ChangeEvent::updated(&old, &new));
            Ok(())
        })
    }

    fn add_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>> {
        let tables = self.tables.clone();

        Box::pin(async move {
            let mut tables = tables.lock();
            if !tables.chats.contains_key(&message.chat_id) {
                return Err(RepositoryError::not_found("chat", &message.chat_id));
            }
            tables.messages.push(message);
            Ok(())
        })
    }

    fn list_messages(&self, chat_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let tables = self.tables.clone();
        let chat_id = chat_id.to_string();

        Box::pin(async move {
            let mut result: Vec<Message> = tables
                .lock()
                .messages
                .iter()
                .filter(|m| m.chat_id == chat_id)
                .cloned()
                .collect();

            // Stable sort keeps insertion order for equal timestamps
            result.sort_by(|a, b| a.created_at.cmp(&b.created_at));

            Ok(result)
        })
    }

    fn first_two_messages(
        &self,
        chat_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let all = self.list_messages(chat_id);

        Box::pin(async move {
            let mut messages = all.await?;
            messages.truncate(2);
            Ok(messages)
        })
    }
}
