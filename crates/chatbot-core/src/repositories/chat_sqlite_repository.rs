use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use tracing::info;

use super::change_feed::{ChangeEvent, LocalChangeFeed};
use super::chat_repository::{BoxFuture, ChatRepository};
use super::error::{RepositoryError, RepositoryResult};
use crate::models::{Chat, Message, Sender};

/// Migrations applied in order. Each entry is (version, sql).
/// To add a new migration: append a tuple with the next version number and its SQL.
/// Never edit or remove existing entries; existing databases depend on them.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS chat (
        cid        TEXT    PRIMARY KEY,
        user_id    TEXT    NOT NULL,
        archived   INTEGER NOT NULL DEFAULT 0,
        created_at TEXT    NOT NULL
    );
    CREATE TABLE IF NOT EXISTS message (
        mid        TEXT    PRIMARY KEY,
        chat_id    TEXT    NOT NULL REFERENCES chat (cid) ON DELETE CASCADE,
        sender     TEXT    NOT NULL,
        content    TEXT    NOT NULL,
        created_at TEXT    NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chat_owner_created_at
        ON chat (user_id, archived, created_at DESC);
    CREATE INDEX IF NOT EXISTS idx_message_chat_created_at
        ON message (chat_id, created_at ASC)",
)];

/// Fixed-width RFC 3339 so TEXT ordering matches time ordering.
fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(raw: &str) -> RepositoryResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RepositoryError::InvalidData {
            message: format!("bad timestamp {raw:?}: {e}"),
        })
}

fn chat_from_row(row: &SqliteRow) -> RepositoryResult<Chat> {
    Ok(Chat {
        id: row.get("cid"),
        owner_id: row.get("user_id"),
        archived: row.get::<i64, _>("archived") != 0,
        created_at: decode_time(row.get("created_at"))?,
    })
}

fn message_from_row(row: &SqliteRow) -> RepositoryResult<Message> {
    let sender: String = row.get("sender");
    Ok(Message {
        id: row.get("mid"),
        chat_id: row.get("chat_id"),
        sender: Sender::parse(&sender).ok_or_else(|| RepositoryError::InvalidData {
            message: format!("unknown sender {sender:?}"),
        })?,
        content: row.get("content"),
        created_at: decode_time(row.get("created_at"))?,
    })
}

/// SQLite-backed repository for chats and messages.
///
/// Uses WAL journal mode for concurrent reads during background saves.
/// `SqlitePool` is internally reference-counted and cheap to clone.
#[derive(Clone)]
pub struct ChatSqliteRepository {
    pool: SqlitePool,
    feed: Option<LocalChangeFeed>,
}

impl ChatSqliteRepository {
    /// Open (or create) the SQLite database at the platform-specific config path.
    pub async fn new() -> RepositoryResult<Self> {
        let db_path = Self::default_path()?;
        Self::open(&db_path).await
    }

    /// Open (or create) the SQLite database at `db_path`.
    pub async fn open(db_path: &Path) -> RepositoryResult<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite chat database");

        Ok(Self { pool, feed: None })
    }

    /// Private in-memory database, used by tests.
    pub async fn in_memory() -> RepositoryResult<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        // Every connection to :memory: is its own database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool, feed: None })
    }

    /// Publish chat-table changes to `feed`.
    pub fn with_change_feed(mut self, feed: LocalChangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Create the schema_version table if absent, then apply any pending migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Seed version 0 if the table is empty (fresh database).
        sqlx::query(
            "INSERT INTO schema_version (version)
             SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
        )
        .execute(pool)
        .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // sqlx doesn't support multiple statements in a single query call,
                // so split on ';' and execute each statement individually.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    pub fn default_path() -> RepositoryResult<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Cannot find config directory".into(),
            })
            .map(|p| p.join("chatbot").join("chats.db"))
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            feed.publish(event);
        }
    }

    async fn fetch_chat(pool: &SqlitePool, id: &str) -> RepositoryResult<Option<Chat>> {
        let row = sqlx::query("SELECT cid, user_id, archived, created_at FROM chat WHERE cid = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        row.as_ref().map(chat_from_row).transpose()
    }
}

impl ChatRepository for ChatSqliteRepository {
    fn add_chat(&self, chat: Chat) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO chat (cid, user_id, archived, created_at) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&chat.id)
            .bind(&chat.owner_id)
            .bind(chat.archived as i64)
            .bind(encode_time(&chat.created_at))
            .execute(&this.pool)
            .await?;

            this.publish(ChangeEvent::inserted(&chat));
            Ok(())
        })
    }

    fn get_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<Chat>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move { Self::fetch_chat(&pool, &id).await })
    }

    fn delete_chat(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        let id = id.to_string();
        Box::pin(async move {
            let chat = Self::fetch_chat(&this.pool, &id)
                .await?
                .ok_or_else(|| RepositoryError::not_found("chat", &id))?;

            // Foreign keys cascade, but older files may predate the constraint.
            let mut tx = this.pool.begin().await?;
            sqlx::query("DELETE FROM message WHERE chat_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM chat WHERE cid = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            this.publish(ChangeEvent::deleted(&chat));
            Ok(())
        })
    }

    fn list_chats(
        &self,
        owner_id: &str,
        archived: bool,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Chat>>> {
        let pool = self.pool.clone();
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT cid, user_id, archived, created_at
                 FROM chat
                 WHERE user_id = ?1 AND archived = ?2
                 ORDER BY created_at DESC",
            )
            .bind(&owner_id)
            .bind(archived as i64)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(chat_from_row).collect()
        })
    }

    fn set_archived(&self, id: &str, archived: bool) -> BoxFuture<'static, RepositoryResult<()>> {
        let this = self.clone();
        let id = id.to_string();
        Box::pin(async move {
            let old = Self::fetch_chat(&this.pool, &id)
                .await?
                .ok_or_else(|| RepositoryError::not_found("chat", &id))?;

            sqlx::query("UPDATE chat SET archived = ?1 WHERE cid = ?2")
                .bind(archived as i64)
                .bind(&id)
                .execute(&this.pool)
                .await?;

            let new = Chat {
                archived,
                ..old.clone()
            };
            this.publish(ChangeEvent::updated(&old, &new));
            Ok(())
        })
    }

    fn add_message(&self, message: Message) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            if Self::fetch_chat(&pool, &message.chat_id).await?.is_none() {
                return Err(RepositoryError::not_found("chat", &message.chat_id));
            }

            sqlx::query(
                "INSERT INTO message (mid, chat_id, sender, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(&message.id)
            .bind(&message.chat_id)
            .bind(message.sender.as_str())
            .bind(&message.content)
            .bind(encode_time(&message.created_at))
            .execute(&pool)
            .await?;

            Ok(())
        })
    }

    fn list_messages(&self, chat_id: &str) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let pool = self.pool.clone();
        let chat_id = chat_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT mid, chat_id, sender, content, created_at
                 FROM message
                 WHERE chat_id = ?
                 ORDER BY created_at ASC, rowid ASC",
            )
            .bind(&chat_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(message_from_row).collect()
        })
    }

    fn first_two_messages(
        &self,
        chat_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<Message>>> {
        let pool = self.pool.clone();
        let chat_id = chat_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT mid, chat_id, sender, content, created_at
                 FROM message
                 WHERE chat_id = ?
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 2",
            )
            .bind(&chat_id)
            .fetch_all(&pool)
            .await?;

            rows.iter().map(message_from_row).collect()
        })
    }
}
