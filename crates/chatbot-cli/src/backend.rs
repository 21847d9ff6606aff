use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chatbot_core::ChatSession;
use chatbot_core::repositories::{
    BoxFuture, ChangeFeed, ChatRepository, ChatSqliteRepository, InMemoryChatRepository,
    LocalChangeFeed, SupabaseChatRepository,
};
use chatbot_core::services::{
    AuthError, AuthProvider, GeminiCompletionSource, IdentityProvider, SessionFile, SessionStatus,
    SupabaseAuth, SupabaseRealtimeFeed,
};
use chatbot_core::settings::{AppSettings, SettingsJsonRepository, SettingsRepository, StoreBackend};
use tracing::{debug, info, warn};

/// Owner id used for local stores when no Supabase project is configured.
const LOCAL_USER: &str = "local";

const LOCAL_FEED_CAPACITY: usize = 256;

/// Identity for offline use: always signed in as [`LOCAL_USER`].
struct LocalIdentity;

impl IdentityProvider for LocalIdentity {
    fn current_user_id(&self) -> Option<String> {
        Some(LOCAL_USER.to_string())
    }

    fn access_token(&self) -> BoxFuture<'static, Result<Option<String>, AuthError>> {
        Box::pin(async { Ok(None) })
    }
}

/// Everything a command needs, built from the saved settings.
pub struct Backend {
    pub settings: AppSettings,
    pub store: Arc<dyn ChatRepository>,
    pub feed: Arc<dyn ChangeFeed>,
    pub identity: Arc<dyn IdentityProvider>,
    pub auth: Option<SupabaseAuth>,
}

impl Backend {
    pub async fn load() -> Result<Self> {
        let repo = SettingsJsonRepository::new().context("Failed to locate settings file")?;
        let settings = repo
            .load()
            .await
            .with_context(|| format!("Failed to read settings from {}", repo.storage_path()))?
            .with_env_overrides()
            .context("Invalid environment override")?;
        debug!(store = ?settings.store, "Loaded settings");

        let auth = match settings.supabase() {
            Some(config) => {
                let file = SessionFile::new().context("Failed to locate session file")?;
                let auth = SupabaseAuth::new(config, Some(file));
                match auth.initialize().await {
                    Ok(status) => debug!(?status, "Auth initialized"),
                    Err(e) => warn!(error = ?e, "Failed to restore session"),
                }
                Some(auth)
            }
            None => None,
        };

        let identity: Arc<dyn IdentityProvider> = match &auth {
            Some(auth) => Arc::new(auth.clone()),
            None => Arc::new(LocalIdentity),
        };

        let (store, feed): (Arc<dyn ChatRepository>, Arc<dyn ChangeFeed>) = match settings.store {
            StoreBackend::Supabase => {
                let Some(config) = settings.supabase() else {
                    bail!("store is \"supabase\" but SUPABASE_URL / SUPABASE_KEY are not set");
                };
                let store = SupabaseChatRepository::new(config.clone(), identity.clone());
                let feed = SupabaseRealtimeFeed::new(config, identity.clone())
                    .with_heartbeat(settings.heartbeat());
                (Arc::new(store), Arc::new(feed))
            }
            StoreBackend::Sqlite => {
                let feed = LocalChangeFeed::new(LOCAL_FEED_CAPACITY);
                let store = match &settings.sqlite_path {
                    Some(path) => ChatSqliteRepository::open(path).await,
                    None => ChatSqliteRepository::new().await,
                }
                .context("Failed to open chat database")?
                .with_change_feed(feed.clone());
                (Arc::new(store), Arc::new(feed))
            }
            StoreBackend::Memory => {
                let feed = LocalChangeFeed::new(LOCAL_FEED_CAPACITY);
                let store = InMemoryChatRepository::new().with_change_feed(feed.clone());
                (Arc::new(store), Arc::new(feed))
            }
        };
        info!(store = ?settings.store, "Backend ready");

        Ok(Self {
            settings,
            store,
            feed,
            identity,
            auth,
        })
    }

    pub fn auth(&self) -> Result<&SupabaseAuth> {
        self.auth
            .as_ref()
            .context("Sign-in needs SUPABASE_URL and SUPABASE_KEY")
    }

    /// Owner of new chats and of the listed chats.
    pub fn user_id(&self) -> Result<String> {
        if let Some(auth) = &self.auth {
            if let SessionStatus::RefreshFailure(reason) = auth.status().borrow().clone() {
                bail!("Session could not be refreshed ({reason}); sign in again");
            }
        }
        self.identity
            .current_user_id()
            .context("Not signed in; run `chatbot login <email>` first")
    }

    pub fn session(&self) -> ChatSession {
        ChatSession::with_config(
            self.store.clone(),
            Arc::new(GeminiCompletionSource::new(self.settings.gemini())),
            self.identity.clone(),
            self.settings.session(),
        )
    }
}
