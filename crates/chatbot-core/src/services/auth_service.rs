use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::supabase::{SupabaseConfig, describe_error};
use crate::repositories::BoxFuture;

/// Tokens closer than this to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Not signed in")]
    NotSignedIn,

    #[error("Auth request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Session refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Cannot determine config directory")]
    PathError,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Signed-in user as shown in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Tokens of a signed-in user, persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

impl AuthSession {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Authenticated(UserProfile),
    NotAuthenticated,
    RefreshFailure(String),
}

/// Nonce pair for Google ID-token sign-in.
///
/// `hashed` goes into the Google credential request, `raw` to the auth
/// provider, which hashes it again and compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoogleNonce {
    pub raw: String,
    pub hashed: String,
}

impl GoogleNonce {
    pub fn generate() -> Self {
        Self::from_raw(Uuid::new_v4().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let hashed = hex::encode(Sha256::digest(raw.as_bytes()));
        Self { raw, hashed }
    }
}

/// Who is signed in, as needed by the stores and the session.
pub trait IdentityProvider: Send + Sync + 'static {
    fn current_user_id(&self) -> Option<String>;

    /// Bearer token for backend calls, refreshed when close to expiry.
    fn access_token(&self) -> BoxFuture<'static, Result<Option<String>, AuthError>>;
}

#[async_trait]
pub trait AuthProvider: IdentityProvider {
    /// Email a one-time code (creates the account on first use).
    async fn send_otp(&self, email: &str) -> Result<(), AuthError>;

    async fn verify_otp(&self, email: &str, token: &str) -> Result<UserProfile, AuthError>;

    async fn sign_in_with_id_token(
        &self,
        id_token: &str,
        nonce: Option<&str>,
    ) -> Result<UserProfile, AuthError>;

    async fn sign_out(&self) -> Result<(), AuthError>;

    fn status(&self) -> watch::Receiver<SessionStatus>;
}

/// JSON file holding the persisted [`AuthSession`].
#[derive(Debug, Clone)]
pub struct SessionFile {
    file_path: PathBuf,
}

impl SessionFile {
    /// Create store with XDG-compliant path
    pub fn new() -> Result<Self, AuthError> {
        let config_dir = dirs::config_dir().ok_or(AuthError::PathError)?;
        Ok(Self {
            file_path: config_dir.join("chatbot").join("session.json"),
        })
    }

    /// Create store with custom path (for testing)
    pub fn with_path(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    pub async fn load(&self) -> Result<Option<AuthSession>, AuthError> {
        if !tokio::fs::try_exists(&self.file_path).await? {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&self.file_path).await?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    pub async fn save(&self, session: &AuthSession) -> Result<(), AuthError> {
        if let Some(parent) = self.file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(session)?;

        // Write atomically using temp file + rename
        let temp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.file_path).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), AuthError> {
        match tokio::fs::remove_file(&self.file_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: GoTrueUser,
}

#[derive(Deserialize)]
struct GoTrueUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    user_metadata: serde_json::Map<String, serde_json::Value>,
}

impl TokenResponse {
    fn into_session(self, now: DateTime<Utc>) -> AuthSession {
        let expires_at = self
            .expires_at
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(|| now + Duration::seconds(self.expires_in.unwrap_or(3600)));

        let metadata = |key: &str| {
            self.user
                .user_metadata
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        AuthSession {
            user: UserProfile {
                name: metadata("name"),
                picture: metadata("picture"),
                id: self.user.id.clone(),
                email: self.user.email.clone(),
            },
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

struct AuthInner {
    client: reqwest::Client,
    config: SupabaseConfig,
    store: Option<SessionFile>,
    session: Mutex<Option<AuthSession>>,
    status: watch::Sender<SessionStatus>,
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Supabase GoTrue client holding the current session.
#[derive(Clone)]
pub struct SupabaseAuth {
    inner: Arc<AuthInner>,
}

impl SupabaseAuth {
    pub fn new(config: SupabaseConfig, store: Option<SessionFile>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Initializing);
        Self {
            inner: Arc::new(AuthInner {
                client: reqwest::Client::new(),
                config,
                store,
                session: Mutex::new(None),
                status,
                refresh_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Restore the persisted session, refreshing it if it is about to expire.
    pub async fn initialize(&self) -> Result<SessionStatus, AuthError> {
        let stored = match &self.inner.store {
            Some(store) => store.load().await?,
            None => None,
        };

        let Some(session) = stored else {
            self.inner.status.send_replace(SessionStatus::NotAuthenticated);
            return Ok(SessionStatus::NotAuthenticated);
        };

        *self.inner.session.lock() = Some(session);
        match self.ensure_fresh().await {
            Ok(_) => {}
            Err(e) => warn!(error = ?e, "Stored session could not be refreshed"),
        }
        Ok(self.inner.status.borrow().clone())
    }

    pub fn current_session(&self) -> Option<AuthSession> {
        self.inner.session.lock().clone()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner.session.lock().as_ref().map(|s| s.user.clone())
    }

    async fn post_json(
        &self,
        url: String,
        query: &[(&str, &str)],
        body: serde_json::Value,
    ) -> Result<reqwest::Response, AuthError> {
        let response = self
            .inner
            .client
            .post(url)
            .query(query)
            .header("apikey", &self.inner.config.anon_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (message, _) = describe_error(&body);
        Err(AuthError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn token_request(
        &self,
        url: String,
        query: &[(&str, &str)],
        body: serde_json::Value,
    ) -> Result<AuthSession, AuthError> {
        let response = self.post_json(url, query, body).await?;
        let token: TokenResponse = response.json().await?;
        Ok(token.into_session(Utc::now()))
    }

    async fn install(&self, session: AuthSession) -> Result<UserProfile, AuthError> {
        if let Some(store) = &self.inner.store {
            store.save(&session).await?;
        }
        let user = session.user.clone();
        *self.inner.session.lock() = Some(session);
        self.inner
            .status
            .send_replace(SessionStatus::Authenticated(user.clone()));
        info!(user_id = %user.id, "Signed in");
        Ok(user)
    }

    /// Refresh the session if it is within the refresh margin of expiry.
    async fn ensure_fresh(&self) -> Result<Option<AuthSession>, AuthError> {
        let _guard = self.inner.refresh_lock.lock().await;

        let Some(current) = self.current_session() else {
            return Ok(None);
        };
        if !current.needs_refresh(Utc::now()) {
            self.inner
                .status
                .send_if_modified(|status| match status {
                    SessionStatus::Authenticated(_) => false,
                    other => {
                        *other = SessionStatus::Authenticated(current.user.clone());
                        true
                    }
                });
            return Ok(Some(current));
        }

        debug!(user_id = %current.user.id, "Refreshing access token");
        let refreshed = self
            .token_request(
                self.inner.config.auth_url("token"),
                &[("grant_type", "refresh_token")],
                serde_json::json!({ "refresh_token": current.refresh_token }),
            )
            .await;

        match refreshed {
            Ok(session) => {
                self.install(session.clone()).await?;
                Ok(Some(session))
            }
            Err(e) => {
                warn!(error = ?e, "Token refresh failed");
                let reason = e.to_string();
                self.inner
                    .status
                    .send_replace(SessionStatus::RefreshFailure(reason.clone()));
                Err(AuthError::RefreshFailed(reason))
            }
        }
    }
}

impl IdentityProvider for SupabaseAuth {
    fn current_user_id(&self) -> Option<String> {
        self.inner.session.lock().as_ref().map(|s| s.user.id.clone())
    }

    fn access_token(&self) -> BoxFuture<'static, Result<Option<String>, AuthError>> {
        let this = self.clone();
        Box::pin(async move {
            Ok(this
                .ensure_fresh()
                .await?
                .map(|session| session.access_token))
        })
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    async fn send_otp(&self, email: &str) -> Result<(), AuthError> {
        self.post_json(
            self.inner.config.auth_url("otp"),
            &[],
            serde_json::json!({ "email": email, "create_user": true }),
        )
        .await?;
        debug!(email, "One-time code sent");
        Ok(())
    }

    async fn verify_otp(&self, email: &str, token: &str) -> Result<UserProfile, AuthError> {
        let session = self
            .token_request(
                self.inner.config.auth_url("verify"),
                &[],
                serde_json::json!({ "type": "email", "email": email, "token": token }),
            )
            .await?;
        self.install(session).await
    }

    async fn sign_in_with_id_token(
        &self,
        id_token: &str,
        nonce: Option<&str>,
    ) -> Result<UserProfile, AuthError> {
        let mut body = serde_json::json!({ "provider": "google", "id_token": id_token });
        if let Some(nonce) = nonce {
            body["nonce"] = serde_json::Value::String(nonce.to_string());
        }

        let session = self
            .token_request(
                self.inner.config.auth_url("token"),
                &[("grant_type", "id_token")],
                body,
            )
            .await?;
        self.install(session).await
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        let session = self.inner.session.lock().take();

        if let Some(session) = session {
            let result = self
                .inner
                .client
                .post(self.inner.config.auth_url("logout"))
                .header("apikey", &self.inner.config.anon_key)
                .bearer_auth(&session.access_token)
                .send()
                .await;
            // The local session is dropped even if the server call fails.
            if let Err(e) = result {
                warn!(error = ?e, "Remote sign-out failed");
            }
        }

        if let Some(store) = &self.inner.store {
            store.clear().await?;
        }
        self.inner.status.send_replace(SessionStatus::NotAuthenticated);
        info!("Signed out");
        Ok(())
    }

    fn status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }
}
