use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::settings_repository::{SettingsError, SettingsResult};
use crate::models::SessionConfig;
use crate::services::backoff::BackoffConfig;
use crate::services::gemini_service::{DEFAULT_GEMINI_BASE_URL, DEFAULT_GEMINI_MODEL, GeminiConfig};
use crate::services::supabase::SupabaseConfig;

/// Where chats and messages are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Supabase,
    Sqlite,
    Memory,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "supabase" => Some(Self::Supabase),
            "sqlite" => Some(Self::Sqlite),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub store: StoreBackend,
    /// SQLite file; the platform config dir when unset
    pub sqlite_path: Option<PathBuf>,
    pub realtime_heartbeat_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_multiplier: f64,
    pub commit_retries: u32,
    pub commit_retry_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_key: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            store: StoreBackend::Sqlite,
            sqlite_path: None,
            realtime_heartbeat_secs: 25,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_multiplier: 2.0,
            commit_retries: 1,
            commit_retry_ms: 200,
        }
    }
}

impl AppSettings {
    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> SettingsResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (`SUPABASE_URL`, `SUPABASE_KEY`,
    /// `GEMINI_API_KEY`, `GEMINI_MODEL`, `CHATBOT_STORE`).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> SettingsResult<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("SUPABASE_URL") {
            self.supabase_url = Some(url);
        }
        if let Some(key) = get("SUPABASE_KEY") {
            self.supabase_key = Some(key);
        }
        if let Some(key) = get("GEMINI_API_KEY") {
            self.gemini_api_key = Some(key);
        }
        if let Some(model) = get("GEMINI_MODEL") {
            self.gemini_model = model;
        }
        if let Some(store) = get("CHATBOT_STORE") {
            self.store = StoreBackend::parse(&store).ok_or(SettingsError::InvalidValue {
                key: "CHATBOT_STORE",
                value: store,
            })?;
        }
        Ok(self)
    }

    /// Supabase project settings, if both url and key are present.
    pub fn supabase(&self) -> Option<SupabaseConfig> {
        match (&self.supabase_url, &self.supabase_key) {
            (Some(url), Some(key)) => Some(SupabaseConfig::new(url.as_str(), key.as_str())),
            _ => None,
        }
    }

    pub fn gemini(&self) -> GeminiConfig {
        GeminiConfig {
            api_key: self.gemini_api_key.clone().unwrap_or_default(),
            model: self.gemini_model.clone(),
            base_url: self.gemini_base_url.clone(),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.realtime_heartbeat_secs.max(1))
    }

    pub fn reconnect_backoff(&self) -> BackoffConfig {
        BackoffConfig::new(
            Duration::from_millis(self.reconnect_initial_ms),
            Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
        )
        .with_multiplier(self.reconnect_multiplier.max(1.0))
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            commit_retries: self.commit_retries,
            commit_backoff: BackoffConfig::new(
                Duration::from_millis(self.commit_retry_ms),
                Duration::from_millis(self.commit_retry_ms.saturating_mul(10)),
            ),
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides_win() {
        let settings = AppSettings::default()
            .with_overrides(env(&[
                ("SUPABASE_URL", "https://x.supabase.co"),
                ("SUPABASE_KEY", "anon"),
                ("GEMINI_MODEL", "gemini-2.0-flash"),
                ("CHATBOT_STORE", "Supabase"),
                ("GEMINI_API_KEY", "  "),
            ]))
            .unwrap();

        assert_eq!(settings.store, StoreBackend::Supabase);
        assert_eq!(settings.gemini_model, "gemini-2.0-flash");
        assert!(settings.gemini_api_key.is_none());
        assert_eq!(settings.supabase().unwrap().anon_key, "anon");
    }

    #[test]
    fn test_invalid_store_is_rejected() {
        let result = AppSettings::default().with_overrides(env(&[("CHATBOT_STORE", "redis")]));
        assert!(matches!(
            result,
            Err(SettingsError::InvalidValue { key: "CHATBOT_STORE", .. })
        ));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"store": "memory", "commit_retries": 3}"#).unwrap();
        assert_eq!(settings.store, StoreBackend::Memory);
        assert_eq!(settings.session().commit_retries, 3);
        assert_eq!(settings.gemini_model, DEFAULT_GEMINI_MODEL);
        assert!(settings.supabase().is_none());
    }

    #[test]
    fn test_backoff_bounds_are_ordered() {
        let settings = AppSettings {
            reconnect_initial_ms: 2_000,
            reconnect_max_ms: 100,
            ..AppSettings::default()
        };
        let backoff = settings.reconnect_backoff();
        assert_eq!(backoff.max_backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_reconnect_multiplier_is_applied() {
        let settings = AppSettings {
            reconnect_initial_ms: 100,
            reconnect_max_ms: 10_000,
            reconnect_multiplier: 3.0,
            ..AppSettings::default()
        };
        let backoff = settings.reconnect_backoff();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(900));

        let damped = AppSettings {
            reconnect_multiplier: 0.5,
            ..AppSettings::default()
        };
        assert_eq!(damped.reconnect_backoff().backoff_multiplier, 1.0);
    }

    #[test]
    fn test_commit_retry_delay_comes_from_settings() {
        let settings = AppSettings {
            commit_retry_ms: 50,
            ..AppSettings::default()
        };
        let session = settings.session();
        assert_eq!(session.commit_backoff.delay(0), Duration::from_millis(50));
        assert_eq!(session.commit_backoff.max_backoff, Duration::from_millis(500));
    }
}
