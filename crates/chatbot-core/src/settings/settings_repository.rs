use thiserror::Error;

use super::app_settings::AppSettings;
use crate::repositories::BoxFuture;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Path error: {0}")]
    PathError(String),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

pub trait SettingsRepository: Send + Sync + 'static {
    /// Load settings from storage, defaults when nothing is stored yet
    fn load(&self) -> BoxFuture<'static, SettingsResult<AppSettings>>;

    /// Save settings to storage
    fn save(&self, settings: AppSettings) -> BoxFuture<'static, SettingsResult<()>>;

    /// Get the storage path (for diagnostics)
    fn storage_path(&self) -> String;
}
