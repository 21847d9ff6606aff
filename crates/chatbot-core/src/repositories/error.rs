use thiserror::Error;

#[derive(Debug, Error)]
#[allow(clippy::enum_variant_names)]
pub enum RepositoryError {
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Not authorized: {message}")]
    Unauthorized { message: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    #[error("Repository initialization failed: {message}")]
    InitializationError { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl RepositoryError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BackendUnavailable { .. } | Self::IoError(_) => true,
            Self::DatabaseError(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            Self::HttpError(e) => {
                e.is_connect()
                    || e.is_timeout()
                    || e.status().is_some_and(|s| s.is_server_error())
            }
            _ => false,
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RepositoryError::unavailable("down").is_transient());
        assert!(!RepositoryError::not_found("chat", "c1").is_transient());
        assert!(
            !RepositoryError::Rejected {
                status: 409,
                message: "duplicate".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = RepositoryError::not_found("chat", "c1");
        assert_eq!(err.to_string(), "chat not found: c1");
    }
}
