use futures::stream::BoxStream;
use thiserror::Error;

use crate::models::Turn;
use crate::repositories::BoxFuture;

/// Stream chunks emitted during responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Text(String),
    Done,
    Error(String),
}

/// Lazy, finite, non-restartable fragment sequence.
///
/// Dropping the stream cancels the underlying transport.
pub type ResponseStream = BoxStream<'static, StreamChunk>;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Completion service is not configured: {0}")]
    NotConfigured(String),

    #[error("Completion request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conversation history is empty")]
    EmptyHistory,
}

/// Remote service turning ordered conversation history into streamed text.
pub trait CompletionSource: Send + Sync + 'static {
    fn stream_completion(
        &self,
        history: Vec<Turn>,
    ) -> BoxFuture<'static, Result<ResponseStream, CompletionError>>;
}
