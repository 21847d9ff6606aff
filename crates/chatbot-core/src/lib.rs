pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use models::{
    ChatListReconciler, ChatSession, Phase, RequestOutcome, SessionError, SessionEvent,
    SessionSnapshot,
};
pub use repositories::{ChatRepository, RepositoryError, RepositoryResult};
pub use services::{CompletionSource, IdentityProvider};
