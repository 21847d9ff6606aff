pub mod auth_service;
pub mod backoff;
pub mod completion_service;
pub mod gemini_service;
pub mod realtime_service;
pub mod supabase;

pub use auth_service::{
    AuthError, AuthProvider, AuthSession, GoogleNonce, IdentityProvider, SessionFile,
    SessionStatus, SupabaseAuth, UserProfile,
};
pub use backoff::BackoffConfig;
pub use completion_service::{CompletionError, CompletionSource, ResponseStream, StreamChunk};
pub use gemini_service::{GeminiCompletionSource, GeminiConfig};
pub use realtime_service::SupabaseRealtimeFeed;
pub use supabase::SupabaseConfig;
