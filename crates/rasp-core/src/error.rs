use thiserror::Error;

/// Error taxonomy for the pipeline, independent of any single component.
///
/// `Config` is startup-fatal and never surfaced to clients once the service
/// is running. `Validation`/`NotOwner`/`InsufficientBalance` map to 4xx
/// responses before a stream opens. `Network`/`ProviderNon2xx`/`RateLimit`
/// are retried per component policy before becoming `Storage`/503-class
/// failures at the orchestrator boundary.
#[derive(Debug, Error)]
pub enum RaspError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("user {user_id} does not own chat {chat_id}")]
    NotOwner { user_id: i64, chat_id: i64 },

    #[error("insufficient balance: {required} credits required")]
    InsufficientBalance { required: i64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned a non-2xx response: {0}")]
    ProviderNon2xx(String),

    #[error("rate limited{}", .retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimit { retry_after_secs: Option<u64> },

    #[error("provider quota exceeded: {0}")]
    Quota(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RaspError {
    /// Whether this error class is retried by the calling component per the
    /// retry policy shared by EmbeddingClient/VectorStoreClient/CompletionClient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaspError::Network(_) | RaspError::ProviderNon2xx(_) | RaspError::RateLimit { .. }
        )
    }
}

pub type RaspResult<T> = Result<T, RaspError>;
