//! Failures of the durable result slot backends.

/// What can go wrong talking to a slot backend.
///
/// The in-memory slot never fails; these come from the Redis backend.
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    /// Could not open a client or build the pool at startup.
    #[error("slot backend unreachable: {0}")]
    Unreachable(String),

    #[cfg(feature = "cache")]
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "cache")]
    #[error("no pooled slot connection: {0}")]
    Pool(#[from] bb8::RunError<redis::RedisError>),

    /// The stored value (or a change notification) is not a slot entry.
    #[error("malformed slot entry: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type SlotResult<T> = Result<T, SlotError>;
