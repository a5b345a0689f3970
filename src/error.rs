use thiserror::Error;

/// Crate-wide result type.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Coarse classification used by the per-layer error policy:
/// allocator and sweeper swallow everything, actor handlers log and keep
/// processing, the facade maps benign misses to empty results and only
/// surfaces `Fatal` to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lookup miss, often benign (unknown ack, missing counter row).
    NotFound,
    /// Optimistic failure on shard allocation or a state transition.
    Conflict,
    /// Storage fault, retryable on the next tick.
    Transient,
    /// Invalid configuration or schema mismatch; surfaced to the caller.
    Fatal,
}

#[derive(Debug, Error)]
pub enum AppError {
    // =========
    // Config / startup
    // =========
    #[error("Configuration file IO error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse TOML config: {0}")]
    ConfigToml(#[from] toml::de::Error),

    #[error("Missing configuration field: {0}")]
    MissingConfig(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // =========
    // Queues / shards
    // =========
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue already exists: {0}")]
    QueueAlreadyExists(String),

    #[error("Shard {shard_id} already exists for queue '{queue}'")]
    ShardExists { queue: String, shard_id: u32 },

    #[error("No shard for queue '{queue}' in region '{region}'")]
    NoShard { queue: String, region: String },

    // =========
    // Messages
    // =========
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message body not found: {0}")]
    BodyNotFound(uuid::Uuid),

    // =========
    // Regions / transport
    // =========
    #[error("No transport route to region '{0}'")]
    NoRoute(String),

    // =========
    // Storage
    // =========
    #[error("Storage error: {0}")]
    Storage(String),

    // =========
    // Serialization
    // =========
    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    // =========
    // Metrics / Prometheus
    // =========
    #[error("Prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    // =========
    // Runtime
    // =========
    #[error("Failed to join task: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::QueueNotFound(_)
            | AppError::MessageNotFound(_)
            | AppError::BodyNotFound(_)
            | AppError::NoShard { .. } => ErrorKind::NotFound,

            AppError::QueueAlreadyExists(_) | AppError::ShardExists { .. } => ErrorKind::Conflict,

            AppError::Storage(_) | AppError::TaskJoin(_) | AppError::Shutdown => {
                ErrorKind::Transient
            }

            _ => ErrorKind::Fatal,
        }
    }

    /// True for misses the facade should fold into an empty result / no-op.
    pub fn is_benign(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_policy() {
        assert_eq!(
            AppError::QueueNotFound("q".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            AppError::QueueAlreadyExists("q".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            AppError::Storage("timeout".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            AppError::InvalidConfig("bad".into()).kind(),
            ErrorKind::Fatal
        );
        assert!(AppError::MessageNotFound("m".into()).is_benign());
        assert!(!AppError::Storage("timeout".into()).is_benign());
    }
}
