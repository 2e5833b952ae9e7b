//! haplane Error Types

use std::time::Duration;
use thiserror::Error;

/// Result type alias for haplane operations
pub type Result<T> = std::result::Result<T, Error>;

/// haplane error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Shared store errors
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Leadership conflict: expected epoch {expected:?}, store holds {actual:?}")]
    LeadershipConflict {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Stale epoch {attempted}: store is fenced at epoch {current}")]
    StaleEpoch { attempted: u64, current: u64 },

    // Rebind errors
    #[error("Rebind failed: {0}")]
    Rebind(String),

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    // Entity errors
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    // Lifecycle errors
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error may clear up on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::Rebind(_) | Error::Network(_)
        )
    }

    /// Check if this error means another node holds a newer leadership term
    pub fn is_fenced(&self) -> bool {
        matches!(
            self,
            Error::StaleEpoch { .. } | Error::LeadershipConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::StoreUnavailable("down".into()).is_retryable());
        assert!(Error::Rebind("bad snapshot".into()).is_retryable());
        assert!(!Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!Error::Config("x".into()).is_retryable());
    }

    #[test]
    fn test_fenced_classification() {
        assert!(Error::StaleEpoch { attempted: 1, current: 2 }.is_fenced());
        assert!(Error::LeadershipConflict { expected: Some(1), actual: Some(2) }.is_fenced());
        assert!(!Error::StoreUnavailable("down".into()).is_fenced());
        assert!(!Error::ShuttingDown.is_fenced());
    }
}
