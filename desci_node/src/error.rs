//! Error taxonomy for the synchronization pipeline

use thiserror::Error;

/// Result type used across the sync pipeline
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// RPC failure that may succeed on retry (timeouts, connection resets, rate limits)
    #[error("Transient RPC error: {0}")]
    TransientRpc(String),

    /// Malformed log payload; the event is skipped
    #[error("Failed to decode {event} at {tx_hash}:{log_index}: {reason}")]
    Decode {
        event: String,
        tx_hash: String,
        log_index: u64,
        reason: String,
    },

    /// Stored state disagrees with the chain; requires manual reconciliation
    #[error("State corruption in {column}: {reason}")]
    StateCorruption { column: &'static str, reason: String },

    #[error("Stale checkpoint for {listener}: attempted {attempted}, current {current}")]
    StaleCheckpoint {
        listener: String,
        attempted: u64,
        current: u64,
    },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        SyncError::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Whether a retry of the same operation can reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientRpc(_))
    }

    /// Errors that stop a listener instead of putting it in backoff
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::StateCorruption { .. } | SyncError::Config(_)
        )
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(err: rocksdb::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SyncError::TransientRpc("timeout".into()).is_transient());
        assert!(!SyncError::Storage("io".into()).is_transient());
        assert!(SyncError::StateCorruption {
            column: "research",
            reason: "bad bytes".into()
        }
        .is_fatal());
        assert!(!SyncError::StaleCheckpoint {
            listener: "desci".into(),
            attempted: 5,
            current: 10
        }
        .is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = SyncError::not_found("research", "demo-token-123");
        assert_eq!(err.to_string(), "research not found: demo-token-123");
    }
}
