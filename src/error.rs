//! Error types for the KV client

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the client and its transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    /// Transport or timeout failure that survived every retry.
    #[error("network failure: {0}")]
    Network(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key already exists: {0}")]
    DuplicateKey(String),

    /// Unexpected status or malformed message; the exchange is out of sync.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session is not connected")]
    NotConnected,
}

impl KvError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether a fresh worker and another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Protocol(_) | Self::Timeout(_) | Self::Transport(_)
        )
    }
}

pub type Result<T, E = KvError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(KvError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(KvError::transport("endpoint reset").is_retryable());
        assert!(KvError::protocol("unexpected status 999").is_retryable());
        assert!(!KvError::KeyNotFound("k".into()).is_retryable());
        assert!(!KvError::DuplicateKey("k".into()).is_retryable());
        assert!(!KvError::NotConnected.is_retryable());
    }
}
