//! Error types for the key-value watch source.

use thiserror::Error;

/// Result type alias for key-value operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur while reading or watching the key-value store.
#[derive(Debug, Error)]
pub enum KvError {
    /// A key or prefix path failed validation.
    #[error("invalid key path '{path}': {reason}")]
    InvalidPath {
        /// The rejected path.
        path: String,
        /// Why the path was rejected.
        reason: String,
    },

    /// The store could not be reached (connection refused, reset, timed out).
    #[error("transport error: {0}")]
    Transport(String),

    /// The store answered with an unexpected HTTP status.
    #[error("unexpected status {status} from {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Request URL.
        url: String,
    },

    /// The store answered with a body or header that could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The backend has shut down.
    #[error("backend closed")]
    Closed,
}

impl KvError {
    /// Creates an invalid path error.
    #[must_use]
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same request later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Status { .. } | Self::Decode(_)
        )
    }
}

impl From<reqwest::Error> for KvError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = KvError::invalid_path("/etc", "leading slash");
        assert_eq!(err.to_string(), "invalid key path '/etc': leading slash");

        let err = KvError::Status {
            status: 500,
            url: "http://127.0.0.1:8500/v1/kv/a".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unexpected status 500 from http://127.0.0.1:8500/v1/kv/a"
        );

        assert_eq!(KvError::Closed.to_string(), "backend closed");
    }

    #[test]
    fn transient_classification() {
        assert!(KvError::Transport("reset".to_string()).is_transient());
        assert!(KvError::Decode("bad index".to_string()).is_transient());
        assert!(!KvError::Closed.is_transient());
        assert!(!KvError::invalid_path("", "empty").is_transient());
    }
}
