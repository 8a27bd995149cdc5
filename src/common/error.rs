//! # Error Taxonomy
//!
//! Every failure inside a sync run is expressed as a [`SyncError`]. The variants
//! follow how the failure must be handled, not where it happened:
//!
//! - **Validation / InvalidInput**: bad input, never retried
//! - **Protocol**: the device broke the digest handshake, never retried
//! - **Transient / Timeout**: network trouble, 429 or 5xx, retried with backoff
//! - **Http / DeviceRejection / FaceUpsertFailed**: a definitive answer from the far side
//! - **RegistryUnavailable**: the device list could not be fetched, fatal for the run

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the library.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors produced by the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The face payload failed one or more validation checks.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A caller handed over a record with an impossible shape.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The device violated the digest protocol (missing or malformed challenge).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Network-level failure, 429 or 5xx. Safe to retry.
    #[error("transient network error: {message}")]
    Transient {
        /// Human readable cause.
        message: String,
        /// HTTP status when the failure was a retryable status code.
        status: Option<u16>,
    },

    /// An attempt exceeded its deadline.
    #[error("request timed out after {0} ms")]
    Timeout(u64),

    /// Non-retryable HTTP status from a plain transfer (e.g. image download 404).
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// The device answered with a definitive business error.
    #[error("device rejected request (HTTP {status}): {body}")]
    DeviceRejection {
        /// Status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// Both the add and the update face operations were rejected.
    #[error("face upsert failed; add: {add}; update: {update}")]
    FaceUpsertFailed {
        /// Truncated failure body of the add call.
        add: String,
        /// Truncated failure body of the update call.
        update: String,
    },

    /// The device registry could not be read.
    #[error("device registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// The HTTP client could not be built.
    #[error("http client error: {0}")]
    Client(String),

    /// The shared face limiter was closed.
    #[error("face upload limiter closed")]
    LimiterClosed,
}

/// Coarse error classification recorded in sync outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidInput,
    Protocol,
    TransientNetwork,
    DeviceRejection,
    RegistryUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::InvalidInput => "invalid_input",
            Self::Protocol => "protocol",
            Self::TransientNetwork => "transient_network",
            Self::DeviceRejection => "device_rejection",
            Self::RegistryUnavailable => "registry_unavailable",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            status: None,
        }
    }

    /// Creates a retryable error for a 429 / 5xx status.
    pub fn transient_status(status: u16) -> Self {
        Self::Transient {
            message: format!("HTTP {}", status),
            status: Some(status),
        }
    }

    /// Returns true if the operation may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout(_))
    }

    /// Maps the error onto the outcome classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Transient { .. } | Self::Timeout(_) | Self::Client(_) | Self::LimiterClosed => {
                ErrorKind::TransientNetwork
            }
            Self::Http { .. } | Self::DeviceRejection { .. } | Self::FaceUpsertFailed { .. } => {
                ErrorKind::DeviceRejection
            }
            Self::RegistryUnavailable(_) => ErrorKind::RegistryUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::transient("connection reset").is_retryable());
        assert!(SyncError::transient_status(503).is_retryable());
        assert!(SyncError::Timeout(10_000).is_retryable());
        assert!(!SyncError::Protocol("missing challenge".into()).is_retryable());
        assert!(!SyncError::Http {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!SyncError::Validation(vec!["name required".into()]).is_retryable());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(SyncError::Timeout(1).kind(), ErrorKind::TransientNetwork);
        assert_eq!(
            SyncError::RegistryUnavailable("db down".into()).kind(),
            ErrorKind::RegistryUnavailable
        );
        assert_eq!(
            SyncError::FaceUpsertFailed {
                add: "a".into(),
                update: "b".into()
            }
            .kind(),
            ErrorKind::DeviceRejection
        );
        assert_eq!(ErrorKind::TransientNetwork.to_string(), "transient_network");
    }

    #[test]
    fn test_validation_display_joins_issues() {
        let err = SyncError::Validation(vec!["name required".into(), "photo not JPEG".into()]);
        assert_eq!(
            err.to_string(),
            "validation failed: name required; photo not JPEG"
        );
    }
}
