//! Error types for the transfer engine.
//!
//! Every failure a transfer can end with is expressed as a [`TransferError`].
//! The variants follow the retry taxonomy used by the part transmitter:
//! only [`TransferError::Transport`] is ever retried, everything else ends
//! the owning task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Why the remote service refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// An object already exists at the target and overwrite was not requested.
    Conflict,
    /// Confirm was requested while parts of the session are still missing.
    IncompleteSession {
        /// Indices of the parts that are not done.
        missing: Vec<u32>,
    },
    /// The confirmation key is unknown, expired, or already consumed.
    SessionNotFound,
    /// The object does not exist.
    NotFound,
    /// Any other client-side rejection, with the server's code/message.
    Other(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => write!(f, "object already exists"),
            Self::IncompleteSession { missing } if missing.is_empty() => {
                write!(f, "upload session is incomplete")
            }
            Self::IncompleteSession { missing } => {
                write!(f, "upload session is incomplete, missing parts {missing:?}")
            }
            Self::SessionNotFound => write!(f, "upload session not found"),
            Self::NotFound => write!(f, "object not found"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

/// Errors that can end a transfer or one of its parts.
///
/// The type is `Clone` so that every caller attached to the same task can
/// observe the same terminal error; underlying I/O errors are kept behind
/// an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// Network-level failure or timeout. The only retryable kind.
    #[error("transport error during {operation}: {message}")]
    Transport {
        /// The remote operation that failed.
        operation: &'static str,
        /// Human-readable cause.
        message: String,
        /// Delay the server asked for before trying again, if any.
        retry_after: Option<Duration>,
    },

    /// The server refused the request (4xx-equivalent). Never retried.
    #[error("server rejected {operation} (HTTP {status}): {rejection}")]
    ServerRejected {
        /// The remote operation that was rejected.
        operation: &'static str,
        /// Status code reported by the transport, 0 when raised locally.
        status: u16,
        /// Classified reason.
        rejection: Rejection,
    },

    /// A part's integrity tag or length, or the whole object's checksum,
    /// does not match what was sent or expected.
    #[error("integrity mismatch on part {part_index}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// The part that failed verification; 0 for the whole object.
        part_index: u32,
        /// Expected tag or byte count.
        expected: String,
        /// Observed tag or byte count.
        actual: String,
    },

    /// The transfer was canceled by the caller.
    #[error("transfer canceled")]
    Canceled,

    /// Reading the source or writing the destination failed.
    #[error("local I/O error while {context}: {source}")]
    LocalIo {
        /// What the engine was doing.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The request cannot be carried out as described.
    #[error("invalid transfer request: {reason}")]
    InvalidRequest {
        /// What is wrong with it.
        reason: String,
    },
}

impl TransferError {
    /// Creates a transport error.
    pub fn transport(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a transport error carrying a server-requested retry delay.
    pub fn transport_with_retry_after(
        operation: &'static str,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::Transport {
            operation,
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a server rejection.
    pub fn rejected(operation: &'static str, status: u16, rejection: Rejection) -> Self {
        Self::ServerRejected {
            operation,
            status,
            rejection,
        }
    }

    /// Creates a conflict rejection for an existing object.
    pub fn conflict(operation: &'static str) -> Self {
        Self::rejected(operation, 409, Rejection::Conflict)
    }

    /// Creates an incomplete-session rejection.
    pub fn incomplete_session(operation: &'static str, status: u16, missing: Vec<u32>) -> Self {
        Self::rejected(operation, status, Rejection::IncompleteSession { missing })
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(
        part_index: u32,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::IntegrityMismatch {
            part_index,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a whole-object CRC64 mismatch.
    pub fn checksum_mismatch(expected: u64, actual: u64) -> Self {
        Self::integrity(0, format!("crc64 {expected}"), format!("crc64 {actual}"))
    }

    /// Creates a local I/O error.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::LocalIo {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Creates an invalid-request error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Returns true for the user-requested cancellation outcome.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns the rejection detail when this is a server rejection.
    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::ServerRejected { rejection, .. } => Some(rejection),
            _ => None,
        }
    }
}
