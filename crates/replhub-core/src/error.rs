//! Error types for the replication pipeline.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ReplError>;

/// Errors that can occur anywhere in the replication pipeline.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Network blip, throttling or another failure worth retrying.
    #[error("transient error during {op}: {msg}")]
    Transient {
        /// The operation that failed (e.g. "list", "upload_part").
        op: String,
        /// Error message describing the issue.
        msg: String,
    },

    /// The object (or upload) no longer exists in the store.
    #[error("object not found: {key}")]
    NotFound {
        /// The missing key.
        key: String,
    },

    /// The store refused the request.
    #[error("access denied: {msg}")]
    AccessDenied {
        /// Error message from the store.
        msg: String,
    },

    /// Fetched byte count does not match the size recorded for the job.
    #[error("size mismatch for {key}: expected {expected}, got {actual}")]
    SizeMismatch {
        /// The object key.
        key: String,
        /// Size announced by the job or source head.
        expected: u64,
        /// Bytes actually fetched.
        actual: u64,
    },

    /// Multipart protocol violation or a failed part.
    #[error("multipart upload {upload_id} failed: {msg}")]
    Multipart {
        /// The upload identifier.
        upload_id: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// Job ledger read/write error.
    #[error("ledger error: {msg}")]
    Ledger {
        /// Error message describing the issue.
        msg: String,
    },

    /// Work queue error.
    #[error("queue error: {msg}")]
    Queue {
        /// Error message describing the issue.
        msg: String,
    },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// A credential reference could not be resolved.
    #[error("credential reference not found: {name}")]
    Credential {
        /// The unresolved reference.
        name: String,
    },

    /// A job exceeded its wall-clock budget.
    #[error("job for {key} timed out after {secs}s")]
    Timeout {
        /// The object key.
        key: String,
        /// The timeout that elapsed.
        secs: u64,
    },

    /// A queue message body could not be decoded into jobs.
    #[error("invalid message: {msg}")]
    InvalidMessage {
        /// Error message describing the problem.
        msg: String,
    },

    /// JSON encode/decode error.
    #[error("json error")]
    Json(#[from] serde_json::Error),

    /// Snapshot encode/decode error.
    #[error("snapshot serialization error")]
    Snapshot(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReplError {
    /// Shorthand for a transient error.
    pub fn transient(op: &str, msg: impl Into<String>) -> Self {
        Self::Transient {
            op: op.to_string(),
            msg: msg.into(),
        }
    }

    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { msg: msg.into() }
    }

    /// Returns true if the failed operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
