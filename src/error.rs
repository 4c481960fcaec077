//! Error types for the schema-change core.
//!
//! One enum for the whole crate, with constructor helpers and a
//! retriability classification used by the transaction retry layer.

use thiserror::Error;

/// Errors produced by the copier, the binlog tracker and their collaborators.
#[derive(Error, Debug)]
pub enum ShiftError {
    /// Configuration error (bad concurrency, missing descriptor, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Table descriptor error
    #[error("table error: {0}")]
    Table(String),

    /// Chunker error
    #[error("chunker error: {0}")]
    Chunker(String),

    /// MySQL protocol or server error
    #[error("MySQL error: {0}")]
    MySql(#[from] mysql_async::Error),

    /// Replication stream error
    #[error("replication error: {0}")]
    Replication(String),

    /// The synced binlog position is no longer on the server
    #[error("binlog position is impossible, the source may have already purged it: {0}")]
    PositionPurged(String),

    /// Invalid state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Timeout
    #[error("timeout: {0}")]
    Timeout(String),

    /// Operation cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

// MySQL server error codes relevant to the retry layer.
const ER_LOCK_DEADLOCK: u16 = 1213;
const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;

impl ShiftError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new table descriptor error
    pub fn table(msg: impl Into<String>) -> Self {
        Self::Table(msg.into())
    }

    /// Create a new chunker error
    pub fn chunker(msg: impl Into<String>) -> Self {
        Self::Chunker(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The MySQL server error code, if this wraps a server-side error.
    pub fn mysql_server_code(&self) -> Option<u16> {
        match self {
            Self::MySql(mysql_async::Error::Server(e)) => Some(e.code),
            _ => None,
        }
    }

    /// True for a deadlock rollback (always safe to retry).
    pub fn is_deadlock(&self) -> bool {
        self.mysql_server_code() == Some(ER_LOCK_DEADLOCK)
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry:
    /// deadlocks, lock wait timeouts and connection-level I/O failures.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::MySql(mysql_async::Error::Server(e)) => {
                e.code == ER_LOCK_DEADLOCK || e.code == ER_LOCK_WAIT_TIMEOUT
            }
            Self::MySql(mysql_async::Error::Io(_)) => true,
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }
}

/// Result type for the schema-change core
pub type Result<T> = std::result::Result<T, ShiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ShiftError::replication("stream closed");
        assert!(err.to_string().contains("replication error"));
        assert!(err.to_string().contains("stream closed"));
    }

    #[test]
    fn test_error_constructors() {
        let _ = ShiftError::config("missing descriptor");
        let _ = ShiftError::chunker("not open");
        let _ = ShiftError::timeout("5 seconds");
        let _ = ShiftError::other("unknown");
    }

    #[test]
    fn test_non_retriable() {
        assert!(!ShiftError::config("bad").is_retriable());
        assert!(!ShiftError::replication("gone").is_retriable());
        assert!(!ShiftError::Cancelled.is_retriable());
        assert!(!ShiftError::PositionPurged("binlog.000001:4".into()).is_retriable());
    }

    #[test]
    fn test_io_retriable() {
        let err = ShiftError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(err.is_retriable());

        let err = ShiftError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert!(!err.is_retriable());
    }
}
