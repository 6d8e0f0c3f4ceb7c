//! Daemon error types and failure classification.

use sluice_capture::CaptureError;
use sluice_config::{ApplyError, ConfigError};
use sluice_db::DbError;
use sluice_domain::{DomainError, NodeId};
use thiserror::Error;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another daemon already serves this cluster and node
    #[error("Another daemon is already running for cluster {cluster} node {node}")]
    AlreadyRunning { cluster: String, node: NodeId },

    /// Peer misbehaved: unknown event type, impossible ordering, …
    #[error("Protocol violation from node {node}: {detail}")]
    ProtocolViolation { node: NodeId, detail: String },

    /// Captured change no longer applies cleanly; operator must intervene
    #[error("Unrecoverable replication error on node {node}: {detail}")]
    ReplicationData { node: NodeId, detail: String },

    /// Schema lifecycle error
    #[error("Schema error: {0}")]
    Db(#[from] DbError),

    /// Capture plane error
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Runtime configuration error
    #[error("Runtime config error: {0}")]
    RuntimeConfig(#[from] ConfigError),

    /// Event application error
    #[error("Event apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error (pidfile, archive dir)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

/// SQLSTATE classes that mean "retry the same transaction".
pub fn sqlstate_is_serialization(code: &str) -> bool {
    // serialization_failure / deadlock_detected
    code == "40001" || code == "40P01"
}

/// Does this error mean the current transaction should be retried as-is?
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|c| sqlstate_is_serialization(&c))
            .unwrap_or(false),
        _ => false,
    }
}

/// Does this error mean the connection is gone and the worker should
/// reconnect with backoff?
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_sqlstates() {
        assert!(sqlstate_is_serialization("40001"));
        assert!(sqlstate_is_serialization("40P01"));
        assert!(!sqlstate_is_serialization("23505"));
        assert!(!sqlstate_is_serialization("42601"));
    }

    #[test]
    fn test_io_errors_are_transient() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transient(&err));
        assert!(!is_serialization_failure(&err));
    }

    #[test]
    fn test_row_not_found_not_transient() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }
}
