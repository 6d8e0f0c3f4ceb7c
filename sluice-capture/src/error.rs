//! Capture error types.

use sluice_domain::DomainError;
use thiserror::Error;

/// Errors raised by the capture plane.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Row logging invoked from a replication session would loop changes
    /// back to their origin
    #[error("Row capture called in a replication session")]
    CaptureInReplicationSession,

    /// Application write against a replicated table on a subscriber
    #[error("Table {table} is replicated and cannot be modified on a subscriber node")]
    SubscriberWriteDenied {
        /// The refused table
        table: String,
    },

    /// Key columns must never be NULL in old row images
    #[error("Old key column {table}.{column} IS NULL on {op}")]
    NullKeyColumn {
        table: String,
        column: String,
        op: &'static str,
    },

    /// Row image width disagrees with the table's attkind
    #[error("Row image for {table} has {got} columns, attkind describes {expected}")]
    AttKindMismatch {
        table: String,
        expected: usize,
        got: usize,
    },

    /// Only NULL and TERM are accepted signal names
    #[error("Unsupported signal: {0}")]
    UnsupportedSignal(String),

    /// Privileged helper invoked without superuser
    #[error("Insufficient privilege for {0}")]
    InsufficientPrivilege(&'static str),

    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
