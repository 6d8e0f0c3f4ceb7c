//! Identity newtypes.
//!
//! All cluster identities are small integers assigned by the administrator;
//! sequence numbers and transaction ids are 64-bit and assigned by the
//! database. The newtypes keep them from being mixed up in signatures.

use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// NodeId
// =============================================================================

/// A participating database, identified by a small positive integer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct NodeId(i32);

impl NodeId {
    /// Create a new NodeId with validation.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidNodeId` if value <= 0
    pub fn new(value: i32) -> Result<Self, DomainError> {
        if value <= 0 {
            return Err(DomainError::InvalidNodeId(value));
        }
        Ok(Self(value))
    }

    /// Get the raw id.
    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// SetId / TableId / SeqId
// =============================================================================

/// A replication set: the atomic unit of tables and sequences.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct SetId(pub i32);

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A replicated table within a set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct TableId(pub i32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A replicated sequence within a set.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct SeqId(pub i32);

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// EventSeq
// =============================================================================

/// A per-origin event sequence number.
///
/// Strictly monotonically increasing in commit order on the origin; the
/// exclusive lock taken by the event builder guarantees assignment order
/// equals commit order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct EventSeq(pub i64);

impl EventSeq {
    /// The watermark before any event has been confirmed.
    pub const ZERO: EventSeq = EventSeq(0);

    /// The next sequence number after this one.
    pub fn next(&self) -> EventSeq {
        EventSeq(self.0 + 1)
    }

    /// Get the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for EventSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Xxid
// =============================================================================

/// A 64-bit epoch-extended transaction id.
///
/// PostgreSQL's native 32-bit xids wrap around; `txid_current()` and
/// `txid_current_snapshot()` return values widened with the wraparound
/// epoch, which survive for the lifetime of SYNC snapshots.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct Xxid(pub i64);

impl Xxid {
    /// Get the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Xxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_rejects_nonpositive() {
        assert!(NodeId::new(0).is_err());
        assert!(NodeId::new(-3).is_err());
        assert_eq!(NodeId::new(7).unwrap().as_i32(), 7);
    }

    #[test]
    fn test_event_seq_next() {
        assert_eq!(EventSeq(41).next(), EventSeq(42));
        assert_eq!(EventSeq::ZERO.next().as_i64(), 1);
    }
}
