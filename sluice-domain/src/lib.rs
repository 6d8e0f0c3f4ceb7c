//! Sluice Domain Layer
//!
//! Core types shared by every part of the replication engine: node and set
//! identities, event sequence numbers, transaction snapshots and the SYNC
//! visibility rules, column kind strings, and the event/log-row records
//! that mirror the cluster schema.
//!
//! Pure domain logic; the only I/O-adjacent code here is the `sqlx::FromRow`
//! derives on the row records.

pub mod attkind;
pub mod error;
pub mod events;
pub mod ids;
pub mod snapshot;

pub use attkind::{AttKind, ColumnKind};
pub use error::DomainError;
pub use events::{CmdType, Event, EventType, LogRow};
pub use ids::{EventSeq, NodeId, SeqId, SetId, TableId, Xxid};
pub use snapshot::{SyncWindow, TxSnapshot};
