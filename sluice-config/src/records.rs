//! Topology records.

use sluice_domain::{EventSeq, NodeId, SetId};

/// A remote node as this daemon sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub active: bool,
    pub comment: String,
    /// Highest event from this origin known applied locally
    pub last_event: EventSeq,
}

/// Connection info from the local node (client) to a server node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub server: NodeId,
    pub conninfo: String,
    /// Seconds between reconnect attempts
    pub connretry: u32,
}

/// Declaration that the local node consumes events originating at
/// `origin` via `provider`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListenRecord {
    pub origin: NodeId,
    pub provider: NodeId,
}

/// A replication set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRecord {
    pub id: SetId,
    pub origin: NodeId,
    pub comment: String,
}

/// The local node's subscription to a set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub set: SetId,
    pub provider: NodeId,
    /// Keep log data so further subscribers can pull from here
    pub forward: bool,
    /// False while the initial copy has not completed
    pub active: bool,
}
