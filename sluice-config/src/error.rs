//! Configuration error types.

use sluice_domain::{NodeId, SetId};
use thiserror::Error;

/// Errors raised by runtime configuration mutators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Referenced node is unknown
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// Referenced set is unknown
    #[error("Unknown set: {0}")]
    UnknownSet(SetId),

    /// Subscription for the given set does not exist on this node
    #[error("No subscription for set {0}")]
    UnknownSubscription(SetId),

    /// The local node cannot be dropped or stored as remote
    #[error("Operation targets the local node {0}")]
    TargetsLocalNode(NodeId),
}
