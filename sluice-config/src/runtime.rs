//! The runtime configuration state.
//!
//! One instance per daemon, shared by the local listener (which mutates it
//! as administrative events arrive) and the remote workers (which read it
//! at every loop entry). Mutators are idempotent: re-storing an entity
//! with identical fields reports no change, re-storing with different
//! fields supersedes the old record. Callers wake affected workers when a
//! mutator reports a change.

use crate::error::ConfigError;
use crate::records::{ListenRecord, NodeRecord, PathRecord, SetRecord, SubscriptionRecord};
use sluice_domain::{EventSeq, NodeId, SetId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct ConfigState {
    nodes: BTreeMap<NodeId, NodeRecord>,
    paths: BTreeMap<NodeId, PathRecord>,
    listens: BTreeSet<ListenRecord>,
    sets: BTreeMap<SetId, SetRecord>,
    subscriptions: BTreeMap<SetId, SubscriptionRecord>,
    pending_activate: BTreeSet<NodeId>,
}

/// Cluster topology as this daemon currently understands it.
#[derive(Debug)]
pub struct RuntimeConfig {
    cluster: String,
    local_node: NodeId,
    state: Mutex<ConfigState>,
}

impl RuntimeConfig {
    /// Empty configuration for `cluster` on `local_node`; populated from
    /// the startup snapshot and then by administrative events.
    pub fn new(cluster: impl Into<String>, local_node: NodeId) -> Self {
        Self {
            cluster: cluster.into(),
            local_node,
            state: Mutex::new(ConfigState::default()),
        }
    }

    /// The cluster name.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The local node id.
    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Store or supersede a remote node record. Returns true when anything
    /// changed.
    pub fn store_node(&self, id: NodeId, active: bool, comment: &str) -> Result<bool, ConfigError> {
        if id == self.local_node {
            return Err(ConfigError::TargetsLocalNode(id));
        }
        let mut state = self.lock();
        let last_event = state
            .nodes
            .get(&id)
            .map(|n| n.last_event)
            .unwrap_or(EventSeq::ZERO);
        let record = NodeRecord {
            id,
            active,
            comment: comment.to_string(),
            last_event,
        };
        let changed = state.nodes.get(&id) != Some(&record);
        if changed {
            info!(node = %id, active, "Stored node");
            state.nodes.insert(id, record);
        }
        Ok(changed)
    }

    /// Mark a node active and remember it for deferred worker activation.
    pub fn enable_node(&self, id: NodeId) -> Result<(), ConfigError> {
        let mut state = self.lock();
        let node = state.nodes.get_mut(&id).ok_or(ConfigError::UnknownNode(id))?;
        node.active = true;
        state.pending_activate.insert(id);
        info!(node = %id, "Enabled node");
        Ok(())
    }

    /// Forget a node along with its path, listens, and subscriptions.
    pub fn drop_node(&self, id: NodeId) -> Result<(), ConfigError> {
        if id == self.local_node {
            return Err(ConfigError::TargetsLocalNode(id));
        }
        let mut state = self.lock();
        if state.nodes.remove(&id).is_none() {
            warn!(node = %id, "Dropped unknown node");
        }
        state.paths.remove(&id);
        state.pending_activate.remove(&id);
        state
            .listens
            .retain(|l| l.origin != id && l.provider != id);
        state.subscriptions.retain(|_, s| s.provider != id);
        info!(node = %id, "Dropped node");
        Ok(())
    }

    /// Snapshot of a node record.
    pub fn node(&self, id: NodeId) -> Option<NodeRecord> {
        self.lock().nodes.get(&id).cloned()
    }

    /// Ids of all known remote nodes.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.lock().nodes.keys().copied().collect()
    }

    // =========================================================================
    // Last-event watermarks
    // =========================================================================

    /// Raise the per-origin applied watermark. Never lowers it.
    pub fn set_node_last_event(&self, id: NodeId, seq: EventSeq) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(&id) {
            if seq > node.last_event {
                node.last_event = seq;
            }
        }
    }

    /// The per-origin applied watermark.
    pub fn node_last_event(&self, id: NodeId) -> Option<EventSeq> {
        self.lock().nodes.get(&id).map(|n| n.last_event)
    }

    // =========================================================================
    // Paths
    // =========================================================================

    /// Store or supersede the path to a server node. Returns true when
    /// anything changed.
    pub fn store_path(&self, server: NodeId, conninfo: &str, connretry: u32) -> bool {
        let record = PathRecord {
            server,
            conninfo: conninfo.to_string(),
            connretry,
        };
        let mut state = self.lock();
        let changed = state.paths.get(&server) != Some(&record);
        if changed {
            debug!(server = %server, connretry, "Stored path");
            state.paths.insert(server, record);
        }
        changed
    }

    /// Forget the path to a server node.
    pub fn drop_path(&self, server: NodeId) {
        self.lock().paths.remove(&server);
    }

    /// The path to a server node, if configured.
    pub fn path(&self, server: NodeId) -> Option<PathRecord> {
        self.lock().paths.get(&server).cloned()
    }

    // =========================================================================
    // Listens
    // =========================================================================

    /// Replace the full listen configuration for this receiver.
    pub fn reload_listen(&self, entries: impl IntoIterator<Item = ListenRecord>) {
        let mut state = self.lock();
        state.listens = entries.into_iter().collect();
        debug!(count = state.listens.len(), "Reloaded listen configuration");
    }

    /// Add one listen entry.
    pub fn store_listen(&self, origin: NodeId, provider: NodeId) -> bool {
        self.lock().listens.insert(ListenRecord { origin, provider })
    }

    /// Remove one listen entry.
    pub fn drop_listen(&self, origin: NodeId, provider: NodeId) -> bool {
        self.lock().listens.remove(&ListenRecord { origin, provider })
    }

    /// The provider this node receives events of `origin` through.
    pub fn event_provider(&self, origin: NodeId) -> Option<NodeId> {
        let state = self.lock();
        state
            .listens
            .iter()
            .find(|l| l.origin == origin)
            .map(|l| l.provider)
    }

    // =========================================================================
    // Sets
    // =========================================================================

    /// Store or supersede a set record.
    pub fn store_set(&self, id: SetId, origin: NodeId, comment: &str) -> bool {
        let record = SetRecord {
            id,
            origin,
            comment: comment.to_string(),
        };
        let mut state = self.lock();
        let changed = state.sets.get(&id) != Some(&record);
        if changed {
            info!(set = %id, origin = %origin, "Stored set");
            state.sets.insert(id, record);
        }
        changed
    }

    /// Forget a set and any local subscription to it.
    pub fn drop_set(&self, id: SetId) {
        let mut state = self.lock();
        state.sets.remove(&id);
        state.subscriptions.remove(&id);
        info!(set = %id, "Dropped set");
    }

    /// Fold `from` into `into`: `from` disappears, its subscription (if
    /// any) is absorbed by `into`'s.
    pub fn merge_set(&self, into: SetId, from: SetId) -> Result<(), ConfigError> {
        let mut state = self.lock();
        if !state.sets.contains_key(&into) {
            return Err(ConfigError::UnknownSet(into));
        }
        state.sets.remove(&from);
        state.subscriptions.remove(&from);
        info!(set = %into, merged = %from, "Merged set");
        Ok(())
    }

    /// Change a set's origin (switchover / failover).
    pub fn move_set(&self, id: SetId, new_origin: NodeId) -> Result<(), ConfigError> {
        let mut state = self.lock();
        let set = state.sets.get_mut(&id).ok_or(ConfigError::UnknownSet(id))?;
        let old_origin = set.origin;
        set.origin = new_origin;
        info!(set = %id, from = %old_origin, to = %new_origin, "Moved set origin");
        Ok(())
    }

    /// Snapshot of a set record.
    pub fn set(&self, id: SetId) -> Option<SetRecord> {
        self.lock().sets.get(&id).cloned()
    }

    /// All sets originating at `origin`.
    pub fn sets_of_origin(&self, origin: NodeId) -> Vec<SetRecord> {
        self.lock()
            .sets
            .values()
            .filter(|s| s.origin == origin)
            .cloned()
            .collect()
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Store a (not yet active) subscription of the local node.
    pub fn store_subscribe(&self, set: SetId, provider: NodeId, forward: bool) -> bool {
        let mut state = self.lock();
        let prior = state.subscriptions.get(&set);
        let active = prior.map(|s| s.active).unwrap_or(false);
        let record = SubscriptionRecord {
            set,
            provider,
            forward,
            active,
        };
        let changed = prior != Some(&record);
        if changed {
            info!(set = %set, provider = %provider, forward, "Stored subscription");
            state.subscriptions.insert(set, record);
        }
        changed
    }

    /// Mark a subscription active once the initial copy completed.
    pub fn enable_subscription(&self, set: SetId) -> Result<(), ConfigError> {
        let mut state = self.lock();
        let sub = state
            .subscriptions
            .get_mut(&set)
            .ok_or(ConfigError::UnknownSubscription(set))?;
        sub.active = true;
        info!(set = %set, provider = %sub.provider, "Enabled subscription");
        Ok(())
    }

    /// Drop the local subscription to a set.
    pub fn unsubscribe_set(&self, set: SetId) {
        self.lock().subscriptions.remove(&set);
        info!(set = %set, "Unsubscribed set");
    }

    /// Snapshot of the local subscription to a set.
    pub fn subscription(&self, set: SetId) -> Option<SubscriptionRecord> {
        self.lock().subscriptions.get(&set).cloned()
    }

    /// All local subscriptions.
    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.lock().subscriptions.values().cloned().collect()
    }

    /// Does any active local subscription forward this set onward?
    pub fn forwards_set(&self, set: SetId) -> bool {
        self.lock()
            .subscriptions
            .get(&set)
            .map(|s| s.forward)
            .unwrap_or(false)
    }

    // =========================================================================
    // Worker activation
    // =========================================================================

    /// Remember a node whose worker should start at the next activation
    /// point. Used during startup so worker creation cannot race the
    /// config snapshot.
    pub fn need_activate(&self, id: NodeId) {
        self.lock().pending_activate.insert(id);
    }

    /// Drain the pending activation set.
    pub fn do_activate(&self) -> Vec<NodeId> {
        let mut state = self.lock();
        let pending: Vec<NodeId> = state.pending_activate.iter().copied().collect();
        state.pending_activate.clear();
        pending
    }

    /// The remote nodes this daemon should run a worker for: every origin
    /// it listens for plus every subscription provider.
    pub fn wanted_workers(&self) -> BTreeSet<NodeId> {
        let state = self.lock();
        let mut wanted: BTreeSet<NodeId> = state.listens.iter().map(|l| l.origin).collect();
        wanted.extend(state.subscriptions.values().map(|s| s.provider));
        wanted.remove(&self.local_node);
        wanted
            .into_iter()
            .filter(|id| state.nodes.get(id).map(|n| n.active).unwrap_or(false))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConfigState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: i32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig::new("payroll", node(1))
    }

    #[test]
    fn test_store_node_idempotent() {
        let cfg = config();
        assert!(cfg.store_node(node(2), true, "second").unwrap());
        // Identical re-store is a no-op
        assert!(!cfg.store_node(node(2), true, "second").unwrap());
        // Changed re-store supersedes
        assert!(cfg.store_node(node(2), false, "second").unwrap());
        assert!(!cfg.node(node(2)).unwrap().active);
    }

    #[test]
    fn test_store_node_rejects_local() {
        let cfg = config();
        assert_eq!(
            cfg.store_node(node(1), true, "me"),
            Err(ConfigError::TargetsLocalNode(node(1)))
        );
    }

    #[test]
    fn test_store_node_preserves_watermark() {
        let cfg = config();
        cfg.store_node(node(2), true, "a").unwrap();
        cfg.set_node_last_event(node(2), EventSeq(9));
        cfg.store_node(node(2), true, "renamed").unwrap();
        assert_eq!(cfg.node_last_event(node(2)), Some(EventSeq(9)));
    }

    #[test]
    fn test_watermark_monotonic() {
        let cfg = config();
        cfg.store_node(node(2), true, "a").unwrap();
        cfg.set_node_last_event(node(2), EventSeq(10));
        cfg.set_node_last_event(node(2), EventSeq(4));
        assert_eq!(cfg.node_last_event(node(2)), Some(EventSeq(10)));
    }

    #[test]
    fn test_drop_node_cascades() {
        let cfg = config();
        cfg.store_node(node(2), true, "a").unwrap();
        cfg.store_path(node(2), "host=b", 10);
        cfg.store_listen(node(2), node(2));
        cfg.store_set(SetId(1), node(2), "s");
        cfg.store_subscribe(SetId(1), node(2), false);
        cfg.drop_node(node(2)).unwrap();
        assert!(cfg.node(node(2)).is_none());
        assert!(cfg.path(node(2)).is_none());
        assert!(cfg.event_provider(node(2)).is_none());
        assert!(cfg.subscription(SetId(1)).is_none());
    }

    #[test]
    fn test_enable_subscription_requires_store() {
        let cfg = config();
        assert_eq!(
            cfg.enable_subscription(SetId(3)),
            Err(ConfigError::UnknownSubscription(SetId(3)))
        );
        cfg.store_subscribe(SetId(3), node(2), true);
        assert!(!cfg.subscription(SetId(3)).unwrap().active);
        cfg.enable_subscription(SetId(3)).unwrap();
        assert!(cfg.subscription(SetId(3)).unwrap().active);
    }

    #[test]
    fn test_store_subscribe_keeps_active_flag() {
        let cfg = config();
        cfg.store_subscribe(SetId(3), node(2), false);
        cfg.enable_subscription(SetId(3)).unwrap();
        // Re-store with a new provider keeps the subscription active
        cfg.store_subscribe(SetId(3), node(4), false);
        let sub = cfg.subscription(SetId(3)).unwrap();
        assert!(sub.active);
        assert_eq!(sub.provider, node(4));
    }

    #[test]
    fn test_move_set() {
        let cfg = config();
        cfg.store_set(SetId(1), node(2), "s");
        cfg.move_set(SetId(1), node(3)).unwrap();
        assert_eq!(cfg.set(SetId(1)).unwrap().origin, node(3));
        assert_eq!(cfg.move_set(SetId(9), node(3)), Err(ConfigError::UnknownSet(SetId(9))));
    }

    #[test]
    fn test_merge_set_absorbs() {
        let cfg = config();
        cfg.store_set(SetId(1), node(2), "a");
        cfg.store_set(SetId(2), node(2), "b");
        cfg.store_subscribe(SetId(2), node(2), false);
        cfg.merge_set(SetId(1), SetId(2)).unwrap();
        assert!(cfg.set(SetId(2)).is_none());
        assert!(cfg.subscription(SetId(2)).is_none());
    }

    #[test]
    fn test_activation_drain() {
        let cfg = config();
        cfg.need_activate(node(2));
        cfg.need_activate(node(3));
        let drained = cfg.do_activate();
        assert_eq!(drained, vec![node(2), node(3)]);
        assert!(cfg.do_activate().is_empty());
    }

    #[test]
    fn test_wanted_workers() {
        let cfg = config();
        cfg.store_node(node(2), true, "origin").unwrap();
        cfg.store_node(node(3), true, "forwarder").unwrap();
        cfg.store_node(node(4), false, "inactive").unwrap();
        // Listen for origin 2 through provider 3
        cfg.store_listen(node(2), node(3));
        // Subscription provided by 3
        cfg.store_set(SetId(1), node(2), "s");
        cfg.store_subscribe(SetId(1), node(3), false);
        // Listen for an inactive node
        cfg.store_listen(node(4), node(4));
        let wanted = cfg.wanted_workers();
        assert!(wanted.contains(&node(2)));
        assert!(wanted.contains(&node(3)));
        assert!(!wanted.contains(&node(4)));
        assert!(!wanted.contains(&node(1)));
    }
}
