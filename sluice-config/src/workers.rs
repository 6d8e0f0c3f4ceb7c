//! Remote worker registry.
//!
//! The daemon runs one worker task per remote node. The registry owns the
//! task handles and their cancellation tokens so reconfiguration can stop
//! a single worker and shutdown can drain all of them with a bounded wait.

use sluice_domain::NodeId;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long shutdown waits for remote workers before giving up.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(20);

/// A running remote worker.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Cancels the worker's loop
    pub token: CancellationToken,
    /// The worker task itself
    pub handle: JoinHandle<()>,
}

/// Registry of the running remote workers, keyed by remote node id.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Mutex<BTreeMap<NodeId, WorkerHandle>>,
}

impl WorkerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly spawned worker. A worker already registered for the
    /// node is cancelled and replaced.
    pub fn register(&self, node: NodeId, worker: WorkerHandle) {
        let replaced = self.lock().insert(node, worker);
        if let Some(old) = replaced {
            warn!(node = %node, "Replacing remote worker");
            old.token.cancel();
            old.handle.abort();
        }
    }

    /// Is a worker registered for this node?
    pub fn contains(&self, node: NodeId) -> bool {
        self.lock().contains_key(&node)
    }

    /// Nodes with a registered worker.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.lock().keys().copied().collect()
    }

    /// Cancel one worker and return its handle for joining.
    pub fn stop(&self, node: NodeId) -> Option<JoinHandle<()>> {
        let worker = self.lock().remove(&node)?;
        worker.token.cancel();
        Some(worker.handle)
    }

    /// Cancel every worker and wait for them to finish, up to
    /// [`JOIN_TIMEOUT`]. Returns false when the wait expired with workers
    /// still running.
    pub async fn join_all(&self) -> bool {
        let drained: Vec<(NodeId, WorkerHandle)> = {
            let mut workers = self.lock();
            std::mem::take(&mut *workers).into_iter().collect()
        };

        for (_, worker) in &drained {
            worker.token.cancel();
        }

        let join = async {
            for (node, worker) in drained {
                if let Err(e) = worker.handle.await {
                    if !e.is_cancelled() {
                        warn!(node = %node, error = %e, "Remote worker panicked");
                    }
                }
            }
        };

        match timeout(JOIN_TIMEOUT, join).await {
            Ok(()) => {
                info!("All remote workers joined");
                true
            }
            Err(_) => {
                warn!("Timed out waiting for remote workers");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<NodeId, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
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

    fn spawn_worker(token: CancellationToken) -> WorkerHandle {
        let child = token.clone();
        let handle = tokio::spawn(async move {
            child.cancelled().await;
        });
        WorkerHandle { token, handle }
    }

    #[tokio::test]
    async fn test_register_and_stop() {
        let registry = WorkerRegistry::new();
        registry.register(node(2), spawn_worker(CancellationToken::new()));
        assert!(registry.contains(node(2)));

        let handle = registry.stop(node(2)).unwrap();
        handle.await.unwrap();
        assert!(!registry.contains(node(2)));
        assert!(registry.stop(node(2)).is_none());
    }

    #[tokio::test]
    async fn test_join_all_cancels_everything() {
        let registry = WorkerRegistry::new();
        registry.register(node(2), spawn_worker(CancellationToken::new()));
        registry.register(node(3), spawn_worker(CancellationToken::new()));

        assert!(registry.join_all().await);
        assert!(registry.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_register_replaces_old_worker() {
        let registry = WorkerRegistry::new();
        let first_token = CancellationToken::new();
        registry.register(node(2), spawn_worker(first_token.clone()));
        registry.register(node(2), spawn_worker(CancellationToken::new()));

        assert!(first_token.is_cancelled());
        assert_eq!(registry.nodes(), vec![node(2)]);
    }
}
