//! The scheduler: per-node connection pools and wakeups.
//!
//! Workers block either on database I/O or on a timed wait; other tasks
//! interrupt a timed wait through the per-node wakeup handle. Pools are
//! created lazily, one per remote node, with creation serialized under a
//! single lock.

use crate::error::DaemonResult;
use sluice_db::{connect_node, ConnectOptions};
use sluice_domain::NodeId;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Why a timed wait returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The deadline passed
    Timeout,
    /// Another task nudged this node
    Woken,
    /// The daemon is shutting down
    Shutdown,
}

#[derive(Default)]
struct SchedState {
    pools: HashMap<NodeId, PgPool>,
    wakeups: HashMap<NodeId, Arc<Notify>>,
}

/// Shared scheduler state.
pub struct Scheduler {
    shutdown: CancellationToken,
    state: Mutex<SchedState>,
    /// Pool construction is not reentrancy-safe against itself for the
    /// same node; serialize it
    connect_lock: tokio::sync::Mutex<()>,
}

impl Scheduler {
    /// A scheduler tied to the daemon's shutdown token.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            state: Mutex::new(SchedState::default()),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The shutdown token workers select against.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Has shutdown been requested?
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The pooled connection handle for a node, creating the pool on first
    /// use.
    pub async fn wait_connection(
        &self,
        node: NodeId,
        options: &ConnectOptions,
    ) -> DaemonResult<PgPool> {
        if let Some(pool) = self.lock().pools.get(&node) {
            return Ok(pool.clone());
        }

        let _guard = self.connect_lock.lock().await;
        // Another task may have created it while we waited
        if let Some(pool) = self.lock().pools.get(&node) {
            return Ok(pool.clone());
        }
        debug!(node = %node, "Creating connection pool");
        let pool = connect_node(options)?;
        self.lock().pools.insert(node, pool.clone());
        Ok(pool)
    }

    /// Discard a node's pool after a connection-level failure so the next
    /// `wait_connection` starts fresh.
    pub fn drop_connection(&self, node: NodeId) {
        if let Some(pool) = self.lock().pools.remove(&node) {
            debug!(node = %node, "Discarding connection pool");
            // Close in the background; callers are already on the error path
            tokio::spawn(async move { pool.close().await });
        }
    }

    /// Nudge a worker blocked in [`Scheduler::msleep`] for this node.
    pub fn wakeup_node(&self, node: NodeId) {
        self.notify_handle(node).notify_one();
    }

    /// Sleep until the deadline, a wakeup for `node`, or shutdown.
    pub async fn msleep(&self, node: NodeId, duration: Duration) -> SleepOutcome {
        let notify = self.notify_handle(node);
        tokio::select! {
            _ = self.shutdown.cancelled() => SleepOutcome::Shutdown,
            _ = notify.notified() => SleepOutcome::Woken,
            _ = tokio::time::sleep(duration) => SleepOutcome::Timeout,
        }
    }

    /// Close every pool. Called once after all workers stopped.
    pub async fn teardown(&self) {
        let pools: Vec<PgPool> = {
            let mut state = self.lock();
            state.wakeups.clear();
            state.pools.drain().map(|(_, p)| p).collect()
        };
        for pool in pools {
            pool.close().await;
        }
    }

    fn notify_handle(&self, node: NodeId) -> Arc<Notify> {
        self.lock()
            .wakeups
            .entry(node)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedState> {
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

    #[tokio::test]
    async fn test_msleep_times_out() {
        let sched = Scheduler::new(CancellationToken::new());
        let outcome = sched.msleep(node(2), Duration::from_millis(10)).await;
        assert_eq!(outcome, SleepOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_msleep_woken_by_wakeup() {
        let sched = Arc::new(Scheduler::new(CancellationToken::new()));
        let sleeper = sched.clone();
        let handle =
            tokio::spawn(async move { sleeper.msleep(node(2), Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sched.wakeup_node(node(2));
        assert_eq!(handle.await.unwrap(), SleepOutcome::Woken);
    }

    #[tokio::test]
    async fn test_msleep_observes_shutdown() {
        let token = CancellationToken::new();
        let sched = Arc::new(Scheduler::new(token.clone()));
        let sleeper = sched.clone();
        let handle =
            tokio::spawn(async move { sleeper.msleep(node(2), Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert_eq!(handle.await.unwrap(), SleepOutcome::Shutdown);
    }

    #[tokio::test]
    async fn test_wakeup_different_node_does_not_wake() {
        let sched = Arc::new(Scheduler::new(CancellationToken::new()));
        sched.wakeup_node(node(3));
        let outcome = sched.msleep(node(2), Duration::from_millis(20)).await;
        assert_eq!(outcome, SleepOutcome::Timeout);
    }
}
