//! The local listener.
//!
//! Holds a dedicated session on the local database: it enforces the
//! one-daemon-per-(cluster, node) rule through an advisory lock, LISTENs
//! on the cluster's event channel, applies administrative events
//! originating on the local node to the runtime configuration as they
//! appear, and confirms them on behalf of the local node so the cleanup
//! floor for this origin always includes the origin itself.

use crate::error::{DaemonError, DaemonResult};
use crate::options::Options;
use crate::remote_worker::update_confirm;
use sluice_config::{apply_config_event, ConfigEffect, RuntimeConfig};
use sluice_domain::{Event, EventSeq};
use sluice_sql::{cluster_schema, event_channel};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stable advisory-lock key for one (cluster, node) daemon identity.
///
/// FNV-1a over the cluster name and node id; collisions would only make
/// two distinct daemons mutually exclusive, never let two equal ones run.
pub fn singleton_lock_key(cluster: &str, node: i32) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in cluster.bytes().chain(node.to_be_bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

/// The local listener task.
pub struct LocalListener {
    pub options: Arc<Options>,
    pub cfg: Arc<RuntimeConfig>,
    pub local_pool: PgPool,
    /// Pinged whenever topology changed and the worker set should be
    /// reconciled
    pub reconcile_tx: mpsc::Sender<()>,
    /// Highest local event already applied to the runtime config
    pub last_local_event: EventSeq,
}

impl LocalListener {
    /// Run until shutdown. `ready` reports the singleton check outcome;
    /// the daemon blocks on it before starting any worker.
    pub async fn run(mut self, ready: oneshot::Sender<DaemonResult<()>>, token: CancellationToken) {
        // The advisory lock lives on this session; hold the connection
        // for the daemon lifetime.
        let lock_conn = match self.acquire_singleton().await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        let mut listener = self.open_listener().await;
        let _ = ready.send(Ok(()));
        info!(cluster = %self.cfg.cluster(), node = %self.cfg.local_node(), "Local listener started");

        // Confirm the backlog that existed before this daemon started
        if self.last_local_event > EventSeq::ZERO {
            if let Err(e) = self.self_confirm().await {
                error!(error = %e, "Cannot confirm local event backlog");
            }
        }

        loop {
            let mut lost = false;
            match &mut listener {
                Some(active) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        notification = active.recv() => {
                            if let Err(e) = notification {
                                warn!(error = %e, "Event channel lost, falling back to polling");
                                lost = true;
                            }
                        }
                        _ = tokio::time::sleep(self.options.sync_interval) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.options.sync_interval) => {}
                    }
                }
            }
            if lost {
                listener = None;
                continue;
            }
            if listener.is_none() {
                listener = self.open_listener().await;
            }

            if let Err(e) = self.drain_local_events().await {
                error!(error = %e, "Failed to process local events");
            }
        }

        drop(lock_conn);
        info!("Local listener stopped");
    }

    /// Take the advisory lock that makes this daemon the only one for its
    /// cluster and node.
    async fn acquire_singleton(
        &self,
    ) -> DaemonResult<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        let mut conn = self.local_pool.acquire().await?;
        let key = singleton_lock_key(self.cfg.cluster(), self.cfg.local_node().as_i32());
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !locked {
            return Err(DaemonError::AlreadyRunning {
                cluster: self.cfg.cluster().to_string(),
                node: self.cfg.local_node(),
            });
        }
        Ok(conn)
    }

    async fn open_listener(&self) -> Option<PgListener> {
        let channel = event_channel(self.cfg.cluster());
        match PgListener::connect_with(&self.local_pool).await {
            Ok(mut listener) => match listener.listen(&channel).await {
                Ok(()) => Some(listener),
                Err(e) => {
                    warn!(error = %e, channel, "LISTEN failed, polling instead");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Cannot open notification session, polling instead");
                None
            }
        }
    }

    /// Record the local node's own confirmation of its events. Without
    /// this row the per-origin minimum over `sl_confirm` never covers the
    /// local origin and its history would be kept forever.
    async fn self_confirm(&self) -> DaemonResult<()> {
        let schema = cluster_schema(self.cfg.cluster());
        let local = self.cfg.local_node();
        let mut conn = self.local_pool.acquire().await?;
        update_confirm(&mut conn, &schema, local, local, self.last_local_event).await?;
        Ok(())
    }

    /// Read administrative events created on the local node and fold them
    /// into the runtime configuration.
    async fn drain_local_events(&mut self) -> DaemonResult<()> {
        let schema = cluster_schema(self.cfg.cluster());
        let query = format!(
            "SELECT ev_origin, ev_seqno, ev_timestamp, ev_minxid, ev_maxxid, ev_xip, \
                    ev_type, ev_data1, ev_data2, ev_data3, ev_data4, \
                    ev_data5, ev_data6, ev_data7, ev_data8 \
             FROM {schema}.sl_event \
             WHERE ev_origin = $1 AND ev_seqno > $2 \
             ORDER BY ev_seqno"
        );
        let events: Vec<Event> = sqlx::query_as(&query)
            .bind(self.cfg.local_node())
            .bind(self.last_local_event)
            .fetch_all(&self.local_pool)
            .await?;

        let before = self.last_local_event;
        for event in events {
            let ev_type = event.event_type().map_err(|e| DaemonError::ProtocolViolation {
                node: event.ev_origin,
                detail: e.to_string(),
            })?;
            if ev_type.is_admin() {
                debug!(seqno = %event.ev_seqno, ev_type = %ev_type, "Applying local event");
                match apply_config_event(&self.cfg, &event) {
                    Ok(ConfigEffect::Topology) | Ok(ConfigEffect::SubscriptionEnabled(_)) => {
                        let _ = self.reconcile_tx.try_send(());
                    }
                    Ok(ConfigEffect::None) => {}
                    Err(e) => {
                        error!(seqno = %event.ev_seqno, error = %e, "Local event rejected");
                    }
                }
            }
            self.last_local_event = event.ev_seqno;
        }

        if self.last_local_event > before {
            self.self_confirm().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable() {
        let a = singleton_lock_key("payroll", 1);
        let b = singleton_lock_key("payroll", 1);
        assert_eq!(a, b);
    }

    #[test]
    fn test_lock_key_distinguishes_identities() {
        let base = singleton_lock_key("payroll", 1);
        assert_ne!(base, singleton_lock_key("payroll", 2));
        assert_ne!(base, singleton_lock_key("billing", 1));
    }
}
