//! The cleanup task.
//!
//! Periodically forgets acknowledged history: for every origin it finds
//! the lowest confirmation watermark across all receivers and deletes
//! events, sequence snapshots, and log rows that every receiver has moved
//! past. Every few cycles the replication tables are vacuumed, and when
//! the draining log partition is empty the active partition is rotated
//! with a SWITCH_LOG event.

use crate::error::DaemonResult;
use crate::options::Options;
use sluice_capture::{create_event, EventArgs};
use sluice_config::RuntimeConfig;
use sluice_domain::{EventSeq, EventType, NodeId, Xxid};
use sluice_sql::cluster_schema;
use sqlx::{Executor, PgPool};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Rotate the log partitions this cycle?
///
/// Only when the draining partition is fully pruned and the active one
/// has grown past the threshold.
pub fn should_switch_log(draining_rows: i64, active_rows: i64, threshold: i64) -> bool {
    draining_rows == 0 && active_rows > threshold
}

/// The cleanup task.
pub struct CleanupTask {
    pub options: Arc<Options>,
    pub cfg: Arc<RuntimeConfig>,
    pub local_pool: PgPool,
    /// Nudged by workers after each confirmation
    pub wakeup: Arc<Notify>,
}

impl CleanupTask {
    /// Run until shutdown.
    pub async fn run(self, token: CancellationToken) {
        info!(
            interval_secs = self.options.cleanup_interval.as_secs(),
            vac_frequency = self.options.vac_frequency,
            "Cleanup task started"
        );
        let mut cycles: u32 = 0;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.options.cleanup_interval) => {}
                _ = self.wakeup.notified() => {}
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Cleanup cycle failed");
                continue;
            }

            cycles += 1;
            if self.options.vac_frequency > 0 && cycles % self.options.vac_frequency == 0 {
                if let Err(e) = self.vacuum().await {
                    error!(error = %e, "Vacuum failed");
                }
            }
        }

        info!("Cleanup task stopped");
    }

    /// One pruning pass over every origin present in `sl_confirm`.
    async fn run_cycle(&self) -> DaemonResult<()> {
        let schema = cluster_schema(self.cfg.cluster());

        let origins: Vec<NodeId> = {
            let query = format!("SELECT DISTINCT con_origin FROM {schema}.sl_confirm");
            sqlx::query_scalar(&query).fetch_all(&self.local_pool).await?
        };

        for origin in origins {
            let floor = self.confirmed_floor(&schema, origin).await?;
            let Some(floor) = floor else { continue };
            self.prune_origin(&schema, origin, floor).await?;
        }

        self.maybe_switch_log(&schema).await?;
        Ok(())
    }

    /// The minimum confirmation watermark over all receivers of an
    /// origin, including this node.
    async fn confirmed_floor(
        &self,
        schema: &str,
        origin: NodeId,
    ) -> DaemonResult<Option<EventSeq>> {
        let query =
            format!("SELECT min(con_seqno) FROM {schema}.sl_confirm WHERE con_origin = $1");
        let floor: Option<i64> = sqlx::query_scalar(&query)
            .bind(origin)
            .fetch_one(&self.local_pool)
            .await?;
        Ok(floor.map(EventSeq))
    }

    /// Delete everything of one origin strictly below the floor.
    async fn prune_origin(&self, schema: &str, origin: NodeId, floor: EventSeq) -> DaemonResult<()> {
        // The floor event's snapshot bounds which log rows are disposable
        let boundary_query = format!(
            "SELECT ev_minxid FROM {schema}.sl_event \
             WHERE ev_origin = $1 AND ev_seqno = $2"
        );
        let boundary: Option<i64> = sqlx::query_scalar(&boundary_query)
            .bind(origin)
            .bind(floor)
            .fetch_optional(&self.local_pool)
            .await?;

        let mut tx = self.local_pool.begin().await?;

        let delete_events =
            format!("DELETE FROM {schema}.sl_event WHERE ev_origin = $1 AND ev_seqno < $2");
        let events = sqlx::query(&delete_events)
            .bind(origin)
            .bind(floor)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let delete_seqlog =
            format!("DELETE FROM {schema}.sl_seqlog WHERE seql_origin = $1 AND seql_ev_seqno < $2");
        sqlx::query(&delete_seqlog)
            .bind(origin)
            .bind(floor)
            .execute(&mut *tx)
            .await?;

        let mut log_rows = 0;
        if let Some(minxid) = boundary {
            for log_table in ["sl_log_1", "sl_log_2"] {
                let delete_log = format!(
                    "DELETE FROM {schema}.{log_table} WHERE log_origin = $1 AND log_xid < $2"
                );
                log_rows += sqlx::query(&delete_log)
                    .bind(origin)
                    .bind(Xxid(minxid))
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
        }

        tx.commit().await?;
        if events > 0 || log_rows > 0 {
            debug!(
                origin = %origin,
                floor = %floor,
                events,
                log_rows,
                "Pruned acknowledged history"
            );
        }
        Ok(())
    }

    /// Rotate the active log partition once the draining one is empty.
    async fn maybe_switch_log(&self, schema: &str) -> DaemonResult<()> {
        let active_query = format!("SELECT ls_active FROM {schema}.sl_log_status");
        let active: i32 = sqlx::query_scalar(&active_query)
            .fetch_one(&self.local_pool)
            .await?;
        let (active_table, draining_table) = if active == 0 {
            ("sl_log_1", "sl_log_2")
        } else {
            ("sl_log_2", "sl_log_1")
        };

        let count = |table: &str| {
            let query = format!("SELECT count(*) FROM {schema}.{table}");
            let pool = self.local_pool.clone();
            async move {
                sqlx::query_scalar::<_, i64>(&query).fetch_one(&pool).await
            }
        };
        let active_rows = count(active_table).await?;
        let draining_rows = count(draining_table).await?;

        if !should_switch_log(draining_rows, active_rows, self.options.switch_threshold) {
            return Ok(());
        }

        let mut tx = self.local_pool.begin().await?;
        create_event(
            &mut tx,
            self.cfg.cluster(),
            self.cfg.local_node(),
            EventType::SwitchLog,
            &EventArgs::new().arg(1, if active == 0 { "2" } else { "1" }),
        )
        .await?;
        let toggle = format!("UPDATE {schema}.sl_log_status SET ls_active = 1 - ls_active");
        sqlx::query(&toggle).execute(&mut *tx).await?;
        tx.commit().await?;

        info!(
            from = active_table,
            active_rows, "Switched active log partition"
        );
        Ok(())
    }

    /// VACUUM ANALYZE the replication tables. Runs outside a transaction.
    async fn vacuum(&self) -> DaemonResult<()> {
        let schema = cluster_schema(self.cfg.cluster());
        for table in ["sl_event", "sl_confirm", "sl_log_1", "sl_log_2", "sl_seqlog"] {
            let statement = format!("VACUUM ANALYZE {schema}.{table}");
            self.local_pool.execute(statement.as_str()).await?;
        }
        debug!("Vacuumed replication tables");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_requires_empty_draining() {
        assert!(!should_switch_log(5, 20_000, 10_000));
        assert!(should_switch_log(0, 20_000, 10_000));
    }

    #[test]
    fn test_switch_requires_grown_active() {
        assert!(!should_switch_log(0, 10_000, 10_000));
        assert!(should_switch_log(0, 10_001, 10_000));
    }
}
