//! The SYNC generator.
//!
//! Wakes at the SYNC interval on the origin. If row changes were captured
//! since the last SYNC it emits one; with no changes it still emits a
//! keepalive once the timeout elapses so subscribers can advance their
//! confirmation watermarks.

use crate::error::DaemonResult;
use crate::options::Options;
use sluice_capture::{create_event, EventArgs};
use sluice_config::RuntimeConfig;
use sluice_domain::EventType;
use sluice_sql::cluster_schema;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Should a SYNC be generated this cycle?
pub fn should_generate_sync(rows_captured: bool, since_last: Duration, timeout: Duration) -> bool {
    if rows_captured {
        return true;
    }
    !timeout.is_zero() && since_last >= timeout
}

/// The SYNC generator task.
pub struct SyncGenerator {
    pub options: Arc<Options>,
    pub cfg: Arc<RuntimeConfig>,
    pub local_pool: PgPool,
}

impl SyncGenerator {
    /// Run until shutdown.
    pub async fn run(self, token: CancellationToken) {
        info!(
            interval_ms = self.options.sync_interval.as_millis() as u64,
            timeout_ms = self.options.sync_interval_timeout.as_millis() as u64,
            "SYNC generator started"
        );

        let mut last_action = match self.current_action_seq().await {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "Cannot read action sequence");
                0
            }
        };
        let mut last_sync_at = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.options.sync_interval) => {}
            }

            let current = match self.current_action_seq().await {
                Ok(value) => value,
                Err(e) => {
                    error!(error = %e, "Cannot read action sequence");
                    continue;
                }
            };

            let rows_captured = current != last_action;
            if should_generate_sync(
                rows_captured,
                last_sync_at.elapsed(),
                self.options.sync_interval_timeout,
            ) {
                match self.generate_sync().await {
                    Ok(()) => {
                        last_action = current;
                        last_sync_at = Instant::now();
                    }
                    Err(e) => {
                        error!(error = %e, "SYNC generation failed");
                    }
                }
            }
        }

        info!("SYNC generator stopped");
    }

    async fn current_action_seq(&self) -> DaemonResult<i64> {
        let schema = cluster_schema(self.cfg.cluster());
        let query = format!("SELECT last_value FROM {schema}.sl_action_seq");
        Ok(sqlx::query_scalar(&query).fetch_one(&self.local_pool).await?)
    }

    async fn generate_sync(&self) -> DaemonResult<()> {
        let mut tx = self.local_pool.begin().await?;
        let seqno = create_event(
            &mut tx,
            self.cfg.cluster(),
            self.cfg.local_node(),
            EventType::Sync,
            &EventArgs::new(),
        )
        .await?;
        tx.commit().await?;
        info!(seqno = %seqno, "Generated SYNC");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_always_sync() {
        assert!(should_generate_sync(
            true,
            Duration::ZERO,
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn test_keepalive_after_timeout() {
        let timeout = Duration::from_secs(60);
        assert!(!should_generate_sync(false, Duration::from_secs(59), timeout));
        assert!(should_generate_sync(false, Duration::from_secs(60), timeout));
    }

    #[test]
    fn test_zero_timeout_disables_keepalive() {
        assert!(!should_generate_sync(
            false,
            Duration::from_secs(3600),
            Duration::ZERO
        ));
    }
}
