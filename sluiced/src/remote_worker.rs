//! Remote worker: one per remote origin node.
//!
//! Maintains a long-running session against the origin's event provider:
//! discovers new events, applies administrative events one at a time,
//! groups and applies SYNC events, confirms everything on the local
//! database, mirrors the confirmation watermark back onto the provider
//! so upstream cleanup can forget consumed history, and forwards events
//! and log data onward for cascaded subscribers.
//!
//! ```text
//!   INIT -> CONNECT -> CAUGHT_UP <-> PROCESS_EVENT
//!                         ^               |
//!                         +--- SYNC_GROUP_APPLY -> CONFIRM -> (loop)
//!   any -> DISCONNECT -> CONNECT   (transient failure, capped backoff)
//!   any -> PARKED                  (fatal failure, until reconfigure)
//!   any -> EXIT                    (shutdown)
//! ```

use crate::archive::ArchiveWriter;
use crate::config_events::persist_config_event;
use crate::error::{is_serialization_failure, is_transient, DaemonError, DaemonResult};
use crate::options::Options;
use crate::scheduler::{Scheduler, SleepOutcome};
use crate::sync_group::SyncGroupSizer;
use futures::TryStreamExt;
use sluice_config::{apply_config_event, ConfigEffect, RuntimeConfig};
use sluice_domain::{
    CmdType, Event, EventSeq, EventType, LogRow, NodeId, SetId, SyncWindow, TableId, TxSnapshot,
};
use sluice_sql::{cluster_schema, event_channel, quote_ident, QueryBuilder};
use sqlx::postgres::PgListener;
use sqlx::{Executor, PgConnection, PgPool, Postgres, Transaction};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Backoff
// =============================================================================

/// Exponential reconnect backoff, seeded by the path's retry interval.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Option<Duration>,
}

impl Backoff {
    /// Backoff starting at `base`, doubling up to ten times `base`.
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            cap: base * 10,
            current: None,
        }
    }

    /// The next wait.
    pub fn next(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(current) => (current * 2).min(self.cap),
        };
        self.current = Some(next);
        next
    }

    /// Back to the initial interval after a success.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

// =============================================================================
// Pure statement helpers
// =============================================================================

/// Complete a captured cmddata fragment into an executable statement.
pub fn build_apply_statement(relname: &str, cmdtype: CmdType, cmddata: &str) -> String {
    match cmdtype {
        CmdType::Insert => format!("insert into {relname} {cmddata}"),
        CmdType::Update => format!("update only {relname} set {cmddata}"),
        CmdType::Delete => format!("delete from only {relname} where {cmddata}"),
    }
}

/// The WHERE clause selecting exactly the log rows of one SYNC window.
pub fn log_where_clause(origin: NodeId, table_ids: &[i32], window: &SyncWindow) -> String {
    let mut q = QueryBuilder::new();
    q.push("log_origin = ").push_i32(origin.as_i32());

    q.push(" and log_tableid in (");
    for (i, id) in table_ids.iter().enumerate() {
        if i > 0 {
            q.push(",");
        }
        q.push_i32(*id);
    }
    q.push(")");

    // Committed before the current snapshot ...
    q.push(" and log_xid < ").push_i64(window.curr.xmax.as_i64());
    if !window.curr.xip.is_empty() {
        q.push(" and log_xid not in (");
        for (i, xid) in window.curr.xip.iter().enumerate() {
            if i > 0 {
                q.push(",");
            }
            q.push_i64(xid.as_i64());
        }
        q.push(")");
    }

    // ... and not yet visible to the previous one
    q.push(" and (log_xid >= ").push_i64(window.prev.xmax.as_i64());
    if !window.prev.xip.is_empty() {
        q.push(" or log_xid in (");
        for (i, xid) in window.prev.xip.iter().enumerate() {
            if i > 0 {
                q.push(",");
            }
            q.push_i64(xid.as_i64());
        }
        q.push(")");
    }
    q.push(")");

    q.build()
}

// =============================================================================
// RemoteWorker
// =============================================================================

/// One table this node replicates, as needed by the apply path.
#[derive(Debug, Clone)]
struct ApplyTable {
    relname: String,
    provider: NodeId,
    forward: bool,
}

/// Worker state for one remote origin.
pub struct RemoteWorker {
    pub origin: NodeId,
    pub options: Arc<Options>,
    pub cfg: Arc<RuntimeConfig>,
    pub scheduler: Arc<Scheduler>,
    pub local_pool: PgPool,
    pub archive: Option<ArchiveWriter>,
    pub cleanup_wakeup: Arc<Notify>,
    pub reconcile_tx: mpsc::Sender<()>,

    sizer: SyncGroupSizer,
    confirmed: Option<EventSeq>,
    /// Highest watermark already mirrored onto the provider
    pushed_confirm: Option<EventSeq>,
    prev_sync: Option<TxSnapshot>,
    notifications: Option<PgListener>,
    /// Peers that already passed the schema version handshake
    verified_peers: std::collections::BTreeSet<NodeId>,
}

/// What one loop iteration accomplished.
enum Progress {
    /// No events pending; wait for a notification
    Idle,
    /// Events were applied; look again immediately
    Worked,
}

impl RemoteWorker {
    /// Build a worker for `origin`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        origin: NodeId,
        options: Arc<Options>,
        cfg: Arc<RuntimeConfig>,
        scheduler: Arc<Scheduler>,
        local_pool: PgPool,
        archive: Option<ArchiveWriter>,
        cleanup_wakeup: Arc<Notify>,
        reconcile_tx: mpsc::Sender<()>,
    ) -> Self {
        let sizer = SyncGroupSizer::new(options.sync_group_maxsize, options.desired_sync_time);
        Self {
            origin,
            options,
            cfg,
            scheduler,
            local_pool,
            archive,
            cleanup_wakeup,
            reconcile_tx,
            sizer,
            confirmed: None,
            pushed_confirm: None,
            prev_sync: None,
            notifications: None,
            verified_peers: std::collections::BTreeSet::new(),
        }
    }

    /// The worker loop. Returns when `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        info!(origin = %self.origin, "Remote worker started");
        let mut backoff = Backoff::new(Duration::from_secs(10));

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.iteration(&token).await {
                Ok(Progress::Worked) => {
                    backoff.reset();
                }
                Ok(Progress::Idle) => {
                    backoff.reset();
                    self.wait_for_events().await;
                }
                Err(DaemonError::Shutdown) => break,
                Err(DaemonError::Database(ref e)) if is_serialization_failure(e) => {
                    // The same group is retried on the next pass
                    warn!(origin = %self.origin, "Serialization failure, retrying group");
                }
                Err(DaemonError::Database(ref e)) if is_transient(e) => {
                    self.disconnect();
                    // Seed the backoff from the path's retry interval
                    backoff = Backoff {
                        base: self.retry_interval(),
                        cap: self.retry_interval() * 10,
                        current: backoff.current,
                    };
                    let wait = backoff.next();
                    warn!(origin = %self.origin, error = %e, wait_secs = wait.as_secs(), "Connection lost, backing off");
                    if self.scheduler.msleep(self.origin, wait).await == SleepOutcome::Shutdown {
                        break;
                    }
                }
                Err(
                    e @ (DaemonError::ReplicationData { .. }
                    | DaemonError::ProtocolViolation { .. }),
                ) => {
                    error!(origin = %self.origin, error = %e, "Unrecoverable replication error, worker parked");
                    if !self.park(&token).await {
                        break;
                    }
                    info!(origin = %self.origin, "Worker unparked after reconfiguration");
                }
                Err(e) => {
                    self.disconnect();
                    let wait = backoff.next();
                    warn!(origin = %self.origin, error = %e, wait_secs = wait.as_secs(), "Worker error, backing off");
                    if self.scheduler.msleep(self.origin, wait).await == SleepOutcome::Shutdown {
                        break;
                    }
                }
            }
        }

        info!(origin = %self.origin, "Remote worker stopped");
    }

    /// Fatal state: hold position until shutdown (false) or an operator
    /// reconfiguration wake (true).
    async fn park(&mut self, token: &CancellationToken) -> bool {
        loop {
            match self
                .scheduler
                .msleep(self.origin, Duration::from_secs(3600))
                .await
            {
                SleepOutcome::Shutdown => return false,
                SleepOutcome::Woken => {
                    self.disconnect();
                    return true;
                }
                SleepOutcome::Timeout => {
                    if token.is_cancelled() {
                        return false;
                    }
                }
            }
        }
    }

    fn disconnect(&mut self) {
        self.notifications = None;
        if let Some(provider) = self.event_provider() {
            self.scheduler.drop_connection(provider);
            self.verified_peers.remove(&provider);
        }
    }

    /// Version handshake, once per peer connection.
    async fn verify_peer(&mut self, peer: NodeId, pool: &PgPool) -> DaemonResult<()> {
        if self.verified_peers.contains(&peer) {
            return Ok(());
        }
        let mut conn = pool.acquire().await?;
        match sluice_db::check_schema_version(&mut conn, self.cfg.cluster()).await {
            Ok(()) => {
                self.verified_peers.insert(peer);
                Ok(())
            }
            // Query-level failures stay retryable
            Err(sluice_db::DbError::Database(e)) => Err(DaemonError::Database(e)),
            // A peer speaking another version (or no version at all) is
            // unusable until the operator intervenes
            Err(e) => Err(DaemonError::ProtocolViolation {
                node: peer,
                detail: e.to_string(),
            }),
        }
    }

    fn event_provider(&self) -> Option<NodeId> {
        self.cfg.event_provider(self.origin).or(Some(self.origin))
    }

    fn retry_interval(&self) -> Duration {
        let retry = self
            .event_provider()
            .and_then(|p| self.cfg.path(p))
            .map(|p| p.connretry.max(1) as u64)
            .unwrap_or(10);
        Duration::from_secs(retry)
    }

    /// Wait for the provider to announce events, or time out at the SYNC
    /// interval.
    async fn wait_for_events(&mut self) {
        if self.notifications.is_none() {
            self.notifications = self.open_notifications().await;
        }
        let mut listener = self.notifications.take();
        let mut lost = false;
        let shutdown = self.scheduler.shutdown_token();
        match listener.as_mut() {
            Some(active) => {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    received = active.recv() => {
                        if let Err(e) = received {
                            debug!(origin = %self.origin, error = %e, "Notification channel lost");
                            lost = true;
                        }
                    }
                    _ = tokio::time::sleep(self.options.sync_interval) => {}
                }
            }
            None => {
                let _ = self
                    .scheduler
                    .msleep(self.origin, self.options.sync_interval)
                    .await;
            }
        }
        self.notifications = if lost { None } else { listener };
    }

    async fn open_notifications(&self) -> Option<PgListener> {
        let provider = self.event_provider()?;
        let path = self.cfg.path(provider)?;
        let options = self.connect_options(&path.conninfo);
        let pool = self
            .scheduler
            .wait_connection(provider, &options)
            .await
            .ok()?;
        let channel = event_channel(self.cfg.cluster());
        let mut listener = PgListener::connect_with(&pool).await.ok()?;
        listener.listen(&channel).await.ok()?;
        Some(listener)
    }

    fn connect_options(&self, conninfo: &str) -> sluice_db::ConnectOptions {
        sluice_db::ConnectOptions::new(conninfo)
            .with_sql_on_connection(self.options.sql_on_connection.clone())
    }

    // =========================================================================
    // One iteration: fetch, classify, apply
    // =========================================================================

    async fn iteration(&mut self, token: &CancellationToken) -> DaemonResult<Progress> {
        let Some(provider) = self.event_provider() else {
            return Ok(Progress::Idle);
        };
        let Some(path) = self.cfg.path(provider) else {
            debug!(origin = %self.origin, provider = %provider, "No path to event provider yet");
            return Ok(Progress::Idle);
        };

        let confirmed = self.load_confirmed().await?;
        let options = self.connect_options(&path.conninfo);
        let provider_pool = self.scheduler.wait_connection(provider, &options).await?;
        self.verify_peer(provider, &provider_pool).await?;

        let events = self.fetch_events(&provider_pool, confirmed).await?;
        if events.is_empty() {
            // Catch up on a watermark the provider may have missed
            self.push_confirm(&provider_pool).await?;
            return Ok(Progress::Idle);
        }
        debug!(origin = %self.origin, count = events.len(), "Fetched events");

        let mut idx = 0;
        while idx < events.len() {
            if token.is_cancelled() {
                return Err(DaemonError::Shutdown);
            }
            let event = &events[idx];
            if event.ev_seqno <= self.confirmed.unwrap_or(EventSeq::ZERO) {
                idx += 1;
                continue;
            }

            let ev_type = event
                .event_type()
                .map_err(|e| DaemonError::ProtocolViolation {
                    node: self.origin,
                    detail: e.to_string(),
                })?;

            if ev_type == EventType::Sync {
                let group_max = self.sizer.next_size() as usize;
                let group_end = events[idx..]
                    .iter()
                    .take(group_max)
                    .take_while(|e| e.ev_type == "SYNC")
                    .count();
                let group = &events[idx..idx + group_end];
                self.apply_sync_group(group).await?;
                idx += group_end;
            } else {
                self.apply_admin_event(event, ev_type).await?;
                idx += 1;
            }
        }

        self.push_confirm(&provider_pool).await?;
        Ok(Progress::Worked)
    }

    /// Mirror the local confirmation watermark onto the provider.
    ///
    /// The local `sl_confirm` row alone only tells this node how far it
    /// got; the origin (and every forwarder in between) needs the same
    /// row before its cleanup may forget the history this receiver has
    /// consumed. Pushing after the local commit keeps at-most-once apply
    /// intact: a failed push is retried here on the next pass, and the
    /// upsert is monotone.
    async fn push_confirm(&mut self, provider_pool: &PgPool) -> DaemonResult<()> {
        if !confirm_needs_push(self.confirmed, self.pushed_confirm) {
            return Ok(());
        }
        let Some(confirmed) = self.confirmed else {
            return Ok(());
        };
        let schema = cluster_schema(self.cfg.cluster());
        let mut conn = provider_pool.acquire().await?;
        update_confirm(
            &mut conn,
            &schema,
            self.origin,
            self.cfg.local_node(),
            confirmed,
        )
        .await?;
        self.pushed_confirm = Some(confirmed);
        debug!(
            origin = %self.origin,
            confirmed = %confirmed,
            "Mirrored confirmation onto provider"
        );
        Ok(())
    }

    async fn load_confirmed(&mut self) -> DaemonResult<EventSeq> {
        if let Some(confirmed) = self.confirmed {
            return Ok(confirmed);
        }
        let schema = cluster_schema(self.cfg.cluster());
        let query = format!(
            "SELECT coalesce(max(con_seqno), 0) FROM {schema}.sl_confirm \
             WHERE con_origin = $1 AND con_received = $2"
        );
        let confirmed: i64 = sqlx::query_scalar(&query)
            .bind(self.origin)
            .bind(self.cfg.local_node())
            .fetch_one(&self.local_pool)
            .await?;
        let confirmed = EventSeq(confirmed);
        self.confirmed = Some(confirmed);
        self.cfg.set_node_last_event(self.origin, confirmed);
        info!(origin = %self.origin, confirmed = %confirmed, "Resuming after last confirmed event");
        Ok(confirmed)
    }

    async fn fetch_events(
        &self,
        provider_pool: &PgPool,
        confirmed: EventSeq,
    ) -> DaemonResult<Vec<Event>> {
        let schema = cluster_schema(self.cfg.cluster());
        let query = format!(
            "SELECT ev_origin, ev_seqno, ev_timestamp, ev_minxid, ev_maxxid, ev_xip, \
                    ev_type, ev_data1, ev_data2, ev_data3, ev_data4, \
                    ev_data5, ev_data6, ev_data7, ev_data8 \
             FROM {schema}.sl_event \
             WHERE ev_origin = $1 AND ev_seqno > $2 \
             ORDER BY ev_seqno \
             LIMIT $3"
        );
        let events = sqlx::query_as(&query)
            .bind(self.origin)
            .bind(confirmed)
            .bind(self.options.fetch_batch_size)
            .fetch_all(provider_pool)
            .await?;
        Ok(events)
    }

    // =========================================================================
    // Administrative events
    // =========================================================================

    async fn apply_admin_event(&mut self, event: &Event, ev_type: EventType) -> DaemonResult<()> {
        let schema = cluster_schema(self.cfg.cluster());
        let local = self.cfg.local_node();

        info!(
            origin = %self.origin,
            seqno = %event.ev_seqno,
            ev_type = %ev_type,
            "Applying administrative event"
        );

        let mut tx = self.local_pool.begin().await?;
        persist_config_event(&mut tx, &schema, local, event).await?;

        // Receiving our own subscription activation means pulling the
        // initial table contents before anything else applies on top.
        let enables_local_subscription = ev_type == EventType::EnableSubscription
            && event.data_i32(3).ok() == Some(local.as_i32());
        if enables_local_subscription {
            self.copy_set(&mut tx, event).await?;
        }

        forward_event(&mut tx, &schema, self.cfg.cluster(), event).await?;
        update_confirm(&mut tx, &schema, self.origin, local, event.ev_seqno).await?;
        tx.commit().await?;

        // In-memory view follows the committed state
        match apply_config_event(&self.cfg, event)? {
            ConfigEffect::Topology => {
                let _ = self.reconcile_tx.try_send(());
            }
            ConfigEffect::SubscriptionEnabled(set) => {
                debug!(set = %set, "Subscription active");
                let _ = self.reconcile_tx.try_send(());
            }
            ConfigEffect::None => {}
        }

        if enables_local_subscription {
            self.prev_sync = Some(event.snapshot()?);
        }
        self.finish_confirm(event.ev_seqno);
        Ok(())
    }

    /// Initial subscription copy: truncate and stream every table of the
    /// set from the data provider, then align the replicated sequences.
    async fn copy_set(
        &mut self,
        tx: &mut Transaction<'_, Postgres>,
        event: &Event,
    ) -> DaemonResult<()> {
        let schema = cluster_schema(self.cfg.cluster());
        let set = SetId(event.data_i32(1)?);
        let provider = NodeId::new(event.data_i32(2)?)?;

        let path = self
            .cfg
            .path(provider)
            .ok_or_else(|| DaemonError::Config(format!("no path to data provider {provider}")))?;
        let options = self.connect_options(&path.conninfo);
        let provider_pool = self.scheduler.wait_connection(provider, &options).await?;

        let tables_query =
            format!("SELECT tab_relname FROM {schema}.sl_table WHERE tab_set = $1 ORDER BY tab_id");
        let tables: Vec<(String,)> = sqlx::query_as(&tables_query)
            .bind(set)
            .fetch_all(&mut **tx)
            .await?;

        info!(set = %set, provider = %provider, tables = tables.len(), "Copying set contents");
        for (relname,) in &tables {
            copy_table(tx, &provider_pool, relname).await?;
        }

        self.apply_sequence_snapshot(tx, &provider_pool, event.ev_seqno)
            .await?;
        Ok(())
    }

    // =========================================================================
    // SYNC groups
    // =========================================================================

    async fn apply_sync_group(&mut self, group: &[Event]) -> DaemonResult<()> {
        let schema = cluster_schema(self.cfg.cluster());
        let local = self.cfg.local_node();
        let last = group.last().ok_or_else(|| DaemonError::ProtocolViolation {
            node: self.origin,
            detail: "empty SYNC group".to_string(),
        })?;

        let curr = last.snapshot()?;
        let prev = match self.prev_sync.clone() {
            Some(prev) => prev,
            None => self
                .load_prev_sync()
                .await?
                // Nothing applied yet and no subscription activation seen:
                // there is nothing to select, confirm only
                .unwrap_or_else(|| curr.clone()),
        };
        let window = SyncWindow {
            prev,
            curr: curr.clone(),
        };

        debug!(
            origin = %self.origin,
            first = %group[0].ev_seqno,
            last = %last.ev_seqno,
            "Applying SYNC group"
        );
        let started = Instant::now();

        let mut tx = self.local_pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let tables = self.load_apply_tables(&mut tx).await?;
        let mut statements: Vec<String> = Vec::new();

        if !tables.is_empty() {
            // Group the tables by data provider; normally a single one
            let mut by_provider: BTreeMap<NodeId, Vec<i32>> = BTreeMap::new();
            for (id, table) in &tables {
                by_provider.entry(table.provider).or_default().push(id.0);
            }

            let active_partition = self.active_partition(&mut tx).await?;

            for (provider, table_ids) in by_provider {
                let path = self.cfg.path(provider).ok_or_else(|| {
                    DaemonError::Config(format!("no path to data provider {provider}"))
                })?;
                let options = self.connect_options(&path.conninfo);
                let provider_pool = self.scheduler.wait_connection(provider, &options).await?;

                let rows = self
                    .fetch_log_rows(&provider_pool, &schema, &table_ids, &window)
                    .await?;
                debug!(provider = %provider, rows = rows.len(), "Streaming log rows");

                for row in rows {
                    let table =
                        tables
                            .get(&row.log_tableid)
                            .ok_or_else(|| DaemonError::ProtocolViolation {
                                node: self.origin,
                                detail: format!("log row for unknown table {}", row.log_tableid),
                            })?;
                    let cmdtype =
                        row.cmd_type()
                            .map_err(|e| DaemonError::ProtocolViolation {
                                node: self.origin,
                                detail: e.to_string(),
                            })?;
                    let statement = build_apply_statement(&table.relname, cmdtype, &row.log_cmddata);

                    if let Err(e) = tx.execute(statement.as_str()).await {
                        if is_serialization_failure(&e) || is_transient(&e) {
                            return Err(DaemonError::Database(e));
                        }
                        // A malformed change never applies cleanly again
                        return Err(DaemonError::ReplicationData {
                            node: self.origin,
                            detail: format!("statement {statement:?} failed: {e}"),
                        });
                    }

                    if table.forward {
                        forward_log_row(&mut tx, &schema, active_partition, &row).await?;
                    }
                    statements.push(statement);
                }
            }

            // The sequence snapshot of the last SYNC in the group
            if let Some(provider) = self.any_event_provider_pool().await? {
                self.apply_sequence_snapshot(&mut tx, &provider, last.ev_seqno)
                    .await?;
            }
        }

        for event in group {
            forward_event(&mut tx, &schema, self.cfg.cluster(), event).await?;
        }
        update_confirm(&mut tx, &schema, self.origin, local, last.ev_seqno).await?;
        tx.commit().await?;

        let elapsed = started.elapsed();
        self.sizer.observe(group.len() as u32, elapsed);
        info!(
            origin = %self.origin,
            syncs = group.len(),
            rows = statements.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            confirmed = %last.ev_seqno,
            "SYNC group applied"
        );

        if let Some(archive) = &self.archive {
            archive
                .write_group(self.origin, last.ev_seqno, &statements)
                .await?;
        }

        self.prev_sync = Some(curr);
        self.finish_confirm(last.ev_seqno);
        Ok(())
    }

    /// Tables of sets this node actively subscribes from this origin.
    async fn load_apply_tables(
        &self,
        tx: &mut Transaction<'_, Postgres>,
    ) -> DaemonResult<BTreeMap<TableId, ApplyTable>> {
        let subs: Vec<(SetId, NodeId, bool)> = self
            .cfg
            .subscriptions()
            .into_iter()
            .filter(|s| s.active)
            .filter(|s| {
                self.cfg
                    .set(s.set)
                    .map(|set| set.origin == self.origin)
                    .unwrap_or(false)
            })
            .map(|s| (s.set, s.provider, s.forward))
            .collect();
        if subs.is_empty() {
            return Ok(BTreeMap::new());
        }

        let schema = cluster_schema(self.cfg.cluster());
        let query = format!("SELECT tab_id, tab_relname FROM {schema}.sl_table WHERE tab_set = $1");
        let mut tables = BTreeMap::new();
        for (set, provider, forward) in subs {
            let rows: Vec<(TableId, String)> = sqlx::query_as(&query)
                .bind(set)
                .fetch_all(&mut **tx)
                .await?;
            for (id, relname) in rows {
                tables.insert(
                    id,
                    ApplyTable {
                        relname,
                        provider,
                        forward,
                    },
                );
            }
        }
        Ok(tables)
    }

    async fn fetch_log_rows(
        &self,
        provider_pool: &PgPool,
        schema: &str,
        table_ids: &[i32],
        window: &SyncWindow,
    ) -> DaemonResult<Vec<LogRow>> {
        let predicate = log_where_clause(self.origin, table_ids, window);
        let query = format!(
            "SELECT log_origin, log_xid, log_tableid, log_actionseq, log_cmdtype, log_cmddata \
             FROM (SELECT * FROM {schema}.sl_log_1 WHERE {predicate} \
                   UNION ALL \
                   SELECT * FROM {schema}.sl_log_2 WHERE {predicate}) log \
             ORDER BY log_actionseq"
        );
        let rows = sqlx::query_as(&query).fetch_all(provider_pool).await?;
        Ok(rows)
    }

    /// The snapshot of the newest SYNC already in the local event copy,
    /// used to resume the visibility window after a restart.
    async fn load_prev_sync(&self) -> DaemonResult<Option<TxSnapshot>> {
        let schema = cluster_schema(self.cfg.cluster());
        let confirmed = self.confirmed.unwrap_or(EventSeq::ZERO);
        let query = format!(
            "SELECT ev_origin, ev_seqno, ev_timestamp, ev_minxid, ev_maxxid, ev_xip, \
                    ev_type, ev_data1, ev_data2, ev_data3, ev_data4, \
                    ev_data5, ev_data6, ev_data7, ev_data8 \
             FROM {schema}.sl_event \
             WHERE ev_origin = $1 AND ev_seqno <= $2 \
               AND ev_type IN ('SYNC', 'ENABLE_SUBSCRIPTION') \
             ORDER BY ev_seqno DESC LIMIT 1"
        );
        let event: Option<Event> = sqlx::query_as(&query)
            .bind(self.origin)
            .bind(confirmed)
            .fetch_optional(&self.local_pool)
            .await?;
        match event {
            Some(event) => Ok(Some(event.snapshot()?)),
            None => Ok(None),
        }
    }

    async fn active_partition(&self, tx: &mut Transaction<'_, Postgres>) -> DaemonResult<i32> {
        let schema = cluster_schema(self.cfg.cluster());
        let query = format!("SELECT ls_active FROM {schema}.sl_log_status");
        let active: i32 = sqlx::query_scalar(&query).fetch_one(&mut **tx).await?;
        Ok(active)
    }

    /// Apply the sequence values recorded with event `seqno` to the local
    /// replicated sequences, and keep a forwarded copy.
    async fn apply_sequence_snapshot(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        provider_pool: &PgPool,
        seqno: EventSeq,
    ) -> DaemonResult<()> {
        let schema = cluster_schema(self.cfg.cluster());
        let fetch = format!(
            "SELECT seql_seqid, seql_last_value FROM {schema}.sl_seqlog \
             WHERE seql_origin = $1 AND seql_ev_seqno = $2"
        );
        let values: Vec<(i32, i64)> = sqlx::query_as(&fetch)
            .bind(self.origin)
            .bind(seqno)
            .fetch_all(provider_pool)
            .await?;
        if values.is_empty() {
            return Ok(());
        }

        let relname_query =
            format!("SELECT seq_relname FROM {schema}.sl_sequence WHERE seq_id = $1");
        let insert = format!(
            "INSERT INTO {schema}.sl_seqlog \
             (seql_seqid, seql_origin, seql_ev_seqno, seql_last_value) \
             VALUES ($1, $2, $3, $4)"
        );
        for (seq_id, last_value) in values {
            let relname: Option<(String,)> = sqlx::query_as(&relname_query)
                .bind(seq_id)
                .fetch_optional(&mut **tx)
                .await?;
            if let Some((relname,)) = relname {
                sqlx::query("SELECT setval($1::regclass, $2)")
                    .bind(&relname)
                    .bind(last_value)
                    .execute(&mut **tx)
                    .await?;
            }
            sqlx::query(&insert)
                .bind(seq_id)
                .bind(self.origin)
                .bind(seqno)
                .bind(last_value)
                .execute(&mut **tx)
                .await?;
        }
        debug!(origin = %self.origin, seqno = %seqno, "Applied sequence snapshot");
        Ok(())
    }

    async fn any_event_provider_pool(&self) -> DaemonResult<Option<PgPool>> {
        let Some(provider) = self.event_provider() else {
            return Ok(None);
        };
        let Some(path) = self.cfg.path(provider) else {
            return Ok(None);
        };
        let options = self.connect_options(&path.conninfo);
        Ok(Some(
            self.scheduler.wait_connection(provider, &options).await?,
        ))
    }

    fn finish_confirm(&mut self, seqno: EventSeq) {
        self.confirmed = Some(seqno);
        self.cfg.set_node_last_event(self.origin, seqno);
        self.cleanup_wakeup.notify_one();
    }
}

// =============================================================================
// Shared SQL helpers
// =============================================================================

/// Re-insert a remote event into the local `sl_event` so cascaded
/// subscribers can consume it, and announce it.
pub async fn forward_event(
    tx: &mut Transaction<'_, Postgres>,
    schema: &str,
    cluster: &str,
    event: &Event,
) -> DaemonResult<()> {
    let insert = format!(
        "INSERT INTO {schema}.sl_event \
         (ev_origin, ev_seqno, ev_timestamp, ev_minxid, ev_maxxid, ev_xip, \
          ev_type, ev_data1, ev_data2, ev_data3, ev_data4, \
          ev_data5, ev_data6, ev_data7, ev_data8) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         ON CONFLICT (ev_origin, ev_seqno) DO NOTHING"
    );
    sqlx::query(&insert)
        .bind(event.ev_origin)
        .bind(event.ev_seqno)
        .bind(event.ev_timestamp)
        .bind(event.ev_minxid)
        .bind(event.ev_maxxid)
        .bind(&event.ev_xip)
        .bind(&event.ev_type)
        .bind(&event.ev_data1)
        .bind(&event.ev_data2)
        .bind(&event.ev_data3)
        .bind(&event.ev_data4)
        .bind(&event.ev_data5)
        .bind(&event.ev_data6)
        .bind(&event.ev_data7)
        .bind(&event.ev_data8)
        .execute(&mut **tx)
        .await?;

    let notify = format!("NOTIFY {}", quote_ident(&event_channel(cluster)));
    sqlx::query(&notify).execute(&mut **tx).await?;
    Ok(())
}

/// Keep a forwarded copy of a log row in the local active partition.
async fn forward_log_row(
    tx: &mut Transaction<'_, Postgres>,
    schema: &str,
    active_partition: i32,
    row: &LogRow,
) -> DaemonResult<()> {
    let log_table = if active_partition == 0 {
        "sl_log_1"
    } else {
        "sl_log_2"
    };
    let insert = format!(
        "INSERT INTO {schema}.{log_table} \
         (log_origin, log_xid, log_tableid, log_actionseq, log_cmdtype, log_cmddata) \
         VALUES ($1, $2, $3, $4, $5, $6)"
    );
    sqlx::query(&insert)
        .bind(row.log_origin)
        .bind(row.log_xid)
        .bind(row.log_tableid)
        .bind(row.log_actionseq)
        .bind(&row.log_cmdtype)
        .bind(&row.log_cmddata)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Raise the (origin, receiver) confirmation watermark. `GREATEST` makes
/// monotonicity a post-condition, no read required.
///
/// Runs against whichever database the caller hands it: the receiver's
/// own apply transaction, or a provider connection when the watermark is
/// mirrored upstream.
pub async fn update_confirm(
    conn: &mut PgConnection,
    schema: &str,
    origin: NodeId,
    received: NodeId,
    seqno: EventSeq,
) -> DaemonResult<()> {
    let upsert = format!(
        "INSERT INTO {schema}.sl_confirm (con_origin, con_received, con_seqno, con_timestamp) \
         VALUES ($1, $2, $3, now()) \
         ON CONFLICT (con_origin, con_received) DO UPDATE \
         SET con_seqno = GREATEST(sl_confirm.con_seqno, EXCLUDED.con_seqno), \
             con_timestamp = now()"
    );
    sqlx::query(&upsert)
        .bind(origin)
        .bind(received)
        .bind(seqno)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Does the provider still lack this receiver's latest watermark?
pub fn confirm_needs_push(confirmed: Option<EventSeq>, pushed: Option<EventSeq>) -> bool {
    match (confirmed, pushed) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(confirmed), Some(pushed)) => confirmed > pushed,
    }
}

/// Stream one table's contents from the provider into the local
/// transaction, replacing what was there.
async fn copy_table(
    tx: &mut Transaction<'_, Postgres>,
    provider_pool: &PgPool,
    relname: &str,
) -> DaemonResult<()> {
    let truncate = format!("TRUNCATE {relname}");
    tx.execute(truncate.as_str()).await?;

    let mut provider_conn = provider_pool.acquire().await?;
    let mut source = provider_conn
        .copy_out_raw(&format!("COPY (SELECT * FROM only {relname}) TO STDOUT"))
        .await?;

    let conn: &mut PgConnection = &mut *tx;
    let mut sink = conn.copy_in_raw(&format!("COPY {relname} FROM STDIN")).await?;
    while let Some(chunk) = source.try_next().await? {
        sink.send(chunk.as_ref()).await?;
    }
    let copied = sink.finish().await?;
    debug!(relname, rows = copied, "Copied table contents");
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_domain::Xxid;
    use std::collections::BTreeSet;

    fn node(n: i32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn snap(xmin: i64, xmax: i64, xip: &[i64]) -> TxSnapshot {
        TxSnapshot::new(
            Xxid(xmin),
            Xxid(xmax),
            xip.iter().copied().map(Xxid).collect::<BTreeSet<_>>(),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(10));
        assert_eq!(backoff.next(), Duration::from_secs(10));
        assert_eq!(backoff.next(), Duration::from_secs(20));
        assert_eq!(backoff.next(), Duration::from_secs(40));
        assert_eq!(backoff.next(), Duration::from_secs(80));
        assert_eq!(backoff.next(), Duration::from_secs(100));
        assert_eq!(backoff.next(), Duration::from_secs(100));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_secs(10));
    }

    #[test]
    fn test_apply_statements() {
        assert_eq!(
            build_apply_statement("public.accounts", CmdType::Insert, "(k,v) values ('1','a')"),
            "insert into public.accounts (k,v) values ('1','a')"
        );
        assert_eq!(
            build_apply_statement("public.accounts", CmdType::Update, "v='b' where k='1'"),
            "update only public.accounts set v='b' where k='1'"
        );
        assert_eq!(
            build_apply_statement("public.accounts", CmdType::Delete, "k='1'"),
            "delete from only public.accounts where k='1'"
        );
    }

    #[test]
    fn test_log_where_clause_full_window() {
        let window = SyncWindow {
            prev: snap(100, 105, &[101, 103]),
            curr: snap(104, 110, &[108]),
        };
        let clause = log_where_clause(node(2), &[1, 7], &window);
        assert_eq!(
            clause,
            "log_origin = 2 and log_tableid in (1,7) \
             and log_xid < 110 and log_xid not in (108) \
             and (log_xid >= 105 or log_xid in (101,103))"
        );
    }

    #[test]
    fn test_confirm_push_decision() {
        // Nothing confirmed yet: nothing to push
        assert!(!confirm_needs_push(None, None));
        // First confirmation always goes upstream
        assert!(confirm_needs_push(Some(EventSeq(5)), None));
        // Already mirrored: no-op
        assert!(!confirm_needs_push(Some(EventSeq(5)), Some(EventSeq(5))));
        assert!(!confirm_needs_push(Some(EventSeq(5)), Some(EventSeq(7))));
        // Watermark advanced past what the provider has
        assert!(confirm_needs_push(Some(EventSeq(8)), Some(EventSeq(5))));
    }

    #[test]
    fn test_log_where_clause_empty_xips() {
        let window = SyncWindow {
            prev: snap(100, 105, &[]),
            curr: snap(105, 110, &[]),
        };
        let clause = log_where_clause(node(2), &[1], &window);
        assert_eq!(
            clause,
            "log_origin = 2 and log_tableid in (1) \
             and log_xid < 110 and (log_xid >= 105)"
        );
    }
}
