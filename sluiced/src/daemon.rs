//! Daemon: startup, task wiring, and the reconcile loop.
//!
//! # Lifecycle
//!
//! 1. Connect to the local database, resolve the node id, check the
//!    schema version handshake
//! 2. Write the pid file
//! 3. Read the configuration snapshot in one serializable transaction
//! 4. Start the local listener and wait for its singleton check
//! 5. Activate remote workers, the SYNC generator and the cleanup task
//! 6. Reconcile the worker set as topology events arrive
//! 7. On shutdown, drain remote workers with a bounded join

use crate::archive::ArchiveWriter;
use crate::error::{DaemonError, DaemonResult};
use crate::listener::LocalListener;
use crate::options::Options;
use crate::remote_worker::RemoteWorker;
use crate::scheduler::Scheduler;
use crate::sync_gen::SyncGenerator;
use crate::watchdog;
use crate::cleanup::CleanupTask;
use sluice_config::{RuntimeConfig, WorkerHandle, WorkerRegistry};
use sluice_db::{check_schema_version, connect_node, get_local_node_id, ConnectOptions};
use sluice_domain::{EventSeq, NodeId, SetId};
use sluice_sql::cluster_schema;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Pid file
// =============================================================================

/// Pid file written at startup and removed when the daemon exits.
struct PidFile(PathBuf);

impl PidFile {
    fn create(path: &Path) -> std::io::Result<Self> {
        std::fs::write(path, std::process::id().to_string())?;
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            warn!(path = %self.0.display(), error = %e, "Cannot remove pid file");
        }
    }
}

// =============================================================================
// Daemon
// =============================================================================

/// The sluice daemon.
pub struct Daemon {
    options: Arc<Options>,
}

impl Daemon {
    /// Build a daemon from resolved options.
    pub fn new(options: Options) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    /// Run under the watchdog until shutdown. Returns the process exit
    /// code.
    pub async fn run(&self) -> DaemonResult<i32> {
        let options = self.options.clone();
        watchdog::supervise(move |token| {
            let options = options.clone();
            async move { run_once(options, token).await }
        })
        .await
    }
}

/// One worker-set generation: everything between two watchdog restarts.
pub async fn run_once(options: Arc<Options>, token: CancellationToken) -> DaemonResult<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        cluster = %options.cluster,
        "sluiced starting up"
    );

    // Local database and identity
    let connect = ConnectOptions {
        conninfo: options.conninfo.clone(),
        sql_on_connection: options.sql_on_connection.clone(),
        max_connections: 8,
    };
    let local_pool = connect_node(&connect)?;
    let local_node = {
        let mut conn = local_pool.acquire().await?;
        let node = get_local_node_id(&mut conn, &options.cluster).await?;
        check_schema_version(&mut conn, &options.cluster).await?;
        node
    };
    info!(node = %local_node, "Local node identified");

    let _pid_file = match &options.pid_file {
        Some(path) => Some(PidFile::create(path)?),
        None => None,
    };

    // Configuration snapshot
    let cfg = Arc::new(RuntimeConfig::new(options.cluster.clone(), local_node));
    let last_local_event = load_config_snapshot(&local_pool, &cfg).await?;
    info!(last_local_event = %last_local_event, "Configuration loaded");

    let scheduler = Arc::new(Scheduler::new(token.clone()));
    let registry = Arc::new(WorkerRegistry::new());
    let cleanup_wakeup = Arc::new(Notify::new());
    let archive = match &options.archive_dir {
        Some(dir) => Some(ArchiveWriter::new(dir, &options.cluster).await?),
        None => None,
    };
    let (reconcile_tx, mut reconcile_rx) = mpsc::channel::<()>(16);

    // The local listener performs the singleton check; nothing else may
    // start before it reports in
    let (ready_tx, ready_rx) = oneshot::channel();
    let listener = LocalListener {
        options: options.clone(),
        cfg: cfg.clone(),
        local_pool: local_pool.clone(),
        reconcile_tx: reconcile_tx.clone(),
        last_local_event,
    };
    let listener_handle = tokio::spawn(listener.run(ready_tx, token.child_token()));
    ready_rx
        .await
        .map_err(|_| DaemonError::Config("local listener died during startup".into()))??;

    // Activate workers for every node the snapshot marked active
    cfg.do_activate();
    reconcile_workers(
        &options,
        &cfg,
        &scheduler,
        &registry,
        &local_pool,
        &archive,
        &cleanup_wakeup,
        &reconcile_tx,
    );

    let sync_handle = tokio::spawn(
        SyncGenerator {
            options: options.clone(),
            cfg: cfg.clone(),
            local_pool: local_pool.clone(),
        }
        .run(token.child_token()),
    );
    let cleanup_handle = tokio::spawn(
        CleanupTask {
            options: options.clone(),
            cfg: cfg.clone(),
            local_pool: local_pool.clone(),
            wakeup: cleanup_wakeup.clone(),
        }
        .run(token.child_token()),
    );

    info!("Daemon running");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            ping = reconcile_rx.recv() => {
                if ping.is_none() {
                    break;
                }
                reconcile_workers(
                    &options,
                    &cfg,
                    &scheduler,
                    &registry,
                    &local_pool,
                    &archive,
                    &cleanup_wakeup,
                    &reconcile_tx,
                );
            }
        }
    }

    // Ordered shutdown: remote workers first, then the local tasks
    info!("Draining remote workers");
    if !registry.join_all().await {
        error!("Remote workers did not stop in time");
    }
    let _ = listener_handle.await;
    let _ = sync_handle.await;
    let _ = cleanup_handle.await;
    scheduler.teardown().await;

    info!("Daemon stopped");
    Ok(())
}

/// Bring the running worker set in line with the wanted one.
#[allow(clippy::too_many_arguments)]
fn reconcile_workers(
    options: &Arc<Options>,
    cfg: &Arc<RuntimeConfig>,
    scheduler: &Arc<Scheduler>,
    registry: &Arc<WorkerRegistry>,
    local_pool: &PgPool,
    archive: &Option<ArchiveWriter>,
    cleanup_wakeup: &Arc<Notify>,
    reconcile_tx: &mpsc::Sender<()>,
) {
    let wanted = cfg.wanted_workers();

    for node in registry.nodes() {
        if !wanted.contains(&node) {
            info!(origin = %node, "Stopping remote worker");
            registry.stop(node);
        } else {
            // Re-resolve config, retry parked workers
            scheduler.wakeup_node(node);
        }
    }

    for node in wanted {
        if registry.contains(node) {
            continue;
        }
        debug!(origin = %node, "Spawning remote worker");
        let worker = RemoteWorker::new(
            node,
            options.clone(),
            cfg.clone(),
            scheduler.clone(),
            local_pool.clone(),
            archive.clone(),
            cleanup_wakeup.clone(),
            reconcile_tx.clone(),
        );
        let worker_token = scheduler.shutdown_token().child_token();
        let handle = tokio::spawn(worker.run(worker_token.clone()));
        registry.register(
            node,
            WorkerHandle {
                token: worker_token,
                handle,
            },
        );
    }
}

/// Read the whole cluster configuration in one serializable read-only
/// transaction, then roll it back.
async fn load_config_snapshot(pool: &PgPool, cfg: &RuntimeConfig) -> DaemonResult<EventSeq> {
    let schema = cluster_schema(cfg.cluster());
    let local = cfg.local_node();

    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY")
        .execute(&mut *tx)
        .await?;

    // Nodes, with the per-origin confirmation watermark in one pass
    let nodes_query = format!(
        "SELECT no_id, no_active, no_comment, \
                (SELECT coalesce(max(con_seqno), 0) FROM {schema}.sl_confirm \
                 WHERE con_origin = no_id AND con_received = $1) AS last_event \
         FROM {schema}.sl_node ORDER BY no_id"
    );
    let nodes: Vec<(i32, bool, String, i64)> = sqlx::query_as(&nodes_query)
        .bind(local)
        .fetch_all(&mut *tx)
        .await?;
    for (id, active, comment, last_event) in nodes {
        let id = NodeId::new(id)?;
        if id == local {
            continue;
        }
        cfg.store_node(id, active, &comment)?;
        cfg.set_node_last_event(id, EventSeq(last_event));
        if active {
            cfg.need_activate(id);
        }
    }

    let paths_query = format!(
        "SELECT pa_server, pa_conninfo, pa_connretry FROM {schema}.sl_path WHERE pa_client = $1"
    );
    let paths: Vec<(i32, String, i32)> = sqlx::query_as(&paths_query)
        .bind(local)
        .fetch_all(&mut *tx)
        .await?;
    for (server, conninfo, connretry) in paths {
        cfg.store_path(NodeId::new(server)?, &conninfo, connretry.max(0) as u32);
    }

    let listen_query =
        format!("SELECT li_origin, li_provider FROM {schema}.sl_listen WHERE li_receiver = $1");
    let listens: Vec<(i32, i32)> = sqlx::query_as(&listen_query)
        .bind(local)
        .fetch_all(&mut *tx)
        .await?;
    let mut entries = Vec::with_capacity(listens.len());
    for (origin, provider) in listens {
        entries.push(sluice_config::ListenRecord {
            origin: NodeId::new(origin)?,
            provider: NodeId::new(provider)?,
        });
    }
    cfg.reload_listen(entries);

    let sets_query = format!("SELECT set_id, set_origin, set_comment FROM {schema}.sl_set");
    let sets: Vec<(i32, i32, String)> = sqlx::query_as(&sets_query).fetch_all(&mut *tx).await?;
    for (id, origin, comment) in sets {
        cfg.store_set(SetId(id), NodeId::new(origin)?, &comment);
    }

    let subs_query = format!(
        "SELECT sub_set, sub_provider, sub_forward, sub_active \
         FROM {schema}.sl_subscribe WHERE sub_receiver = $1"
    );
    let subs: Vec<(i32, i32, bool, bool)> = sqlx::query_as(&subs_query)
        .bind(local)
        .fetch_all(&mut *tx)
        .await?;
    for (set, provider, forward, active) in subs {
        let set = SetId(set);
        cfg.store_subscribe(set, NodeId::new(provider)?, forward);
        if active {
            cfg.enable_subscription(set)?;
        }
    }

    let last_event_query = format!(
        "SELECT coalesce(max(ev_seqno), 0) FROM {schema}.sl_event WHERE ev_origin = $1"
    );
    let last_local: i64 = sqlx::query_scalar(&last_event_query)
        .bind(local)
        .fetch_one(&mut *tx)
        .await?;

    tx.rollback().await?;
    Ok(EventSeq(last_local))
}
