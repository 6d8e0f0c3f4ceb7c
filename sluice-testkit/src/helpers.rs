//! Seeding helpers for cluster schemas under test.

use crate::Result;
use sluice_capture::{create_event, EventArgs};
use sluice_domain::{EventSeq, EventType, NodeId, SetId, TableId};
use sluice_sql::cluster_schema;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

/// Connect to the test database named by `DATABASE_URL`.
pub async fn test_pool() -> Result<PgPool> {
    let url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must point at a test database"))?;
    let pool = PgPoolOptions::new().max_connections(8).connect(&url).await?;
    Ok(pool)
}

/// Drop and reinstall a scratch cluster schema, returning its name.
pub async fn fresh_cluster(pool: &PgPool, cluster: &str, local_node: NodeId) -> Result<()> {
    sluice_db::uninstall_schema(pool, cluster).await?;
    sluice_db::install_schema(pool, cluster, local_node).await?;
    Ok(())
}

/// Insert a node row.
pub async fn seed_node(
    pool: &PgPool,
    cluster: &str,
    id: NodeId,
    active: bool,
    comment: &str,
) -> Result<()> {
    let schema = cluster_schema(cluster);
    let query = format!(
        "INSERT INTO {schema}.sl_node (no_id, no_active, no_comment) VALUES ($1, $2, $3) \
         ON CONFLICT (no_id) DO UPDATE SET no_active = EXCLUDED.no_active"
    );
    sqlx::query(&query)
        .bind(id)
        .bind(active)
        .bind(comment)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert a path row.
pub async fn seed_path(
    pool: &PgPool,
    cluster: &str,
    server: NodeId,
    client: NodeId,
    conninfo: &str,
    connretry: i32,
) -> Result<()> {
    let schema = cluster_schema(cluster);
    let query = format!(
        "INSERT INTO {schema}.sl_path (pa_server, pa_client, pa_conninfo, pa_connretry) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (pa_server, pa_client) DO UPDATE SET pa_conninfo = EXCLUDED.pa_conninfo"
    );
    sqlx::query(&query)
        .bind(server)
        .bind(client)
        .bind(conninfo)
        .bind(connretry)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert a listen row.
pub async fn seed_listen(
    pool: &PgPool,
    cluster: &str,
    origin: NodeId,
    provider: NodeId,
    receiver: NodeId,
) -> Result<()> {
    let schema = cluster_schema(cluster);
    let query = format!(
        "INSERT INTO {schema}.sl_listen (li_origin, li_provider, li_receiver) \
         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING"
    );
    sqlx::query(&query)
        .bind(origin)
        .bind(provider)
        .bind(receiver)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert a set row.
pub async fn seed_set(pool: &PgPool, cluster: &str, set: SetId, origin: NodeId) -> Result<()> {
    let schema = cluster_schema(cluster);
    let query = format!(
        "INSERT INTO {schema}.sl_set (set_id, set_origin, set_comment) VALUES ($1, $2, '') \
         ON CONFLICT (set_id) DO UPDATE SET set_origin = EXCLUDED.set_origin"
    );
    sqlx::query(&query).bind(set).bind(origin).execute(pool).await?;
    Ok(())
}

/// Register a replicated table in a set.
pub async fn seed_table(
    pool: &PgPool,
    cluster: &str,
    table: TableId,
    set: SetId,
    relname: &str,
    attkind: &str,
) -> Result<()> {
    let schema = cluster_schema(cluster);
    let query = format!(
        "INSERT INTO {schema}.sl_table (tab_id, tab_relname, tab_set, tab_attkind, tab_comment) \
         VALUES ($1, $2, $3, $4, '') \
         ON CONFLICT (tab_id) DO UPDATE SET tab_relname = EXCLUDED.tab_relname"
    );
    sqlx::query(&query)
        .bind(table)
        .bind(relname)
        .bind(set)
        .bind(attkind)
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert a subscription row.
pub async fn seed_subscribe(
    pool: &PgPool,
    cluster: &str,
    set: SetId,
    provider: NodeId,
    receiver: NodeId,
    forward: bool,
    active: bool,
) -> Result<()> {
    let schema = cluster_schema(cluster);
    let query = format!(
        "INSERT INTO {schema}.sl_subscribe \
         (sub_set, sub_provider, sub_receiver, sub_forward, sub_active) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (sub_set, sub_receiver) DO UPDATE SET sub_active = EXCLUDED.sub_active"
    );
    sqlx::query(&query)
        .bind(set)
        .bind(provider)
        .bind(receiver)
        .bind(forward)
        .bind(active)
        .execute(pool)
        .await?;
    Ok(())
}

/// Create an event through the event builder, committed.
pub async fn seed_event(
    pool: &PgPool,
    cluster: &str,
    origin: NodeId,
    ev_type: EventType,
    args: EventArgs,
) -> Result<EventSeq> {
    let mut tx = pool.begin().await?;
    let seqno = create_event(&mut tx, cluster, origin, ev_type, &args).await?;
    tx.commit().await?;
    Ok(seqno)
}

/// The confirmation watermark a receiver has recorded for an origin.
pub async fn confirm_watermark(
    pool: &PgPool,
    cluster: &str,
    origin: NodeId,
    received: NodeId,
) -> Result<i64> {
    let schema = cluster_schema(cluster);
    let query = format!(
        "SELECT coalesce(max(con_seqno), 0) FROM {schema}.sl_confirm \
         WHERE con_origin = $1 AND con_received = $2"
    );
    let seqno = sqlx::query_scalar(&query)
        .bind(origin)
        .bind(received)
        .fetch_one(pool)
        .await?;
    Ok(seqno)
}

/// Row count of an arbitrary (possibly schema-qualified) table.
pub async fn count_rows(pool: &PgPool, relname: &str) -> Result<i64> {
    let query = format!("SELECT count(*) FROM {relname}");
    Ok(sqlx::query_scalar(&query).fetch_one(pool).await?)
}

/// Create a plain two-column replicated test table.
pub async fn create_demo_table(pool: &PgPool, relname: &str) -> Result<()> {
    let drop = format!("DROP TABLE IF EXISTS {relname}");
    pool.execute(drop.as_str()).await?;
    let create = format!("CREATE TABLE {relname} (k int4 PRIMARY KEY, v text)");
    pool.execute(create.as_str()).await?;
    Ok(())
}
