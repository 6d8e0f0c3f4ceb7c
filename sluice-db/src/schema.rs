//! The cluster schema.
//!
//! Every participating database carries the same schema, named after the
//! cluster. Installation is idempotent; the statements use IF NOT EXISTS
//! and ON CONFLICT so a re-run against a live node is harmless.

use crate::{Result, SCHEMA_VERSION};
use sluice_domain::NodeId;
use sluice_sql::cluster_schema;
use sqlx::{Executor, PgPool};
use tracing::info;

/// The DDL statements for one cluster schema, in execution order.
fn schema_statements(schema: &str) -> Vec<String> {
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
        // Identity of this database within the cluster
        format!("CREATE SEQUENCE IF NOT EXISTS {schema}.sl_local_node_id MINVALUE -1"),
        // Per-origin event sequence and the global row-action sequence
        format!("CREATE SEQUENCE IF NOT EXISTS {schema}.sl_event_seq"),
        format!("CREATE SEQUENCE IF NOT EXISTS {schema}.sl_action_seq"),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_node (\n\
             \tno_id      int4 PRIMARY KEY,\n\
             \tno_active  bool NOT NULL DEFAULT false,\n\
             \tno_comment text NOT NULL DEFAULT ''\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_path (\n\
             \tpa_server    int4 NOT NULL,\n\
             \tpa_client    int4 NOT NULL,\n\
             \tpa_conninfo  text NOT NULL,\n\
             \tpa_connretry int4 NOT NULL DEFAULT 10,\n\
             \tPRIMARY KEY (pa_server, pa_client)\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_listen (\n\
             \tli_origin   int4 NOT NULL,\n\
             \tli_provider int4 NOT NULL,\n\
             \tli_receiver int4 NOT NULL,\n\
             \tPRIMARY KEY (li_origin, li_provider, li_receiver)\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_set (\n\
             \tset_id      int4 PRIMARY KEY,\n\
             \tset_origin  int4 NOT NULL,\n\
             \tset_comment text NOT NULL DEFAULT ''\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_table (\n\
             \ttab_id      int4 PRIMARY KEY,\n\
             \ttab_relname text NOT NULL,\n\
             \ttab_set     int4 NOT NULL,\n\
             \ttab_attkind text NOT NULL,\n\
             \ttab_comment text NOT NULL DEFAULT ''\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_sequence (\n\
             \tseq_id      int4 PRIMARY KEY,\n\
             \tseq_relname text NOT NULL,\n\
             \tseq_set     int4 NOT NULL,\n\
             \tseq_comment text NOT NULL DEFAULT ''\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_subscribe (\n\
             \tsub_set      int4 NOT NULL,\n\
             \tsub_provider int4 NOT NULL,\n\
             \tsub_receiver int4 NOT NULL,\n\
             \tsub_forward  bool NOT NULL DEFAULT false,\n\
             \tsub_active   bool NOT NULL DEFAULT false,\n\
             \tPRIMARY KEY (sub_set, sub_receiver)\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_event (\n\
             \tev_origin    int4 NOT NULL,\n\
             \tev_seqno     int8 NOT NULL,\n\
             \tev_timestamp timestamptz NOT NULL DEFAULT now(),\n\
             \tev_minxid    int8 NOT NULL,\n\
             \tev_maxxid    int8 NOT NULL,\n\
             \tev_xip       text NOT NULL DEFAULT '',\n\
             \tev_type      text NOT NULL,\n\
             \tev_data1     text,\n\
             \tev_data2     text,\n\
             \tev_data3     text,\n\
             \tev_data4     text,\n\
             \tev_data5     text,\n\
             \tev_data6     text,\n\
             \tev_data7     text,\n\
             \tev_data8     text,\n\
             \tPRIMARY KEY (ev_origin, ev_seqno)\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_confirm (\n\
             \tcon_origin    int4 NOT NULL,\n\
             \tcon_received  int4 NOT NULL,\n\
             \tcon_seqno     int8 NOT NULL,\n\
             \tcon_timestamp timestamptz NOT NULL DEFAULT now(),\n\
             \tPRIMARY KEY (con_origin, con_received)\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_log_1 (\n\
             \tlog_origin    int4 NOT NULL,\n\
             \tlog_xid       int8 NOT NULL,\n\
             \tlog_tableid   int4 NOT NULL,\n\
             \tlog_actionseq int8 NOT NULL,\n\
             \tlog_cmdtype   char(1) NOT NULL,\n\
             \tlog_cmddata   text NOT NULL\n\
             )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS sl_log_1_idx ON {schema}.sl_log_1 \
             (log_origin, log_xid, log_actionseq)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_log_2 (\n\
             \tlog_origin    int4 NOT NULL,\n\
             \tlog_xid       int8 NOT NULL,\n\
             \tlog_tableid   int4 NOT NULL,\n\
             \tlog_actionseq int8 NOT NULL,\n\
             \tlog_cmdtype   char(1) NOT NULL,\n\
             \tlog_cmddata   text NOT NULL\n\
             )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS sl_log_2_idx ON {schema}.sl_log_2 \
             (log_origin, log_xid, log_actionseq)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_seqlog (\n\
             \tseql_seqid      int4 NOT NULL,\n\
             \tseql_origin     int4 NOT NULL,\n\
             \tseql_ev_seqno   int8 NOT NULL,\n\
             \tseql_last_value int8 NOT NULL\n\
             )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS sl_seqlog_idx ON {schema}.sl_seqlog \
             (seql_origin, seql_ev_seqno, seql_seqid)"
        ),
        // Which log partition capture appends to: 0 -> sl_log_1, 1 -> sl_log_2
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_log_status (\n\
             \tls_active int4 NOT NULL\n\
             )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sl_version (\n\
             \tver_schema text NOT NULL\n\
             )"
        ),
        // Current value of every replicated sequence, by owning origin
        format!(
            "CREATE OR REPLACE VIEW {schema}.sl_seqlastvalue AS \
             SELECT sq.seq_id, st.set_origin AS seq_origin, \
                    pg_sequence_last_value(sq.seq_relname::regclass) AS seq_last_value \
             FROM {schema}.sl_sequence sq \
             JOIN {schema}.sl_set st ON sq.seq_set = st.set_id"
        ),
    ]
}

/// Install the cluster schema and assign this database its node id.
///
/// Idempotent; re-running against an installed node only refreshes the
/// version row.
pub async fn install_schema(pool: &PgPool, cluster: &str, local_node: NodeId) -> Result<()> {
    let schema = cluster_schema(cluster);

    let mut tx = pool.begin().await?;
    for statement in schema_statements(&schema) {
        tx.execute(statement.as_str()).await?;
    }

    // Seed the singleton rows
    let set_node = format!("SELECT setval('{schema}.sl_local_node_id', $1)");
    sqlx::query(&set_node)
        .bind(local_node.as_i32() as i64)
        .execute(&mut *tx)
        .await?;

    let seed_status = format!(
        "INSERT INTO {schema}.sl_log_status (ls_active) \
         SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {schema}.sl_log_status)"
    );
    sqlx::query(&seed_status).execute(&mut *tx).await?;

    let reset_version = format!("DELETE FROM {schema}.sl_version");
    sqlx::query(&reset_version).execute(&mut *tx).await?;
    let seed_version = format!("INSERT INTO {schema}.sl_version (ver_schema) VALUES ($1)");
    sqlx::query(&seed_version)
        .bind(SCHEMA_VERSION)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    info!(cluster, node = %local_node, "Installed cluster schema");
    Ok(())
}

/// Drop the cluster schema and everything in it.
pub async fn uninstall_schema(pool: &PgPool, cluster: &str) -> Result<()> {
    let schema = cluster_schema(cluster);
    let drop = format!("DROP SCHEMA IF EXISTS {schema} CASCADE");
    pool.execute(drop.as_str()).await?;
    info!(cluster, "Removed cluster schema");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statements_cover_all_tables() {
        let ddl = schema_statements("_payroll").join(";\n");
        for table in [
            "sl_node",
            "sl_path",
            "sl_listen",
            "sl_set",
            "sl_table",
            "sl_sequence",
            "sl_subscribe",
            "sl_event",
            "sl_confirm",
            "sl_log_1",
            "sl_log_2",
            "sl_seqlog",
            "sl_log_status",
            "sl_version",
            "sl_seqlastvalue",
        ] {
            assert!(
                ddl.contains(&format!("_payroll.{table}")),
                "missing {table}"
            );
        }
        for seq in ["sl_local_node_id", "sl_event_seq", "sl_action_seq"] {
            assert!(ddl.contains(seq), "missing sequence {seq}");
        }
    }

    #[test]
    fn test_statements_quote_odd_cluster_names() {
        let schema = cluster_schema("My Cluster");
        let ddl = schema_statements(&schema).join(";\n");
        assert!(ddl.contains("\"_My Cluster\".sl_event"));
    }
}
