//! Persisting administrative events into the local cluster schema.
//!
//! A receiver does not just mirror topology in memory: its own startup
//! snapshot and any cascaded subscriber read the configuration tables, so
//! every administrative event is also applied to `sl_node`, `sl_path`,
//! `sl_set`, `sl_table`, `sl_sequence`, `sl_subscribe` and `sl_listen` on
//! the local database, inside the same transaction that confirms the
//! event.

use crate::error::{DaemonError, DaemonResult};
use sluice_domain::{Event, EventType, NodeId};
use sqlx::{Executor, PgConnection};
use tracing::{debug, info};

/// Apply one administrative event to the local configuration tables.
pub async fn persist_config_event(
    conn: &mut PgConnection,
    schema: &str,
    local: NodeId,
    event: &Event,
) -> DaemonResult<()> {
    let ev_type = event.event_type().map_err(|e| DaemonError::ProtocolViolation {
        node: event.ev_origin,
        detail: e.to_string(),
    })?;

    match ev_type {
        EventType::StoreNode => {
            let query = format!(
                "INSERT INTO {schema}.sl_node (no_id, no_active, no_comment) \
                 VALUES ($1, false, $2) \
                 ON CONFLICT (no_id) DO UPDATE SET no_comment = EXCLUDED.no_comment"
            );
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data(2).unwrap_or(""))
                .execute(&mut *conn)
                .await?;
        }
        EventType::EnableNode => {
            let query = format!("UPDATE {schema}.sl_node SET no_active = true WHERE no_id = $1");
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::DropNode => {
            let id = event.data_i32(1)?;
            for query in [
                format!("DELETE FROM {schema}.sl_subscribe WHERE sub_provider = $1 OR sub_receiver = $1"),
                format!("DELETE FROM {schema}.sl_listen WHERE li_origin = $1 OR li_provider = $1 OR li_receiver = $1"),
                format!("DELETE FROM {schema}.sl_path WHERE pa_server = $1 OR pa_client = $1"),
                format!("DELETE FROM {schema}.sl_node WHERE no_id = $1"),
            ] {
                sqlx::query(&query).bind(id).execute(&mut *conn).await?;
            }
        }
        EventType::StorePath => {
            let query = format!(
                "INSERT INTO {schema}.sl_path (pa_server, pa_client, pa_conninfo, pa_connretry) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (pa_server, pa_client) DO UPDATE \
                 SET pa_conninfo = EXCLUDED.pa_conninfo, pa_connretry = EXCLUDED.pa_connretry"
            );
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data_i32(2)?)
                .bind(event.require_data(3)?)
                .bind(event.data_i32(4).unwrap_or(10))
                .execute(&mut *conn)
                .await?;
        }
        EventType::DropPath => {
            let query =
                format!("DELETE FROM {schema}.sl_path WHERE pa_server = $1 AND pa_client = $2");
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data_i32(2)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::StoreListen => {
            let query = format!(
                "INSERT INTO {schema}.sl_listen (li_origin, li_provider, li_receiver) \
                 VALUES ($1, $2, $3) ON CONFLICT DO NOTHING"
            );
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data_i32(2)?)
                .bind(event.data_i32(3)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::DropListen => {
            let query = format!(
                "DELETE FROM {schema}.sl_listen \
                 WHERE li_origin = $1 AND li_provider = $2 AND li_receiver = $3"
            );
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data_i32(2)?)
                .bind(event.data_i32(3)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::StoreSet => {
            let query = format!(
                "INSERT INTO {schema}.sl_set (set_id, set_origin, set_comment) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (set_id) DO UPDATE \
                 SET set_origin = EXCLUDED.set_origin, set_comment = EXCLUDED.set_comment"
            );
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.ev_origin)
                .bind(event.data(2).unwrap_or(""))
                .execute(&mut *conn)
                .await?;
        }
        EventType::DropSet => {
            let id = event.data_i32(1)?;
            for query in [
                format!("DELETE FROM {schema}.sl_subscribe WHERE sub_set = $1"),
                format!("DELETE FROM {schema}.sl_table WHERE tab_set = $1"),
                format!("DELETE FROM {schema}.sl_sequence WHERE seq_set = $1"),
                format!("DELETE FROM {schema}.sl_set WHERE set_id = $1"),
            ] {
                sqlx::query(&query).bind(id).execute(&mut *conn).await?;
            }
        }
        EventType::MergeSet => {
            let into = event.data_i32(1)?;
            let from = event.data_i32(2)?;
            for query in [
                format!("UPDATE {schema}.sl_table SET tab_set = $1 WHERE tab_set = $2"),
                format!("UPDATE {schema}.sl_sequence SET seq_set = $1 WHERE seq_set = $2"),
            ] {
                sqlx::query(&query)
                    .bind(into)
                    .bind(from)
                    .execute(&mut *conn)
                    .await?;
            }
            for query in [
                format!("DELETE FROM {schema}.sl_subscribe WHERE sub_set = $1"),
                format!("DELETE FROM {schema}.sl_set WHERE set_id = $1"),
            ] {
                sqlx::query(&query).bind(from).execute(&mut *conn).await?;
            }
            info!(into, from, "Merged set");
        }
        EventType::MoveSet | EventType::FailoverSet => {
            let query = format!("UPDATE {schema}.sl_set SET set_origin = $2 WHERE set_id = $1");
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data_i32(2)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::SetAddTable => {
            let query = format!(
                "INSERT INTO {schema}.sl_table (tab_id, tab_relname, tab_set, tab_attkind, tab_comment) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (tab_id) DO UPDATE \
                 SET tab_relname = EXCLUDED.tab_relname, tab_set = EXCLUDED.tab_set, \
                     tab_attkind = EXCLUDED.tab_attkind, tab_comment = EXCLUDED.tab_comment"
            );
            sqlx::query(&query)
                .bind(event.data_i32(2)?)
                .bind(event.require_data(3)?)
                .bind(event.data_i32(1)?)
                .bind(event.require_data(4)?)
                .bind(event.data(5).unwrap_or(""))
                .execute(&mut *conn)
                .await?;
        }
        EventType::SetDropTable => {
            let query = format!("DELETE FROM {schema}.sl_table WHERE tab_id = $1");
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::SetAddSequence => {
            let query = format!(
                "INSERT INTO {schema}.sl_sequence (seq_id, seq_relname, seq_set, seq_comment) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (seq_id) DO UPDATE \
                 SET seq_relname = EXCLUDED.seq_relname, seq_set = EXCLUDED.seq_set, \
                     seq_comment = EXCLUDED.seq_comment"
            );
            sqlx::query(&query)
                .bind(event.data_i32(2)?)
                .bind(event.require_data(3)?)
                .bind(event.data_i32(1)?)
                .bind(event.data(4).unwrap_or(""))
                .execute(&mut *conn)
                .await?;
        }
        EventType::SetDropSequence => {
            let query = format!("DELETE FROM {schema}.sl_sequence WHERE seq_id = $1");
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::SubscribeSet => {
            let query = format!(
                "INSERT INTO {schema}.sl_subscribe \
                 (sub_set, sub_provider, sub_receiver, sub_forward, sub_active) \
                 VALUES ($1, $2, $3, $4, false) \
                 ON CONFLICT (sub_set, sub_receiver) DO UPDATE \
                 SET sub_provider = EXCLUDED.sub_provider, sub_forward = EXCLUDED.sub_forward"
            );
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data_i32(2)?)
                .bind(event.data_i32(3)?)
                .bind(event.data(4) == Some("t"))
                .execute(&mut *conn)
                .await?;
        }
        EventType::EnableSubscription => {
            let query = format!(
                "UPDATE {schema}.sl_subscribe SET sub_active = true \
                 WHERE sub_set = $1 AND sub_receiver = $2"
            );
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data_i32(3)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::UnsubscribeSet => {
            let query = format!(
                "DELETE FROM {schema}.sl_subscribe WHERE sub_set = $1 AND sub_receiver = $2"
            );
            sqlx::query(&query)
                .bind(event.data_i32(1)?)
                .bind(event.data_i32(2)?)
                .execute(&mut *conn)
                .await?;
        }
        EventType::DdlScript => {
            // data1 = set, data2 = script, data3 = only-on node (-1 = all)
            let only_on = event.data_i32(3).unwrap_or(-1);
            if only_on == -1 || only_on == local.as_i32() {
                let script = event.require_data(2)?;
                info!(origin = %event.ev_origin, seqno = %event.ev_seqno, "Executing DDL script");
                conn.execute(script).await?;
            }
        }
        EventType::SwitchLog => {
            // Partition rotation is origin-local; receivers only forward it
            debug!(origin = %event.ev_origin, "SWITCH_LOG passed through");
        }
        EventType::Sync => {
            // SYNC never reaches the admin path
            return Err(DaemonError::ProtocolViolation {
                node: event.ev_origin,
                detail: "SYNC routed to administrative apply".to_string(),
            });
        }
    }
    Ok(())
}
