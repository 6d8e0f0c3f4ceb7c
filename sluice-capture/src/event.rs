//! The event builder.
//!
//! Events are assigned their per-origin sequence number under an exclusive
//! lock on `sl_event`, so assignment order equals commit order equals the
//! order receivers apply them in. SYNC and ENABLE_SUBSCRIPTION events also
//! snapshot the current value of every replicated sequence originating on
//! this node into `sl_seqlog`.

use crate::Result;
use sluice_domain::{EventSeq, EventType, NodeId};
use sluice_sql::{cluster_schema, event_channel, quote_ident};
use sqlx::PgConnection;
use tracing::debug;

/// The eight optional text arguments of an event.
#[derive(Debug, Clone, Default)]
pub struct EventArgs {
    data: [Option<String>; 8],
}

impl EventArgs {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set argument slot `n` (1-based, matching `ev_data1..8`).
    ///
    /// Slots outside 1..=8 are ignored.
    pub fn arg(mut self, n: usize, value: impl Into<String>) -> Self {
        if (1..=8).contains(&n) {
            self.data[n - 1] = Some(value.into());
        }
        self
    }

    /// Argument slot `n`.
    pub fn get(&self, n: usize) -> Option<&str> {
        self.data.get(n.wrapping_sub(1)).and_then(|s| s.as_deref())
    }
}

/// Insert a new event and return its assigned sequence number.
///
/// Must run inside an open transaction: the exclusive lock taken here is
/// what serializes sequence assignment with commit order, and it has to be
/// held until the caller commits.
pub async fn create_event(
    conn: &mut PgConnection,
    cluster: &str,
    origin: NodeId,
    ev_type: EventType,
    args: &EventArgs,
) -> Result<EventSeq> {
    let schema = cluster_schema(cluster);

    sqlx::query(&format!("LOCK TABLE {schema}.sl_event IN EXCLUSIVE MODE"))
        .execute(&mut *conn)
        .await?;

    sqlx::query(&format!("NOTIFY {}", quote_ident(&event_channel(cluster))))
        .execute(&mut *conn)
        .await?;

    // The snapshot travels with the event so receivers can reconstruct
    // which transactions it covers.
    let snapshot_text: String = sqlx::query_scalar("SELECT txid_current_snapshot()::text")
        .fetch_one(&mut *conn)
        .await?;
    let snapshot: sluice_domain::TxSnapshot = snapshot_text.parse()?;

    let insert = format!(
        "INSERT INTO {schema}.sl_event \
         (ev_origin, ev_seqno, ev_timestamp, ev_minxid, ev_maxxid, ev_xip, \
          ev_type, ev_data1, ev_data2, ev_data3, ev_data4, \
          ev_data5, ev_data6, ev_data7, ev_data8) \
         VALUES ($1, nextval('{schema}.sl_event_seq'), now(), $2, $3, $4, \
                 $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING ev_seqno",
    );
    let seqno: i64 = sqlx::query_scalar(&insert)
        .bind(origin)
        .bind(snapshot.xmin)
        .bind(snapshot.xmax)
        .bind(snapshot.xip_list())
        .bind(ev_type.as_str())
        .bind(args.get(1))
        .bind(args.get(2))
        .bind(args.get(3))
        .bind(args.get(4))
        .bind(args.get(5))
        .bind(args.get(6))
        .bind(args.get(7))
        .bind(args.get(8))
        .fetch_one(&mut *conn)
        .await?;

    if ev_type.records_sequences() {
        let record = format!(
            "INSERT INTO {schema}.sl_seqlog \
             (seql_seqid, seql_origin, seql_ev_seqno, seql_last_value) \
             SELECT seq_id, $1, currval('{schema}.sl_event_seq'), \
                    coalesce(seq_last_value, 0) \
             FROM {schema}.sl_seqlastvalue \
             WHERE seq_origin = $1",
        );
        sqlx::query(&record).bind(origin).execute(&mut *conn).await?;
    }

    debug!(
        origin = %origin,
        seqno,
        ev_type = %ev_type,
        "Created event"
    );

    Ok(EventSeq(seqno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_slots() {
        let args = EventArgs::new().arg(1, "17").arg(3, "t").arg(8, "last");
        assert_eq!(args.get(1), Some("17"));
        assert_eq!(args.get(2), None);
        assert_eq!(args.get(3), Some("t"));
        assert_eq!(args.get(8), Some("last"));
    }

    #[test]
    fn test_args_out_of_range_ignored() {
        let args = EventArgs::new().arg(0, "x").arg(9, "y");
        for n in 0..=9 {
            assert_eq!(args.get(n), None);
        }
    }
}
