//! Per-connection capture state.
//!
//! One [`CaptureSession`] exists per database connection doing captured
//! work. It decides once per transaction which log partition is active and
//! announces the transaction on the cluster's event channel, then appends
//! one log row per row change. It also enforces the session role: normal
//! sessions may not write replicated tables on a subscriber, replication
//! sessions may not feed the capture log.

use crate::error::CaptureError;
use crate::render::{render_delete, render_insert, render_update, RowImage};
use crate::Result;
use sluice_domain::{AttKind, CmdType, NodeId, TableId, Xxid};
use sluice_sql::{cluster_schema, event_channel, quote_ident};
use sqlx::PgConnection;
use tracing::debug;

// =============================================================================
// SessionRole
// =============================================================================

/// Who is driving this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// An application client; writes are captured, subscriber tables are
    /// read-only
    Normal,
    /// The replication daemon applying remote changes; capture is
    /// suppressed, subscriber tables are writable
    Replication,
}

// =============================================================================
// ReplicatedTable
// =============================================================================

/// The capture parameters of one replicated table.
#[derive(Debug, Clone)]
pub struct ReplicatedTable {
    /// Table id from `sl_table`
    pub id: TableId,
    /// Schema-qualified relation name
    pub name: String,
    /// Column kinds from `sl_table.tab_attkind`
    pub attkind: AttKind,
}

// =============================================================================
// CaptureSession
// =============================================================================

/// Per-transaction scratch state.
#[derive(Debug, Clone, Copy)]
struct TxScope {
    xid: Xxid,
    active_partition: i32,
}

/// Per-connection capture state container.
#[derive(Debug)]
pub struct CaptureSession {
    schema: String,
    channel: String,
    local_node: NodeId,
    role: SessionRole,
    tx: Option<TxScope>,
}

impl CaptureSession {
    /// Create a session for `cluster` on the node identified by
    /// `local_node`.
    pub fn new(cluster: &str, local_node: NodeId, role: SessionRole) -> Self {
        Self {
            schema: cluster_schema(cluster),
            channel: event_channel(cluster),
            local_node,
            role,
            tx: None,
        }
    }

    /// The session role this connection was opened with.
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Refuse application writes to a replicated table on a subscriber.
    ///
    /// Pure refusal: the session state is never mutated on the error path.
    ///
    /// # Errors
    /// `SubscriberWriteDenied` unless this is a replication session.
    pub fn deny_access(&self, table: &str) -> Result<()> {
        match self.role {
            SessionRole::Replication => Ok(()),
            SessionRole::Normal => Err(CaptureError::SubscriberWriteDenied {
                table: table.to_string(),
            }),
        }
    }

    /// Capture an INSERT.
    pub async fn log_insert(
        &mut self,
        conn: &mut PgConnection,
        table: &ReplicatedTable,
        new: &RowImage,
    ) -> Result<()> {
        self.check_capture_allowed()?;
        let cmddata = render_insert(new);
        self.append_log_row(conn, table.id, CmdType::Insert, &cmddata)
            .await
    }

    /// Capture an UPDATE.
    pub async fn log_update(
        &mut self,
        conn: &mut PgConnection,
        table: &ReplicatedTable,
        old: &RowImage,
        new: &RowImage,
    ) -> Result<()> {
        self.check_capture_allowed()?;
        let cmddata = render_update(&table.name, &table.attkind, old, new)?;
        self.append_log_row(conn, table.id, CmdType::Update, &cmddata)
            .await
    }

    /// Capture a DELETE.
    pub async fn log_delete(
        &mut self,
        conn: &mut PgConnection,
        table: &ReplicatedTable,
        old: &RowImage,
    ) -> Result<()> {
        self.check_capture_allowed()?;
        let cmddata = render_delete(&table.name, &table.attkind, old)?;
        self.append_log_row(conn, table.id, CmdType::Delete, &cmddata)
            .await
    }

    /// A replication session feeding the capture log would loop changes
    /// back to their origin.
    fn check_capture_allowed(&self) -> Result<()> {
        match self.role {
            SessionRole::Normal => Ok(()),
            SessionRole::Replication => Err(CaptureError::CaptureInReplicationSession),
        }
    }

    /// Once per transaction: announce on the event channel and pin the
    /// active log partition. SWITCH_LOG only takes effect between
    /// transactions.
    async fn tx_scope(&mut self, conn: &mut PgConnection) -> Result<TxScope> {
        let xid: i64 = sqlx::query_scalar("SELECT txid_current()")
            .fetch_one(&mut *conn)
            .await?;
        let xid = Xxid(xid);

        if let Some(scope) = self.tx {
            if scope.xid == xid {
                return Ok(scope);
            }
        }

        sqlx::query(&format!("NOTIFY {}", quote_ident(&self.channel)))
            .execute(&mut *conn)
            .await?;

        let active: i32 =
            sqlx::query_scalar(&format!("SELECT ls_active FROM {}.sl_log_status", self.schema))
                .fetch_one(&mut *conn)
                .await?;

        let scope = TxScope {
            xid,
            active_partition: active,
        };
        self.tx = Some(scope);
        Ok(scope)
    }

    async fn append_log_row(
        &mut self,
        conn: &mut PgConnection,
        table_id: TableId,
        cmdtype: CmdType,
        cmddata: &str,
    ) -> Result<()> {
        let scope = self.tx_scope(conn).await?;
        let log_table = if scope.active_partition == 0 {
            "sl_log_1"
        } else {
            "sl_log_2"
        };

        let query = format!(
            "INSERT INTO {schema}.{log} \
             (log_origin, log_xid, log_tableid, log_actionseq, log_cmdtype, log_cmddata) \
             VALUES ($1, $2, $3, nextval('{schema}.sl_action_seq'), $4, $5)",
            schema = self.schema,
            log = log_table,
        );
        sqlx::query(&query)
            .bind(self.local_node)
            .bind(scope.xid)
            .bind(table_id)
            .bind(cmdtype.as_str())
            .bind(cmddata)
            .execute(&mut *conn)
            .await?;

        debug!(
            table_id = %table_id,
            xid = %scope.xid,
            cmdtype = %cmdtype,
            partition = log_table,
            "Captured row change"
        );

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn session(role: SessionRole) -> CaptureSession {
        CaptureSession::new("payroll", NodeId::new(1).unwrap(), role)
    }

    #[test]
    fn test_deny_access_refuses_normal_sessions() {
        let err = session(SessionRole::Normal)
            .deny_access("accounts")
            .unwrap_err();
        assert!(matches!(
            err,
            CaptureError::SubscriberWriteDenied { table } if table == "accounts"
        ));
    }

    #[test]
    fn test_deny_access_passes_replication_sessions() {
        assert!(session(SessionRole::Replication).deny_access("accounts").is_ok());
    }

    #[test]
    fn test_capture_refused_in_replication_session() {
        let err = session(SessionRole::Replication)
            .check_capture_allowed()
            .unwrap_err();
        assert!(matches!(err, CaptureError::CaptureInReplicationSession));
    }

    #[test]
    fn test_schema_and_channel_derivation() {
        let s = session(SessionRole::Normal);
        assert_eq!(s.schema, "_payroll");
        assert_eq!(s.channel, "payroll_Event");
    }
}
