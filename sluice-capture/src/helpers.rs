//! Privileged operator helpers.

use crate::error::CaptureError;
use crate::Result;
use sqlx::PgConnection;
use tracing::info;

/// Signal a backend by pid.
///
/// `signame` must be exactly `"NULL"` (liveness probe: succeeds iff the
/// backend exists) or `"TERM"` (terminate the backend). Requires superuser.
///
/// Returns 0 on success, -1 when the backend does not exist or could not
/// be signalled.
pub async fn kill_backend(conn: &mut PgConnection, pid: i32, signame: &str) -> Result<i32> {
    let is_superuser: bool =
        sqlx::query_scalar("SELECT rolsuper FROM pg_roles WHERE rolname = current_user")
            .fetch_one(&mut *conn)
            .await?;
    if !is_superuser {
        return Err(CaptureError::InsufficientPrivilege("kill_backend"));
    }

    match signame {
        "NULL" => {
            let exists: bool =
                sqlx::query_scalar("SELECT count(*) > 0 FROM pg_stat_activity WHERE pid = $1")
                    .bind(pid)
                    .fetch_one(&mut *conn)
                    .await?;
            Ok(if exists { 0 } else { -1 })
        }
        "TERM" => {
            let terminated: bool = sqlx::query_scalar("SELECT pg_terminate_backend($1)")
                .bind(pid)
                .fetch_one(&mut *conn)
                .await?;
            info!(pid, terminated, "Terminated backend");
            Ok(if terminated { 0 } else { -1 })
        }
        other => Err(CaptureError::UnsupportedSignal(other.to_string())),
    }
}
