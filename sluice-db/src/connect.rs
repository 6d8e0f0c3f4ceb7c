//! Connection helpers.

use crate::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, PgPool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// How a pool to one node is opened.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// libpq-style conninfo / URL for the node
    pub conninfo: String,
    /// Statement run on every fresh connection before use
    pub sql_on_connection: Option<String>,
    /// Maximum pooled connections to this node
    pub max_connections: u32,
}

impl ConnectOptions {
    /// Defaults for a node conninfo.
    pub fn new(conninfo: impl Into<String>) -> Self {
        Self {
            conninfo: conninfo.into(),
            sql_on_connection: None,
            max_connections: 4,
        }
    }

    /// Set the statement run on every fresh connection.
    pub fn with_sql_on_connection(mut self, sql: Option<String>) -> Self {
        self.sql_on_connection = sql;
        self
    }
}

/// Open a connection pool to one node.
///
/// The pool is lazy: no connection is made until first use, so an
/// unreachable peer surfaces as a recoverable error in the worker loop
/// rather than at configuration time.
pub fn connect_node(options: &ConnectOptions) -> Result<PgPool> {
    let connect = PgConnectOptions::from_str(&options.conninfo)?
        .application_name("sluiced");

    let mut pool = PgPoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(Duration::from_secs(30));

    if let Some(sql) = options.sql_on_connection.clone() {
        pool = pool.after_connect(move |conn, _meta| {
            let sql = sql.clone();
            Box::pin(async move {
                debug!("Running on-connect SQL");
                if let Err(e) = conn.execute(sql.as_str()).await {
                    warn!(error = %e, "On-connect SQL failed");
                }
                Ok(())
            })
        });
    }

    Ok(pool.connect_lazy_with(connect))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_connect_accepts_unreachable_host() {
        let options = ConnectOptions::new("postgres://user@host.invalid:5432/db");
        // No I/O happens until first acquire
        assert!(connect_node(&options).is_ok());
    }

    #[test]
    fn test_bad_conninfo_rejected() {
        let options = ConnectOptions::new("not a conninfo ::: ");
        assert!(connect_node(&options).is_err());
    }
}
