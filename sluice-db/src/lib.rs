//! Cluster schema lifecycle for sluice.
//!
//! Installs the in-database replication schema (`"_<cluster>"`), performs
//! the version handshake every connection goes through, and provides the
//! connection helpers the daemon uses.

pub mod connect;
pub mod schema;

pub use connect::{connect_node, ConnectOptions};
pub use schema::{install_schema, uninstall_schema};

use sluice_domain::NodeId;
use sluice_sql::cluster_schema;
use sqlx::PgConnection;
use thiserror::Error;
use tracing::error;

/// The schema version this build speaks. Stored in `sl_version` at install
/// time and checked at connect time; layout changes bump it.
pub const SCHEMA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised by schema lifecycle operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The node has no cluster schema or no node id assigned
    #[error("Node is not initialized for cluster {0}")]
    NodeNotInitialized(String),

    /// Peer speaks a different schema version
    #[error("Schema version is {found}, this daemon requires {expected}")]
    VersionMismatch { found: String, expected: String },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for DB operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Does this error mean the cluster schema simply is not there?
fn schema_missing(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::RowNotFound => true,
        // undefined_table
        sqlx::Error::Database(db) => db.code().as_deref() == Some("42P01"),
        _ => false,
    }
}

/// Read the local node id of a cluster database.
///
/// # Errors
/// `NodeNotInitialized` when the id sequence is absent or unset.
pub async fn get_local_node_id(conn: &mut PgConnection, cluster: &str) -> Result<NodeId> {
    let schema = cluster_schema(cluster);
    let query = format!("SELECT last_value::int4 FROM {schema}.sl_local_node_id");
    let id: i32 = sqlx::query_scalar(&query)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if schema_missing(&e) {
                DbError::NodeNotInitialized(cluster.to_string())
            } else {
                DbError::Database(e)
            }
        })?;
    NodeId::new(id).map_err(|_| DbError::NodeNotInitialized(cluster.to_string()))
}

/// Validate the schema version handshake against this build.
///
/// Receivers older than an emitter must keep parsing what they were
/// promised, so a mismatch refuses the connection outright.
pub async fn check_schema_version(conn: &mut PgConnection, cluster: &str) -> Result<()> {
    let schema = cluster_schema(cluster);
    let query = format!("SELECT ver_schema FROM {schema}.sl_version");
    let found: String = sqlx::query_scalar(&query)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| {
            if schema_missing(&e) {
                DbError::NodeNotInitialized(cluster.to_string())
            } else {
                DbError::Database(e)
            }
        })?;
    if found != SCHEMA_VERSION {
        error!(found, expected = SCHEMA_VERSION, "Schema version mismatch");
        return Err(DbError::VersionMismatch {
            found,
            expected: SCHEMA_VERSION.to_string(),
        });
    }
    Ok(())
}
