//! Sluice Capture Plane
//!
//! Produces the totally ordered row-change log and the event stream on an
//! origin node. The per-connection [`CaptureSession`] replaces the
//! original engine's per-backend trigger state: it renders row changes
//! into SQL fragments, appends them to the active log partition, refuses
//! application writes on subscriber tables, and builds administrative and
//! SYNC events with their transaction snapshots.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sluice_capture::{CaptureSession, ReplicatedTable, RowImage, SessionRole};
//! use sluice_domain::{AttKind, NodeId, TableId};
//!
//! # async fn example(conn: &mut sqlx::PgConnection) -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = CaptureSession::new("payroll", NodeId::new(1)?, SessionRole::Normal);
//! let table = ReplicatedTable {
//!     id: TableId(1),
//!     name: "public.accounts".to_string(),
//!     attkind: AttKind::new("kv")?,
//! };
//! let mut row = RowImage::new();
//! row.push("id", Some("1"));
//! row.push("balance", Some("100.00"));
//! session.log_insert(conn, &table, &row).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod helpers;
pub mod render;
pub mod session;

pub use error::CaptureError;
pub use event::{create_event, EventArgs};
pub use helpers::kill_backend;
pub use render::{render_delete, render_insert, render_update, RowImage};
pub use session::{CaptureSession, ReplicatedTable, SessionRole};

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
