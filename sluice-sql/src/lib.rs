//! SQL text utilities.
//!
//! The capture plane and the daemon both assemble SQL statements as text:
//! captured row changes are stored as rendered SQL fragments, and most of
//! the daemon's queries interpolate the cluster schema name and small
//! integer ids. This crate provides the quoting rules and a small builder
//! for doing that safely.

pub mod cluster;
pub mod quote;

mod builder;

pub use builder::QueryBuilder;
pub use cluster::{cluster_schema, event_channel};
pub use quote::{quote_ident, quote_literal};
