//! Sluice Runtime Configuration
//!
//! The in-memory mirror of the cluster topology tables: nodes, paths,
//! sets, subscriptions, and listen entries. All mutation goes through
//! [`RuntimeConfig`] under a single coarse-grained lock; remote workers
//! re-read it at the top of every loop iteration and re-resolve their
//! records across reconfiguration.
//!
//! The [`WorkerRegistry`] owns the running remote-worker tasks so shutdown
//! can cancel and join them in order.

pub mod apply;
pub mod error;
pub mod records;
pub mod runtime;
pub mod workers;

pub use apply::{apply_config_event, ApplyError, ConfigEffect};
pub use error::ConfigError;
pub use records::{ListenRecord, NodeRecord, PathRecord, SetRecord, SubscriptionRecord};
pub use runtime::RuntimeConfig;
pub use workers::{WorkerHandle, WorkerRegistry};
