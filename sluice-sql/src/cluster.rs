//! Cluster naming conventions.
//!
//! A cluster named `payroll` keeps all replication state in the schema
//! `_payroll` and announces new events on the notification channel
//! `payroll_Event`.

use crate::quote::quote_ident;

/// The quoted schema identifier holding a cluster's replication state.
pub fn cluster_schema(cluster: &str) -> String {
    quote_ident(&format!("_{cluster}"))
}

/// The LISTEN/NOTIFY channel announcing new events for a cluster.
pub fn event_channel(cluster: &str) -> String {
    format!("{cluster}_Event")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_plain() {
        assert_eq!(cluster_schema("payroll"), "_payroll");
    }

    #[test]
    fn test_schema_needs_quoting() {
        assert_eq!(cluster_schema("Payroll"), "\"_Payroll\"");
        assert_eq!(cluster_schema("my cluster"), "\"_my cluster\"");
    }

    #[test]
    fn test_event_channel() {
        assert_eq!(event_channel("payroll"), "payroll_Event");
    }
}
