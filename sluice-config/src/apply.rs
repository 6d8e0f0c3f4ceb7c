//! Applying administrative events to the in-memory configuration.
//!
//! Both the local listener and the remote workers funnel configuration
//! events through here. Events that concern other receivers are accepted
//! and ignored; the caller decides what to do with the reported effect.

use crate::error::ConfigError;
use crate::runtime::RuntimeConfig;
use sluice_domain::{DomainError, Event, EventType, NodeId, SetId};
use tracing::warn;

/// What an applied event changed, as far as the daemon needs to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEffect {
    /// Nothing this node cares about
    None,
    /// Topology changed; the worker set should be reconciled
    Topology,
    /// A local subscription became active
    SubscriptionEnabled(SetId),
}

/// Errors from event application.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),
}

/// Apply one administrative event to the in-memory configuration.
///
/// SYNC events are not configuration and are rejected by debug assertion;
/// the caller routes them to the data path.
pub fn apply_config_event(cfg: &RuntimeConfig, event: &Event) -> Result<ConfigEffect, ApplyError> {
    let ev_type = event.event_type()?;
    debug_assert!(ev_type.is_admin(), "SYNC routed to config apply");
    let local = cfg.local_node();

    let effect = match ev_type {
        EventType::StoreNode => {
            let id = node_id(event.data_i32(1)?)?;
            if id != local {
                cfg.store_node(id, false, event.data(2).unwrap_or(""))?;
            }
            ConfigEffect::Topology
        }
        EventType::EnableNode => {
            let id = node_id(event.data_i32(1)?)?;
            if id != local {
                cfg.enable_node(id)?;
            }
            ConfigEffect::Topology
        }
        EventType::DropNode => {
            let id = node_id(event.data_i32(1)?)?;
            if id == local {
                warn!(node = %id, "This node was dropped from the cluster");
                ConfigEffect::None
            } else {
                cfg.drop_node(id)?;
                ConfigEffect::Topology
            }
        }
        EventType::StorePath => {
            let server = node_id(event.data_i32(1)?)?;
            let client = node_id(event.data_i32(2)?)?;
            if client == local {
                let conninfo = event.require_data(3)?;
                let retry = event.data_i32(4).unwrap_or(10).max(0) as u32;
                cfg.store_path(server, conninfo, retry);
                ConfigEffect::Topology
            } else {
                ConfigEffect::None
            }
        }
        EventType::DropPath => {
            let server = node_id(event.data_i32(1)?)?;
            let client = node_id(event.data_i32(2)?)?;
            if client == local {
                cfg.drop_path(server);
                ConfigEffect::Topology
            } else {
                ConfigEffect::None
            }
        }
        EventType::StoreListen => {
            let origin = node_id(event.data_i32(1)?)?;
            let provider = node_id(event.data_i32(2)?)?;
            let receiver = node_id(event.data_i32(3)?)?;
            if receiver == local {
                cfg.store_listen(origin, provider);
                ConfigEffect::Topology
            } else {
                ConfigEffect::None
            }
        }
        EventType::DropListen => {
            let origin = node_id(event.data_i32(1)?)?;
            let provider = node_id(event.data_i32(2)?)?;
            let receiver = node_id(event.data_i32(3)?)?;
            if receiver == local {
                cfg.drop_listen(origin, provider);
                ConfigEffect::Topology
            } else {
                ConfigEffect::None
            }
        }
        EventType::StoreSet => {
            let set = SetId(event.data_i32(1)?);
            cfg.store_set(set, event.ev_origin, event.data(2).unwrap_or(""));
            ConfigEffect::None
        }
        EventType::DropSet => {
            cfg.drop_set(SetId(event.data_i32(1)?));
            ConfigEffect::Topology
        }
        EventType::MergeSet => {
            let into = SetId(event.data_i32(1)?);
            let from = SetId(event.data_i32(2)?);
            cfg.merge_set(into, from)?;
            ConfigEffect::None
        }
        EventType::MoveSet | EventType::FailoverSet => {
            let set = SetId(event.data_i32(1)?);
            let new_origin = node_id(event.data_i32(2)?)?;
            cfg.move_set(set, new_origin)?;
            ConfigEffect::Topology
        }
        EventType::SubscribeSet => {
            let set = SetId(event.data_i32(1)?);
            let provider = node_id(event.data_i32(2)?)?;
            let receiver = node_id(event.data_i32(3)?)?;
            if receiver == local {
                let forward = event.data(4) == Some("t");
                cfg.store_subscribe(set, provider, forward);
                ConfigEffect::Topology
            } else {
                ConfigEffect::None
            }
        }
        EventType::EnableSubscription => {
            let set = SetId(event.data_i32(1)?);
            let receiver = node_id(event.data_i32(3)?)?;
            if receiver == local {
                cfg.enable_subscription(set)?;
                ConfigEffect::SubscriptionEnabled(set)
            } else {
                ConfigEffect::None
            }
        }
        EventType::UnsubscribeSet => {
            let set = SetId(event.data_i32(1)?);
            let receiver = node_id(event.data_i32(2)?)?;
            if receiver == local {
                cfg.unsubscribe_set(set);
                ConfigEffect::Topology
            } else {
                ConfigEffect::None
            }
        }
        // Table/sequence membership and DDL live in the database tables;
        // the in-memory mirror only tracks topology
        EventType::SetAddTable
        | EventType::SetDropTable
        | EventType::SetAddSequence
        | EventType::SetDropSequence
        | EventType::DdlScript
        | EventType::SwitchLog => ConfigEffect::None,
        EventType::Sync => ConfigEffect::None,
    };
    Ok(effect)
}

fn node_id(raw: i32) -> Result<NodeId, ApplyError> {
    Ok(NodeId::new(raw)?)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sluice_domain::{EventSeq, Xxid};

    fn node(n: i32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn event(origin: i32, ty: &str, data: &[&str]) -> Event {
        let slot = |n: usize| data.get(n).map(|s| s.to_string());
        Event {
            ev_origin: node(origin),
            ev_seqno: EventSeq(1),
            ev_timestamp: Utc::now(),
            ev_minxid: Xxid(1),
            ev_maxxid: Xxid(1),
            ev_xip: String::new(),
            ev_type: ty.to_string(),
            ev_data1: slot(0),
            ev_data2: slot(1),
            ev_data3: slot(2),
            ev_data4: slot(3),
            ev_data5: slot(4),
            ev_data6: slot(5),
            ev_data7: slot(6),
            ev_data8: slot(7),
        }
    }

    #[test]
    fn test_store_and_enable_node() {
        let cfg = RuntimeConfig::new("payroll", node(1));
        let effect =
            apply_config_event(&cfg, &event(2, "STORE_NODE", &["2", "second node"])).unwrap();
        assert_eq!(effect, ConfigEffect::Topology);
        assert!(!cfg.node(node(2)).unwrap().active);

        apply_config_event(&cfg, &event(2, "ENABLE_NODE", &["2"])).unwrap();
        assert!(cfg.node(node(2)).unwrap().active);
    }

    #[test]
    fn test_path_for_other_client_ignored() {
        let cfg = RuntimeConfig::new("payroll", node(1));
        let effect = apply_config_event(
            &cfg,
            &event(2, "STORE_PATH", &["3", "2", "host=three", "10"]),
        )
        .unwrap();
        assert_eq!(effect, ConfigEffect::None);
        assert!(cfg.path(node(3)).is_none());
    }

    #[test]
    fn test_path_for_local_client_stored() {
        let cfg = RuntimeConfig::new("payroll", node(1));
        apply_config_event(
            &cfg,
            &event(2, "STORE_PATH", &["3", "1", "host=three", "15"]),
        )
        .unwrap();
        let path = cfg.path(node(3)).unwrap();
        assert_eq!(path.conninfo, "host=three");
        assert_eq!(path.connretry, 15);
    }

    #[test]
    fn test_subscription_lifecycle() {
        let cfg = RuntimeConfig::new("payroll", node(1));
        cfg.store_node(node(2), true, "").unwrap();
        cfg.store_set(SetId(1), node(2), "");

        apply_config_event(&cfg, &event(2, "SUBSCRIBE_SET", &["1", "2", "1", "t"])).unwrap();
        let sub = cfg.subscription(SetId(1)).unwrap();
        assert!(sub.forward);
        assert!(!sub.active);

        let effect =
            apply_config_event(&cfg, &event(2, "ENABLE_SUBSCRIPTION", &["1", "2", "1"])).unwrap();
        assert_eq!(effect, ConfigEffect::SubscriptionEnabled(SetId(1)));
        assert!(cfg.subscription(SetId(1)).unwrap().active);
    }

    #[test]
    fn test_subscription_for_other_receiver_ignored() {
        let cfg = RuntimeConfig::new("payroll", node(1));
        apply_config_event(&cfg, &event(2, "SUBSCRIBE_SET", &["1", "2", "3", "f"])).unwrap();
        assert!(cfg.subscription(SetId(1)).is_none());
    }

    #[test]
    fn test_move_set_changes_origin() {
        let cfg = RuntimeConfig::new("payroll", node(1));
        cfg.store_set(SetId(1), node(2), "");
        apply_config_event(&cfg, &event(2, "MOVE_SET", &["1", "3"])).unwrap();
        assert_eq!(cfg.set(SetId(1)).unwrap().origin, node(3));
    }

    #[test]
    fn test_unknown_event_type_is_error() {
        let cfg = RuntimeConfig::new("payroll", node(1));
        assert!(apply_config_event(&cfg, &event(2, "NOT_AN_EVENT", &[])).is_err());
    }
}
