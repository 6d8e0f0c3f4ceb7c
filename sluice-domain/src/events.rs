//! Event and log-row records.
//!
//! Events are the per-origin, strictly ordered administrative and SYNC
//! records in `sl_event`; log rows are the row-level changes captured into
//! the rotating `sl_log_1`/`sl_log_2` partitions.

use crate::error::DomainError;
use crate::ids::{EventSeq, NodeId, TableId, Xxid};
use crate::snapshot::TxSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// EventType
// =============================================================================

/// Every event type the engine produces or consumes.
///
/// Administrative events mutate the cluster topology and are applied one at
/// a time in seqno order; SYNC events demarcate log batches and may be
/// grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    StoreNode,
    EnableNode,
    DropNode,
    StorePath,
    DropPath,
    StoreListen,
    DropListen,
    StoreSet,
    DropSet,
    MergeSet,
    MoveSet,
    FailoverSet,
    SetAddTable,
    SetDropTable,
    SetAddSequence,
    SetDropSequence,
    SubscribeSet,
    EnableSubscription,
    UnsubscribeSet,
    DdlScript,
    Sync,
    SwitchLog,
}

impl EventType {
    /// The wire name stored in `sl_event.ev_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StoreNode => "STORE_NODE",
            EventType::EnableNode => "ENABLE_NODE",
            EventType::DropNode => "DROP_NODE",
            EventType::StorePath => "STORE_PATH",
            EventType::DropPath => "DROP_PATH",
            EventType::StoreListen => "STORE_LISTEN",
            EventType::DropListen => "DROP_LISTEN",
            EventType::StoreSet => "STORE_SET",
            EventType::DropSet => "DROP_SET",
            EventType::MergeSet => "MERGE_SET",
            EventType::MoveSet => "MOVE_SET",
            EventType::FailoverSet => "FAILOVER_SET",
            EventType::SetAddTable => "SET_ADD_TABLE",
            EventType::SetDropTable => "SET_DROP_TABLE",
            EventType::SetAddSequence => "SET_ADD_SEQUENCE",
            EventType::SetDropSequence => "SET_DROP_SEQUENCE",
            EventType::SubscribeSet => "SUBSCRIBE_SET",
            EventType::EnableSubscription => "ENABLE_SUBSCRIPTION",
            EventType::UnsubscribeSet => "UNSUBSCRIBE_SET",
            EventType::DdlScript => "DDL_SCRIPT",
            EventType::Sync => "SYNC",
            EventType::SwitchLog => "SWITCH_LOG",
        }
    }

    /// SYNC and ENABLE_SUBSCRIPTION snapshot replicated sequence values at
    /// creation time.
    pub fn records_sequences(&self) -> bool {
        matches!(self, EventType::Sync | EventType::EnableSubscription)
    }

    /// Administrative events are everything that is not a SYNC.
    pub fn is_admin(&self) -> bool {
        !matches!(self, EventType::Sync)
    }
}

impl FromStr for EventType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "STORE_NODE" => EventType::StoreNode,
            "ENABLE_NODE" => EventType::EnableNode,
            "DROP_NODE" => EventType::DropNode,
            "STORE_PATH" => EventType::StorePath,
            "DROP_PATH" => EventType::DropPath,
            "STORE_LISTEN" => EventType::StoreListen,
            "DROP_LISTEN" => EventType::DropListen,
            "STORE_SET" => EventType::StoreSet,
            "DROP_SET" => EventType::DropSet,
            "MERGE_SET" => EventType::MergeSet,
            "MOVE_SET" => EventType::MoveSet,
            "FAILOVER_SET" => EventType::FailoverSet,
            "SET_ADD_TABLE" => EventType::SetAddTable,
            "SET_DROP_TABLE" => EventType::SetDropTable,
            "SET_ADD_SEQUENCE" => EventType::SetAddSequence,
            "SET_DROP_SEQUENCE" => EventType::SetDropSequence,
            "SUBSCRIBE_SET" => EventType::SubscribeSet,
            "ENABLE_SUBSCRIPTION" => EventType::EnableSubscription,
            "UNSUBSCRIBE_SET" => EventType::UnsubscribeSet,
            "DDL_SCRIPT" => EventType::DdlScript,
            "SYNC" => EventType::Sync,
            "SWITCH_LOG" => EventType::SwitchLog,
            other => return Err(DomainError::UnknownEventType(other.to_string())),
        })
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Event
// =============================================================================

/// One row of `sl_event`.
#[derive(Debug, Clone, FromRow)]
pub struct Event {
    /// Node the event was created on
    pub ev_origin: NodeId,
    /// Per-origin sequence number
    pub ev_seqno: EventSeq,
    /// Creation time on the origin
    pub ev_timestamp: DateTime<Utc>,
    /// Snapshot lower bound at creation
    pub ev_minxid: Xxid,
    /// Snapshot upper bound at creation
    pub ev_maxxid: Xxid,
    /// In-progress transactions at creation, quoted comma list
    pub ev_xip: String,
    /// Wire name of the event type
    pub ev_type: String,
    pub ev_data1: Option<String>,
    pub ev_data2: Option<String>,
    pub ev_data3: Option<String>,
    pub ev_data4: Option<String>,
    pub ev_data5: Option<String>,
    pub ev_data6: Option<String>,
    pub ev_data7: Option<String>,
    pub ev_data8: Option<String>,
}

impl Event {
    /// The typed event type.
    ///
    /// # Errors
    /// `DomainError::UnknownEventType` for a type this build does not know;
    /// the caller treats that as a protocol violation.
    pub fn event_type(&self) -> Result<EventType, DomainError> {
        self.ev_type.parse()
    }

    /// The transaction snapshot taken when this event was created.
    pub fn snapshot(&self) -> Result<TxSnapshot, DomainError> {
        let xip = TxSnapshot::parse_xip_list(&self.ev_xip)?;
        Ok(TxSnapshot::new(self.ev_minxid, self.ev_maxxid, xip))
    }

    /// Event data slot `n` (1-based, matching `ev_data1..8`).
    pub fn data(&self, n: usize) -> Option<&str> {
        let slot = match n {
            1 => &self.ev_data1,
            2 => &self.ev_data2,
            3 => &self.ev_data3,
            4 => &self.ev_data4,
            5 => &self.ev_data5,
            6 => &self.ev_data6,
            7 => &self.ev_data7,
            8 => &self.ev_data8,
            _ => return None,
        };
        slot.as_deref()
    }

    /// Event data slot `n`, required.
    pub fn require_data(&self, n: usize) -> Result<&str, DomainError> {
        self.data(n).ok_or(DomainError::MissingEventData(n))
    }

    /// Event data slot `n` parsed as an integer.
    pub fn data_i32(&self, n: usize) -> Result<i32, DomainError> {
        self.require_data(n)?
            .parse()
            .map_err(|_| DomainError::MissingEventData(n))
    }
}

// =============================================================================
// LogRow
// =============================================================================

/// The kind of a captured row action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdType {
    Insert,
    Update,
    Delete,
}

impl CmdType {
    /// The single-character wire form stored in `log_cmdtype`.
    pub fn as_str(&self) -> &'static str {
        match self {
            CmdType::Insert => "I",
            CmdType::Update => "U",
            CmdType::Delete => "D",
        }
    }
}

impl FromStr for CmdType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "I" => CmdType::Insert,
            "U" => CmdType::Update,
            "D" => CmdType::Delete,
            other => return Err(DomainError::UnknownCmdType(other.to_string())),
        })
    }
}

impl fmt::Display for CmdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `sl_log_1` / `sl_log_2`.
#[derive(Debug, Clone, FromRow)]
pub struct LogRow {
    /// Node the change was captured on
    pub log_origin: NodeId,
    /// Capturing transaction
    pub log_xid: Xxid,
    /// Replicated table the change belongs to
    pub log_tableid: TableId,
    /// Global action sequence on the origin
    pub log_actionseq: i64,
    /// `I`, `U` or `D`
    pub log_cmdtype: String,
    /// Rendered SQL fragment
    pub log_cmddata: String,
}

impl LogRow {
    /// The typed command.
    pub fn cmd_type(&self) -> Result<CmdType, DomainError> {
        self.log_cmdtype.parse()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_round_trip() {
        for name in [
            "STORE_NODE",
            "SUBSCRIBE_SET",
            "ENABLE_SUBSCRIPTION",
            "SYNC",
            "SWITCH_LOG",
            "FAILOVER_SET",
        ] {
            let ty: EventType = name.parse().unwrap();
            assert_eq!(ty.as_str(), name);
        }
        assert!("BOGUS_EVENT".parse::<EventType>().is_err());
    }

    #[test]
    fn test_records_sequences() {
        assert!(EventType::Sync.records_sequences());
        assert!(EventType::EnableSubscription.records_sequences());
        assert!(!EventType::StoreNode.records_sequences());
    }

    #[test]
    fn test_admin_classification() {
        assert!(!EventType::Sync.is_admin());
        assert!(EventType::SwitchLog.is_admin());
        assert!(EventType::DdlScript.is_admin());
    }

    #[test]
    fn test_cmd_type_parse() {
        assert_eq!("I".parse::<CmdType>().unwrap(), CmdType::Insert);
        assert_eq!("U".parse::<CmdType>().unwrap(), CmdType::Update);
        assert_eq!("D".parse::<CmdType>().unwrap(), CmdType::Delete);
        assert!("X".parse::<CmdType>().is_err());
    }

    fn sample_event() -> Event {
        Event {
            ev_origin: NodeId::new(1).unwrap(),
            ev_seqno: EventSeq(10),
            ev_timestamp: Utc::now(),
            ev_minxid: Xxid(100),
            ev_maxxid: Xxid(110),
            ev_xip: "'104','107'".to_string(),
            ev_type: "SYNC".to_string(),
            ev_data1: Some("1".to_string()),
            ev_data2: None,
            ev_data3: None,
            ev_data4: None,
            ev_data5: None,
            ev_data6: None,
            ev_data7: None,
            ev_data8: None,
        }
    }

    #[test]
    fn test_event_snapshot() {
        let ev = sample_event();
        let snap = ev.snapshot().unwrap();
        assert_eq!(snap.xmin, Xxid(100));
        assert_eq!(snap.xmax, Xxid(110));
        assert_eq!(snap.xip.len(), 2);
        assert!(!snap.sees(Xxid(104)));
        assert!(snap.sees(Xxid(105)));
    }

    #[test]
    fn test_event_data_slots() {
        let ev = sample_event();
        assert_eq!(ev.data(1), Some("1"));
        assert_eq!(ev.data(2), None);
        assert_eq!(ev.data_i32(1).unwrap(), 1);
        assert!(ev.require_data(2).is_err());
        assert!(ev.data(9).is_none());
    }
}
