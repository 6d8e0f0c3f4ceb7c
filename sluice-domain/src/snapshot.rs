//! Transaction snapshots and the SYNC visibility rules.
//!
//! Every SYNC event carries the origin's transaction snapshot at the moment
//! the event was created. A receiver reconstructs commit order by applying,
//! for each SYNC, exactly the log rows whose transaction committed after the
//! previous SYNC's snapshot and before the current one's.

use crate::error::DomainError;
use crate::ids::Xxid;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// =============================================================================
// TxSnapshot
// =============================================================================

/// A transaction visibility snapshot: `(xmin, xmax, xip)`.
///
/// `xmin` is the lowest transaction id still in progress, `xmax` the first
/// unassigned id, and `xip` the set of in-progress ids in `[xmin, xmax)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSnapshot {
    /// Lowest in-progress transaction id
    pub xmin: Xxid,
    /// First unassigned transaction id
    pub xmax: Xxid,
    /// Transactions in progress at snapshot time
    pub xip: BTreeSet<Xxid>,
}

impl TxSnapshot {
    /// Build a snapshot from its parts, dropping xip entries outside
    /// `[xmin, xmax)`.
    pub fn new(xmin: Xxid, xmax: Xxid, xip: impl IntoIterator<Item = Xxid>) -> Self {
        let xip = xip
            .into_iter()
            .filter(|x| *x >= xmin && *x < xmax)
            .collect();
        Self { xmin, xmax, xip }
    }

    /// Was `xid` committed and visible at this snapshot?
    pub fn sees(&self, xid: Xxid) -> bool {
        xid < self.xmax && !self.xip.contains(&xid)
    }

    /// The xip set rendered as the comma separated list of quoted ids used
    /// in `sl_event.ev_xip`.
    pub fn xip_list(&self) -> String {
        let mut out = String::new();
        for (i, xid) in self.xip.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('\'');
            out.push_str(&xid.to_string());
            out.push('\'');
        }
        out
    }

    /// Parse the `ev_xip` list form produced by [`TxSnapshot::xip_list`].
    pub fn parse_xip_list(s: &str) -> Result<BTreeSet<Xxid>, DomainError> {
        let mut xip = BTreeSet::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let digits = part.trim_matches('\'');
            let value = digits
                .parse::<i64>()
                .map_err(|_| DomainError::InvalidSnapshot(s.to_string()))?;
            xip.insert(Xxid(value));
        }
        Ok(xip)
    }
}

impl FromStr for TxSnapshot {
    type Err = DomainError;

    /// Parse the `xmin:xmax:xip1,xip2,...` text form of
    /// `txid_current_snapshot()`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let xmin = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| DomainError::InvalidSnapshot(s.to_string()))?;
        let xmax = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| DomainError::InvalidSnapshot(s.to_string()))?;
        let xip = match parts.next() {
            None | Some("") => BTreeSet::new(),
            Some(list) => list
                .split(',')
                .map(|p| {
                    p.trim()
                        .parse::<i64>()
                        .map(Xxid)
                        .map_err(|_| DomainError::InvalidSnapshot(s.to_string()))
                })
                .collect::<Result<_, _>>()?,
        };
        Ok(Self::new(Xxid(xmin), Xxid(xmax), xip))
    }
}

impl fmt::Display for TxSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.xmin, self.xmax)?;
        for (i, xid) in self.xip.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", xid)?;
        }
        Ok(())
    }
}

// =============================================================================
// SyncWindow
// =============================================================================

/// The visibility window between two consecutive SYNC snapshots on one
/// origin.
///
/// A log row belongs to the window when its transaction is seen by the
/// current snapshot but was not yet seen by the previous one. This
/// reconstructs commit order without requiring the log itself to be in
/// commit order.
#[derive(Debug, Clone)]
pub struct SyncWindow {
    /// Snapshot of the SYNC preceding this group (already applied)
    pub prev: TxSnapshot,
    /// Snapshot of the last SYNC in the group being applied
    pub curr: TxSnapshot,
}

impl SyncWindow {
    /// Should the log row written by `xid` be applied under this window?
    pub fn contains(&self, xid: Xxid) -> bool {
        self.curr.sees(xid) && !self.prev.sees(xid)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(xmin: i64, xmax: i64, xip: &[i64]) -> TxSnapshot {
        TxSnapshot::new(
            Xxid(xmin),
            Xxid(xmax),
            xip.iter().copied().map(Xxid),
        )
    }

    #[test]
    fn test_parse_snapshot_text() {
        let s: TxSnapshot = "100:105:101,103".parse().unwrap();
        assert_eq!(s.xmin, Xxid(100));
        assert_eq!(s.xmax, Xxid(105));
        assert!(s.xip.contains(&Xxid(101)));
        assert!(s.xip.contains(&Xxid(103)));
        assert_eq!(s.xip.len(), 2);
    }

    #[test]
    fn test_parse_snapshot_empty_xip() {
        let s: TxSnapshot = "7:7:".parse().unwrap();
        assert!(s.xip.is_empty());
        let s: TxSnapshot = "7:7".parse().unwrap();
        assert!(s.xip.is_empty());
    }

    #[test]
    fn test_parse_snapshot_garbage() {
        assert!("".parse::<TxSnapshot>().is_err());
        assert!("a:b:c".parse::<TxSnapshot>().is_err());
    }

    #[test]
    fn test_sees_basics() {
        let s = snap(100, 105, &[101, 103]);
        // Committed before xmin: visible
        assert!(s.sees(Xxid(99)));
        // Committed inside the window: visible
        assert!(s.sees(Xxid(102)));
        // Still in progress: not visible
        assert!(!s.sees(Xxid(101)));
        assert!(!s.sees(Xxid(103)));
        // Not yet assigned: not visible
        assert!(!s.sees(Xxid(105)));
        assert!(!s.sees(Xxid(200)));
    }

    #[test]
    fn test_window_excludes_already_applied() {
        let window = SyncWindow {
            prev: snap(100, 105, &[101, 103]),
            curr: snap(104, 110, &[108]),
        };
        // Seen by prev: already applied, excluded
        assert!(!window.contains(Xxid(99)));
        assert!(!window.contains(Xxid(102)));
        // In progress at prev, committed by curr: apply now
        assert!(window.contains(Xxid(101)));
        assert!(window.contains(Xxid(103)));
        // Started after prev, committed by curr: apply now
        assert!(window.contains(Xxid(106)));
        // Still in progress at curr: not yet
        assert!(!window.contains(Xxid(108)));
        // Future transaction: not yet
        assert!(!window.contains(Xxid(110)));
    }

    #[test]
    fn test_xip_list_round_trip() {
        let s = snap(100, 110, &[104, 102, 107]);
        let list = s.xip_list();
        assert_eq!(list, "'102','104','107'");
        let parsed = TxSnapshot::parse_xip_list(&list).unwrap();
        assert_eq!(parsed, s.xip);
        assert!(TxSnapshot::parse_xip_list("").unwrap().is_empty());
    }
}
