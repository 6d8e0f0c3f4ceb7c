//! Column kind strings.
//!
//! Every replicated table carries an `attkind`: one character per
//! non-dropped column, `k` for replication key columns and `v` for plain
//! data columns. The capture plane uses it to build UPDATE/DELETE key
//! predicates; a table with no key column cannot be replicated.

use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of one table column for replication purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// Part of the replication key
    Key,
    /// Plain data column
    Value,
}

/// A validated attkind string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttKind(String);

impl AttKind {
    /// Parse and validate an attkind string.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidAttKind` when the string is empty,
    /// contains anything but `k`/`v`, or names no key column at all.
    pub fn new(s: impl Into<String>) -> Result<Self, DomainError> {
        let s = s.into();
        if s.is_empty() || !s.bytes().all(|b| b == b'k' || b == b'v') {
            return Err(DomainError::InvalidAttKind(s));
        }
        if !s.bytes().any(|b| b == b'k') {
            return Err(DomainError::InvalidAttKind(s));
        }
        Ok(Self(s))
    }

    /// The kind of the column at `idx` (position among non-dropped columns).
    pub fn kind(&self, idx: usize) -> Option<ColumnKind> {
        self.0.as_bytes().get(idx).map(|b| match b {
            b'k' => ColumnKind::Key,
            _ => ColumnKind::Value,
        })
    }

    /// Number of columns described.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no columns are described (never for a validated value).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Index of the first key column.
    pub fn first_key(&self) -> usize {
        self.0
            .bytes()
            .position(|b| b == b'k')
            .expect("validated attkind has a key column")
    }

    /// Iterate the column kinds in order.
    pub fn iter(&self) -> impl Iterator<Item = ColumnKind> + '_ {
        self.0.bytes().map(|b| match b {
            b'k' => ColumnKind::Key,
            _ => ColumnKind::Value,
        })
    }

    /// The raw string form stored in `sl_table.tab_attkind`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AttKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for AttKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_attkind() {
        let ak = AttKind::new("kvv").unwrap();
        assert_eq!(ak.len(), 3);
        assert_eq!(ak.kind(0), Some(ColumnKind::Key));
        assert_eq!(ak.kind(1), Some(ColumnKind::Value));
        assert_eq!(ak.kind(3), None);
        assert_eq!(ak.first_key(), 0);
    }

    #[test]
    fn test_first_key_not_leading() {
        let ak = AttKind::new("vvkv").unwrap();
        assert_eq!(ak.first_key(), 2);
    }

    #[test]
    fn test_invalid_attkind() {
        assert!(AttKind::new("").is_err());
        assert!(AttKind::new("kxv").is_err());
        // No key column at all
        assert!(AttKind::new("vvv").is_err());
    }
}
