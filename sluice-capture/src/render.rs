//! Row-change rendering.
//!
//! A captured change is stored as `(cmdtype, cmddata)` where `cmddata` is a
//! SQL fragment the apply side completes into a full statement:
//!
//! - Insert: `("col", ...) values ('val', ...)` — only non-NULL columns.
//! - Update: `"col"='val', ... where "key"='val' and ...` — SET list holds
//!   only columns whose value changed; a no-op UPDATE still emits one SET
//!   of the first key column to its own old value so apply counts match.
//! - Delete: `"key"='val' and ...`.
//!
//! Values are the database text form of each column; comparison for
//! "changed?" is on that text form.

use crate::error::CaptureError;
use crate::Result;
use sluice_domain::{AttKind, ColumnKind};
use sluice_sql::{quote_ident, quote_literal};

// =============================================================================
// RowImage
// =============================================================================

/// One row as seen by the capture plane: the non-dropped columns in table
/// order, each value in its database text form (`None` = SQL NULL).
#[derive(Debug, Clone, Default)]
pub struct RowImage {
    cols: Vec<(String, Option<String>)>,
}

impl RowImage {
    /// An empty image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column.
    pub fn push(&mut self, name: impl Into<String>, value: Option<&str>) {
        self.cols.push((name.into(), value.map(str::to_string)));
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.cols.len()
    }

    /// True when the image has no columns.
    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    fn name(&self, idx: usize) -> &str {
        &self.cols[idx].0
    }

    fn value(&self, idx: usize) -> Option<&str> {
        self.cols[idx].1.as_deref()
    }
}

fn check_width(table: &str, attkind: &AttKind, image: &RowImage) -> Result<()> {
    if image.len() != attkind.len() {
        return Err(CaptureError::AttKindMismatch {
            table: table.to_string(),
            expected: attkind.len(),
            got: image.len(),
        });
    }
    Ok(())
}

/// Grow `buf` by doubling until `additional` more bytes fit.
fn reserve_doubling(buf: &mut String, additional: usize) {
    let need = buf.len() + additional;
    if need > buf.capacity() {
        let mut cap = buf.capacity().max(64);
        while cap < need {
            cap *= 2;
        }
        buf.reserve(cap - buf.len());
    }
}

fn push_pair(buf: &mut String, ident: &str, value: &str) {
    let ident = quote_ident(ident);
    reserve_doubling(buf, ident.len() + value.len() + 1);
    buf.push_str(&ident);
    buf.push('=');
    buf.push_str(value);
}

// =============================================================================
// Insert
// =============================================================================

/// Render the cmddata fragment for an INSERT.
pub fn render_insert(image: &RowImage) -> String {
    let mut buf = String::with_capacity(64);

    buf.push('(');
    let mut need_comma = false;
    for i in 0..image.len() {
        if image.value(i).is_none() {
            continue;
        }
        if need_comma {
            buf.push(',');
        } else {
            need_comma = true;
        }
        let ident = quote_ident(image.name(i));
        reserve_doubling(&mut buf, ident.len());
        buf.push_str(&ident);
    }

    buf.push_str(") values (");

    need_comma = false;
    for i in 0..image.len() {
        let Some(value) = image.value(i) else {
            continue;
        };
        if need_comma {
            buf.push(',');
        } else {
            need_comma = true;
        }
        let lit = quote_literal(value);
        reserve_doubling(&mut buf, lit.len());
        buf.push_str(&lit);
    }

    buf.push(')');
    buf
}

// =============================================================================
// Update
// =============================================================================

/// Render the cmddata fragment for an UPDATE.
///
/// # Errors
/// `NullKeyColumn` when a key column is NULL in the old image;
/// `AttKindMismatch` when an image width disagrees with the attkind.
pub fn render_update(
    table: &str,
    attkind: &AttKind,
    old: &RowImage,
    new: &RowImage,
) -> Result<String> {
    check_width(table, attkind, old)?;
    check_width(table, attkind, new)?;

    let mut buf = String::with_capacity(64);
    let mut need_comma = false;

    for i in 0..old.len() {
        let old_value = old.value(i);
        let new_value = new.value(i);

        // Both NULL: unchanged
        if old_value.is_none() && new_value.is_none() {
            continue;
        }
        // Both present and equal on the text form: unchanged
        if let (Some(o), Some(n)) = (old_value, new_value) {
            if o == n {
                continue;
            }
        }

        if need_comma {
            buf.push(',');
        } else {
            need_comma = true;
        }
        let value = match new_value {
            Some(v) => quote_literal(v),
            None => "NULL".to_string(),
        };
        push_pair(&mut buf, old.name(i), &value);
    }

    // An application may UPDATE every column to its existing value. Emit
    // the first key column set to its own old value so the apply side still
    // sees one statement per log row.
    if !need_comma {
        let i = attkind.first_key();
        let value = old.value(i).ok_or_else(|| CaptureError::NullKeyColumn {
            table: table.to_string(),
            column: old.name(i).to_string(),
            op: "UPDATE",
        })?;
        push_pair(&mut buf, old.name(i), &quote_literal(value));
    }

    buf.push_str(" where ");
    render_key_clause(table, attkind, old, "UPDATE", &mut buf)?;
    Ok(buf)
}

// =============================================================================
// Delete
// =============================================================================

/// Render the cmddata fragment for a DELETE.
///
/// # Errors
/// `NullKeyColumn` when a key column is NULL in the old image.
pub fn render_delete(table: &str, attkind: &AttKind, old: &RowImage) -> Result<String> {
    check_width(table, attkind, old)?;

    let mut buf = String::with_capacity(64);
    render_key_clause(table, attkind, old, "DELETE", &mut buf)?;
    Ok(buf)
}

/// Render `"key"='val' [and ...]` over the old image's key columns.
fn render_key_clause(
    table: &str,
    attkind: &AttKind,
    old: &RowImage,
    op: &'static str,
    buf: &mut String,
) -> Result<()> {
    let mut need_and = false;
    for (i, kind) in attkind.iter().enumerate() {
        if kind != ColumnKind::Key {
            continue;
        }
        let value = old.value(i).ok_or_else(|| CaptureError::NullKeyColumn {
            table: table.to_string(),
            column: old.name(i).to_string(),
            op,
        })?;
        if need_and {
            buf.push_str(" and ");
        } else {
            need_and = true;
        }
        push_pair(buf, old.name(i), &quote_literal(value));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn image(cols: &[(&str, Option<&str>)]) -> RowImage {
        let mut img = RowImage::new();
        for (name, value) in cols {
            img.push(*name, *value);
        }
        img
    }

    #[test]
    fn test_insert_skips_nulls() {
        let img = image(&[("k", Some("1")), ("v", Some("a")), ("w", None)]);
        assert_eq!(render_insert(&img), "(k,v) values ('1','a')");
    }

    #[test]
    fn test_insert_quotes_values_and_idents() {
        let img = image(&[("k", Some("1")), ("select", Some("O'Reilly"))]);
        assert_eq!(
            render_insert(&img),
            "(k,\"select\") values ('1','O''Reilly')"
        );
    }

    #[test]
    fn test_update_changed_column_only() {
        let ak = AttKind::new("kv").unwrap();
        let old = image(&[("k", Some("1")), ("v", Some("a"))]);
        let new = image(&[("k", Some("1")), ("v", Some("b"))]);
        let cmd = render_update("t", &ak, &old, &new).unwrap();
        assert_eq!(cmd, "v='b' where k='1'");
    }

    #[test]
    fn test_update_set_to_null() {
        let ak = AttKind::new("kv").unwrap();
        let old = image(&[("k", Some("1")), ("v", Some("a"))]);
        let new = image(&[("k", Some("1")), ("v", None)]);
        let cmd = render_update("t", &ak, &old, &new).unwrap();
        assert_eq!(cmd, "v=NULL where k='1'");
    }

    #[test]
    fn test_update_from_null() {
        let ak = AttKind::new("kv").unwrap();
        let old = image(&[("k", Some("1")), ("v", None)]);
        let new = image(&[("k", Some("1")), ("v", Some("a"))]);
        let cmd = render_update("t", &ak, &old, &new).unwrap();
        assert_eq!(cmd, "v='a' where k='1'");
    }

    #[test]
    fn test_noop_update_emits_first_key() {
        let ak = AttKind::new("kv").unwrap();
        let old = image(&[("k", Some("1")), ("v", Some("a"))]);
        let cmd = render_update("t", &ak, &old, &old).unwrap();
        assert_eq!(cmd, "k='1' where k='1'");
    }

    #[test]
    fn test_noop_update_first_key_not_leading() {
        let ak = AttKind::new("vkv").unwrap();
        let old = image(&[("a", Some("x")), ("id", Some("9")), ("b", None)]);
        let cmd = render_update("t", &ak, &old, &old).unwrap();
        assert_eq!(cmd, "id='9' where id='9'");
    }

    #[test]
    fn test_update_multi_key_where() {
        let ak = AttKind::new("kkv").unwrap();
        let old = image(&[("a", Some("1")), ("b", Some("2")), ("v", Some("x"))]);
        let new = image(&[("a", Some("1")), ("b", Some("2")), ("v", Some("y"))]);
        let cmd = render_update("t", &ak, &old, &new).unwrap();
        assert_eq!(cmd, "v='y' where a='1' and b='2'");
    }

    #[test]
    fn test_update_null_key_fails() {
        let ak = AttKind::new("kv").unwrap();
        let old = image(&[("k", None), ("v", Some("a"))]);
        let new = image(&[("k", None), ("v", Some("b"))]);
        let err = render_update("t", &ak, &old, &new).unwrap_err();
        assert!(matches!(err, CaptureError::NullKeyColumn { op: "UPDATE", .. }));
    }

    #[test]
    fn test_update_width_mismatch() {
        let ak = AttKind::new("kv").unwrap();
        let old = image(&[("k", Some("1"))]);
        let err = render_update("t", &ak, &old, &old).unwrap_err();
        assert!(matches!(err, CaptureError::AttKindMismatch { .. }));
    }

    #[test]
    fn test_delete_key_clause() {
        let ak = AttKind::new("kvk").unwrap();
        let old = image(&[("a", Some("1")), ("v", Some("x")), ("b", Some("2"))]);
        let cmd = render_delete("t", &ak, &old).unwrap();
        assert_eq!(cmd, "a='1' and b='2'");
    }

    #[test]
    fn test_delete_null_key_fails() {
        let ak = AttKind::new("k").unwrap();
        let old = image(&[("k", None)]);
        let err = render_delete("t", &ak, &old).unwrap_err();
        assert!(matches!(err, CaptureError::NullKeyColumn { op: "DELETE", .. }));
    }

    #[test]
    fn test_backslash_value_round_trip_form() {
        let ak = AttKind::new("kv").unwrap();
        let old = image(&[("k", Some("1")), ("v", Some("plain"))]);
        let new = image(&[("k", Some("1")), ("v", Some("O'Reilly\\n"))]);
        let cmd = render_update("t", &ak, &old, &new).unwrap();
        assert_eq!(cmd, "v=E'O''Reilly\\\\n' where k='1'");
    }
}
