//! Statement assembly.

use crate::quote::{quote_ident, quote_literal};
use std::fmt::Write;

/// Accumulates a SQL statement as text.
///
/// Most daemon queries interpolate the quoted cluster schema and small
/// integers; captured row changes interpolate quoted identifiers and
/// literals. The builder keeps the quoting rules in one place. The buffer
/// grows by doubling, so repeated appends reallocate logarithmically.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    buf: String,
}

impl QueryBuilder {
    /// Start an empty statement.
    pub fn new() -> Self {
        Self {
            buf: String::with_capacity(256),
        }
    }

    /// Append raw SQL text.
    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.reserve(sql.len());
        self.buf.push_str(sql);
        self
    }

    /// Append an identifier, quoting it if needed.
    pub fn push_ident(&mut self, ident: &str) -> &mut Self {
        let quoted = quote_ident(ident);
        self.reserve(quoted.len());
        self.buf.push_str(&quoted);
        self
    }

    /// Append a value as a quoted string literal.
    pub fn push_literal(&mut self, value: &str) -> &mut Self {
        let quoted = quote_literal(value);
        self.reserve(quoted.len());
        self.buf.push_str(&quoted);
        self
    }

    /// Append an integer.
    pub fn push_i64(&mut self, value: i64) -> &mut Self {
        self.reserve(20);
        let _ = write!(self.buf, "{}", value);
        self
    }

    /// Append an integer.
    pub fn push_i32(&mut self, value: i32) -> &mut Self {
        self.push_i64(value as i64)
    }

    /// Current length of the assembled text.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The assembled statement.
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Consume the builder, returning the statement.
    pub fn build(self) -> String {
        self.buf
    }

    /// Grow the buffer by doubling until `additional` bytes fit.
    fn reserve(&mut self, additional: usize) {
        let need = self.buf.len() + additional;
        if need > self.buf.capacity() {
            let mut cap = self.buf.capacity().max(16);
            while cap < need {
                cap *= 2;
            }
            self.buf.reserve(cap - self.buf.len());
        }
    }
}

impl std::fmt::Display for QueryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_statement() {
        let mut q = QueryBuilder::new();
        q.push("select * from ")
            .push_ident("my_table")
            .push(" where ")
            .push_ident("name")
            .push(" = ")
            .push_literal("O'Reilly")
            .push(" and id = ")
            .push_i32(42);
        assert_eq!(
            q.build(),
            "select * from my_table where name = 'O''Reilly' and id = 42"
        );
    }

    #[test]
    fn test_ident_quoting_applied() {
        let mut q = QueryBuilder::new();
        q.push("delete from ").push_ident("Order");
        assert_eq!(q.as_str(), "delete from \"Order\"");
    }

    #[test]
    fn test_growth_keeps_content() {
        let mut q = QueryBuilder::new();
        for i in 0..1000 {
            q.push_i64(i).push(",");
        }
        assert!(q.as_str().starts_with("0,1,2,"));
        assert!(q.as_str().ends_with("999,"));
    }
}
