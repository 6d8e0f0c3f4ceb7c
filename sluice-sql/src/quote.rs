//! Literal and identifier quoting.

/// Keywords that force quoting even for otherwise safe identifiers.
///
/// This is the reserved part of the SQL keyword list. The test is overly
/// strong on purpose: a keyword that would actually be usable as a column
/// name still gets quoted, which is always valid.
const RESERVED_WORDS: &[&str] = &[
    "all",
    "analyse",
    "analyze",
    "and",
    "any",
    "array",
    "as",
    "asc",
    "asymmetric",
    "between",
    "binary",
    "both",
    "case",
    "cast",
    "check",
    "collate",
    "column",
    "constraint",
    "create",
    "cross",
    "current_date",
    "current_role",
    "current_time",
    "current_timestamp",
    "current_user",
    "default",
    "deferrable",
    "desc",
    "distinct",
    "do",
    "else",
    "end",
    "except",
    "false",
    "for",
    "foreign",
    "freeze",
    "from",
    "full",
    "grant",
    "group",
    "having",
    "ilike",
    "in",
    "initially",
    "inner",
    "intersect",
    "into",
    "is",
    "isnull",
    "join",
    "leading",
    "left",
    "like",
    "limit",
    "localtime",
    "localtimestamp",
    "natural",
    "not",
    "notnull",
    "null",
    "off",
    "offset",
    "old",
    "on",
    "only",
    "or",
    "order",
    "outer",
    "overlaps",
    "placing",
    "primary",
    "references",
    "right",
    "select",
    "session_user",
    "similar",
    "some",
    "symmetric",
    "table",
    "then",
    "to",
    "trailing",
    "true",
    "union",
    "unique",
    "user",
    "using",
    "verbose",
    "when",
    "where",
];

/// Quote a value as a SQL string literal.
///
/// Single quotes and backslashes are doubled. When the value contains a
/// backslash the literal gets the `E` escape-string prefix, so the result
/// parses back to the input regardless of the server's
/// `standard_conforming_strings` setting.
pub fn quote_literal(value: &str) -> String {
    let has_backslash = value.contains('\\');
    let mut out = String::with_capacity(value.len() + 2);
    if has_backslash {
        out.push('E');
    }
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// Quote an identifier only if needed.
///
/// The identifier is returned unchanged iff it starts with a lowercase
/// letter or underscore, contains only lowercase letters, digits, and
/// underscores, and is not a reserved word. Otherwise it is double-quoted
/// with embedded quotes doubled.
pub fn quote_ident(ident: &str) -> String {
    let safe = ident
        .bytes()
        .next()
        .map(|b| b.is_ascii_lowercase() || b == b'_')
        .unwrap_or(false)
        && ident
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        && RESERVED_WORDS.binary_search(&ident).is_err();

    if safe {
        return ident.to_string();
    }

    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for ch in ident.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_words_sorted() {
        // binary_search above depends on this
        let mut sorted = RESERVED_WORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, RESERVED_WORDS);
    }

    #[test]
    fn test_literal_plain() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal(""), "''");
    }

    #[test]
    fn test_literal_quotes_doubled() {
        assert_eq!(quote_literal("O'Reilly"), "'O''Reilly'");
    }

    #[test]
    fn test_literal_backslash() {
        assert_eq!(quote_literal("a\\b"), "E'a\\\\b'");
        assert_eq!(quote_literal("O'Reilly\\n"), "E'O''Reilly\\\\n'");
    }

    /// Undo literal quoting the way the server's parser would.
    fn unquote(lit: &str) -> String {
        let body = lit
            .strip_prefix('E')
            .unwrap_or(lit)
            .strip_prefix('\'')
            .unwrap()
            .strip_suffix('\'')
            .unwrap();
        let mut out = String::new();
        let mut chars = body.chars();
        while let Some(ch) = chars.next() {
            match ch {
                '\'' => {
                    chars.next();
                    out.push('\'');
                }
                '\\' => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push(ch),
            }
        }
        out
    }

    #[test]
    fn test_literal_round_trip() {
        for input in ["", "plain", "O'Reilly", "a\\b", "''''", "\\\\", "mixed '\\' end"] {
            assert_eq!(unquote(&quote_literal(input)), input, "input {:?}", input);
        }
    }

    #[test]
    fn test_ident_safe_unchanged() {
        assert_eq!(quote_ident("foo"), "foo");
        assert_eq!(quote_ident("_x1"), "_x1");
        assert_eq!(quote_ident("tab_2"), "tab_2");
    }

    #[test]
    fn test_ident_unsafe_quoted() {
        assert_eq!(quote_ident("Foo"), "\"Foo\"");
        assert_eq!(quote_ident("1st"), "\"1st\"");
        assert_eq!(quote_ident("with space"), "\"with space\"");
        assert_eq!(quote_ident(""), "\"\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_ident_reserved_quoted() {
        assert_eq!(quote_ident("select"), "\"select\"");
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("where"), "\"where\"");
        // Not reserved, stays bare
        assert_eq!(quote_ident("selection"), "selection");
    }
}
