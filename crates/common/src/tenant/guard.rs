//! Statement and identifier guards
//!
//! The executor itself never inspects SQL. These checks run at the call sites
//! that need them: the read-only gate on self-service paths, and the
//! identifier allow-list wherever a mapping name is spliced into a statement.

use crate::errors::{AppError, Result};
use regex_lite::Regex;
use std::sync::OnceLock;

/// Leading keywords accepted on the self-service path
pub const READ_ONLY_KEYWORDS: &[&str] = &["SELECT"];

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"))
}

/// Non-empty statement, whatever it does
pub fn require_statement(sql: &str) -> Result<()> {
    if sql.trim().is_empty() {
        return Err(AppError::validation("sql", "Query text is empty"));
    }
    Ok(())
}

/// Whether the trimmed text opens with a read-only keyword as a whole word
pub fn is_read_only(sql: &str) -> bool {
    let trimmed = sql.trim_start();
    READ_ONLY_KEYWORDS.iter().any(|keyword| {
        let Some(head) = trimmed.get(..keyword.len()) else {
            return false;
        };
        head.eq_ignore_ascii_case(keyword)
            && trimmed[keyword.len()..]
                .chars()
                .next()
                .map_or(true, |c| !(c.is_alphanumeric() || c == '_'))
    })
}

/// Gate for self-service execution and saves
pub fn require_read_only(sql: &str) -> Result<()> {
    require_statement(sql)?;
    if !is_read_only(sql) {
        return Err(AppError::validation(
            "sql",
            format!(
                "Only statements starting with {} are allowed",
                READ_ONLY_KEYWORDS.join(" or ")
            ),
        ));
    }
    if !is_single_statement(sql) {
        return Err(AppError::validation("sql", "Only a single statement is allowed"));
    }
    Ok(())
}

/// Whether nothing but whitespace, comments or semicolons follows the first
/// statement terminator. Quoted text, comments and dollar-quoted bodies are
/// skipped while looking for it.
pub fn is_single_statement(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut terminated = false;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            i = skip_line_comment(bytes, i);
            continue;
        }
        if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = skip_block_comment(bytes, i);
            continue;
        }
        if terminated {
            if b != b';' && !b.is_ascii_whitespace() {
                return false;
            }
            i += 1;
            continue;
        }
        i = match b {
            b'\'' | b'"' => skip_quoted(bytes, i),
            b'$' => skip_dollar_quoted(bytes, i),
            b';' => {
                terminated = true;
                i + 1
            }
            _ => i + 1,
        };
    }
    true
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |offset| start + offset + 1)
}

/// Block comments nest
fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Single- or double-quoted run; a doubled quote is an escape
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// `$tag$ ... $tag$`; `$1` style parameters are left alone
fn skip_dollar_quoted(bytes: &[u8], start: usize) -> usize {
    let tag_len = bytes[start + 1..]
        .iter()
        .position(|&b| !(b.is_ascii_alphanumeric() || b == b'_'));
    let Some(tag_len) = tag_len else {
        return start + 1;
    };
    let close = start + 1 + tag_len;
    let starts_with_digit = bytes.get(start + 1).is_some_and(u8::is_ascii_digit);
    if bytes[close] != b'$' || starts_with_digit {
        return start + 1;
    }

    let tag = &bytes[start..=close];
    bytes[close + 1..]
        .windows(tag.len())
        .position(|window| window == tag)
        .map_or(bytes.len(), |offset| close + 1 + offset + tag.len())
}

/// Check a bare column-style identifier against the allow-list
pub fn validate_identifier(name: &str) -> Result<()> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(AppError::validation(
            "identifier",
            format!("'{}' is not a valid identifier", name),
        ))
    }
}

/// Check a table name, optionally schema-qualified (`schema.table`)
pub fn validate_table_name(name: &str) -> Result<()> {
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() > 2 {
        return Err(AppError::validation(
            "table",
            format!("'{}' has too many qualifiers", name),
        ));
    }
    segments.into_iter().try_for_each(validate_identifier)
}

/// Validate and double-quote an identifier for the tenant dialect
pub fn quote_identifier(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

/// Validate and quote each segment of a table name
pub fn quote_table_name(name: &str) -> Result<String> {
    validate_table_name(name)?;
    Ok(name
        .split('.')
        .map(|segment| format!("\"{}\"", segment))
        .collect::<Vec<_>>()
        .join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_only_gate_is_case_insensitive_and_trims() {
        assert!(is_read_only("SELECT 1"));
        assert!(is_read_only("   select * from sales"));
        assert!(is_read_only("\n\tSeLeCt\n1"));
        assert!(is_read_only("select(1)"));
    }

    #[test]
    fn test_read_only_gate_rejects_other_statements() {
        assert!(!is_read_only("DELETE FROM sales"));
        assert!(!is_read_only("update sales set amount = 0"));
        assert!(!is_read_only("selection_table"));
        assert!(!is_read_only("sel"));
        assert!(!is_read_only(""));
    }

    #[test]
    fn test_require_read_only_returns_validation_error() {
        let err = require_read_only("DROP TABLE customers").unwrap_err();
        match err {
            AppError::Validation { field, .. } => assert_eq!(field.as_deref(), Some("sql")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stacked_statements_fail_the_read_only_gate() {
        let err = require_read_only("SELECT 1; DELETE FROM invoices").unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        assert!(require_read_only("select * from sales;\nupdate sales set amount = 0").is_err());
        assert!(require_read_only("SELECT 1 /* note */; DROP TABLE x").is_err());
    }

    #[test]
    fn test_single_statement_detection() {
        assert!(is_single_statement("SELECT 1"));
        assert!(is_single_statement("SELECT 1;"));
        assert!(is_single_statement("SELECT 1;  ;\n-- trailing note\n"));
        assert!(is_single_statement("SELECT 'a;b', \"odd;name\" FROM t"));
        assert!(is_single_statement("SELECT 'it''s; fine'"));
        assert!(is_single_statement("SELECT 1 -- ; DELETE FROM t"));
        assert!(is_single_statement("SELECT /* ; /* nested ; */ */ 1"));
        assert!(is_single_statement("SELECT $body$ ; DELETE $body$"));
        assert!(is_single_statement("SELECT $$;$$, $1"));
        assert!(!is_single_statement("SELECT 1; SELECT 2"));
        assert!(!is_single_statement("SELECT $1; DELETE FROM t"));
    }

    #[test]
    fn test_multibyte_prefix_does_not_panic() {
        assert!(!is_read_only("é"));
        assert!(!is_read_only("sélect 1"));
    }

    #[test]
    fn test_identifier_allow_list() {
        assert!(validate_identifier("CustomerID").is_ok());
        assert!(validate_identifier("_total_2024").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("name; DROP TABLE x").is_err());
        assert!(validate_identifier("col\"umn").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_table_names_may_be_schema_qualified() {
        assert_eq!(quote_table_name("dbo.Customers").unwrap(), "\"dbo\".\"Customers\"");
        assert_eq!(quote_table_name("Sales").unwrap(), "\"Sales\"");
        assert!(quote_table_name("a.b.c").is_err());
        assert!(quote_table_name("dbo.").is_err());
    }
}
