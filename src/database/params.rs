//! Named `:param` placeholders.
//!
//! SQL is scanned for `:name` placeholders outside of quoted text and
//! comments, skipping `::` casts. The SQL is then rewritten to the
//! positional syntax of the connected backend and values are bound in order.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::query::Query;
use sqlx::{Database, Encode, Type};

use crate::config::ParameterSet;

use super::QueryError;

/// Positional placeholder syntax of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ... (PostgreSQL). Repeated names reuse their index.
    Numbered,
    /// `?` for every occurrence.
    Question,
}

/// SQL rewritten to positional placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSql {
    pub sql: String,
    /// Parameter name for each positional argument, in bind order.
    pub binds: Vec<String>,
}

enum Token<'a> {
    Text(&'a str),
    Param(&'a str),
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn tokenize(sql: &str) -> Vec<Token<'_>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 2;
            }
            b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
            b':' if bytes.get(i + 1).copied().is_some_and(is_ident_start) => {
                if start < i {
                    tokens.push(Token::Text(&sql[start..i]));
                }
                let name_start = i + 1;
                i = name_start;
                while i < bytes.len() && is_ident(bytes[i]) {
                    i += 1;
                }
                tokens.push(Token::Param(&sql[name_start..i]));
                start = i;
            }
            _ => i += 1,
        }
    }

    let end = i.min(bytes.len());
    if start < end {
        tokens.push(Token::Text(&sql[start..end]));
    }
    tokens
}

/// Names of all placeholders in `sql`.
pub fn placeholders(sql: &str) -> BTreeSet<String> {
    tokenize(sql)
        .into_iter()
        .filter_map(|token| match token {
            Token::Param(name) => Some(name.to_string()),
            Token::Text(_) => None,
        })
        .collect()
}

/// Rewrite `:name` placeholders into the given positional style.
pub fn rewrite(sql: &str, style: PlaceholderStyle) -> PreparedSql {
    let mut out = String::with_capacity(sql.len());
    let mut binds: Vec<String> = Vec::new();
    let mut indexes: BTreeMap<&str, usize> = BTreeMap::new();

    for token in tokenize(sql) {
        match (token, style) {
            (Token::Text(text), _) => out.push_str(text),
            (Token::Param(name), PlaceholderStyle::Question) => {
                out.push('?');
                binds.push(name.to_string());
            }
            (Token::Param(name), PlaceholderStyle::Numbered) => {
                let index = *indexes.entry(name).or_insert_with(|| {
                    binds.push(name.to_string());
                    binds.len()
                });
                out.push('$');
                out.push_str(&index.to_string());
            }
        }
    }

    PreparedSql { sql: out, binds }
}

/// Check that `params` provides exactly the placeholders of `sql`.
pub fn check_parameters(query: &str, sql: &str, params: &ParameterSet) -> Result<(), QueryError> {
    let expected = placeholders(sql);
    if params.keys().eq(expected.iter()) {
        return Ok(());
    }
    Err(QueryError::ParameterMismatch {
        query: query.to_string(),
        expected: expected.into_iter().collect(),
        got: params.keys().cloned().collect(),
    })
}

/// Bind parameter values to a prepared statement in bind order.
pub fn bind<'q, DB>(
    prepared: &'q PreparedSql,
    params: &ParameterSet,
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    bool: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    f64: Encode<'q, DB> + Type<DB>,
    String: Encode<'q, DB> + Type<DB>,
    Option<String>: Encode<'q, DB>,
{
    let mut query = sqlx::query(&prepared.sql);
    for name in &prepared.binds {
        query = match params.get(name) {
            None | Some(serde_json::Value::Null) => query.bind(None::<String>),
            Some(serde_json::Value::Bool(b)) => query.bind(*b),
            Some(serde_json::Value::Number(n)) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Some(serde_json::Value::String(s)) => query.bind(s.clone()),
            Some(other) => query.bind(other.to_string()),
        };
    }
    query
}
