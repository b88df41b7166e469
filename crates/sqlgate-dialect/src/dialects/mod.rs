//! Built-in dialect adapters.

mod generic;
mod mssql;
mod oracle;
mod postgres;
mod sqlite;

pub use generic::Generic;
pub use mssql::SqlServer;
pub use oracle::Oracle;
pub use postgres::Postgres;
pub use sqlite::Sqlite;

use regex::Regex;
use sqlgate_core::{DialectErrorKind, Error, Result};
use std::sync::OnceLock;

/// Compile `pattern` once and cache it in `cell`.
pub(crate) fn cached_regex(
    cell: &'static OnceLock<Option<Regex>>,
    dialect: &'static str,
    pattern: &str,
) -> Result<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .ok_or_else(|| {
            Error::dialect(
                DialectErrorKind::InvalidInput,
                dialect,
                format!("filter pattern failed to compile: {pattern}"),
            )
        })
}

/// Apply `rewrite` to every part of `sql` outside single-quoted literals.
pub(crate) fn rewrite_outside_literals(
    sql: &str,
    mut rewrite: impl FnMut(&str) -> String,
) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    loop {
        let Some(open) = rest.find('\'') else {
            out.push_str(&rewrite(rest));
            return out;
        };
        out.push_str(&rewrite(&rest[..open]));
        let literal = &rest[open..];
        // Closing quote; a doubled quote re-opens immediately and is handled
        // by the next iteration.
        let close = literal[1..].find('\'').map_or(literal.len(), |i| i + 2);
        out.push_str(&literal[..close]);
        rest = &literal[close..];
    }
}

/// Replace calls to the zero-argument `NOW()` function with `replacement`.
pub(crate) fn alias_now(
    sql: &str,
    cell: &'static OnceLock<Option<Regex>>,
    dialect: &'static str,
    replacement: &str,
) -> Result<String> {
    let re = cached_regex(cell, dialect, r"(?i)\bNOW\s*\(\s*\)")?;
    Ok(rewrite_outside_literals(sql, |part| {
        re.replace_all(part, replacement).into_owned()
    }))
}
