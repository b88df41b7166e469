//! SQLite: native `ON CONFLICT`, `?n` placeholders, `PRAGMA table_info`
//! key discovery.

use super::alias_now;
use crate::adapter::{DialectAdapter, KeyCache, bare_table_name};
use crate::capabilities::DialectCapabilities;
use regex::Regex;
use sqlgate_core::{Result, Row, Value};
use std::sync::OnceLock;

static NOW_FN: OnceLock<Option<Regex>> = OnceLock::new();

/// SQLite adapter.
#[derive(Debug, Default)]
pub struct Sqlite {
    keys: KeyCache,
}

impl Sqlite {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DialectAdapter for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities::on_conflict()
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }

    fn primary_key_query(&self, table: &str) -> (String, Vec<Value>) {
        let pragma = match table.rsplit_once('.') {
            Some((schema, _)) => format!(
                "PRAGMA {}.table_info({})",
                self.quote(schema),
                self.quote(bare_table_name(table))
            ),
            None => format!("PRAGMA table_info({})", self.quote(table)),
        };
        (pragma, Vec::new())
    }

    fn primary_keys_from_rows(&self, rows: &[Row]) -> Vec<String> {
        // `pk` is the 1-based position within the key, 0 for other columns.
        let mut keys: Vec<(i64, String)> = rows
            .iter()
            .filter_map(|row| {
                let position = row.get_by_name("pk").and_then(Value::as_i64)?;
                let name = row.get_by_name("name").and_then(Value::as_str)?;
                (position > 0).then(|| (position, name.to_string()))
            })
            .collect();
        keys.sort_by_key(|(position, _)| *position);
        keys.into_iter().map(|(_, name)| name).collect()
    }

    fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    fn filter(&self, sql: String, args: Vec<Value>) -> Result<(String, Vec<Value>)> {
        Ok((alias_now(&sql, &NOW_FN, "sqlite", "CURRENT_TIMESTAMP")?, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, pk: i64) -> Row {
        Row::new(
            vec!["cid".into(), "name".into(), "pk".into()],
            vec![Value::BigInt(0), Value::Text(name.into()), Value::BigInt(pk)],
        )
    }

    #[test]
    fn test_pragma_rows_are_ordered_by_key_position() {
        let rows = vec![column("b", 2), column("note", 0), column("a", 1)];
        assert_eq!(Sqlite::new().primary_keys_from_rows(&rows), vec!["a", "b"]);
    }

    #[test]
    fn test_pragma_query() {
        let s = Sqlite::new();
        assert_eq!(s.primary_key_query("t").0, "PRAGMA table_info(\"t\")");
        assert_eq!(
            s.primary_key_query("aux.t").0,
            "PRAGMA \"aux\".table_info(\"t\")"
        );
    }

    #[test]
    fn test_now_is_aliased() {
        let (sql, _) = Sqlite::new()
            .filter("UPDATE t SET at = NOW()".into(), Vec::new())
            .unwrap();
        assert_eq!(sql, "UPDATE t SET at = CURRENT_TIMESTAMP");
    }
}
