//! The per-backend dialect seam.

use crate::capabilities::DialectCapabilities;
use asupersync::{Cx, Outcome};
use sqlgate_core::{BoxFuture, Error, Link, Result, Row, Value, try_outcome};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Per-table primary-key cache owned by an adapter.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: Mutex<HashMap<String, Vec<String>>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str) -> Option<Vec<String>> {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }

    pub fn insert(&self, table: &str, keys: Vec<String>) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), keys);
    }

    /// Forget the cached key of `table` (after a schema change).
    pub fn invalidate(&self, table: &str) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(table);
    }

    pub fn clear(&self) {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Quote a possibly schema-qualified identifier with `left`/`right`.
///
/// Each dot-separated part is quoted separately; embedded closing quote
/// characters are doubled. `*` and parts that are already quoted are left
/// as they are.
pub fn quote_with(left: char, right: char, ident: &str) -> String {
    ident
        .split('.')
        .map(|part| {
            if part == "*" || (part.starts_with(left) && part.ends_with(right) && part.len() > 1) {
                part.to_string()
            } else {
                let doubled: String = [right, right].iter().collect();
                format!("{left}{}{right}", part.replace(right, &doubled))
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Last segment of a possibly schema-qualified table name.
pub fn bare_table_name(table: &str) -> &str {
    table.rsplit('.').next().unwrap_or(table)
}

/// Dialect-specific behaviour for one backend.
///
/// Adapters are pure apart from primary-key discovery, which runs an
/// introspection query through the caller's [`Link`] and caches the result
/// per table.
pub trait DialectAdapter: Send + Sync {
    /// Short backend name used in logs and error context.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> DialectCapabilities;

    /// The identifier quote pair.
    fn chars(&self) -> (char, char) {
        let caps = self.capabilities();
        (caps.quote_left, caps.quote_right)
    }

    /// Placeholder for the 1-based argument `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Quote an identifier for this backend.
    fn quote(&self, ident: &str) -> String {
        let (left, right) = self.chars();
        quote_with(left, right, ident)
    }

    /// Introspection statement listing the primary-key columns of `table`.
    fn primary_key_query(&self, table: &str) -> (String, Vec<Value>);

    /// Extract key column names, in key order, from the introspection rows.
    fn primary_keys_from_rows(&self, rows: &[Row]) -> Vec<String> {
        rows.iter()
            .filter_map(|row| row.get(0).and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Cache backing [`primary_keys`](Self::primary_keys).
    fn key_cache(&self) -> &KeyCache;

    /// Primary-key columns of `table`, discovered through `link`.
    ///
    /// An empty list means the table has no primary key.
    fn primary_keys<'a>(
        &'a self,
        cx: &'a Cx,
        link: &'a dyn Link,
        table: &'a str,
    ) -> BoxFuture<'a, Outcome<Vec<String>, Error>> {
        Box::pin(async move {
            if let Some(keys) = self.key_cache().get(table) {
                return Outcome::Ok(keys);
            }
            let (sql, args) = self.primary_key_query(table);
            tracing::trace!(dialect = self.name(), sql = %sql, "Primary key introspection");
            let rows = try_outcome!(link.query(cx, &sql, &args).await);
            let keys = self.primary_keys_from_rows(&rows);
            tracing::debug!(dialect = self.name(), table, keys = ?keys, "Discovered primary key");
            self.key_cache().insert(table, keys.clone());
            Outcome::Ok(keys)
        })
    }

    /// Last-mile rewrite applied to every statement this crate synthesizes.
    fn filter(&self, sql: String, args: Vec<Value>) -> Result<(String, Vec<Value>)> {
        Ok((sql, args))
    }

    /// Whether one `INSERT` may carry several `VALUES` tuples.
    fn supports_multi_row_values(&self) -> bool {
        true
    }

    /// Appended to each `SELECT` of a MERGE source (`" FROM DUAL"`).
    fn select_suffix(&self) -> &'static str {
        ""
    }

    /// Appended to MERGE statements.
    fn merge_terminator(&self) -> &'static str {
        ""
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_with() {
        assert_eq!(quote_with('"', '"', "users"), "\"users\"");
        assert_eq!(quote_with('"', '"', "main.users"), "\"main\".\"users\"");
        assert_eq!(quote_with('"', '"', "we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_with('[', ']', "a]b"), "[a]]b]");
        assert_eq!(quote_with('[', ']', "[done]"), "[done]");
        assert_eq!(quote_with('"', '"', "t.*"), "\"t\".*");
    }

    #[test]
    fn test_bare_table_name() {
        assert_eq!(bare_table_name("public.users"), "users");
        assert_eq!(bare_table_name("users"), "users");
    }

    #[test]
    fn test_key_cache() {
        let cache = KeyCache::new();
        assert!(cache.get("t").is_none());
        cache.insert("t", vec!["id".into()]);
        assert_eq!(cache.get("t"), Some(vec!["id".to_string()]));
        cache.invalidate("t");
        assert!(cache.get("t").is_none());
    }
}
