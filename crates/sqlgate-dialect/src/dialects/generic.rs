//! Fallback for engines without native upsert syntax.

use crate::adapter::{DialectAdapter, KeyCache, bare_table_name};
use crate::capabilities::DialectCapabilities;
use sqlgate_core::Value;

/// Standard-SQL adapter with `?` placeholders and no native upsert.
///
/// `insert_ignore` checks each row for a match before inserting it; `save` and
/// `replace` update each row by key and insert it when nothing matched.
#[derive(Debug, Default)]
pub struct Generic {
    keys: KeyCache,
}

impl Generic {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DialectAdapter for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities::none()
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn primary_key_query(&self, table: &str) -> (String, Vec<Value>) {
        (
            "SELECT kcu.column_name FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
             ON tc.constraint_name = kcu.constraint_name \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_name = ? \
             ORDER BY kcu.ordinal_position"
                .to_string(),
            vec![Value::Text(bare_table_name(table).to_string())],
        )
    }

    fn key_cache(&self) -> &KeyCache {
        &self.keys
    }
}
