//! SQL Server: `MERGE` upserts, `[ ]` quoting, `@Pn` placeholders.

use super::alias_now;
use crate::adapter::{DialectAdapter, KeyCache, bare_table_name};
use crate::capabilities::DialectCapabilities;
use regex::Regex;
use sqlgate_core::{Result, Value};
use std::sync::OnceLock;

static NOW_FN: OnceLock<Option<Regex>> = OnceLock::new();

/// Microsoft SQL Server adapter.
#[derive(Debug, Default)]
pub struct SqlServer {
    keys: KeyCache,
}

impl SqlServer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DialectAdapter for SqlServer {
    fn name(&self) -> &'static str {
        "mssql"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities::merge('[', ']', true)
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{index}")
    }

    fn primary_key_query(&self, table: &str) -> (String, Vec<Value>) {
        let mut sql = String::from(
            "SELECT kcu.COLUMN_NAME FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
             JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
             ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA \
             WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' AND tc.TABLE_NAME = @P1",
        );
        let mut args = vec![Value::Text(bare_table_name(table).to_string())];
        if let Some((schema, _)) = table.rsplit_once('.') {
            sql.push_str(" AND tc.TABLE_SCHEMA = @P2");
            args.push(Value::Text(schema.to_string()));
        }
        sql.push_str(" ORDER BY kcu.ORDINAL_POSITION");
        (sql, args)
    }

    fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    fn filter(&self, sql: String, args: Vec<Value>) -> Result<(String, Vec<Value>)> {
        Ok((alias_now(&sql, &NOW_FN, "mssql", "GETDATE()")?, args))
    }

    fn merge_terminator(&self) -> &'static str {
        ";"
    }
}
