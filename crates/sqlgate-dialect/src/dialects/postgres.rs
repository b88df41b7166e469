//! PostgreSQL: native `ON CONFLICT`, `$n` placeholders.

use crate::adapter::{DialectAdapter, KeyCache, bare_table_name};
use crate::capabilities::DialectCapabilities;
use sqlgate_core::Value;

/// PostgreSQL adapter.
#[derive(Debug, Default)]
pub struct Postgres {
    keys: KeyCache,
}

impl Postgres {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DialectAdapter for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities::on_conflict()
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn primary_key_query(&self, table: &str) -> (String, Vec<Value>) {
        let mut sql = String::from(
            "SELECT kcu.column_name FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
             ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_name = $1",
        );
        let mut args = vec![Value::Text(bare_table_name(table).to_string())];
        if let Some((schema, _)) = table.rsplit_once('.') {
            sql.push_str(" AND tc.table_schema = $2");
            args.push(Value::Text(schema.to_string()));
        }
        sql.push_str(" ORDER BY kcu.ordinal_position");
        (sql, args)
    }

    fn key_cache(&self) -> &KeyCache {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_and_quoting() {
        let pg = Postgres::new();
        assert_eq!(pg.placeholder(3), "$3");
        assert_eq!(pg.quote("public.users"), "\"public\".\"users\"");
        assert_eq!(pg.chars(), ('"', '"'));
    }

    #[test]
    fn test_primary_key_query_with_schema() {
        let (sql, args) = Postgres::new().primary_key_query("app.users");
        assert!(sql.contains("tc.table_schema = $2"));
        assert_eq!(
            args,
            vec![Value::Text("users".into()), Value::Text("app".into())]
        );
    }

    #[test]
    fn test_filter_is_identity() {
        let (sql, args) = Postgres::new()
            .filter("SELECT NOW()".to_string(), vec![Value::Int(1)])
            .unwrap();
        assert_eq!(sql, "SELECT NOW()");
        assert_eq!(args, vec![Value::Int(1)]);
    }
}
