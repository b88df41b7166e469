//! Oracle: `MERGE` upserts without updating ON-clause columns, `:n`
//! placeholders, bare identifiers with reserved-word escaping.

use crate::adapter::{DialectAdapter, KeyCache, bare_table_name, quote_with};
use crate::capabilities::DialectCapabilities;
use sqlgate_core::Value;

/// Words Oracle rejects as bare column names.
const RESERVED_WORDS: &[&str] = &[
    "ACCESS", "COMMENT", "FILE", "LEVEL", "MODE", "NUMBER", "RESOURCE", "ROWID", "ROWNUM",
    "SESSION", "SIZE", "UID", "USER",
];

/// Oracle adapter.
///
/// Identifiers are emitted bare so they resolve case-insensitively like
/// hand-written Oracle SQL. Names that are not plain identifiers are quoted
/// as written; reserved words are quoted in upper case. Raw SQL fragments
/// never pass through [`quote`](DialectAdapter::quote) and are sent as is.
#[derive(Debug, Default)]
pub struct Oracle {
    keys: KeyCache,
}

impl Oracle {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_plain_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '#'))
}

fn is_reserved(part: &str) -> bool {
    RESERVED_WORDS.iter().any(|w| w.eq_ignore_ascii_case(part))
}

impl DialectAdapter for Oracle {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities::merge('"', '"', false)
    }

    fn placeholder(&self, index: usize) -> String {
        format!(":{index}")
    }

    fn quote(&self, ident: &str) -> String {
        ident
            .split('.')
            .map(|part| {
                if !is_plain_identifier(part) {
                    quote_with('"', '"', part)
                } else if is_reserved(part) {
                    quote_with('"', '"', &part.to_ascii_uppercase())
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    fn primary_key_query(&self, table: &str) -> (String, Vec<Value>) {
        let mut sql = String::from(
            "SELECT cols.column_name FROM all_constraints cons \
             JOIN all_cons_columns cols \
             ON cons.constraint_name = cols.constraint_name AND cons.owner = cols.owner \
             WHERE cons.constraint_type = 'P' AND cons.table_name = UPPER(:1)",
        );
        let mut args = vec![Value::Text(bare_table_name(table).to_string())];
        if let Some((schema, _)) = table.rsplit_once('.') {
            sql.push_str(" AND cons.owner = UPPER(:2)");
            args.push(Value::Text(schema.to_string()));
        }
        sql.push_str(" ORDER BY cols.position");
        (sql, args)
    }

    fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    fn supports_multi_row_values(&self) -> bool {
        false
    }

    fn select_suffix(&self) -> &'static str {
        " FROM DUAL"
    }
}
