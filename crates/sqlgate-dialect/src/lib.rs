//! Dialect adapters, upsert synthesis and write execution for sqlgate.
//!
//! Each supported backend is described by a [`DialectAdapter`]: its
//! quoting, placeholder style, native upsert syntax, primary-key
//! introspection and a last-mile SQL filter. The [`upsert`] module turns
//! save / replace / insert-ignore requests into dialect-specific plans, and
//! [`WriteExecutor`] runs those plans over any [`Link`](sqlgate_core::Link),
//! normalizing affected-row counts and duplicate-key recovery.
//!
//! | Adapter | Upsert | Quotes | Placeholders |
//! |---|---|---|---|
//! | [`Postgres`] | `ON CONFLICT` | `"x"` | `$1` |
//! | [`Sqlite`] | `ON CONFLICT` | `"x"` | `?1` |
//! | [`SqlServer`] | `MERGE` | `[x]` | `@P1` |
//! | [`Oracle`] | `MERGE` | bare | `:1` |
//! | [`Generic`] | update, then insert on a miss | `"x"` | `?` |

pub mod adapter;
pub mod capabilities;
pub mod dialects;
pub mod executor;
pub mod record;
pub mod upsert;

pub use adapter::{DialectAdapter, KeyCache, bare_table_name, quote_with};
pub use capabilities::{DialectCapabilities, NativeUpsert};
pub use dialects::{Generic, Oracle, Postgres, SqlServer, Sqlite};
pub use executor::{WriteExecutor, WriteOptions, WriteResult};
pub use record::Record;
pub use upsert::{
    DEFAULT_BATCH_SIZE, Plan, Statement, Step, Strategy, UpdateValue, UpsertMode, UpsertSpec,
    synthesize, synthesize_insert,
};

use std::sync::Arc;

/// Adapter for a backend name as used in configuration (`"postgres"`,
/// `"sqlite"`, `"mssql"`, `"oracle"`). Unknown names get [`Generic`].
pub fn adapter_for(name: &str) -> Arc<dyn DialectAdapter> {
    match name.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" | "pg" => Arc::new(Postgres::new()),
        "sqlite" | "sqlite3" => Arc::new(Sqlite::new()),
        "mssql" | "sqlserver" => Arc::new(SqlServer::new()),
        "oracle" => Arc::new(Oracle::new()),
        _ => Arc::new(Generic::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_for() {
        assert_eq!(adapter_for("PostgreSQL").name(), "postgres");
        assert_eq!(adapter_for("sqlite").name(), "sqlite");
        assert_eq!(adapter_for("sqlserver").name(), "mssql");
        assert_eq!(adapter_for("oracle").name(), "oracle");
        assert_eq!(adapter_for("db2").name(), "generic");
    }
}
