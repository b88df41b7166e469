//! sqlgate - transactional execution and dialect-aware upserts.
//!
//! sqlgate sits between application code and a relational database:
//!
//! - Units of work attach to transactions under seven propagation modes,
//!   with savepoints for nested work and rollback on error, panic or
//!   cancellation
//! - `save`, `replace` and `insert_ignore` synthesize the right upsert for
//!   each engine (`ON CONFLICT`, `MERGE`, or probe-then-insert)
//! - Affected-row counts are normalized across engines
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlgate::prelude::*;
//! use std::sync::Arc;
//!
//! async fn example(cx: &Cx) -> Outcome<(), Error> {
//!     let provider = SqliteProvider::new(SqliteConfig::file("app.db"));
//!     let db = Database::new(Arc::new(provider), Arc::new(Sqlite::new()));
//!     let ctx = TxContext::new();
//!
//!     db.transaction(cx, &ctx, |ctx| async move {
//!         let rows = [Record::new().with("id", 1_i64).with("name", "Ada")];
//!         try_outcome!(db.save(cx, &ctx, "users", &rows, &WriteOptions::new()).await);
//!         Outcome::Ok(())
//!     })
//!     .await
//! }
//! ```

pub mod database;

pub use database::{Database, DatabaseConfig};

pub use sqlgate_core::{
    ConnectionProvider, Cx, Error, ExecResult, IsolationLevel, Link, LinkRole, LinkTarget,
    Outcome, RawConnection, Result, Row, Value, try_outcome,
};
pub use sqlgate_dialect::{
    DialectAdapter, DialectCapabilities, Generic, NativeUpsert, Oracle, Postgres, Record,
    SqlServer, Sqlite, UpdateValue, UpsertMode, WriteOptions, WriteResult, adapter_for,
};
pub use sqlgate_tx::{HandleState, Propagation, TransactionHandle, TransactionManager, TxContext, TxOptions};

#[cfg(feature = "sqlite")]
pub use sqlgate_sqlite::{JournalMode, SqliteConfig, SqliteConnection, SqliteProvider};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use sqlgate::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Cx, Database, DatabaseConfig, Error, Link, LinkTarget, Outcome, Propagation, Record,
        Result, Row, TxContext, TxOptions, UpdateValue, Value, WriteOptions, WriteResult,
        try_outcome,
    };
    pub use crate::{Oracle, Postgres, SqlServer, Sqlite};

    #[cfg(feature = "sqlite")]
    pub use crate::{SqliteConfig, SqliteProvider};
}
