//! The caller-facing entry point.
//!
//! A [`Database`] ties a [`ConnectionProvider`] and a [`DialectAdapter`]
//! together: write operations attach to transactions through the
//! [`TransactionManager`], then run through a [`WriteExecutor`] on whatever
//! link the propagation rule resolved to.

use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use sqlgate_core::{ConnectionProvider, Error, ExecResult, Link, LinkTarget, Row, Value, try_outcome};
use sqlgate_dialect::{
    DEFAULT_BATCH_SIZE, DialectAdapter, Record, UpsertMode, WriteExecutor, WriteOptions, WriteResult,
};
use sqlgate_tx::{Propagation, TransactionHandle, TransactionManager, TxContext, TxOptions};
use std::future::Future;
use std::sync::Arc;

/// Settings for a [`Database`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Where connections are acquired from.
    pub target: LinkTarget,
    /// Audit columns `save` leaves untouched on rows that already exist.
    pub soft_created_columns: Vec<String>,
    /// Rows per statement for the batched strategies.
    pub batch_size: usize,
    /// How write operations attach to the caller's transaction.
    pub write_propagation: Propagation,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            target: LinkTarget::master(),
            soft_created_columns: vec!["created_at".to_string()],
            batch_size: DEFAULT_BATCH_SIZE,
            write_propagation: Propagation::Required,
        }
    }
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, target: LinkTarget) -> Self {
        self.target = target;
        self
    }

    pub fn soft_created_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.soft_created_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn write_propagation(mut self, propagation: Propagation) -> Self {
        self.write_propagation = propagation;
        self
    }
}

/// Transactional access to one database through one dialect.
///
/// Cheap to clone; clones share the provider and the adapter (including its
/// primary-key cache).
#[derive(Debug, Clone)]
pub struct Database {
    manager: TransactionManager,
    executor: WriteExecutor,
    config: DatabaseConfig,
}

impl Database {
    /// A database with the default configuration.
    pub fn new(provider: Arc<dyn ConnectionProvider>, adapter: Arc<dyn DialectAdapter>) -> Self {
        Self::with_config(provider, adapter, DatabaseConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn ConnectionProvider>,
        adapter: Arc<dyn DialectAdapter>,
        config: DatabaseConfig,
    ) -> Self {
        let manager = TransactionManager::new(provider).with_target(config.target.clone());
        let executor = WriteExecutor::new(adapter)
            .soft_created_columns(config.soft_created_columns.clone())
            .batch_size(config.batch_size);
        Self {
            manager,
            executor,
            config,
        }
    }

    /// A copy of this database acquiring connections for `target`.
    #[must_use]
    pub fn with_target(&self, target: LinkTarget) -> Self {
        let mut db = self.clone();
        db.manager = db.manager.with_target(target.clone());
        db.config.target = target;
        db
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    pub fn adapter(&self) -> &Arc<dyn DialectAdapter> {
        self.executor.adapter()
    }

    /// Begin a transaction owned by the caller.
    ///
    /// The handle is independent of any transaction current in `ctx`; bind
    /// it with [`TxContext::with_handle`] so later calls join it, and finish
    /// it with `commit`, `rollback` or `close`.
    pub async fn begin(&self, cx: &Cx, ctx: &TxContext) -> Outcome<Arc<TransactionHandle>, Error> {
        if ctx.in_transaction() {
            tracing::debug!(depth = ctx.depth(), "Beginning an independent transaction");
        }
        self.manager.begin(cx, &TxOptions::new()).await
    }

    /// Run `work` in a transaction, joining the one current in `ctx`.
    pub async fn transaction<T, F, Fut>(&self, cx: &Cx, ctx: &TxContext, work: F) -> Outcome<T, Error>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        self.manager.transaction(cx, ctx, work).await
    }

    /// Run `work` under `options` relative to `ctx`.
    pub async fn transaction_with_options<T, F, Fut>(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        options: TxOptions,
        work: F,
    ) -> Outcome<T, Error>
    where
        F: FnOnce(TxContext) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        self.manager
            .run_with_propagation(cx, ctx, options, work)
            .await
    }

    /// Run a query on the transaction current in `ctx`, or on a fresh
    /// connection when there is none.
    pub async fn query(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<Row>, Error> {
        if let Some(handle) = ctx.active() {
            return handle.query(cx, sql, params).await;
        }
        let conn = try_outcome!(self.manager.provider().acquire(cx, self.manager.target()).await);
        conn.as_link().query(cx, sql, params).await
    }

    /// Execute a statement on the transaction current in `ctx`, or on a
    /// fresh connection when there is none.
    pub async fn execute(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        sql: &str,
        params: &[Value],
    ) -> Outcome<ExecResult, Error> {
        if let Some(handle) = ctx.active() {
            return handle.execute(cx, sql, params).await;
        }
        let conn = try_outcome!(self.manager.provider().acquire(cx, self.manager.target()).await);
        conn.as_link().execute(cx, sql, params).await
    }

    /// Insert `rows`. A collision with an existing key is an error.
    pub async fn insert(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
    ) -> Outcome<WriteResult, Error> {
        self.write(cx, ctx, table, rows, options, None).await
    }

    /// Insert `rows`, updating the rows they collide with.
    pub async fn save(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
    ) -> Outcome<WriteResult, Error> {
        self.write(cx, ctx, table, rows, options, Some(UpsertMode::Save))
            .await
    }

    /// Insert `rows`, overwriting every non-key column of colliding rows.
    pub async fn replace(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
    ) -> Outcome<WriteResult, Error> {
        self.write(cx, ctx, table, rows, options, Some(UpsertMode::Replace))
            .await
    }

    /// Insert the `rows` that do not collide; colliding rows are skipped.
    pub async fn insert_ignore(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
    ) -> Outcome<WriteResult, Error> {
        self.write(cx, ctx, table, rows, options, Some(UpsertMode::Ignore))
            .await
    }

    async fn write(
        &self,
        cx: &Cx,
        ctx: &TxContext,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
        mode: Option<UpsertMode>,
    ) -> Outcome<WriteResult, Error> {
        let tx = TxOptions::with_propagation(self.config.write_propagation);
        self.manager
            .run_with_propagation(cx, ctx, tx, |ctx| async move {
                match ctx.active() {
                    Some(handle) => self.run_write(cx, &*handle, table, rows, options, mode).await,
                    None => {
                        let conn = try_outcome!(
                            self.manager.provider().acquire(cx, self.manager.target()).await
                        );
                        self.run_write(cx, conn.as_link(), table, rows, options, mode)
                            .await
                    }
                }
            })
            .await
    }

    async fn run_write(
        &self,
        cx: &Cx,
        link: &dyn Link,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
        mode: Option<UpsertMode>,
    ) -> Outcome<WriteResult, Error> {
        match mode {
            None => self.executor.insert(cx, link, table, rows, options).await,
            Some(mode) => {
                self.executor
                    .upsert(cx, link, table, rows, options, mode)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use sqlgate_core::testing::{MockDb, MockResponse};
    use sqlgate_dialect::{Oracle, Postgres};

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn row(id: i64, name: &str) -> Record {
        Record::new().with("id", id).with("name", name)
    }

    #[test]
    fn test_config_defaults_and_serde() {
        let config = DatabaseConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.write_propagation, Propagation::Required);
        assert_eq!(config.soft_created_columns, vec!["created_at"]);

        let parsed: DatabaseConfig =
            serde_json::from_str(r#"{"batch_size": 50, "target": {"role": "Slave", "schema": "audit"}}"#)
                .unwrap();
        assert_eq!(parsed.batch_size, 50);
        assert_eq!(parsed.target, LinkTarget::slave().schema("audit"));
        assert_eq!(parsed.write_propagation, Propagation::Required);
        assert_eq!(DatabaseConfig::new().batch_size(0).batch_size, 1);
    }

    #[test]
    fn test_write_joins_an_owned_transaction() {
        let db_script = MockDb::new();
        let db = Database::new(Arc::new(db_script.provider()), Arc::new(Postgres::new()));
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let result = unwrap_outcome(
                db.save(
                    &cx,
                    &TxContext::new(),
                    "users",
                    &[row(1, "a")],
                    &WriteOptions::new().conflict_keys(["id"]),
                )
                .await,
            );
            assert_eq!(result.affected, 1);
        });
        let log = db_script.statements();
        assert_eq!(log.first().map(String::as_str), Some("BEGIN"));
        assert!(log[1].starts_with("INSERT INTO \"users\""));
        assert_eq!(log.last().map(String::as_str), Some("COMMIT"));
        assert_eq!(db_script.acquired(), db_script.released());
    }

    #[test]
    fn test_merge_quirk_normalized_through_database() {
        let db_script = MockDb::new();
        db_script.on("MERGE INTO", MockResponse::Affected(0));
        let db = Database::new(Arc::new(db_script.provider()), Arc::new(Oracle::new()));
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let result = unwrap_outcome(
                db.save(
                    &cx,
                    &TxContext::new(),
                    "users",
                    &[row(1, "a"), row(2, "b"), row(3, "c")],
                    &WriteOptions::new().conflict_keys(["id"]),
                )
                .await,
            );
            assert_eq!(result.affected, 3);
        });
    }

    #[test]
    fn test_supports_without_transaction_uses_a_plain_connection() {
        let db_script = MockDb::new();
        let db = Database::with_config(
            Arc::new(db_script.provider()),
            Arc::new(Postgres::new()),
            DatabaseConfig::new().write_propagation(Propagation::Supports),
        );
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            unwrap_outcome(
                db.insert(&cx, &TxContext::new(), "users", &[row(1, "a")], &WriteOptions::new())
                    .await,
            );
        });
        let log = db_script.statements();
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("INSERT INTO \"users\""));
    }

    #[test]
    fn test_write_errors_carry_context_and_roll_back() {
        let db_script = MockDb::new();
        db_script.on("INSERT", MockResponse::Fail("disk full".into()));
        let db = Database::new(Arc::new(db_script.provider()), Arc::new(Postgres::new()));
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let out = db
                .replace(
                    &cx,
                    &TxContext::new(),
                    "users",
                    &[row(1, "a")],
                    &WriteOptions::new().conflict_keys(["id"]),
                )
                .await;
            match out {
                Outcome::Err(Error::Write(w)) => {
                    assert_eq!(w.operation, "replace");
                    assert_eq!(w.table, "users");
                    assert_eq!(w.dialect, "postgres");
                }
                Outcome::Err(e) => panic!("expected a write error, got {e}"),
                _ => panic!("expected a write error"),
            }
        });
        assert_eq!(db_script.statements().last().map(String::as_str), Some("ROLLBACK"));
    }
}
