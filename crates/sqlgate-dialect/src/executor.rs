//! Executes synthesized write plans against a [`Link`].
//!
//! The executor resolves conflict keys (explicit, else the table's primary
//! key), asks the synthesizer for a [`Plan`], runs it statement by statement
//! and folds the engine's counts into a [`WriteResult`]. Two engine quirks
//! are normalized here:
//!
//! - some MERGE implementations report 0 affected rows for an upsert that
//!   did write; such a count is reported as one row per incoming row
//! - duplicate-key failures in ignore mode, and races between an existence
//!   probe and its insert, count as skipped rows instead of errors

use crate::adapter::DialectAdapter;
use crate::capabilities::NativeUpsert;
use crate::record::Record;
use crate::upsert::{
    DEFAULT_BATCH_SIZE, Plan, Statement, Step, UpdateValue, UpsertMode, UpsertSpec, synthesize,
    synthesize_insert,
};
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use sqlgate_core::{Error, ExecResult, Link, try_outcome};
use std::sync::Arc;

/// Per-call write options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
    /// Collision columns; empty means the table's primary key.
    pub conflict_keys: Vec<String>,
    /// Assignments applied to colliding rows by `save`.
    pub on_duplicate: Vec<(String, UpdateValue)>,
    /// Overrides the executor's batch size.
    pub batch_size: Option<usize>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conflict_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflict_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_duplicate(mut self, column: impl Into<String>, value: UpdateValue) -> Self {
        self.on_duplicate.push((column.into(), value));
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Outcome of one write operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Rows inserted or updated, normalized across engines.
    pub affected: u64,
    /// Engine-reported id of the last inserted row, when available.
    pub last_insert_id: Option<i64>,
}

impl WriteResult {
    fn absorb(&mut self, result: ExecResult) {
        self.affected += result.rows_affected;
        if result.last_insert_id.is_some() {
            self.last_insert_id = result.last_insert_id;
        }
    }
}

/// Runs inserts and upserts through one dialect.
#[derive(Clone)]
pub struct WriteExecutor {
    adapter: Arc<dyn DialectAdapter>,
    soft_created_columns: Vec<String>,
    batch_size: usize,
}

impl std::fmt::Debug for WriteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteExecutor")
            .field("dialect", &self.adapter.name())
            .field("soft_created_columns", &self.soft_created_columns)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl WriteExecutor {
    pub fn new(adapter: Arc<dyn DialectAdapter>) -> Self {
        Self {
            adapter,
            soft_created_columns: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Columns `save` never overwrites on colliding rows.
    #[must_use]
    pub fn soft_created_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.soft_created_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn adapter(&self) -> &Arc<dyn DialectAdapter> {
        &self.adapter
    }

    /// Insert `rows`; any collision is an error.
    #[tracing::instrument(level = "debug", skip(self, cx, link, rows, options), fields(dialect = self.adapter.name(), rows = rows.len()))]
    pub async fn insert(
        &self,
        cx: &Cx,
        link: &dyn Link,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
    ) -> Outcome<WriteResult, Error> {
        let batch = options.batch_size.unwrap_or(self.batch_size);
        let plan = match synthesize_insert(self.adapter.as_ref(), table, rows, batch) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e.with_context("insert", table, self.adapter.name())),
        };
        self.run_plan(cx, link, &plan, "insert").await
    }

    /// Insert `rows`, updating colliding rows.
    pub async fn save(
        &self,
        cx: &Cx,
        link: &dyn Link,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
    ) -> Outcome<WriteResult, Error> {
        self.upsert(cx, link, table, rows, options, UpsertMode::Save)
            .await
    }

    /// Insert `rows`, overwriting every non-key column of colliding rows.
    pub async fn replace(
        &self,
        cx: &Cx,
        link: &dyn Link,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
    ) -> Outcome<WriteResult, Error> {
        self.upsert(cx, link, table, rows, options, UpsertMode::Replace)
            .await
    }

    /// Insert `rows`, skipping colliding rows.
    pub async fn insert_ignore(
        &self,
        cx: &Cx,
        link: &dyn Link,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
    ) -> Outcome<WriteResult, Error> {
        self.upsert(cx, link, table, rows, options, UpsertMode::Ignore)
            .await
    }

    /// Run any upsert mode.
    #[tracing::instrument(level = "debug", skip(self, cx, link, rows, options), fields(dialect = self.adapter.name(), rows = rows.len()))]
    pub async fn upsert(
        &self,
        cx: &Cx,
        link: &dyn Link,
        table: &str,
        rows: &[Record],
        options: &WriteOptions,
        mode: UpsertMode,
    ) -> Outcome<WriteResult, Error> {
        let operation = mode.operation();
        let dialect = self.adapter.name();
        let keys = match self.conflict_keys(cx, link, table, options, mode).await {
            Outcome::Ok(keys) => keys,
            Outcome::Err(e) => return Outcome::Err(e.with_context(operation, table, dialect)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let spec = UpsertSpec {
            table: table.to_string(),
            rows: rows.to_vec(),
            mode,
            conflict_keys: keys,
            on_duplicate: options.on_duplicate.clone(),
            soft_created_columns: self.soft_created_columns.clone(),
            batch_size: options.batch_size.unwrap_or(self.batch_size),
        };
        let plan = match synthesize(self.adapter.as_ref(), &spec) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e.with_context(operation, table, dialect)),
        };
        tracing::debug!(
            operation,
            table,
            strategy = ?plan.strategy,
            keys = ?plan.conflict_keys,
            statements = plan.steps.len(),
            "Planned upsert"
        );
        self.run_plan(cx, link, &plan, operation).await
    }

    /// Explicit keys win; otherwise the primary key is discovered, except
    /// where the statement does not need it.
    async fn conflict_keys(
        &self,
        cx: &Cx,
        link: &dyn Link,
        table: &str,
        options: &WriteOptions,
        mode: UpsertMode,
    ) -> Outcome<Vec<String>, Error> {
        if !options.conflict_keys.is_empty() {
            return Outcome::Ok(options.conflict_keys.clone());
        }
        // ON CONFLICT DO NOTHING needs no target.
        if self.adapter.capabilities().native_upsert == NativeUpsert::OnConflict
            && mode == UpsertMode::Ignore
        {
            return Outcome::Ok(Vec::new());
        }
        self.adapter.primary_keys(cx, link, table).await
    }

    /// Run every step of `plan`, stopping at the first unrecovered error.
    pub async fn run_plan(
        &self,
        cx: &Cx,
        link: &dyn Link,
        plan: &Plan,
        operation: &'static str,
    ) -> Outcome<WriteResult, Error> {
        let dialect = self.adapter.name();
        let mut result = WriteResult::default();
        for step in &plan.steps {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let outcome = self.run_step(cx, link, plan, step, &mut result).await;
            match outcome {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    tracing::debug!(operation, table = %plan.table, error = %e, "Write failed");
                    return Outcome::Err(e.with_context(operation, &plan.table, dialect));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        tracing::debug!(
            operation,
            table = %plan.table,
            affected = result.affected,
            "Write finished"
        );
        Outcome::Ok(result)
    }

    async fn run_step(
        &self,
        cx: &Cx,
        link: &dyn Link,
        plan: &Plan,
        step: &Step,
        result: &mut WriteResult,
    ) -> Outcome<(), Error> {
        match step {
            Step::Exec(statement) => {
                let exec = try_outcome!(
                    self.exec(cx, link, statement, plan.recovers_duplicates())
                        .await
                );
                result.absorb(exec);
            }
            Step::Merge {
                statement,
                rows,
                upsert,
            } => {
                let mut exec = try_outcome!(
                    self.exec(cx, link, statement, plan.recovers_duplicates())
                        .await
                );
                if *upsert && exec.rows_affected == 0 {
                    tracing::warn!(
                        table = %plan.table,
                        rows,
                        "MERGE reported no affected rows; counting every incoming row"
                    );
                    exec.rows_affected = *rows;
                }
                result.absorb(exec);
            }
            Step::UpdateOrInsert { update, insert } => {
                let updated = try_outcome!(self.exec(cx, link, update, false).await);
                if updated.rows_affected > 0 {
                    result.absorb(updated);
                } else {
                    let inserted = try_outcome!(self.exec(cx, link, insert, false).await);
                    result.absorb(inserted);
                }
            }
            Step::ProbeInsert { probe, insert } => {
                tracing::trace!(sql = %probe.sql, "Probing for existing row");
                let found = try_outcome!(link.query(cx, &probe.sql, &probe.args).await);
                if found.is_empty() {
                    // A concurrent insert between probe and insert surfaces
                    // as a duplicate and counts as skipped.
                    let inserted = try_outcome!(self.exec(cx, link, insert, true).await);
                    result.absorb(inserted);
                } else {
                    tracing::trace!(table = %plan.table, "Row exists; skipped");
                }
            }
        }
        Outcome::Ok(())
    }

    async fn exec(
        &self,
        cx: &Cx,
        link: &dyn Link,
        statement: &Statement,
        recover_duplicates: bool,
    ) -> Outcome<ExecResult, Error> {
        tracing::trace!(dialect = self.adapter.name(), sql = %statement.sql, args = statement.args.len(), "Executing");
        match link.execute(cx, &statement.sql, &statement.args).await {
            Outcome::Err(e) if recover_duplicates && e.is_duplicate_key() => {
                tracing::warn!(
                    dialect = self.adapter.name(),
                    error = %e,
                    "Duplicate key ignored"
                );
                Outcome::Ok(ExecResult::affected(0))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialects::{Generic, Oracle, Postgres, SqlServer, Sqlite};
    use asupersync::runtime::RuntimeBuilder;
    use sqlgate_core::testing::{MockDb, MockResponse};
    use sqlgate_core::{DialectErrorKind, Row, Value};

    fn rows() -> Vec<Record> {
        vec![
            Record::new().with("id", 1_i64).with("name", "a"),
            Record::new().with("id", 2_i64).with("name", "b"),
        ]
    }

    fn pk_row(name: &str) -> Row {
        Row::new(vec!["column_name".into()], vec![Value::from(name)])
    }

    fn ok<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => panic!("expected success, got {other:?}"),
        }
    }

    fn err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_save_discovers_primary_key_once() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("information_schema", MockResponse::Rows(vec![pk_row("id")]));
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Postgres::new()));

            let first = ok(exec.save(&cx, &conn, "users", &rows(), &WriteOptions::new()).await);
            assert_eq!(first.affected, 1);
            ok(exec.save(&cx, &conn, "users", &rows(), &WriteOptions::new()).await);

            let statements = db.statements();
            assert_eq!(statements.len(), 3);
            assert!(statements[0].contains("information_schema"));
            assert!(statements[1].contains("ON CONFLICT (\"id\") DO UPDATE SET \"name\" = EXCLUDED.\"name\""));
        });
    }

    #[test]
    fn test_save_without_key_fails() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Sqlite::new()));
            let e = err(exec.save(&cx, &conn, "logs", &rows(), &WriteOptions::new()).await);
            assert_eq!(e.dialect_kind(), Some(DialectErrorKind::MissingConflictKey));
            let Error::Write(w) = &e else {
                panic!("expected write context, got {e:?}");
            };
            assert_eq!((w.operation, w.table.as_str(), w.dialect), ("save", "logs", "sqlite"));
            // Only the introspection ran.
            assert_eq!(db.statements().len(), 1);
        });
    }

    #[test]
    fn test_merge_zero_count_is_normalized() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("MERGE", MockResponse::Affected(0));
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(SqlServer::new()));
            let opts = WriteOptions::new().conflict_keys(["id"]);

            let saved = ok(exec.save(&cx, &conn, "users", &rows(), &opts).await);
            assert_eq!(saved.affected, 2);

            let ignored = ok(exec.insert_ignore(&cx, &conn, "users", &rows(), &opts).await);
            assert_eq!(ignored.affected, 0);
        });
    }

    #[test]
    fn test_ignore_recovers_duplicates() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("MERGE", MockResponse::Duplicate);
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Oracle::new()));
            let opts = WriteOptions::new().conflict_keys(["id"]);
            let out = ok(exec.insert_ignore(&cx, &conn, "users", &rows(), &opts).await);
            assert_eq!(out.affected, 0);

            // A plain insert does not recover.
            db.on("INSERT", MockResponse::Duplicate);
            let e = err(exec.insert(&cx, &conn, "users", &rows(), &WriteOptions::new()).await);
            assert!(e.is_duplicate_key());
        });
    }

    #[test]
    fn test_on_conflict_ignore_skips_key_discovery() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Postgres::new()));
            ok(exec.insert_ignore(&cx, &conn, "users", &rows(), &WriteOptions::new()).await);
            let statements = db.statements();
            assert_eq!(statements.len(), 1);
            assert!(statements[0].ends_with("ON CONFLICT DO NOTHING"));
        });
    }

    #[test]
    fn test_generic_probe_then_insert() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("information_schema", MockResponse::Rows(vec![pk_row("id")]));
            // The first row already exists; the second races a concurrent insert.
            db.on_once(
                "SELECT 1",
                MockResponse::Rows(vec![Row::new(vec!["1".into()], vec![Value::BigInt(1)])]),
            );
            db.on_once("INSERT", MockResponse::Duplicate);
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Generic::new()));

            let out = ok(exec.insert_ignore(&cx, &conn, "users", &rows(), &WriteOptions::new()).await);
            assert_eq!(out.affected, 0);
            let statements = db.statements();
            assert_eq!(statements.len(), 4);
            assert!(statements[1].starts_with("SELECT 1 FROM \"users\""));
            assert!(statements[3].starts_with("INSERT INTO \"users\""));
        });
    }

    #[test]
    fn test_generic_save_updates_then_inserts() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("information_schema", MockResponse::Rows(vec![pk_row("id")]));
            db.on_once("UPDATE", MockResponse::Affected(0));
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Generic::new()));
            let row = [Record::new().with("id", 1_i64).with("name", "b")];

            let first = ok(exec.save(&cx, &conn, "users", &row, &WriteOptions::new()).await);
            assert_eq!(first.affected, 1);
            let second = ok(exec.save(&cx, &conn, "users", &row, &WriteOptions::new()).await);
            assert_eq!(second.affected, 1);
            assert_eq!(
                db.statements()[1..],
                [
                    "UPDATE \"users\" SET \"name\" = ? WHERE \"id\" = ?",
                    "INSERT INTO \"users\" (\"id\", \"name\") VALUES (?, ?)",
                    "UPDATE \"users\" SET \"name\" = ? WHERE \"id\" = ?",
                ]
            );
            assert_eq!(db.params()[1], vec![Value::from("b"), Value::BigInt(1)]);
        });
    }

    #[test]
    fn test_generic_save_without_primary_key() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Generic::new()));
            let e = err(exec.replace(&cx, &conn, "logs", &rows(), &WriteOptions::new()).await);
            assert_eq!(e.dialect_kind(), Some(DialectErrorKind::MissingConflictKey));
            assert_eq!(db.statements().len(), 1);
            assert!(db.statements()[0].contains("information_schema"));
        });
    }

    #[test]
    fn test_update_then_insert_fallback() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on_once("UPDATE", MockResponse::Affected(0));
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Oracle::new()));
            let opts = WriteOptions::new()
                .conflict_keys(["id", "name"])
                .on_duplicate("name", UpdateValue::Excluded("name".into()));
            let out = ok(exec.save(&cx, &conn, "users", &rows(), &opts).await);
            assert_eq!(out.affected, 2);
            assert_eq!(
                db.statements(),
                vec![
                    "UPDATE users SET name = :1 WHERE id = :2 AND name = :3",
                    "INSERT INTO users (id, name) VALUES (:1, :2)",
                    "UPDATE users SET name = :1 WHERE id = :2 AND name = :3",
                ]
            );
        });
    }

    #[test]
    fn test_query_errors_carry_context() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("INSERT", MockResponse::Fail("disk full".into()));
            let conn = db.connection();
            let exec = WriteExecutor::new(Arc::new(Sqlite::new()));
            let opts = WriteOptions::new().conflict_keys(["id"]);
            let e = err(exec.replace(&cx, &conn, "users", &rows(), &opts).await);
            let Error::Write(w) = &e else {
                panic!("expected write context, got {e:?}");
            };
            assert_eq!(w.operation, "replace");
            assert!(matches!(*w.source, Error::Query(_)));
        });
    }
}
