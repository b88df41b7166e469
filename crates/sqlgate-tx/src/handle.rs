//! Transaction handles.
//!
//! A [`TransactionHandle`] owns one checked-out connection with an open
//! transaction on it. Every statement and boundary operation runs under the
//! handle's session lock, so the connection never sees two statements at
//! once. Once committed, rolled back or closed, the connection is dropped
//! (returned to its provider) and every further operation fails with
//! `TransactionErrorKind::Closed`.
//!
//! Rollback paths take the session lock with cancellation masked, so a
//! cancelled context still ends the transaction on the engine.

use asupersync::sync::{Mutex, MutexGuard};
use asupersync::{Cx, Outcome};
use sqlgate_core::{
    BoxFuture, Error, ExecResult, IsolationLevel, Link, RawConnection, Row, TransactionErrorKind,
    Value, try_outcome,
};
use std::collections::HashSet;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleState {
    /// Open; statements and savepoints are accepted.
    Active,
    /// Committed; the connection has been returned.
    Committed,
    /// Rolled back; the connection has been returned.
    RolledBack,
    /// Explicitly closed.
    Closed,
}

impl HandleState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HandleState::Active => "active",
            HandleState::Committed => "committed",
            HandleState::RolledBack => "rolled back",
            HandleState::Closed => "closed",
        }
    }
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Bookkeeping {
    state: HandleState,
    /// Live savepoints, oldest first.
    savepoints: Vec<String>,
    /// Every savepoint name ever created on this handle.
    used: HashSet<String>,
    next_seq: u64,
}

/// An open transaction bound to one connection.
///
/// Handles are shared behind `Arc`; contexts only keep weak references, so
/// a handle lives exactly as long as the scope that began it.
pub struct TransactionHandle {
    id: u64,
    engine: &'static str,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    session: Mutex<Session>,
    book: std::sync::Mutex<Bookkeeping>,
}

macro_rules! lock_session {
    ($self:ident, $cx:ident) => {
        match $self.session.lock($cx).await {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(reason) = $cx.cancel_reason() {
                    return Outcome::Cancelled(reason);
                }
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::Closed,
                    format!("transaction {}: failed to acquire session lock", $self.id),
                ));
            }
        }
    };
}

type Session = Option<Box<dyn RawConnection>>;

impl TransactionHandle {
    /// Begin a transaction on `conn` and wrap it in a handle.
    ///
    /// If the engine refuses to begin, the connection is dropped and the
    /// error returned.
    pub async fn begin(
        cx: &Cx,
        conn: Box<dyn RawConnection>,
        engine: &'static str,
        isolation: Option<IsolationLevel>,
        read_only: bool,
    ) -> Outcome<Arc<Self>, Error> {
        try_outcome!(conn.begin(cx, isolation, read_only).await);
        let id = NEXT_TX_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tx_id = id, engine, ?isolation, read_only, "Transaction begun");
        Outcome::Ok(Arc::new(Self {
            id,
            engine,
            isolation,
            read_only,
            session: Mutex::new(Some(conn)),
            book: std::sync::Mutex::new(Bookkeeping {
                state: HandleState::Active,
                savepoints: Vec::new(),
                used: HashSet::new(),
                next_seq: 0,
            }),
        }))
    }

    /// Process-unique handle id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Engine name of the underlying connection.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Isolation level requested at begin.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn book(&self) -> std::sync::MutexGuard<'_, Bookkeeping> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandleState {
        self.book().state
    }

    /// Whether the handle still accepts statements.
    pub fn is_active(&self) -> bool {
        self.state() == HandleState::Active
    }

    /// Whether the handle has left the `Active` state.
    pub fn is_closed(&self) -> bool {
        !self.is_active()
    }

    /// Number of live savepoints.
    pub fn depth(&self) -> usize {
        self.book().savepoints.len()
    }

    /// Names of the live savepoints, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.book().savepoints.clone()
    }

    fn closed_error(&self, op: &str) -> Error {
        Error::transaction(
            TransactionErrorKind::Closed,
            format!("cannot {op}: transaction {} is {}", self.id, self.state()),
        )
    }

    /// Lock the session for rollback work, ignoring cancellation of `cx`.
    async fn session_for_rollback(&self, cx: &Cx) -> Result<MutexGuard<'_, Session>, Error> {
        if let Ok(guard) = self.session.try_lock() {
            return Ok(guard);
        }
        let mut waiting = pin!(self.session.lock(cx));
        std::future::poll_fn(|task| cx.masked(|| waiting.as_mut().poll(task)))
            .await
            .map_err(|_| {
                Error::transaction(
                    TransactionErrorKind::Closed,
                    format!("transaction {}: session lock poisoned", self.id),
                )
            })
    }

    fn finish(&self, state: HandleState) {
        let mut book = self.book();
        book.state = state;
        book.savepoints.clear();
    }

    /// Commit the transaction and return the connection.
    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        let mut guard = lock_session!(self, cx);
        let Some(conn) = guard.as_ref() else {
            return Outcome::Err(self.closed_error("commit"));
        };
        try_outcome!(conn.commit(cx).await);
        guard.take();
        self.finish(HandleState::Committed);
        tracing::debug!(tx_id = self.id, "Transaction committed");
        Outcome::Ok(())
    }

    /// Roll back the transaction and return the connection.
    ///
    /// The connection is released even when the engine reports a rollback
    /// failure; the failure is still returned. Runs to completion on a
    /// cancelled context.
    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let mut guard = match self.session_for_rollback(cx).await {
            Ok(guard) => guard,
            Err(e) => {
                if self.is_active() {
                    self.finish(HandleState::RolledBack);
                }
                return Outcome::Err(e);
            }
        };
        let Some(conn) = guard.as_ref() else {
            return Outcome::Err(self.closed_error("rollback"));
        };
        let outcome = conn.rollback(cx).await;
        guard.take();
        self.finish(HandleState::RolledBack);
        match &outcome {
            Outcome::Ok(()) => tracing::debug!(tx_id = self.id, "Transaction rolled back"),
            Outcome::Err(e) => tracing::error!(tx_id = self.id, error = %e, "Rollback failed"),
            _ => tracing::warn!(tx_id = self.id, "Rollback interrupted"),
        }
        outcome
    }

    /// Close the handle. An active transaction is rolled back first; closing
    /// an already finished handle is a no-op.
    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        let outcome = if self.is_active() {
            self.rollback(cx).await
        } else {
            Outcome::Ok(())
        };
        self.finish(HandleState::Closed);
        outcome
    }

    /// Create a savepoint named `name`.
    ///
    /// Names must be plain identifiers and may not repeat within the
    /// lifetime of the handle.
    pub async fn savepoint(&self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Outcome::Err(Error::Custom(format!(
                "invalid savepoint name '{name}'"
            )));
        }
        let guard = lock_session!(self, cx);
        let Some(conn) = guard.as_ref() else {
            return Outcome::Err(self.closed_error("create savepoint"));
        };
        if self.book().used.contains(name) {
            return Outcome::Err(Error::transaction(
                TransactionErrorKind::SavepointExists,
                format!("savepoint '{name}' was already used in transaction {}", self.id),
            ));
        }
        try_outcome!(conn.savepoint(cx, name).await);
        let depth = {
            let mut book = self.book();
            book.used.insert(name.to_string());
            book.savepoints.push(name.to_string());
            book.savepoints.len()
        };
        tracing::trace!(tx_id = self.id, savepoint = name, depth, "Savepoint created");
        Outcome::Ok(())
    }

    /// Create a savepoint with a generated name and return the name.
    pub async fn push_savepoint(&self, cx: &Cx) -> Outcome<String, Error> {
        let name = {
            let mut book = self.book();
            loop {
                book.next_seq += 1;
                let candidate = format!("sp_{}", book.next_seq);
                if !book.used.contains(&candidate) {
                    break candidate;
                }
            }
        };
        try_outcome!(self.savepoint(cx, &name).await);
        Outcome::Ok(name)
    }

    fn position_of(&self, name: &str) -> Result<usize, Error> {
        self.book()
            .savepoints
            .iter()
            .rposition(|sp| sp == name)
            .ok_or_else(|| {
                Error::transaction(
                    TransactionErrorKind::SavepointNotFound,
                    format!("no live savepoint '{name}' in transaction {}", self.id),
                )
            })
    }

    /// Roll back to savepoint `name`. The savepoint itself stays live;
    /// every savepoint created after it is discarded. Like [`rollback`],
    /// this is not interrupted by cancellation.
    ///
    /// [`rollback`]: Self::rollback
    pub async fn rollback_to(&self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        let guard = match self.session_for_rollback(cx).await {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let Some(conn) = guard.as_ref() else {
            return Outcome::Err(self.closed_error("roll back to savepoint"));
        };
        let pos = match self.position_of(name) {
            Ok(pos) => pos,
            Err(e) => return Outcome::Err(e),
        };
        try_outcome!(conn.rollback_to(cx, name).await);
        self.book().savepoints.truncate(pos + 1);
        tracing::trace!(tx_id = self.id, savepoint = name, "Rolled back to savepoint");
        Outcome::Ok(())
    }

    /// Release savepoint `name` along with every savepoint created after it.
    pub async fn release(&self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        let guard = lock_session!(self, cx);
        let Some(conn) = guard.as_ref() else {
            return Outcome::Err(self.closed_error("release savepoint"));
        };
        let pos = match self.position_of(name) {
            Ok(pos) => pos,
            Err(e) => return Outcome::Err(e),
        };
        try_outcome!(conn.release(cx, name).await);
        self.book().savepoints.truncate(pos);
        tracing::trace!(tx_id = self.id, savepoint = name, "Savepoint released");
        Outcome::Ok(())
    }
}

impl Link for TransactionHandle {
    fn query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        Box::pin(async move {
            let guard = lock_session!(self, cx);
            let Some(conn) = guard.as_ref() else {
                return Outcome::Err(self.closed_error("query"));
            };
            tracing::trace!(tx_id = self.id, sql, "Query in transaction");
            conn.query(cx, sql, params).await
        })
    }

    fn execute<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<ExecResult, Error>> {
        Box::pin(async move {
            let guard = lock_session!(self, cx);
            let Some(conn) = guard.as_ref() else {
                return Outcome::Err(self.closed_error("execute"));
            };
            tracing::trace!(tx_id = self.id, sql, "Execute in transaction");
            conn.execute(cx, sql, params).await
        })
    }

    fn in_transaction(&self) -> bool {
        self.is_active()
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let book = self.book();
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("engine", &self.engine)
            .field("state", &book.state)
            .field("savepoints", &book.savepoints)
            .finish_non_exhaustive()
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.book().state == HandleState::Active {
            // No async work in drop; dropping the connection is all we can do.
            tracing::warn!(
                tx_id = self.id,
                engine = self.engine,
                "Transaction handle dropped while active; connection released without commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::CancelKind;
    use asupersync::runtime::RuntimeBuilder;
    use sqlgate_core::testing::{MockDb, MockResponse};

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn err_of<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => panic!("expected error, got {other:?}"),
        }
    }

    async fn open(cx: &Cx, db: &MockDb) -> Arc<TransactionHandle> {
        unwrap_outcome(
            TransactionHandle::begin(cx, Box::new(db.connection()), "mock", None, false).await,
        )
    }

    #[test]
    fn test_commit_releases_connection_and_closes() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let tx = open(&cx, &db).await;
            assert!(tx.is_active());
            assert!(tx.in_transaction());

            unwrap_outcome(tx.execute(&cx, "INSERT INTO t VALUES (1)", &[]).await);
            unwrap_outcome(tx.commit(&cx).await);

            assert_eq!(tx.state(), HandleState::Committed);
            assert!(tx.is_closed());
            assert_eq!(db.released(), 1);

            let err = err_of(tx.execute(&cx, "INSERT INTO t VALUES (2)", &[]).await);
            assert!(err.is_transaction_closed());
            assert!(err_of(tx.commit(&cx).await).is_transaction_closed());
            assert!(err_of(tx.rollback(&cx).await).is_transaction_closed());
            assert_eq!(
                db.statements(),
                vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT"]
            );
        });
    }

    #[test]
    fn test_begin_failure_returns_connection() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("BEGIN", MockResponse::Fail("database is locked".into()));
            let outcome =
                TransactionHandle::begin(&cx, Box::new(db.connection()), "mock", None, false)
                    .await;
            assert!(matches!(outcome, Outcome::Err(_)));
            assert_eq!(db.released(), 1);
        });
    }

    #[test]
    fn test_begin_passes_isolation_and_read_only() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let tx = unwrap_outcome(
                TransactionHandle::begin(
                    &cx,
                    Box::new(db.connection()),
                    "mock",
                    Some(IsolationLevel::Serializable),
                    true,
                )
                .await,
            );
            assert!(tx.is_read_only());
            assert_eq!(tx.isolation(), Some(IsolationLevel::Serializable));
            assert_eq!(
                db.statements(),
                vec!["BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY"]
            );
        });
    }

    #[test]
    fn test_savepoint_stack() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let tx = open(&cx, &db).await;

            unwrap_outcome(tx.savepoint(&cx, "a").await);
            unwrap_outcome(tx.savepoint(&cx, "b").await);
            unwrap_outcome(tx.savepoint(&cx, "c").await);
            assert_eq!(tx.depth(), 3);

            unwrap_outcome(tx.rollback_to(&cx, "b").await);
            assert_eq!(tx.savepoints(), vec!["a", "b"]);

            unwrap_outcome(tx.release(&cx, "a").await);
            assert_eq!(tx.depth(), 0);

            let err = err_of(tx.rollback_to(&cx, "c").await);
            assert_eq!(
                err.transaction_kind(),
                Some(TransactionErrorKind::SavepointNotFound)
            );
        });
    }

    #[test]
    fn test_savepoint_names_are_never_reused() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let tx = open(&cx, &db).await;

            unwrap_outcome(tx.savepoint(&cx, "sp_1").await);
            unwrap_outcome(tx.release(&cx, "sp_1").await);
            let err = err_of(tx.savepoint(&cx, "sp_1").await);
            assert_eq!(
                err.transaction_kind(),
                Some(TransactionErrorKind::SavepointExists)
            );

            // Generated names skip anything already taken.
            let generated = unwrap_outcome(tx.push_savepoint(&cx).await);
            assert_eq!(generated, "sp_2");
            assert!(matches!(
                tx.savepoint(&cx, "bad name;").await,
                Outcome::Err(Error::Custom(_))
            ));
        });
    }

    #[test]
    fn test_rollback_failure_still_releases() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            db.on("ROLLBACK", MockResponse::Fail("connection reset".into()));
            let tx = open(&cx, &db).await;
            assert!(matches!(tx.rollback(&cx).await, Outcome::Err(_)));
            assert_eq!(tx.state(), HandleState::RolledBack);
            assert_eq!(db.released(), 1);
        });
    }

    #[test]
    fn test_rollback_runs_on_cancelled_context() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let tx = open(&cx, &db).await;
            unwrap_outcome(tx.savepoint(&cx, "a").await);
            cx.cancel_with(CancelKind::User, None);

            assert!(matches!(
                tx.execute(&cx, "INSERT INTO t VALUES (1)", &[]).await,
                Outcome::Cancelled(_)
            ));
            unwrap_outcome(tx.rollback_to(&cx, "a").await);
            unwrap_outcome(tx.close(&cx).await);
            assert_eq!(tx.state(), HandleState::Closed);
            assert_eq!(db.released(), 1);
            assert_eq!(
                db.statements(),
                vec!["BEGIN", "SAVEPOINT a", "ROLLBACK TO SAVEPOINT a", "ROLLBACK"]
            );
        });
    }

    #[test]
    fn test_close_is_idempotent() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let db = MockDb::new();
            let tx = open(&cx, &db).await;
            unwrap_outcome(tx.close(&cx).await);
            unwrap_outcome(tx.close(&cx).await);
            assert_eq!(tx.state(), HandleState::Closed);
            assert_eq!(db.statements(), vec!["BEGIN", "ROLLBACK"]);
        });
    }
}
