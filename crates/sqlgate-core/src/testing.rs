//! Scripted in-memory connections for tests.
//!
//! `MockDb` records every statement (including transaction control) issued
//! through the connections it hands out, and answers statements according
//! to rules matched by substring. Enabled by the `testing` feature.

use crate::connection::{
    BoxFuture, ConnectionProvider, ExecResult, IsolationLevel, Link, LinkTarget, RawConnection,
};
use crate::error::{ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind};
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How a matched statement should be answered.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Report this many affected rows.
    Affected(u64),
    /// Return these rows from a query.
    Rows(Vec<Row>),
    /// Fail with a unique-key violation.
    Duplicate,
    /// Fail with a generic database error carrying this message.
    Fail(String),
}

#[derive(Debug, Clone)]
struct MockRule {
    contains: String,
    response: MockResponse,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MockState {
    log: Vec<String>,
    params: Vec<Vec<Value>>,
    rules: Vec<MockRule>,
    acquired: usize,
    released: usize,
    next_conn: usize,
    unavailable: bool,
}

/// Shared script and journal for a family of mock connections.
#[derive(Debug, Clone, Default)]
pub struct MockDb {
    state: Arc<Mutex<MockState>>,
}

impl MockDb {
    /// Create an empty mock database.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer every statement containing `contains` with `response`.
    pub fn on(&self, contains: &str, response: MockResponse) -> &Self {
        self.lock().rules.push(MockRule {
            contains: contains.to_string(),
            response,
            remaining: None,
        });
        self
    }

    /// Answer the next statement containing `contains` with `response`.
    pub fn on_once(&self, contains: &str, response: MockResponse) -> &Self {
        self.lock().rules.push(MockRule {
            contains: contains.to_string(),
            response,
            remaining: Some(1),
        });
        self
    }

    /// Make subsequent `acquire` calls fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Every statement issued so far, prefixed with the connection number
    /// (`"c1: BEGIN"`).
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Statements issued so far without the connection prefix.
    pub fn statements(&self) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .map(|line| line.split_once(": ").map_or(line.as_str(), |(_, s)| s).to_string())
            .collect()
    }

    /// Arguments bound to each statement, in issue order.
    pub fn params(&self) -> Vec<Vec<Value>> {
        self.lock().params.clone()
    }

    /// Number of connections handed out.
    pub fn acquired(&self) -> usize {
        self.lock().acquired
    }

    /// Number of connections dropped (returned).
    pub fn released(&self) -> usize {
        self.lock().released
    }

    /// Clear the statement journal, keeping rules.
    pub fn clear_log(&self) {
        let mut state = self.lock();
        state.log.clear();
        state.params.clear();
    }

    /// Open a new connection against this script.
    pub fn connection(&self) -> MockConnection {
        let id = {
            let mut state = self.lock();
            state.acquired += 1;
            state.next_conn += 1;
            state.next_conn
        };
        MockConnection {
            db: self.clone(),
            id,
            in_tx: Mutex::new(false),
        }
    }

    /// A provider handing out connections from this script.
    pub fn provider(&self) -> MockProvider {
        MockProvider { db: self.clone() }
    }

    fn record(&self, conn: usize, sql: &str, params: &[Value]) -> Option<MockResponse> {
        let mut state = self.lock();
        state.log.push(format!("c{conn}: {sql}"));
        state.params.push(params.to_vec());
        let idx = state
            .rules
            .iter()
            .position(|r| r.remaining != Some(0) && sql.contains(&r.contains))?;
        let rule = &mut state.rules[idx];
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.response.clone())
    }
}

fn mock_error(kind: QueryErrorKind, sql: &str, message: &str) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        sqlstate: None,
        message: message.to_string(),
        source: None,
    })
}

/// A connection whose statements are answered by a [`MockDb`] script.
#[derive(Debug)]
pub struct MockConnection {
    db: MockDb,
    id: usize,
    in_tx: Mutex<bool>,
}

impl MockConnection {
    fn control(&self, sql: &str) -> Outcome<(), Error> {
        match self.db.record(self.id, sql, &[]) {
            Some(MockResponse::Fail(msg)) => Outcome::Err(mock_error(QueryErrorKind::Database, sql, &msg)),
            Some(MockResponse::Duplicate) => {
                Outcome::Err(mock_error(QueryErrorKind::Duplicate, sql, "duplicate key"))
            }
            _ => Outcome::Ok(()),
        }
    }

    fn set_in_tx(&self, value: bool) {
        *self.in_tx.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.db.lock().released += 1;
    }
}

impl Link for MockConnection {
    fn query<'a>(
        &'a self,
        _cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        let outcome = match self.db.record(self.id, sql, params) {
            Some(MockResponse::Rows(rows)) => Outcome::Ok(rows),
            Some(MockResponse::Duplicate) => {
                Outcome::Err(mock_error(QueryErrorKind::Duplicate, sql, "duplicate key"))
            }
            Some(MockResponse::Fail(msg)) => {
                Outcome::Err(mock_error(QueryErrorKind::Database, sql, &msg))
            }
            Some(MockResponse::Affected(_)) | None => Outcome::Ok(Vec::new()),
        };
        Box::pin(async move { outcome })
    }

    fn execute<'a>(
        &'a self,
        _cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<ExecResult, Error>> {
        let outcome = match self.db.record(self.id, sql, params) {
            Some(MockResponse::Affected(n)) => Outcome::Ok(ExecResult::affected(n)),
            Some(MockResponse::Duplicate) => {
                Outcome::Err(mock_error(QueryErrorKind::Duplicate, sql, "duplicate key"))
            }
            Some(MockResponse::Fail(msg)) => {
                Outcome::Err(mock_error(QueryErrorKind::Database, sql, &msg))
            }
            Some(MockResponse::Rows(rows)) => Outcome::Ok(ExecResult::affected(rows.len() as u64)),
            None => Outcome::Ok(ExecResult::affected(1)),
        };
        Box::pin(async move { outcome })
    }

    fn in_transaction(&self) -> bool {
        *self.in_tx.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RawConnection for MockConnection {
    fn as_link(&self) -> &dyn Link {
        self
    }

    fn begin<'a>(
        &'a self,
        _cx: &'a Cx,
        isolation: Option<IsolationLevel>,
        read_only: bool,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        let mut sql = String::from("BEGIN");
        if let Some(level) = isolation {
            sql.push_str(" ISOLATION LEVEL ");
            sql.push_str(level.as_sql());
        }
        if read_only {
            sql.push_str(" READ ONLY");
        }
        let outcome = self.control(&sql);
        if matches!(outcome, Outcome::Ok(())) {
            self.set_in_tx(true);
        }
        Box::pin(async move { outcome })
    }

    fn commit<'a>(&'a self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>> {
        let outcome = self.control("COMMIT");
        if matches!(outcome, Outcome::Ok(())) {
            self.set_in_tx(false);
        }
        Box::pin(async move { outcome })
    }

    fn rollback<'a>(&'a self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>> {
        let outcome = self.control("ROLLBACK");
        if matches!(outcome, Outcome::Ok(())) {
            self.set_in_tx(false);
        }
        Box::pin(async move { outcome })
    }

    fn savepoint<'a>(&'a self, _cx: &'a Cx, name: &'a str) -> BoxFuture<'a, Outcome<(), Error>> {
        let outcome = self.control(&format!("SAVEPOINT {name}"));
        Box::pin(async move { outcome })
    }

    fn rollback_to<'a>(
        &'a self,
        _cx: &'a Cx,
        name: &'a str,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        let outcome = self.control(&format!("ROLLBACK TO SAVEPOINT {name}"));
        Box::pin(async move { outcome })
    }

    fn release<'a>(&'a self, _cx: &'a Cx, name: &'a str) -> BoxFuture<'a, Outcome<(), Error>> {
        let outcome = self.control(&format!("RELEASE SAVEPOINT {name}"));
        Box::pin(async move { outcome })
    }
}

/// Provider handing out [`MockConnection`]s.
#[derive(Debug, Clone)]
pub struct MockProvider {
    db: MockDb,
}

impl ConnectionProvider for MockProvider {
    fn engine(&self) -> &'static str {
        "mock"
    }

    fn acquire<'a>(
        &'a self,
        _cx: &'a Cx,
        _target: &'a LinkTarget,
    ) -> BoxFuture<'a, Outcome<Box<dyn RawConnection>, Error>> {
        let outcome = if self.db.lock().unavailable {
            Outcome::Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Unavailable,
                message: "mock database unavailable".to_string(),
                source: None,
            }))
        } else {
            let conn: Box<dyn RawConnection> = Box::new(self.db.connection());
            Outcome::Ok(conn)
        };
        Box::pin(async move { outcome })
    }
}
