//! SQLite connection.
//!
//! [`SqliteConnection`] wraps one `sqlite3*` handle behind a mutex and
//! implements [`Link`] and [`RawConnection`], so it can back a transaction
//! handle or be used directly for autocommit statements. All calls are
//! synchronous under the hood; the returned futures are already resolved.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::borrow_as_ptr)]

use crate::ffi;
use crate::types;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use sqlgate_core::{
    BoxFuture, ConnectionError, ConnectionErrorKind, Error, ExecResult, IsolationLevel, Link,
    QueryError, QueryErrorKind, RawConnection, Result, Row, Value, row::ColumnInfo,
};
use std::ffi::{CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Journal mode applied right after opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    Wal,
    Off,
}

impl JournalMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
            JournalMode::Persist => "PERSIST",
            JournalMode::Memory => "MEMORY",
            JournalMode::Wal => "WAL",
            JournalMode::Off => "OFF",
        }
    }
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Interpret the path as a `file:` URI.
    pub uri: bool,
    pub no_mutex: bool,
    pub full_mutex: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Read-write; the database must exist.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Database file, or `":memory:"`.
    pub path: String,
    pub flags: OpenFlags,
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u32,
    pub journal_mode: Option<JournalMode>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            journal_mode: None,
        }
    }
}

impl SqliteConfig {
    /// A file database, created if missing.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// A private in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = Some(mode);
        self
    }
}

struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
    query_only: bool,
}

// SAFETY: the handle is only touched while the owning Mutex is held, so it
// is never used from two threads at once.
unsafe impl Send for SqliteInner {}

/// A connection to a SQLite database.
pub struct SqliteConnection {
    inner: Mutex<SqliteInner>,
    path: String,
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("in_transaction", &self.lock().in_transaction)
            .finish()
    }
}

fn connect_error(message: String) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message,
        source: None,
    })
}

fn query_error(kind: QueryErrorKind, sql: Option<&str>, message: String) -> Error {
    let sqlstate = (kind == QueryErrorKind::Duplicate).then(|| "23505".to_string());
    Error::Query(QueryError {
        kind,
        sql: sql.map(str::to_string),
        sqlstate,
        message,
        source: None,
    })
}

fn quote_savepoint(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl SqliteConnection {
    /// Open a connection with `config`.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str())
            .map_err(|_| connect_error("invalid path: contains a NUL byte".to_string()))?;
        let mut db: *mut ffi::sqlite3 = ptr::null_mut();

        // SAFETY: valid pointers; the return code is checked below
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                c_path.as_ptr(),
                &mut db,
                config.flags.to_sqlite_flags(),
                ptr::null(),
            )
        };
        if rc != ffi::SQLITE_OK {
            let message = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db was allocated by open_v2 and is closed exactly once
                unsafe {
                    let msg = ffi::errmsg(db);
                    ffi::sqlite3_close_v2(db);
                    msg
                }
            };
            return Err(connect_error(format!(
                "failed to open '{}': {message}",
                config.path
            )));
        }
        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms.min(c_int::MAX as u32) as c_int);
            }
        }

        let conn = Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
                query_only: false,
            }),
            path: config.path.clone(),
        };
        if let Some(mode) = config.journal_mode {
            conn.query_sync(&format!("PRAGMA journal_mode = {}", mode.as_str()), &[])?;
        }
        tracing::debug!(path = %config.path, "Opened SQLite connection");
        Ok(conn)
    }

    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one or more `;`-separated statements without parameters.
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let inner = self.lock();
        exec_raw(inner.db, sql)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid while the connection lives
        unsafe {
            ffi::sqlite3_last_insert_rowid(inner.db)
        }
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> u64 {
        let inner = self.lock();
        // SAFETY: db is valid while the connection lives
        let n = unsafe { ffi::sqlite3_changes(inner.db) };
        n.max(0) as u64
    }

    /// Prepare, bind and run `sql`, returning every row.
    pub fn query_sync(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql)?;
        stmt.bind(params)?;

        let count = stmt.column_count();
        let names: Vec<String> = (0..count)
            .map(|i| stmt.column_name(i).unwrap_or_else(|| format!("col{i}")))
            .collect();
        let columns = Arc::new(ColumnInfo::new(names));

        let mut rows = Vec::new();
        while stmt.step()? {
            let values = (0..count).map(|i| stmt.read(i)).collect();
            rows.push(Row::with_columns(Arc::clone(&columns), values));
        }
        tracing::trace!(sql, rows = rows.len(), "SQLite query");
        Ok(rows)
    }

    /// Prepare, bind and run `sql`, reporting rows changed by it.
    ///
    /// `last_insert_id` is set only when the statement inserted a row.
    pub fn execute_sync(&self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let inner = self.lock();
        let stmt = Statement::prepare(inner.db, sql)?;
        stmt.bind(params)?;

        // SAFETY: db is valid while the guard is held
        let (changes_before, rowid_before) = unsafe {
            (
                ffi::sqlite3_total_changes(inner.db),
                ffi::sqlite3_last_insert_rowid(inner.db),
            )
        };
        while stmt.step()? {}
        // SAFETY: as above
        let (changes_after, rowid_after) = unsafe {
            (
                ffi::sqlite3_total_changes(inner.db),
                ffi::sqlite3_last_insert_rowid(inner.db),
            )
        };
        let rows_affected = (changes_after - changes_before).max(0) as u64;
        let last_insert_id = (rowid_after != rowid_before).then_some(rowid_after);
        tracing::trace!(sql, rows_affected, "SQLite execute");
        Ok(ExecResult {
            rows_affected,
            last_insert_id,
        })
    }

    /// Open a transaction. `Serializable` takes the write lock up front
    /// (`BEGIN IMMEDIATE`); every other level begins deferred. Read-only
    /// transactions run with `PRAGMA query_only`.
    pub fn begin_sync(&self, isolation: Option<IsolationLevel>, read_only: bool) -> Result<()> {
        let mut inner = self.lock();
        if inner.in_transaction {
            return Err(query_error(
                QueryErrorKind::Database,
                None,
                "already in a transaction".to_string(),
            ));
        }
        let begin = match isolation {
            Some(IsolationLevel::Serializable) => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        };
        exec_raw(inner.db, begin)?;
        if read_only {
            if let Err(e) = exec_raw(inner.db, "PRAGMA query_only = ON") {
                let _ = exec_raw(inner.db, "ROLLBACK");
                return Err(e);
            }
            inner.query_only = true;
        }
        inner.in_transaction = true;
        Ok(())
    }

    pub fn commit_sync(&self) -> Result<()> {
        self.finish("COMMIT")
    }

    pub fn rollback_sync(&self) -> Result<()> {
        self.finish("ROLLBACK")
    }

    fn finish(&self, sql: &str) -> Result<()> {
        let mut inner = self.lock();
        if !inner.in_transaction {
            return Err(query_error(
                QueryErrorKind::Database,
                Some(sql),
                "not in a transaction".to_string(),
            ));
        }
        let result = exec_raw(inner.db, sql);
        // A failed COMMIT can leave the transaction open; SQLite knows.
        // SAFETY: db is valid while the guard is held
        let autocommit = unsafe { libsqlite3_sys::sqlite3_get_autocommit(inner.db) } != 0;
        if autocommit {
            inner.in_transaction = false;
            if inner.query_only {
                inner.query_only = false;
                exec_raw(inner.db, "PRAGMA query_only = OFF")?;
            }
        }
        result
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self.lock();
        if !inner.db.is_null() {
            // SAFETY: db is valid and closed exactly once
            unsafe {
                ffi::sqlite3_close_v2(inner.db);
            }
        }
    }
}

/// Owns a prepared statement and finalizes it on drop.
struct Statement<'a> {
    db: *mut ffi::sqlite3,
    stmt: *mut ffi::sqlite3_stmt,
    sql: &'a str,
}

impl<'a> Statement<'a> {
    fn prepare(db: *mut ffi::sqlite3, sql: &'a str) -> Result<Self> {
        let c_sql = CString::new(sql).map_err(|_| {
            query_error(
                QueryErrorKind::Syntax,
                Some(sql),
                "SQL contains a NUL byte".to_string(),
            )
        })?;
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                c_sql.as_ptr(),
                c_sql.as_bytes().len() as c_int,
                &mut stmt,
                ptr::null_mut(),
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(last_error(db, sql));
        }
        Ok(Self { db, stmt, sql })
    }

    fn bind(&self, params: &[Value]) -> Result<()> {
        for (i, value) in params.iter().enumerate() {
            // SAFETY: stmt is valid; indexes are 1-based
            let rc = unsafe { types::bind_value(self.stmt, (i + 1) as c_int, value) };
            if rc != ffi::SQLITE_OK {
                // SAFETY: db is valid
                let msg = unsafe { ffi::errmsg(self.db) };
                return Err(query_error(
                    QueryErrorKind::Database,
                    Some(self.sql),
                    format!("failed to bind parameter {}: {msg}", i + 1),
                ));
            }
        }
        Ok(())
    }

    fn column_count(&self) -> c_int {
        // SAFETY: stmt is valid
        unsafe { ffi::sqlite3_column_count(self.stmt) }
    }

    fn column_name(&self, index: c_int) -> Option<String> {
        // SAFETY: stmt is valid and index < column_count
        unsafe { types::column_name(self.stmt, index) }
    }

    fn read(&self, index: c_int) -> Value {
        // SAFETY: only called after step returned a row
        unsafe { types::read_column(self.stmt, index) }
    }

    /// Advance; `true` when a row is available.
    fn step(&self) -> Result<bool> {
        // SAFETY: stmt is valid
        match unsafe { ffi::sqlite3_step(self.stmt) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            _ => Err(last_error(self.db, self.sql)),
        }
    }
}

impl Drop for Statement<'_> {
    fn drop(&mut self) {
        // SAFETY: stmt came from prepare_v2 and is finalized exactly once
        unsafe {
            ffi::sqlite3_finalize(self.stmt);
        }
    }
}

fn exec_raw(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let c_sql = CString::new(sql).map_err(|_| {
        query_error(
            QueryErrorKind::Syntax,
            Some(sql),
            "SQL contains a NUL byte".to_string(),
        )
    })?;
    let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();
    // SAFETY: all pointers are valid for the duration of the call
    let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };
    if rc == ffi::SQLITE_OK {
        return Ok(());
    }
    if !errmsg.is_null() {
        // SAFETY: errmsg was allocated by sqlite3_exec
        unsafe { ffi::sqlite3_free(errmsg.cast()) };
    }
    Err(last_error(db, sql))
}

fn last_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (code, message) = unsafe { (ffi::sqlite3_extended_errcode(db), ffi::errmsg(db)) };
    query_error(error_code_to_kind(code), Some(sql), message)
}

/// Classify an extended result code.
pub(crate) fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code {
        ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE => {
            QueryErrorKind::Duplicate
        }
        _ => match code & 0xff {
            ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
            ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Deadlock,
            ffi::SQLITE_PERM | ffi::SQLITE_AUTH => QueryErrorKind::Permission,
            ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
            ffi::SQLITE_INTERRUPT => QueryErrorKind::Cancelled,
            _ => QueryErrorKind::Database,
        },
    }
}

fn ready<T: Send + 'static>(cx: &Cx, run: impl FnOnce() -> Result<T>) -> BoxFuture<'static, Outcome<T, Error>> {
    let outcome = match cx.cancel_reason() {
        Some(reason) => Outcome::Cancelled(reason),
        None => run().map_or_else(Outcome::Err, Outcome::Ok),
    };
    Box::pin(async move { outcome })
}

impl Link for SqliteConnection {
    fn query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        ready(cx, || self.query_sync(sql, params))
    }

    fn execute<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<ExecResult, Error>> {
        ready(cx, || self.execute_sync(sql, params))
    }

    fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }
}

impl RawConnection for SqliteConnection {
    fn as_link(&self) -> &dyn Link {
        self
    }

    fn begin<'a>(
        &'a self,
        cx: &'a Cx,
        isolation: Option<IsolationLevel>,
        read_only: bool,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        ready(cx, || self.begin_sync(isolation, read_only))
    }

    // Commit and rollback ignore cancellation: they are the cleanup path.
    fn commit<'a>(&'a self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>> {
        let outcome = self.commit_sync().map_or_else(Outcome::Err, Outcome::Ok);
        Box::pin(async move { outcome })
    }

    fn rollback<'a>(&'a self, _cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>> {
        let outcome = self.rollback_sync().map_or_else(Outcome::Err, Outcome::Ok);
        Box::pin(async move { outcome })
    }

    fn savepoint<'a>(&'a self, cx: &'a Cx, name: &'a str) -> BoxFuture<'a, Outcome<(), Error>> {
        ready(cx, || {
            self.execute_raw(&format!("SAVEPOINT {}", quote_savepoint(name)))
        })
    }

    fn rollback_to<'a>(
        &'a self,
        _cx: &'a Cx,
        name: &'a str,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        let outcome = self
            .execute_raw(&format!("ROLLBACK TO SAVEPOINT {}", quote_savepoint(name)))
            .map_or_else(Outcome::Err, Outcome::Ok);
        Box::pin(async move { outcome })
    }

    fn release<'a>(&'a self, cx: &'a Cx, name: &'a str) -> BoxFuture<'a, Outcome<(), Error>> {
        ready(cx, || {
            self.execute_raw(&format!("RELEASE SAVEPOINT {}", quote_savepoint(name)))
        })
    }
}
