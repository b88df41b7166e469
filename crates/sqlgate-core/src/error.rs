//! Error types for sqlgate operations.

use std::fmt;

/// The primary error type for all sqlgate operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (acquire, disconnect)
    Connection(ConnectionError),
    /// Query execution errors reported by the engine
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction lifecycle and propagation errors
    Transaction(TransactionError),
    /// Statement synthesis errors raised by a dialect
    Dialect(DialectError),
    /// An error annotated with the write operation that produced it
    Write(WriteError),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// No connection could be checked out for the target
    Unavailable,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Unique or primary key violation
    Duplicate,
    /// Any other constraint violation (foreign key, check, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Lock contention or deadlock
    Deadlock,
    /// Statement timeout
    Timeout,
    /// Cancelled
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    /// The error that was being handled when this one occurred.
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Operation on a handle that is no longer active
    Closed,
    /// Propagation mode forbids the current transaction state
    PropagationViolation,
    /// Savepoint not found on the handle's stack
    SavepointNotFound,
    /// Savepoint name already used within this handle's lifetime
    SavepointExists,
    /// Rollback failed while cleaning up another failure
    RollbackFailed,
    /// The unit of work panicked
    Panicked,
}

#[derive(Debug)]
pub struct DialectError {
    pub kind: DialectErrorKind,
    pub dialect: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectErrorKind {
    /// Save/Replace with no explicit or discoverable conflict key
    MissingConflictKey,
    /// The dialect structurally cannot express the operation
    UnsupportedOperation,
    /// The write request itself is malformed (no rows, ragged columns)
    InvalidInput,
}

/// Operation/table/dialect context wrapped around an underlying error.
#[derive(Debug)]
pub struct WriteError {
    pub operation: &'static str,
    pub table: String,
    pub dialect: &'static str,
    pub source: Box<Error>,
}

impl Error {
    /// Is this a unique/primary key violation?
    ///
    /// Looks through write context wrappers.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Error::Query(q) => q.is_unique_violation(),
            Error::Write(w) => w.source.is_duplicate_key(),
            _ => false,
        }
    }

    /// Is this a retryable error (deadlock, lock contention, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock | QueryErrorKind::Timeout),
            Error::Write(w) => w.source.is_retryable(),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// The transaction error kind, if this is a transaction error.
    pub fn transaction_kind(&self) -> Option<TransactionErrorKind> {
        match self {
            Error::Transaction(t) => Some(t.kind),
            Error::Write(w) => w.source.transaction_kind(),
            _ => None,
        }
    }

    /// The dialect error kind, if this is a synthesis error.
    pub fn dialect_kind(&self) -> Option<DialectErrorKind> {
        match self {
            Error::Dialect(d) => Some(d.kind),
            Error::Write(w) => w.source.dialect_kind(),
            _ => None,
        }
    }

    /// Is this a propagation violation?
    pub fn is_propagation_violation(&self) -> bool {
        self.transaction_kind() == Some(TransactionErrorKind::PropagationViolation)
    }

    /// Is this an operation on a closed transaction handle?
    pub fn is_transaction_closed(&self) -> bool {
        self.transaction_kind() == Some(TransactionErrorKind::Closed)
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Write(w) => w.source.sqlstate(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Write(w) => w.source.sql(),
            _ => None,
        }
    }

    /// Wrap this error with the write operation that produced it.
    ///
    /// Errors that already carry write context are returned unchanged.
    #[must_use]
    pub fn with_context(self, operation: &'static str, table: &str, dialect: &'static str) -> Self {
        match self {
            Error::Write(_) => self,
            other => Error::Write(WriteError {
                operation,
                table: table.to_string(),
                dialect,
                source: Box::new(other),
            }),
        }
    }

    /// Build a transaction error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a dialect error.
    pub fn dialect(kind: DialectErrorKind, dialect: &'static str, message: impl Into<String>) -> Self {
        Error::Dialect(DialectError {
            kind,
            dialect,
            message: message.into(),
        })
    }

    /// Merge a failed rollback with the error that triggered it.
    ///
    /// The rollback failure becomes the primary error; the original is kept
    /// as its source so neither is lost.
    pub fn rollback_failed(rollback: Error, original: Error) -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::RollbackFailed,
            message: format!("rollback failed: {rollback}; original error: {original}"),
            source: Some(Box::new(original)),
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.kind == QueryErrorKind::Duplicate
            || matches!(self.sqlstate.as_deref(), Some("23505" | "23000"))
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Dialect(e) => write!(f, "Dialect error ({}): {}", e.dialect, e.message),
            Error::Write(e) => write!(f, "{}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Transaction(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Write(e) => Some(&*e.source),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DialectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on table '{}' ({}): {}",
            self.operation, self.table, self.dialect, self.source
        )
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<DialectError> for Error {
    fn from(err: DialectError) -> Self {
        Error::Dialect(err)
    }
}

/// Result type alias for sqlgate operations.
pub type Result<T> = std::result::Result<T, Error>;
