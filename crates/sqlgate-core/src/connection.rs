//! Database connection traits.
//!
//! This module defines the downstream contract the transactional core is
//! written against:
//!
//! - [`Link`] - uniform `query`/`execute` over a raw connection or an active
//!   transaction handle
//! - [`RawConnection`] - a checked-out session that can also drive
//!   transaction boundaries and savepoints
//! - [`ConnectionProvider`] - yields raw connections for a [`LinkTarget`]
//! - [`IsolationLevel`] - SQL transaction isolation levels
//!
//! The traits are object-safe (boxed futures) so handles can own a
//! `Box<dyn RawConnection>` regardless of the backing driver. All operations
//! take the caller's `Cx` for cancellation and timeout handling.

use crate::error::Error;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Read uncommitted: transactions can see uncommitted changes from others.
    ReadUncommitted,

    /// Read committed: transactions only see committed changes from others.
    /// This is the default for PostgreSQL and SQL Server.
    #[default]
    ReadCommitted,

    /// Repeatable read: transactions see a consistent snapshot.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Result of executing a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Rows affected as reported by the engine.
    pub rows_affected: u64,
    /// Last generated row id, when the engine reports one.
    pub last_insert_id: Option<i64>,
}

impl ExecResult {
    /// Create a result with the given affected count and no insert id.
    pub const fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            last_insert_id: None,
        }
    }
}

/// Which node of a replicated setup a link should talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LinkRole {
    /// Primary node; receives every write and every transaction.
    #[default]
    Master,
    /// Read replica.
    Slave,
}

/// Logical target a connection is acquired for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LinkTarget {
    pub role: LinkRole,
    pub schema: Option<String>,
}

impl LinkTarget {
    /// The primary node with the provider's default schema.
    pub fn master() -> Self {
        Self::default()
    }

    /// A read replica with the provider's default schema.
    pub fn slave() -> Self {
        Self {
            role: LinkRole::Slave,
            schema: None,
        }
    }

    /// Select a schema on this target.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

/// Uniform statement execution over a connection or a transaction.
pub trait Link: Send + Sync {
    /// Execute a query and return all rows.
    fn query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>>;

    /// Execute a statement and report affected rows.
    fn execute<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<ExecResult, Error>>;

    /// Whether statements on this link run inside a transaction.
    fn in_transaction(&self) -> bool {
        false
    }
}

/// A raw session checked out from a [`ConnectionProvider`].
///
/// Besides plain execution it drives transaction boundaries on its own
/// session. Implementations must serialize statement submission; one
/// session never runs two statements at once.
pub trait RawConnection: Link {
    /// View this connection as a plain [`Link`].
    fn as_link(&self) -> &dyn Link;

    /// Start a transaction on this session.
    fn begin<'a>(
        &'a self,
        cx: &'a Cx,
        isolation: Option<IsolationLevel>,
        read_only: bool,
    ) -> BoxFuture<'a, Outcome<(), Error>>;

    /// Commit the session's transaction.
    fn commit<'a>(&'a self, cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>>;

    /// Roll back the session's transaction.
    fn rollback<'a>(&'a self, cx: &'a Cx) -> BoxFuture<'a, Outcome<(), Error>>;

    /// Create a savepoint.
    fn savepoint<'a>(&'a self, cx: &'a Cx, name: &'a str) -> BoxFuture<'a, Outcome<(), Error>>;

    /// Roll back to a savepoint, keeping the savepoint itself.
    fn rollback_to<'a>(&'a self, cx: &'a Cx, name: &'a str)
    -> BoxFuture<'a, Outcome<(), Error>>;

    /// Release a savepoint.
    fn release<'a>(&'a self, cx: &'a Cx, name: &'a str) -> BoxFuture<'a, Outcome<(), Error>>;
}

/// Source of raw connections, typically a pool.
///
/// Returned connections are exclusively owned by the caller until dropped;
/// dropping one returns it to the provider.
pub trait ConnectionProvider: Send + Sync {
    /// Short engine name used in logs and error context.
    fn engine(&self) -> &'static str;

    /// Check out a connection for `target`.
    fn acquire<'a>(
        &'a self,
        cx: &'a Cx,
        target: &'a LinkTarget,
    ) -> BoxFuture<'a, Outcome<Box<dyn RawConnection>, Error>>;
}
