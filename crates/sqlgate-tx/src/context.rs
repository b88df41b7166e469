//! Transaction context values.
//!
//! A [`TxContext`] is passed explicitly into every unit of work. It records
//! which handle (if any) is current for that call chain. Contexts hold only
//! weak references, so a context that escapes its scope never keeps a
//! connection checked out, and independent call chains can never observe
//! each other's transactions.

use crate::handle::TransactionHandle;
use asupersync::Cx;
use sqlgate_core::{BoxFuture, Error, ExecResult, IsolationLevel, Link, Outcome, Row, Value};
use std::sync::{Arc, Weak};

/// The transactional view of one call chain.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    current: Option<Weak<TransactionHandle>>,
    depth: usize,
}

impl TxContext {
    /// A context with no active transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current handle, if it is still alive and active.
    pub fn active(&self) -> Option<Arc<TransactionHandle>> {
        self.current
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|h| h.is_active())
    }

    /// Whether work run with this context would join a transaction.
    pub fn in_transaction(&self) -> bool {
        self.active().is_some()
    }

    /// Number of propagation boundaries crossed to reach this context.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Isolation level of the active transaction.
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.active().and_then(|h| h.isolation())
    }

    /// Whether the active transaction is read-only.
    pub fn is_read_only(&self) -> bool {
        self.active().is_some_and(|h| h.is_read_only())
    }

    /// A child context bound to `handle`.
    pub fn with_handle(&self, handle: &Arc<TransactionHandle>) -> Self {
        Self {
            current: Some(Arc::downgrade(handle)),
            depth: self.depth + 1,
        }
    }

    /// A child context with the current transaction suspended.
    pub fn detached(&self) -> Self {
        Self {
            current: None,
            depth: self.depth + 1,
        }
    }

    /// A [`Link`] routing statements through the active transaction, or
    /// `fallback` when there is none.
    pub fn link<'a>(&self, fallback: &'a dyn Link) -> ContextLink<'a> {
        match self.active() {
            Some(handle) => ContextLink::Transaction(handle),
            None => ContextLink::Direct(fallback),
        }
    }
}

/// A link resolved from a [`TxContext`].
pub enum ContextLink<'a> {
    /// Statements run on the active transaction.
    Transaction(Arc<TransactionHandle>),
    /// Statements run on a plain connection.
    Direct(&'a dyn Link),
}

impl ContextLink<'_> {
    fn inner(&self) -> &dyn Link {
        match self {
            ContextLink::Transaction(handle) => &**handle,
            ContextLink::Direct(link) => *link,
        }
    }
}

impl Link for ContextLink<'_> {
    fn query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<Vec<Row>, Error>> {
        self.inner().query(cx, sql, params)
    }

    fn execute<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> BoxFuture<'a, Outcome<ExecResult, Error>> {
        self.inner().execute(cx, sql, params)
    }

    fn in_transaction(&self) -> bool {
        self.inner().in_transaction()
    }
}
