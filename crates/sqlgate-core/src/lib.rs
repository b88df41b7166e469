//! Core types and traits for sqlgate.
//!
//! This crate provides the foundational abstractions shared by the
//! transaction manager, the dialect layer and the drivers:
//!
//! - `Value` / `Row` for statement arguments and results
//! - `Error` taxonomy with duplicate-key and propagation classification
//! - `Link`, `RawConnection` and `ConnectionProvider` downstream traits
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod error;
pub mod row;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod value;

pub use connection::{
    BoxFuture, ConnectionProvider, ExecResult, IsolationLevel, Link, LinkRole, LinkTarget,
    RawConnection,
};
pub use error::{
    ConnectionError, ConnectionErrorKind, DialectError, DialectErrorKind, Error, QueryError,
    QueryErrorKind, Result, TransactionError, TransactionErrorKind, WriteError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;

/// Unwrap an `Outcome::Ok`, returning every other variant from the
/// enclosing function unchanged.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result::Ok`, returning `Outcome::Err` from the enclosing
/// function on error.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            ::std::result::Result::Ok(v) => v,
            ::std::result::Result::Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}
