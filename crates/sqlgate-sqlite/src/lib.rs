//! SQLite driver for sqlgate.
//!
//! A [`SqliteConnection`] is a [`RawConnection`](sqlgate_core::RawConnection)
//! over the bundled libsqlite3, and [`SqliteProvider`] hands them out to the
//! transaction manager. Together with the `Sqlite` dialect adapter this is
//! the reference engine the rest of the workspace is tested against.
//!
//! - `BEGIN DEFERRED` by default, `BEGIN IMMEDIATE` for serializable
//! - read-only transactions via `PRAGMA query_only`
//! - primary-key and unique violations surface as
//!   [`QueryErrorKind::Duplicate`](sqlgate_core::QueryErrorKind::Duplicate)
//! - `last_insert_id` is reported for statements that inserted a row
//!
//! ```rust,ignore
//! use sqlgate_sqlite::{SqliteConfig, SqliteProvider};
//!
//! let provider = SqliteProvider::new(SqliteConfig::file("app.db"));
//! provider.open()?.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")?;
//! ```

// FFI bindings require unsafe code
#![allow(unsafe_code)]

pub mod connection;
pub mod ffi;
pub mod provider;
pub mod types;

pub use connection::{JournalMode, OpenFlags, SqliteConfig, SqliteConnection};
pub use provider::SqliteProvider;

/// The linked SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}
