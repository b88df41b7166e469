//! The slice of libsqlite3 the driver uses.
//!
//! Raw bindings come from `libsqlite3-sys` (bundled build); this module
//! re-exports the ones the driver needs and wraps the few calls that return
//! static strings.

pub use libsqlite3_sys::{
    SQLITE_BLOB, SQLITE_BUSY, SQLITE_CONSTRAINT, SQLITE_CONSTRAINT_PRIMARYKEY,
    SQLITE_CONSTRAINT_UNIQUE, SQLITE_DONE, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_INTERRUPT,
    SQLITE_LOCKED, SQLITE_NOTFOUND, SQLITE_NULL, SQLITE_OK, SQLITE_OPEN_CREATE,
    SQLITE_OPEN_FULLMUTEX, SQLITE_OPEN_NOMUTEX, SQLITE_OPEN_READONLY, SQLITE_OPEN_READWRITE,
    SQLITE_OPEN_URI, SQLITE_PERM, SQLITE_AUTH, SQLITE_ROW, SQLITE_TEXT, SQLITE_TRANSIENT, sqlite3,
    sqlite3_bind_blob, sqlite3_bind_double, sqlite3_bind_int, sqlite3_bind_int64,
    sqlite3_bind_null, sqlite3_bind_text, sqlite3_busy_timeout, sqlite3_changes,
    sqlite3_column_blob, sqlite3_column_bytes, sqlite3_column_count,
    sqlite3_column_double, sqlite3_column_int64, sqlite3_column_name, sqlite3_column_text,
    sqlite3_column_type, sqlite3_errmsg, sqlite3_exec, sqlite3_extended_errcode, sqlite3_finalize,
    sqlite3_free, sqlite3_last_insert_rowid, sqlite3_open_v2, sqlite3_prepare_v2, sqlite3_step,
    sqlite3_stmt, sqlite3_total_changes,
};

use std::ffi::{CStr, c_int};

// `libsqlite3-sys` blocklists `sqlite3_close_v2` from its generated bindings,
// but the symbol is present in the bundled library.
unsafe extern "C" {
    pub fn sqlite3_close_v2(db: *mut sqlite3) -> c_int;
}

/// The SQLite library version, e.g. `"3.46.0"`.
pub fn version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a static NUL-terminated string
    unsafe { CStr::from_ptr(libsqlite3_sys::sqlite3_libversion()) }
        .to_str()
        .unwrap_or("unknown")
}

/// The SQLite library version as a number (`3046000`).
pub fn version_number() -> i32 {
    // SAFETY: no preconditions
    unsafe { libsqlite3_sys::sqlite3_libversion_number() }
}

/// English description of a result code.
pub fn error_string(code: c_int) -> &'static str {
    // SAFETY: sqlite3_errstr returns a static NUL-terminated string
    unsafe { CStr::from_ptr(libsqlite3_sys::sqlite3_errstr(code)) }
        .to_str()
        .unwrap_or("unknown error")
}

/// Last error message recorded on `db`.
///
/// # Safety
/// `db` must be a valid connection handle.
pub unsafe fn errmsg(db: *mut sqlite3) -> String {
    // SAFETY: db is valid per the caller; errmsg never returns NULL for a
    // valid handle but is checked anyway
    unsafe {
        let ptr = sqlite3_errmsg(db);
        if ptr.is_null() {
            return "unknown error".to_string();
        }
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}
