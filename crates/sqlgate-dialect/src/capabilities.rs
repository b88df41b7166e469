//! What a backend can express natively.

use serde::{Deserialize, Serialize};

/// Native upsert syntax supported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeUpsert {
    /// `INSERT ... ON CONFLICT (...) DO UPDATE / DO NOTHING`
    OnConflict,
    /// `MERGE INTO ... USING ... ON (...)`
    Merge,
    /// No native upsert; writes are probed row by row.
    None,
}

/// Static capabilities of a dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialectCapabilities {
    pub native_upsert: NativeUpsert,
    pub quote_left: char,
    pub quote_right: char,
    /// Whether `WHEN MATCHED THEN UPDATE` may assign columns referenced in
    /// the MERGE `ON` clause.
    pub supports_merge_updating_conflict_cols: bool,
}

impl DialectCapabilities {
    /// Capabilities of an `ON CONFLICT` backend quoting with `"`.
    pub const fn on_conflict() -> Self {
        Self {
            native_upsert: NativeUpsert::OnConflict,
            quote_left: '"',
            quote_right: '"',
            supports_merge_updating_conflict_cols: false,
        }
    }

    /// Capabilities of a MERGE backend.
    pub const fn merge(quote_left: char, quote_right: char, updates_conflict_cols: bool) -> Self {
        Self {
            native_upsert: NativeUpsert::Merge,
            quote_left,
            quote_right,
            supports_merge_updating_conflict_cols: updates_conflict_cols,
        }
    }

    /// Capabilities of a backend without native upsert.
    pub const fn none() -> Self {
        Self {
            native_upsert: NativeUpsert::None,
            quote_left: '"',
            quote_right: '"',
            supports_merge_updating_conflict_cols: false,
        }
    }
}
