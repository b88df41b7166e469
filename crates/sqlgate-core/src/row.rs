//! Database row representation.
//!
//! Drivers build one [`ColumnInfo`] per result set and share it across the
//! rows they return, so a row is just its values plus an `Arc`. Callers
//! read values positionally with [`Row::get`] or by column name with
//! [`Row::get_named`], which converts through [`FromValue`]:
//!
//! ```ignore
//! let rows = link.query(cx, "SELECT id, name FROM users", &[]).await;
//! for row in &rows {
//!     let id: i64 = row.get_named("id")?;
//!     let name: Option<String> = row.get_named("name")?;
//! }
//! ```

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
///
/// Primary-key discovery reads columns by name on every row, so the name
/// index is built up front.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column names in result order
    names: Vec<String>,
    /// Name -> position; on duplicate names the last column wins
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name. Matching is exact; drivers that
    /// fold identifier case report names the way the engine does.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a database query.
#[derive(Debug, Clone)]
pub struct Row {
    /// Values in column order
    values: Vec<Value>,
    /// Shared with every other row of the same result set
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    ///
    /// Allocates fresh column metadata; drivers producing many rows should
    /// build one [`ColumnInfo`] and use [`Row::with_columns`].
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a typed value by column name.
    ///
    /// A missing column and a failed conversion are both reported as
    /// [`Error::Type`] carrying the column name. `NULL` converts only into
    /// `Option<T>` or [`Value`].
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
            })
        })?;
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Trait for converting from a `Value` to a typed value.
///
/// Implemented for the scalar types sqlgate reads back itself (affected
/// counts, key names, flags) plus `Option<T>` for nullable columns.
/// Conversions follow the `Value::as_*` accessors, so integers widen to
/// `i64` and `f64` but `Text` never parses into numbers.
pub trait FromValue: Sized {
    /// Convert from a Value, returning an error if the conversion fails.
    fn from_value(value: &Value) -> Result<Self>;
}

fn type_error(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
    })
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| type_error("bool", value))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| type_error("i64", value))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| type_error("f64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| type_error("String", value))
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(
            vec!["id".to_string(), "name".to_string(), "note".to_string()],
            vec![Value::BigInt(1), Value::Text("a".to_string()), Value::Null],
        )
    }

    #[test]
    fn test_row_named_access() {
        let row = sample();
        assert_eq!(row.len(), 3);
        assert_eq!(row.get_named::<i64>("id").unwrap(), 1);
        assert_eq!(row.get_named::<String>("name").unwrap(), "a");
        assert_eq!(row.get_named::<Option<String>>("note").unwrap(), None);
    }

    #[test]
    fn test_row_type_error_names_column() {
        let row = sample();
        let err = row.get_named::<i64>("name").unwrap_err();
        match err {
            Error::Type(te) => assert_eq!(te.column.as_deref(), Some("name")),
            other => panic!("expected type error, got {other:?}"),
        }
        assert!(row.get_named::<i64>("missing").is_err());
    }

    #[test]
    fn test_rows_share_column_info() {
        let columns = Arc::new(ColumnInfo::new(vec!["n".to_string(), "n".to_string()]));
        let a = Row::with_columns(Arc::clone(&columns), vec![Value::Int(1), Value::Int(2)]);
        let b = Row::with_columns(Arc::clone(&columns), vec![Value::Null, Value::Null]);
        assert_eq!(Arc::strong_count(&columns), 3);
        assert_eq!(a.get_named::<i64>("n").unwrap(), 2);
        assert!(b.get_named::<i64>("n").is_err());
        assert_eq!(b.get_named::<Option<i64>>("n").unwrap(), None);
        assert!(a.get_named::<i64>("m").is_err());
        assert!(Row::new(Vec::new(), Vec::new()).is_empty());
    }

    #[test]
    fn test_row_iter_preserves_order() {
        let row = sample();
        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["id", "name", "note"]);
    }
}
