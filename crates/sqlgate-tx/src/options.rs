//! Transaction options and propagation modes.

use serde::{Deserialize, Serialize};
use sqlgate_core::IsolationLevel;
use std::fmt;

/// How a unit of work relates to the transaction already active on the
/// calling context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Propagation {
    /// Join the active transaction, or begin a new one if none is active.
    #[default]
    Required,
    /// Always begin a fresh transaction on a separate connection, suspending
    /// the active one until the work returns.
    RequiresNew,
    /// Run inside a savepoint of the active transaction, or begin a new one
    /// if none is active.
    Nested,
    /// Run outside any transaction, suspending the active one.
    NotSupported,
    /// Run outside any transaction; fail if one is active.
    Never,
    /// Join the active transaction; fail if none is active.
    Mandatory,
    /// Join the active transaction if there is one, otherwise run without.
    Supports,
}

impl Propagation {
    /// Every propagation mode, in declaration order.
    pub const ALL: [Propagation; 7] = [
        Propagation::Required,
        Propagation::RequiresNew,
        Propagation::Nested,
        Propagation::NotSupported,
        Propagation::Never,
        Propagation::Mandatory,
        Propagation::Supports,
    ];

    /// Stable upper-snake name used in logs and error messages.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Nested => "NESTED",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Never => "NEVER",
            Propagation::Mandatory => "MANDATORY",
            Propagation::Supports => "SUPPORTS",
        }
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for one transactional unit of work.
///
/// `isolation` and `read_only` only take effect when a new transaction is
/// begun; joined transactions keep the settings they were begun with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxOptions {
    pub propagation: Propagation,
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    /// Default options (`Required`, engine isolation, read-write).
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with the given propagation mode.
    pub fn with_propagation(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    /// Set the propagation mode.
    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set the isolation level for newly begun transactions.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Mark newly begun transactions read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

impl From<Propagation> for TxOptions {
    fn from(propagation: Propagation) -> Self {
        Self::with_propagation(propagation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_required() {
        let opts = TxOptions::default();
        assert_eq!(opts.propagation, Propagation::Required);
        assert_eq!(opts.isolation, None);
        assert!(!opts.read_only);
    }

    #[test]
    fn test_builder() {
        let opts = TxOptions::new()
            .propagation(Propagation::Nested)
            .isolation(IsolationLevel::Serializable)
            .read_only(true);
        assert_eq!(opts.propagation, Propagation::Nested);
        assert_eq!(opts.isolation, Some(IsolationLevel::Serializable));
        assert!(opts.read_only);
        assert_eq!(TxOptions::from(Propagation::Never).propagation, Propagation::Never);
    }

    #[test]
    fn test_names_are_distinct() {
        let names: std::collections::HashSet<_> =
            Propagation::ALL.iter().map(Propagation::as_str).collect();
        assert_eq!(names.len(), Propagation::ALL.len());
        assert_eq!(Propagation::RequiresNew.to_string(), "REQUIRES_NEW");
    }
}
