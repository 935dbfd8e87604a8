//! Identifier parse errors.

use thiserror::Error;

/// Why a string could not be read back as a typed identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Nothing to parse.
    #[error("identifier cannot be empty")]
    Empty,

    /// No `_` between prefix and ULID.
    #[error("identifier '{0}' has no '_' separator")]
    MissingSeparator(String),

    /// The prefix names a different kind of record.
    #[error("identifier prefix mismatch: expected '{expected}', got '{actual}'")]
    WrongKind {
        expected: &'static str,
        actual: String,
    },

    /// The part after the separator is not a ULID.
    #[error("invalid ULID in identifier: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// True when the identifier belonged to another record kind.
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, IdError::WrongKind { .. })
    }
}
