//! Error types for the entity store.
//!
//! The variants fall into four kinds (see [`ErrorKind`]): not-found,
//! validation, permission, and internal. The first three are
//! recoverable and carry enough structure (field name, expected/actual
//! detail) for a caller to produce a precise user-facing message; the
//! internal kind covers database, pool and filesystem faults that a
//! request layer should surface as a server-side failure.

use thiserror::Error;

fn length_lower_bound(min: Option<u64>) -> String {
    match min {
        Some(min) => format!("between {min} and"),
        None => "at most".to_string(),
    }
}

/// Coarse classification of a [`StoreError`], for mapping to a
/// transport-level response category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The identifier or key does not resolve to a live row.
    NotFound,
    /// Length, format, uniqueness or role-mismatch violation.
    Validation,
    /// Attempted mutation or deletion of a reserved entity.
    Permission,
    /// Database, pool or filesystem fault.
    Internal,
}

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No live row matches the given key.
    #[error("{entity} was not found by {key} {value}")]
    NotFound {
        entity: &'static str,
        key: &'static str,
        value: String,
    },

    /// A value's length falls outside its allowed bounds.
    #[error(
        "{field} has invalid length of {actual} {units} (expected {} {max} {units})",
        length_lower_bound(*min)
    )]
    WrongLength {
        field: &'static str,
        units: &'static str,
        /// Lower bound, where one applies. Every current length check
        /// is an upper-bound-only one, but the variant carries the
        /// full contract.
        min: Option<u64>,
        max: u64,
        actual: u64,
    },

    /// A fixed-length hash has the wrong length.
    #[error("hash of {field} must be {expected} (not {actual}) bytes long")]
    WrongHashLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A unique value is already in use.
    #[error("{field} {value:?} is already taken")]
    AlreadyTaken { field: &'static str, value: String },

    /// A value is malformed.
    #[error("{field} is invalid: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    /// Two values that must agree do not.
    #[error("{field} mismatch: {detail}")]
    Mismatch { field: &'static str, detail: String },

    /// The operation is forbidden for this entity.
    #[error("{operation} is not allowed")]
    Permission { operation: &'static str },

    /// A database statement failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A filesystem operation (watermark file) failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A migration failed during startup.
    #[error(transparent)]
    Migration(#[from] crate::migrations::MigrationError),
}

impl StoreError {
    /// Classifies this error for transport-layer mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::WrongLength { .. }
            | StoreError::WrongHashLength { .. }
            | StoreError::AlreadyTaken { .. }
            | StoreError::InvalidValue { .. }
            | StoreError::Mismatch { .. } => ErrorKind::Validation,
            StoreError::Permission { .. } => ErrorKind::Permission,
            StoreError::Database(_)
            | StoreError::Pool(_)
            | StoreError::Io(_)
            | StoreError::Migration(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn not_found(
        entity: &'static str,
        key: &'static str,
        value: impl ToString,
    ) -> Self {
        StoreError::NotFound {
            entity,
            key,
            value: value.to_string(),
        }
    }
}
