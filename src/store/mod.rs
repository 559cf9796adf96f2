//! Storage collaborator seam.
//!
//! The pipeline needs exactly three things from a store: a unit of work, a
//! set-membership lookup by natural key, and a bulk insert that silently
//! skips rows whose key already exists. It never issues DDL.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{CompositeKey, ValidatedRecord};

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    /// CHECK, NOT NULL and other constraints.
    ConstraintViolation,
    NotFound,
    Timeout,
    Connection,
    Other,
}

impl StoreErrorKind {
    /// Errors that will fail the same way on every retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            StoreErrorKind::UniqueViolation
                | StoreErrorKind::ForeignKeyViolation
                | StoreErrorKind::ConstraintViolation
                | StoreErrorKind::NotFound
        )
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreErrorKind::UniqueViolation => "unique constraint violation",
            StoreErrorKind::ForeignKeyViolation => "foreign key violation",
            StoreErrorKind::ConstraintViolation => "constraint violation",
            StoreErrorKind::NotFound => "not found",
            StoreErrorKind::Timeout => "timeout",
            StoreErrorKind::Connection => "connection error",
            StoreErrorKind::Other => "store error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}{}", .code.as_ref().map(|c| format!(" (code {c})")).unwrap_or_default())]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
    /// Backend-specific error code, when the backend has one.
    pub code: Option<String>,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Timeout, message)
    }

    pub fn is_permanent(&self) -> bool {
        self.kind.is_permanent()
    }
}

/// Opens units of work against the pageview table.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// One unit of work. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Keys from `keys` that already exist. One query regardless of how many
    /// keys are passed. Matching is null-safe per component.
    async fn find_existing(
        &mut self,
        keys: &[CompositeKey],
    ) -> Result<HashSet<CompositeKey>, StoreError>;

    /// Insert `records`, skipping any whose natural key or id conflicts with a
    /// stored row. Returns how many rows were actually written.
    async fn insert_skip_duplicates(
        &mut self,
        records: &[ValidatedRecord],
    ) -> Result<usize, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StoreErrorKind::UniqueViolation.is_permanent());
        assert!(StoreErrorKind::ForeignKeyViolation.is_permanent());
        assert!(StoreErrorKind::ConstraintViolation.is_permanent());
        assert!(StoreErrorKind::NotFound.is_permanent());
        assert!(!StoreErrorKind::Timeout.is_permanent());
        assert!(!StoreErrorKind::Connection.is_permanent());
        assert!(!StoreErrorKind::Other.is_permanent());
    }

    #[test]
    fn display_includes_code() {
        let err = StoreError::new(StoreErrorKind::Connection, "socket closed").with_code("08006");
        assert_eq!(err.to_string(), "connection error: socket closed (code 08006)");
        let err = StoreError::timeout("transaction exceeded 30s");
        assert_eq!(err.to_string(), "timeout: transaction exceeded 30s");
    }
}
