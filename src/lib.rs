//! Pageview CSV import with duplicate detection.
//!
//! - Input: local CSV exports, optionally gzip/zstd, any WHATWG charset.
//! - Rows whose `datapoint` is not `pageview` are counted and skipped.
//! - Each pageview row is mapped, validated and buffered; full buffers are
//!   flushed through [`BatchInserter`], which drops records already stored
//!   under the same natural key and retries transient store failures.
//!
//! Data shape:
//! - Rows in: `csv_async::StringRecord` addressed through [`ColumnIndex`]
//! - Rows out: [`ValidatedRecord`], persisted through an [`EventStore`]
//! - Per run: [`ImportSummary`] plus a timestamped log file from [`LogManager`]
#![cfg_attr(docsrs, feature(doc_cfg))]
//
mod codec;
pub mod config;
pub mod ident;
pub mod inserter;
mod io;
pub mod mapper;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod retry;
pub mod store;
pub mod validate;

pub use crate::config::{ConfigError, ImportConfig};
pub use crate::inserter::{BatchInsertResult, BatchInserter, InsertError, RunKeys, TransactionTimeouts};
pub use crate::io::{build_source_reader, reader_from_path, Compression, SourceMeta};
pub use crate::mapper::{map_row, ColumnIndex, RawRow};
pub use crate::pipeline::{ImportSummary, PageviewImporter, RowError, REQUIRED_HEADERS};
pub use crate::record::{CompositeKey, DeviceType, MappedRecord, ReferrerCategory, ValidatedRecord};
pub use crate::report::LogManager;
pub use crate::retry::RetryPolicy;
#[cfg(feature = "sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
pub use crate::store::SqliteStore;
pub use crate::store::{EventStore, MemoryStore, StoreError, StoreErrorKind, StoreTransaction};
pub use crate::validate::{validate, ValidationFailure};

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort a whole run. Row and batch failures never surface here;
/// they are counted in [`ImportSummary`].
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Input file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Missing required header: {0}")]
    MissingHeader(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("run log unavailable: {0}")]
    Log(std::io::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv_async::Error),
}

pub type ImportResult<T> = std::result::Result<T, ImportError>;
