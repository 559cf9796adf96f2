//! Streaming import: read → filter → map → validate → batch → insert.
//!
//! Intake and flushing run on the same task. When the buffer fills, the
//! reader is not polled again until the flush future completes, so at most
//! one batch is ever in flight against the store.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use csv_async::{AsyncReaderBuilder, ByteRecord, StringRecord};
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{debug, info};

use crate::config::ImportConfig;
use crate::inserter::{BatchInsertResult, BatchInserter, RunKeys};
use crate::io::{reader_from_path, READ_BUFFER};
use crate::mapper::{map_row, ColumnIndex, RawRow};
use crate::record::ValidatedRecord;
use crate::report::LogManager;
use crate::store::EventStore;
use crate::validate::validate;
use crate::{ImportError, ImportResult};

/// Columns a file must have to be importable at all.
pub const REQUIRED_HEADERS: &[&str] = &["datapoint", "path"];

/// Distinct skipped `datapoint` values tracked by name; the rest are lumped.
const MAX_TRACKED_DATAPOINTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowError {
    /// Line in the input file where the row starts.
    pub row: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchError {
    pub batch: u64,
    pub message: String,
}

/// Final report of one run.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub source: String,
    pub log_file: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Data rows read, whatever their type.
    pub total_rows: u64,
    /// Rows whose `datapoint` matched the filter.
    pub processed: u64,
    pub skipped_other_types: u64,
    pub skipped_by_type: BTreeMap<String, u64>,
    pub inserted: u64,
    pub skipped_duplicates: u64,
    pub validation_failed: u64,
    pub insert_failed: u64,
    pub identifiers_replaced: u64,
    pub batches: u64,
    pub malformed_chunks: u64,
    /// First `max_recorded_errors` row errors; the run log has all of them.
    pub row_errors: Vec<RowError>,
    pub batch_errors: Vec<BatchError>,
    #[serde(skip)]
    error_preview: usize,
}

impl ImportSummary {
    pub fn failed(&self) -> u64 {
        self.validation_failed + self.insert_failed
    }

    /// Pageview rows handled per second.
    pub fn throughput(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.processed as f64 / self.duration_secs
        } else {
            self.processed as f64
        }
    }

    /// A run succeeds when it inserted something or found everything already
    /// present, so re-running an imported file is not reported as a failure.
    pub fn is_success(&self) -> bool {
        self.inserted > 0 || self.skipped_duplicates > 0
    }

    pub fn error_preview(&self) -> &[RowError] {
        &self.row_errors[..self.row_errors.len().min(self.error_preview)]
    }
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Source:                 {}", self.source)?;
        writeln!(f, "Started:                {}", self.started_at.to_rfc3339())?;
        writeln!(f, "Finished:               {}", self.finished_at.to_rfc3339())?;
        writeln!(f, "Duration:               {:.2}s", self.duration_secs)?;
        writeln!(f, "Rows read:              {}", self.total_rows)?;
        writeln!(f, "Rows processed:         {}", self.processed)?;
        writeln!(f, "Skipped (other types):  {}", self.skipped_other_types)?;
        for (kind, n) in &self.skipped_by_type {
            writeln!(f, "  {kind}: {n}")?;
        }
        writeln!(f, "Inserted:               {}", self.inserted)?;
        writeln!(f, "Skipped (duplicates):   {}", self.skipped_duplicates)?;
        writeln!(
            f,
            "Failed:                 {} (validation {}, insert {})",
            self.failed(),
            self.validation_failed,
            self.insert_failed
        )?;
        writeln!(f, "Identifiers replaced:   {}", self.identifiers_replaced)?;
        writeln!(f, "Batches processed:      {}", self.batches)?;
        write!(f, "Throughput:             {:.0} records/s", self.throughput())?;
        if self.malformed_chunks > 0 {
            write!(
                f,
                "\nCharset warnings:       {} chunk(s) contained undecodable bytes",
                self.malformed_chunks
            )?;
        }
        let preview = self.error_preview();
        if !preview.is_empty() {
            write!(f, "\nValidation errors (first {}):", preview.len())?;
            for e in preview {
                write!(f, "\n  row {}: {}", e.row, e.message)?;
            }
            let hidden = self.validation_failed.saturating_sub(preview.len() as u64);
            if hidden > 0 {
                write!(f, "\n  ... and {hidden} more (see the run log)")?;
            }
        }
        for e in &self.batch_errors {
            write!(f, "\nBatch {} error: {}", e.batch, e.message)?;
        }
        Ok(())
    }
}

/// Running totals, owned by one run.
#[derive(Debug)]
struct ImportStats {
    started_at: DateTime<Utc>,
    clock: Instant,
    total_rows: u64,
    processed: u64,
    skipped_by_type: BTreeMap<String, u64>,
    skipped_other_types: u64,
    inserted: u64,
    skipped_duplicates: u64,
    validation_failed: u64,
    insert_failed: u64,
    identifiers_replaced: u64,
    batches: u64,
    row_errors: Vec<RowError>,
    batch_errors: Vec<BatchError>,
    max_recorded_errors: usize,
    written: RunKeys,
}

impl ImportStats {
    fn new(max_recorded_errors: usize) -> Self {
        Self {
            started_at: Utc::now(),
            clock: Instant::now(),
            total_rows: 0,
            processed: 0,
            skipped_by_type: BTreeMap::new(),
            skipped_other_types: 0,
            inserted: 0,
            skipped_duplicates: 0,
            validation_failed: 0,
            insert_failed: 0,
            identifiers_replaced: 0,
            batches: 0,
            row_errors: Vec::new(),
            batch_errors: Vec::new(),
            max_recorded_errors,
            written: RunKeys::new(),
        }
    }

    /// Count a skipped row type; true the first time the type is seen.
    fn skip_type(&mut self, datapoint: &str) -> bool {
        self.skipped_other_types += 1;
        if let Some(n) = self.skipped_by_type.get_mut(datapoint) {
            *n += 1;
            return false;
        }
        let key = if self.skipped_by_type.len() < MAX_TRACKED_DATAPOINTS {
            datapoint.to_string()
        } else {
            "(other)".to_string()
        };
        *self.skipped_by_type.entry(key).or_insert(0) += 1;
        true
    }

    fn row_failed(&mut self, row: u64, message: String) {
        self.validation_failed += 1;
        if self.row_errors.len() < self.max_recorded_errors {
            self.row_errors.push(RowError { row, message });
        }
    }

    fn merge(&mut self, result: &BatchInsertResult) {
        self.batches += 1;
        self.inserted += result.inserted as u64;
        self.skipped_duplicates += result.skipped as u64;
        self.insert_failed += result.failed as u64;
        if let Some(message) = &result.error {
            if self.batch_errors.len() < self.max_recorded_errors {
                self.batch_errors.push(BatchError {
                    batch: result.batch_number.unwrap_or(self.batches),
                    message: message.clone(),
                });
            }
        }
    }

    fn finish(
        self,
        source: String,
        log_file: Option<PathBuf>,
        malformed_chunks: u64,
        error_preview: usize,
    ) -> ImportSummary {
        ImportSummary {
            source,
            log_file,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_secs: self.clock.elapsed().as_secs_f64(),
            total_rows: self.total_rows,
            processed: self.processed,
            skipped_other_types: self.skipped_other_types,
            skipped_by_type: self.skipped_by_type,
            inserted: self.inserted,
            skipped_duplicates: self.skipped_duplicates,
            validation_failed: self.validation_failed,
            insert_failed: self.insert_failed,
            identifiers_replaced: self.identifiers_replaced,
            batches: self.batches,
            malformed_chunks,
            row_errors: self.row_errors,
            batch_errors: self.batch_errors,
            error_preview,
        }
    }
}

/// Drives one import run at a time against a store.
#[derive(Clone)]
pub struct PageviewImporter {
    inserter: BatchInserter,
    config: ImportConfig,
}

impl PageviewImporter {
    pub fn new(store: Arc<dyn EventStore>, config: ImportConfig) -> Self {
        let inserter = BatchInserter::new(store)
            .with_retry(config.retry)
            .with_timeouts(config.timeouts);
        Self { inserter, config }
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Import one file. Aborts only on errors that make the whole run
    /// unusable; row and batch failures are counted in the summary.
    pub async fn run(&self, path: &Path, log: &mut LogManager) -> ImportResult<ImportSummary> {
        log.info(format!("Starting import of {}", path.display()));
        let result = async {
            self.config.validate()?;
            let charset = self.config.encoding()?;
            let (reader, meta) = reader_from_path(path, charset).await?;
            if charset != encoding_rs::UTF_8 {
                log.info(format!("Decoding input as {}", charset.name()));
            }
            let mut summary = self
                .run_reader(reader, &path.display().to_string(), log)
                .await?;
            summary.malformed_chunks = meta.malformed_chunks();
            if summary.malformed_chunks > 0 {
                log.warn(format!(
                    "{} chunk(s) contained bytes invalid for {}; they were replaced",
                    summary.malformed_chunks,
                    charset.name()
                ));
            }
            Ok::<_, ImportError>(summary)
        }
        .await;

        match result {
            Ok(summary) => {
                log.write_summary(&summary);
                Ok(summary)
            }
            Err(e) => {
                log.error(format!("Import aborted: {e}"));
                Err(e)
            }
        }
    }

    /// Import from any reader of UTF-8 CSV text. Does not write the summary
    /// block; [`PageviewImporter::run`] does.
    pub async fn run_reader<R>(
        &self,
        reader: R,
        source: &str,
        log: &mut LogManager,
    ) -> ImportResult<ImportSummary>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        self.config.validate()?;
        let mut rdr = AsyncReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .buffer_capacity(READ_BUFFER)
            .create_reader(reader);

        let headers = rdr.headers().await?.clone();
        let columns = ColumnIndex::from_headers(&headers);
        if let Some(missing) = REQUIRED_HEADERS.iter().find(|h| !columns.contains(h)) {
            return Err(ImportError::MissingHeader(missing.to_string()));
        }

        let mut stats = ImportStats::new(self.config.max_recorded_errors);
        let mut buffer: Vec<ValidatedRecord> = Vec::with_capacity(self.config.batch_size);
        let mut raw = ByteRecord::new();
        info!(source, batch_size = self.config.batch_size, "import started");

        while rdr.read_byte_record(&mut raw).await? {
            stats.total_rows += 1;
            // Header is line 1; fall back to counting if the reader has no position.
            let line = raw
                .position()
                .map(|p| p.line())
                .unwrap_or(stats.total_rows + 1);

            let record = match StringRecord::from_byte_record(std::mem::replace(&mut raw, ByteRecord::new())) {
                Ok(record) => record,
                Err(e) => {
                    let message = format!("invalid UTF-8: {}", e.utf8_error());
                    log.warn(format!("Row {line}: {message}"));
                    stats.processed += 1;
                    stats.row_failed(line, message);
                    raw = e.into_byte_record();
                    continue;
                }
            };

            self.handle_row(RawRow::new(&columns, &record), line, &mut stats, &mut buffer, log);
            raw = record.into_byte_record();

            if buffer.len() >= self.config.batch_size {
                self.flush(&mut buffer, &mut stats, log).await;
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut buffer, &mut stats, log).await;
        }

        let summary = stats.finish(
            source.to_string(),
            Some(log.path().to_path_buf()),
            0,
            self.config.error_preview,
        );
        info!(
            source,
            rows = summary.total_rows,
            inserted = summary.inserted,
            skipped = summary.skipped_duplicates,
            failed = summary.failed(),
            "import finished"
        );
        Ok(summary)
    }

    fn handle_row(
        &self,
        row: RawRow<'_>,
        line: u64,
        stats: &mut ImportStats,
        buffer: &mut Vec<ValidatedRecord>,
        log: &mut LogManager,
    ) {
        let datapoint = row.get("datapoint").unwrap_or_default();
        if datapoint != self.config.datapoint_filter {
            if stats.skip_type(datapoint) {
                log.info(format!(
                    "Row {line}: skipping datapoint '{datapoint}' (only '{}' is imported; further rows of this type are counted silently)",
                    self.config.datapoint_filter
                ));
            }
            return;
        }
        stats.processed += 1;

        let mapped = map_row(&row);
        if let Some(original) = &mapped.replaced_id {
            stats.identifiers_replaced += 1;
            log.info(format!(
                "Row {line}: replaced identifier '{original}' with '{}'",
                mapped.id
            ));
        }

        match validate(mapped) {
            Ok(record) => buffer.push(record),
            Err(failure) => {
                let message = failure.to_string();
                log.warn(format!("Row {line}: {message}"));
                stats.row_failed(line, message);
            }
        }
    }

    /// Flush the buffer through the inserter. Intake is suspended for the
    /// duration because the caller awaits this before reading another row.
    async fn flush(
        &self,
        buffer: &mut Vec<ValidatedRecord>,
        stats: &mut ImportStats,
        log: &mut LogManager,
    ) {
        let batch_number = stats.batches + 1;
        debug!(batch_number, size = buffer.len(), "intake paused, flushing batch");

        let result = self
            .inserter
            .insert_batch(buffer, Some(batch_number), &mut stats.written)
            .await;
        debug_assert_eq!(result.total(), buffer.len());
        buffer.clear();
        stats.merge(&result);

        if let Some(err) = &result.error {
            log.error(format!("Batch {batch_number}: {err}"));
        }
        if result.skipped > 0 {
            log.info(format!(
                "Batch {batch_number}: skipped {} duplicate record(s)",
                result.skipped
            ));
        }
        debug!(
            batch_number,
            inserted = result.inserted,
            skipped = result.skipped,
            failed = result.failed,
            "batch flushed, intake resumed"
        );

        if batch_number % self.config.progress_every == 0 {
            log.info(format!(
                "Progress: {} batches, {} rows read, {} inserted, {} duplicates, {} failed",
                stats.batches,
                stats.total_rows,
                stats.inserted,
                stats.skipped_duplicates,
                stats.validation_failed + stats.insert_failed
            ));
        }
    }
}
