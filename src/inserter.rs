//! Duplicate filtering and transactional bulk insert for one batch.
//!
//! Existing keys are looked up first and filtered out in memory, so the bulk
//! insert only carries rows that cannot collide with stored data. A unique
//! violation inside a transaction would otherwise abort the whole batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::record::{CompositeKey, ValidatedRecord};
use crate::retry::{retry_transient, RetryError, RetryPolicy};
use crate::store::{EventStore, StoreError, StoreErrorKind};

/// Bounds for one transaction, separate from the retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransactionTimeouts {
    /// Longest wait to start a transaction.
    pub max_wait: Duration,
    /// Longest a started transaction may run, including the wait.
    pub timeout: Duration,
}

impl Default for TransactionTimeouts {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of one batch. `inserted + skipped + failed` always equals the
/// number of records handed in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchInsertResult {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batch_number: Option<u64>,
    pub error: Option<String>,
}

impl BatchInsertResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn total(&self) -> usize {
        self.inserted + self.skipped + self.failed
    }
}

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("permanent store error: {0}")]
    Permanent(StoreError),
    #[error("store still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StoreError },
}

impl InsertError {
    /// The store error behind this failure.
    pub fn store_error(&self) -> &StoreError {
        match self {
            InsertError::Permanent(e) => e,
            InsertError::RetriesExhausted { last, .. } => last,
        }
    }
}

impl From<RetryError<StoreError>> for InsertError {
    fn from(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Permanent(e) => InsertError::Permanent(e),
            RetryError::Exhausted { attempts, last } => {
                InsertError::RetriesExhausted { attempts, last }
            }
        }
    }
}

/// Keys with a NULL component that this run has already written.
///
/// The existence lookup is null-safe so re-imports of anonymous rows are
/// recognised, but it would also match rows written moments ago by the same
/// run. Those matches are ignored: within one file, anonymous twins are
/// distinct events whichever batch they land in.
#[derive(Debug, Default)]
pub struct RunKeys {
    partial: HashSet<CompositeKey>,
}

impl RunKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }

    fn written_this_run(&self, key: &CompositeKey) -> bool {
        !key.is_fully_specified() && self.partial.contains(key)
    }

    fn record(&mut self, keys: Vec<CompositeKey>) {
        self.partial.extend(keys);
    }
}

#[derive(Debug)]
struct TxOutcome {
    inserted: usize,
    duplicates: usize,
    /// Rows that passed the existence check but were still skipped by the
    /// store, e.g. a concurrent importer won the race.
    races: usize,
    /// Keys with a NULL component among the rows sent to the store.
    partial: Vec<CompositeKey>,
}

#[derive(Clone)]
pub struct BatchInserter {
    store: Arc<dyn EventStore>,
    retry: RetryPolicy,
    timeouts: TransactionTimeouts,
}

impl BatchInserter {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            timeouts: TransactionTimeouts::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TransactionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Insert one batch. Never returns an error: failures are counted.
    /// `run` carries what earlier batches of the same run wrote.
    pub async fn insert_batch(
        &self,
        records: &[ValidatedRecord],
        batch_number: Option<u64>,
        run: &mut RunKeys,
    ) -> BatchInsertResult {
        let mut result = BatchInsertResult {
            batch_number,
            ..Default::default()
        };
        if records.is_empty() {
            return result;
        }

        let keys: Vec<CompositeKey> = records.iter().map(ValidatedRecord::composite_key).collect();
        let known: &RunKeys = run;
        let attempt = retry_transient(&self.retry, StoreError::is_permanent, |_| {
            self.dedup_and_insert(records, &keys, known)
        })
        .await;

        match attempt.map_err(InsertError::from) {
            Ok(outcome) => {
                result.inserted = outcome.inserted;
                result.skipped = outcome.duplicates + outcome.races;
                if outcome.races > 0 {
                    debug!(batch = ?batch_number, races = outcome.races, "store skipped conflicting rows");
                }
                run.record(outcome.partial);
            }
            Err(InsertError::Permanent(cause)) => {
                warn!(batch = ?batch_number, error = %cause, "permanent store error, inserting records one by one");
                return self.isolate(records, batch_number, cause, run).await;
            }
            Err(err) => {
                error!(batch = ?batch_number, error = %err, "batch failed");
                result.failed = records.len();
                result.error = Some(err.to_string());
            }
        }
        result
    }

    /// One transaction: look up existing keys, drop those records, bulk
    /// insert the rest, commit.
    async fn dedup_and_insert(
        &self,
        records: &[ValidatedRecord],
        keys: &[CompositeKey],
        run: &RunKeys,
    ) -> Result<TxOutcome, StoreError> {
        let work = async {
            let mut tx = timeout(self.timeouts.max_wait, self.store.begin())
                .await
                .map_err(|_| {
                    StoreError::timeout(format!(
                        "no transaction available within {:?}",
                        self.timeouts.max_wait
                    ))
                })??;

            let existing = tx.find_existing(keys).await?;
            let (fresh, partial): (Vec<ValidatedRecord>, Vec<CompositeKey>) = records
                .iter()
                .zip(keys)
                .filter(|(_, key)| !existing.contains(*key) || run.written_this_run(key))
                .map(|(record, key)| (record.clone(), key.clone()))
                .unzip();
            let partial: Vec<CompositeKey> = partial
                .into_iter()
                .filter(|key| !key.is_fully_specified())
                .collect();
            let duplicates = records.len() - fresh.len();

            let inserted = if fresh.is_empty() {
                0
            } else {
                tx.insert_skip_duplicates(&fresh).await?
            };
            tx.commit().await?;

            Ok::<_, StoreError>(TxOutcome {
                inserted,
                duplicates,
                races: fresh.len().saturating_sub(inserted),
                partial,
            })
        };

        timeout(self.timeouts.timeout, work).await.map_err(|_| {
            StoreError::timeout(format!(
                "transaction exceeded {:?}",
                self.timeouts.timeout
            ))
        })?
    }

    /// After a permanent error the batch is replayed one record per
    /// transaction so only the offending rows count as failed. Each record
    /// still gets the transient retry schedule.
    async fn isolate(
        &self,
        records: &[ValidatedRecord],
        batch_number: Option<u64>,
        cause: StoreError,
        run: &mut RunKeys,
    ) -> BatchInsertResult {
        let mut result = BatchInsertResult {
            batch_number,
            ..Default::default()
        };
        let mut first_failure = None;

        for record in records {
            let key = record.composite_key();
            let known: &RunKeys = run;
            let attempt = retry_transient(&self.retry, StoreError::is_permanent, |_| {
                self.dedup_and_insert(
                    std::slice::from_ref(record),
                    std::slice::from_ref(&key),
                    known,
                )
            })
            .await;

            match attempt {
                Ok(outcome) => {
                    result.inserted += outcome.inserted;
                    result.skipped += outcome.duplicates + outcome.races;
                    run.record(outcome.partial);
                }
                Err(RetryError::Permanent(e)) if e.kind == StoreErrorKind::UniqueViolation => {
                    result.skipped += 1
                }
                Err(e) => {
                    let e = InsertError::from(e);
                    warn!(batch = ?batch_number, id = record.id(), path = record.path(), error = %e, "record rejected by store");
                    result.failed += 1;
                    first_failure.get_or_insert(e);
                }
            }
        }

        if result.failed > 0 {
            let err = first_failure.unwrap_or(InsertError::Permanent(cause));
            result.error = Some(format!("{} record(s) rejected: {err}", result.failed));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DeviceType, MappedRecord, PageviewAttributes, ReferrerCategory};
    use crate::store::MemoryStore;
    use crate::validate::validate;

    fn record(path: &str, session: Option<&str>) -> ValidatedRecord {
        validate(MappedRecord {
            id: crate::ident::generate_id(),
            timestamp: Some("2024-05-01T08:30:00Z".into()),
            path: Some(path.into()),
            hostname: Some("example.com".into()),
            session_id: session.map(str::to_string),
            device_type: DeviceType::Desktop,
            referrer_category: ReferrerCategory::Direct,
            duration_seconds: 0,
            visibility_changed: false,
            is_unique: false,
            is_robot: false,
            attributes: PageviewAttributes::default(),
            replaced_id: None,
        })
        .unwrap()
    }

    fn inserter(store: &MemoryStore) -> BatchInserter {
        BatchInserter::new(Arc::new(store.clone())).with_retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        })
    }

    #[tokio::test]
    async fn empty_batch_never_touches_the_store() {
        let store = MemoryStore::new();
        let result = inserter(&store).insert_batch(&[], Some(7), &mut RunKeys::new()).await;
        assert_eq!(
            result,
            BatchInsertResult {
                batch_number: Some(7),
                ..Default::default()
            }
        );
        assert!(result.success());
        assert_eq!(store.transactions_started(), 0);
    }

    #[tokio::test]
    async fn duplicates_inside_one_fully_keyed_batch_are_absorbed_by_the_store() {
        let store = MemoryStore::new();
        let a = record("/a", Some("s1"));
        let twin = validate(MappedRecord {
            id: crate::ident::generate_id(),
            timestamp: Some("2024-05-01T08:30:00Z".into()),
            path: Some("/a".into()),
            hostname: Some("example.com".into()),
            session_id: Some("s1".into()),
            device_type: DeviceType::Mobile,
            referrer_category: ReferrerCategory::Direct,
            duration_seconds: 3,
            visibility_changed: true,
            is_unique: false,
            is_robot: false,
            attributes: PageviewAttributes::default(),
            replaced_id: None,
        })
        .unwrap();

        let result = inserter(&store).insert_batch(&[a, twin], None, &mut RunKeys::new()).await;
        assert_eq!((result.inserted, result.skipped, result.failed), (1, 1, 0));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let store = MemoryStore::new();
        store.fail_next_inserts(2).await;
        let result = inserter(&store)
            .insert_batch(&[record("/a", None), record("/b", None)], Some(1), &mut RunKeys::new())
            .await;
        assert_eq!((result.inserted, result.skipped, result.failed), (2, 0, 0));
        assert_eq!(store.insert_calls(), 3);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_whole_batch() {
        let store = MemoryStore::new();
        store.fail_next_inserts(usize::MAX).await;
        let result = inserter(&store)
            .insert_batch(&[record("/a", None), record("/b", None)], Some(4), &mut RunKeys::new())
            .await;

        assert_eq!(store.insert_calls(), 4);
        assert_eq!((result.inserted, result.skipped, result.failed), (0, 0, 2));
        assert!(!result.success());
        let msg = result.error.unwrap();
        assert!(msg.contains("after 4 attempts"), "{msg}");
        assert!(msg.contains("connection reset by peer"), "{msg}");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn permanent_error_is_isolated_to_the_offending_record() {
        let store = MemoryStore::new();
        store
            .reject_path("/broken", StoreErrorKind::ForeignKeyViolation)
            .await;
        let batch = [record("/a", None), record("/broken", None), record("/c", None)];

        let result = inserter(&store).insert_batch(&batch, Some(2), &mut RunKeys::new()).await;

        assert_eq!((result.inserted, result.skipped, result.failed), (2, 0, 1));
        assert_eq!(result.total(), batch.len());
        assert!(result.error.unwrap().contains("foreign key violation"));
        // One bulk attempt, never retried, then one transaction per record.
        assert_eq!(store.transactions_started(), 1 + batch.len());
    }

    #[tokio::test]
    async fn replayed_batch_reports_only_skips() {
        let store = MemoryStore::new();
        let inserter = inserter(&store);
        let mut run = RunKeys::new();
        let a = [record("/a1", Some("s1")), record("/a2", Some("s1"))];
        let b = [
            record("/b1", Some("s1")),
            record("/b2", Some("s1")),
            record("/b3", Some("s1")),
        ];

        let first = inserter.insert_batch(&a, Some(1), &mut run).await;
        let second = inserter.insert_batch(&b, Some(2), &mut run).await;
        let replay = inserter.insert_batch(&a, Some(3), &mut run).await;

        assert_eq!((first.inserted, first.skipped, first.failed), (2, 0, 0));
        assert_eq!((second.inserted, second.skipped, second.failed), (3, 0, 0));
        assert_eq!((replay.inserted, replay.skipped, replay.failed), (0, 2, 0));
        assert_eq!(replay.batch_number, Some(3));
        assert_eq!(store.len().await, 5);
    }

    #[tokio::test]
    async fn transient_errors_during_isolation_are_retried() {
        let store = MemoryStore::new();
        store
            .reject_path("/broken", StoreErrorKind::ForeignKeyViolation)
            .await;
        // The bulk attempt fails permanently before the transient fault is
        // consumed, so the first single-record replay hits it.
        store.fail_next_inserts(1).await;
        let batch = [record("/a", None), record("/broken", None), record("/c", None)];

        let result = inserter(&store)
            .insert_batch(&batch, Some(5), &mut RunKeys::new())
            .await;

        assert_eq!((result.inserted, result.skipped, result.failed), (2, 0, 1));
        // Bulk attempt, /a twice, /broken once, /c once.
        assert_eq!(store.insert_calls(), 5);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn anonymous_twins_split_across_batches_both_insert() {
        let store = MemoryStore::new();
        let inserter = inserter(&store);

        let mut run = RunKeys::new();
        let first = inserter.insert_batch(&[record("/anon", None)], Some(1), &mut run).await;
        let second = inserter.insert_batch(&[record("/anon", None)], Some(2), &mut run).await;
        assert_eq!((first.inserted, second.inserted, second.skipped), (1, 1, 0));
        assert_eq!(run.len(), 1);

        // A later run sees both as already stored.
        let mut rerun = RunKeys::new();
        let again = inserter
            .insert_batch(&[record("/anon", None), record("/anon", None)], Some(1), &mut rerun)
            .await;
        assert_eq!((again.inserted, again.skipped), (0, 2));
        assert!(rerun.is_empty());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn fully_keyed_rows_from_earlier_batches_stay_duplicates() {
        let store = MemoryStore::new();
        let inserter = inserter(&store);
        let mut run = RunKeys::new();
        inserter.insert_batch(&[record("/k", Some("s1"))], Some(1), &mut run).await;
        let second = inserter.insert_batch(&[record("/k", Some("s1"))], Some(2), &mut run).await;
        assert_eq!((second.inserted, second.skipped), (0, 1));
        assert!(run.is_empty());
    }
}
