//! In-process store with SQL NULL semantics and fault injection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{EventStore, StoreError, StoreErrorKind, StoreTransaction};
use crate::record::{CompositeKey, ValidatedRecord};

#[derive(Debug, Default)]
struct State {
    rows: Vec<ValidatedRecord>,
    ids: HashSet<String>,
    keys: HashSet<CompositeKey>,
    transient_failures: usize,
    rejected_paths: HashMap<String, StoreErrorKind>,
}

#[derive(Debug, Default)]
struct Counters {
    transactions: AtomicUsize,
    insert_calls: AtomicUsize,
}

/// Everything lives behind one async mutex; a transaction holds it for its
/// whole lifetime, so there is exactly one writer at a time.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    counters: Arc<Counters>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` bulk-insert calls that are not rejected by path fail
    /// with a connection error. `usize::MAX` means every call fails.
    pub async fn fail_next_inserts(&self, n: usize) {
        self.state.lock().await.transient_failures = n;
    }

    /// Any bulk insert containing a record for `path` fails with `kind`
    /// and writes nothing.
    pub async fn reject_path(&self, path: impl Into<String>, kind: StoreErrorKind) {
        self.state.lock().await.rejected_paths.insert(path.into(), kind);
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn records(&self) -> Vec<ValidatedRecord> {
        self.state.lock().await.rows.clone()
    }

    pub fn transactions_started(&self) -> usize {
        self.counters.transactions.load(Ordering::Relaxed)
    }

    pub fn insert_calls(&self) -> usize {
        self.counters.insert_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let state = self.state.clone().lock_owned().await;
        self.counters.transactions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryTransaction {
            state,
            counters: self.counters.clone(),
            staged: Vec::new(),
            staged_ids: HashSet::new(),
            staged_keys: HashSet::new(),
        }))
    }
}

struct MemoryTransaction {
    state: OwnedMutexGuard<State>,
    counters: Arc<Counters>,
    staged: Vec<ValidatedRecord>,
    staged_ids: HashSet<String>,
    staged_keys: HashSet<CompositeKey>,
}

impl MemoryTransaction {
    fn conflicts(&self, record: &ValidatedRecord, key: &CompositeKey) -> bool {
        if self.state.ids.contains(record.id()) || self.staged_ids.contains(record.id()) {
            return true;
        }
        // NULL never equals NULL under the unique index.
        key.is_fully_specified()
            && (self.state.keys.contains(key) || self.staged_keys.contains(key))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn find_existing(
        &mut self,
        keys: &[CompositeKey],
    ) -> Result<HashSet<CompositeKey>, StoreError> {
        Ok(keys
            .iter()
            .filter(|k| self.state.keys.contains(*k) || self.staged_keys.contains(*k))
            .cloned()
            .collect())
    }

    async fn insert_skip_duplicates(
        &mut self,
        records: &[ValidatedRecord],
    ) -> Result<usize, StoreError> {
        self.counters.insert_calls.fetch_add(1, Ordering::Relaxed);

        if let Some((path, kind)) = records
            .iter()
            .find_map(|r| self.state.rejected_paths.get_key_value(r.path()))
        {
            return Err(StoreError::new(*kind, format!("rejected row for path {path}")));
        }
        if self.state.transient_failures > 0 {
            if self.state.transient_failures != usize::MAX {
                self.state.transient_failures -= 1;
            }
            return Err(StoreError::new(
                StoreErrorKind::Connection,
                "connection reset by peer",
            ));
        }

        let mut inserted = 0;
        for record in records {
            let key = record.composite_key();
            if self.conflicts(record, &key) {
                continue;
            }
            self.staged_ids.insert(record.id().to_string());
            self.staged_keys.insert(key);
            self.staged.push(record.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut state,
            staged,
            staged_ids,
            staged_keys,
            ..
        } = *self;
        state.ids.extend(staged_ids);
        state.keys.extend(staged_keys);
        state.rows.extend(staged);
        Ok(())
    }
}
