//! Change-aware upserts.
//!
//! Each record is compared against what the sink already holds for its key:
//! new keys are created, changed fields overwrite (latest observation wins),
//! identical fields are left untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    CollectionOutcome, DiffReport, ErrorKind, Fields, NormalizedRecord, RecordKey, SourceIdentity,
    TimeWindow,
};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to encode record fields: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("sink state poisoned by an earlier panic")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Created,
    Updated,
}

/// One line of run history: what a task did, kept for later inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub run_id: Uuid,
    pub identity: SourceIdentity,
    pub time_window: Option<TimeWindow>,
    pub success: bool,
    pub item_count: usize,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunHistoryEntry {
    pub fn from_outcome(run_id: Uuid, outcome: &CollectionOutcome) -> Self {
        Self {
            run_id,
            identity: outcome.identity.clone(),
            time_window: outcome.time_window,
            success: outcome.success,
            item_count: outcome.record_count(),
            error_kind: outcome.error_kind,
            error_detail: outcome.error_detail.clone(),
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
        }
    }
}

/// Storage the engine writes through. Schema, indexing and transactions are
/// the implementation's business.
pub trait RecordSink: Send + Sync {
    fn exists(&self, key: &RecordKey) -> Result<bool, SinkError> {
        Ok(self.current_fields(key)?.is_some())
    }

    /// Stored fields for `key`, if any.
    fn current_fields(&self, key: &RecordKey) -> Result<Option<Fields>, SinkError>;

    fn upsert(&self, record: &NormalizedRecord) -> Result<UpsertKind, SinkError>;

    fn record_run(&self, _entry: &RunHistoryEntry) -> Result<(), SinkError> {
        Ok(())
    }

    /// Drop history entries that finished before `cutoff`. Returns how many
    /// were removed.
    fn prune_history(&self, _cutoff: DateTime<Utc>) -> Result<usize, SinkError> {
        Ok(0)
    }
}

/// Sink kept in memory; handy for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<HashMap<RecordKey, NormalizedRecord>>,
    history: Mutex<Vec<RunHistoryEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &RecordKey) -> Option<NormalizedRecord> {
        self.records.lock().ok()?.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn history(&self) -> Vec<RunHistoryEntry> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl RecordSink for MemorySink {
    fn current_fields(&self, key: &RecordKey) -> Result<Option<Fields>, SinkError> {
        let records = self.records.lock().map_err(|_| SinkError::Poisoned)?;
        Ok(records.get(key).map(|r| r.fields.clone()))
    }

    fn upsert(&self, record: &NormalizedRecord) -> Result<UpsertKind, SinkError> {
        let mut records = self.records.lock().map_err(|_| SinkError::Poisoned)?;
        Ok(match records.insert(record.key(), record.clone()) {
            Some(_) => UpsertKind::Updated,
            None => UpsertKind::Created,
        })
    }

    fn record_run(&self, entry: &RunHistoryEntry) -> Result<(), SinkError> {
        self.history
            .lock()
            .map_err(|_| SinkError::Poisoned)?
            .push(entry.clone());
        Ok(())
    }

    fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<usize, SinkError> {
        let mut history = self.history.lock().map_err(|_| SinkError::Poisoned)?;
        let before = history.len();
        history.retain(|entry| entry.finished_at >= cutoff);
        Ok(before - history.len())
    }
}

/// Placeholder strings some platforms send instead of a real null.
const NULL_SPELLINGS: [&str; 3] = ["None", "null", "NULL"];

pub fn normalize_fields(fields: &Fields) -> Fields {
    fields
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) if NULL_SPELLINGS.contains(&s.as_str()) => {
                    serde_json::Value::Null
                }
                other => other.clone(),
            };
            (k.clone(), value)
        })
        .collect()
}

/// Per-key mutexes, dropped again once nobody holds them.
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<RecordKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: &RecordKey) -> Result<Arc<Mutex<()>>, SinkError> {
        let mut locks = self.locks.lock().map_err(|_| SinkError::Poisoned)?;
        Ok(Arc::clone(locks.entry(key.clone()).or_default()))
    }

    fn forget(&self, key: &RecordKey) {
        if let Ok(mut locks) = self.locks.lock() {
            // One reference in the map and none outside it: nobody is waiting
            if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
                locks.remove(key);
            }
        }
    }
}

pub struct DiffPersistenceEngine {
    sink: Arc<dyn RecordSink>,
    key_locks: KeyLocks,
}

impl DiffPersistenceEngine {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            sink,
            key_locks: KeyLocks::default(),
        }
    }

    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    pub fn persist(&self, records: &[NormalizedRecord]) -> Result<DiffReport, SinkError> {
        let mut report = DiffReport::default();
        for record in records {
            match self.persist_one(record)? {
                Change::Created => report.created += 1,
                Change::Updated => report.updated += 1,
                Change::Unchanged => report.unchanged += 1,
            }
        }
        Ok(report)
    }

    /// Persist the profile plus every item of a successful outcome. Failed
    /// outcomes carry nothing worth storing.
    pub fn persist_outcome(&self, outcome: &CollectionOutcome) -> Result<DiffReport, SinkError> {
        if !outcome.success {
            return Ok(DiffReport::default());
        }

        let mut report = DiffReport::default();
        if let Some(summary) = &outcome.summary {
            let profile = summary.to_record(&outcome.identity.source_type, outcome.finished_at);
            report += self.persist(std::slice::from_ref(&profile))?;
        }
        report += self.persist(&outcome.items)?;
        report += self.persist(&outcome.ephemeral_items)?;

        tracing::debug!(identity = %outcome.identity, %report, "outcome persisted");
        Ok(report)
    }

    fn persist_one(&self, record: &NormalizedRecord) -> Result<Change, SinkError> {
        let key = record.key();
        let lock = self.key_locks.lock_for(&key)?;
        let change = {
            let _guard: MutexGuard<'_, ()> = lock.lock().map_err(|_| SinkError::Poisoned)?;

            let mut normalized = record.clone();
            normalized.fields = normalize_fields(&record.fields);

            match self.sink.current_fields(&key)? {
                None => {
                    self.sink.upsert(&normalized)?;
                    Change::Created
                }
                Some(existing) if normalize_fields(&existing) != normalized.fields => {
                    self.sink.upsert(&normalized)?;
                    Change::Updated
                }
                Some(_) => Change::Unchanged,
            }
        };
        drop(lock);
        self.key_locks.forget(&key);
        Ok(change)
    }
}

enum Change {
    Created,
    Updated,
    Unchanged,
}
