//! Job ledger capability and the in-memory backend.
//!
//! The ledger holds one row per source object, keyed by
//! `<source bucket>/<source key>`, with a secondary index on the destination
//! bucket. Writes are upserts and the last writer wins; no row is ever
//! removed by the pipeline.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{ReplError, Result};
use crate::model::{JobRecord, JobStatus};

/// Durable key-value store of job records.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Row for `object_key`, if any.
    async fn get(&self, object_key: &str) -> Result<Option<JobRecord>>;

    /// Insert or replace the row for `record.object_key`.
    async fn put(&self, record: JobRecord) -> Result<()>;

    /// Rows whose destination bucket is `bucket`, ordered by object key.
    async fn query_by_dest_bucket(&self, bucket: &str) -> Result<Vec<JobRecord>>;

    /// Number of rows.
    async fn len(&self) -> Result<usize>;
}

/// Rows grouped by status, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// PENDING rows.
    pub pending: usize,
    /// IN_PROGRESS rows.
    pub in_progress: usize,
    /// DONE rows.
    pub done: usize,
    /// FAILED rows.
    pub failed: usize,
}

/// In-memory ledger with a destination-bucket index and snapshot files.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    rows: DashMap<String, JobRecord>,
    by_dest: DashMap<String, BTreeSet<String>>,
    failing_writes: AtomicU32,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Count rows per status.
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for row in self.rows.iter() {
            match row.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::InProgress => counts.in_progress += 1,
                JobStatus::Done => counts.done += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// All rows, ordered by object key.
    pub fn records(&self) -> Vec<JobRecord> {
        let mut rows: Vec<JobRecord> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| a.object_key.cmp(&b.object_key));
        rows
    }

    fn insert(&self, record: JobRecord) {
        let key = record.object_key.clone();
        let dest = record.des_bucket.clone();
        if let Some(previous) = self.rows.insert(key.clone(), record) {
            if previous.des_bucket != dest {
                if let Some(mut keys) = self.by_dest.get_mut(&previous.des_bucket) {
                    keys.remove(&key);
                }
            }
        }
        self.by_dest.entry(dest).or_default().insert(key);
    }

    /// Write every row to `path` as a bincode snapshot.
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let rows = self.records();
        let encoded = bincode::serialize(&rows)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), rows = rows.len(), "saved ledger snapshot");
        Ok(())
    }

    /// Restore a ledger from a snapshot written by [`MemoryLedger::save_snapshot`].
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let rows: Vec<JobRecord> = bincode::deserialize(&raw)?;
        let ledger = Self::new();
        for row in rows {
            ledger.insert(row);
        }
        info!(path = %path.display(), rows = ledger.rows.len(), "loaded ledger snapshot");
        Ok(ledger)
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn get(&self, object_key: &str) -> Result<Option<JobRecord>> {
        Ok(self.rows.get(object_key).map(|r| r.value().clone()))
    }

    async fn put(&self, record: JobRecord) -> Result<()> {
        let armed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(ReplError::Ledger {
                msg: format!("write of {} rejected", record.object_key),
            });
        }
        debug!(object_key = %record.object_key, status = ?record.status, "ledger upsert");
        self.insert(record);
        Ok(())
    }

    async fn query_by_dest_bucket(&self, bucket: &str) -> Result<Vec<JobRecord>> {
        let keys: Vec<String> = match self.by_dest.get(bucket) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };
        Ok(keys
            .iter()
            .filter_map(|k| self.rows.get(k).map(|r| r.value().clone()))
            .collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.rows.len())
    }
}
