//! Job records, job messages and object summaries shared by every component.

use serde::{Deserialize, Serialize};

/// Storage classes that cannot be read without a restore and are never replicated.
pub const ARCHIVED_STORAGE_CLASSES: &[&str] = &["GLACIER", "DEEP_ARCHIVE"];

/// Replication status of one object in the job ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Found by the finder, waiting for a worker.
    Pending,
    /// A worker is transferring the object.
    InProgress,
    /// Destination holds the object (or the delete was applied).
    Done,
    /// Last attempt failed; the message is redelivered or parked in the DLQ.
    Failed,
}

impl JobStatus {
    /// Returns true if the row describes finished work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

/// What a job asks the worker to do with the destination key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Copy the source object to the destination.
    #[default]
    Transfer,
    /// Remove the destination object (source removal event).
    Delete,
}

/// A bucket plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    /// Bucket name.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
}

impl ObjectLocation {
    /// Create a new location.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// One entry of a source listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Entity tag as reported by the store.
    pub etag: String,
    /// Version identifier when the store is versioned.
    pub version_id: Option<String>,
    /// Last modification time (milliseconds since epoch).
    pub last_modified: u64,
    /// Storage class reported by the listing.
    pub storage_class: String,
}

impl ObjectSummary {
    /// Returns true if the object sits in an archive tier.
    pub fn is_archived(&self) -> bool {
        ARCHIVED_STORAGE_CLASSES.contains(&self.storage_class.as_str())
    }
}

/// Durable per-object row in the job ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Partition key: `<source bucket>/<source key>`.
    pub object_key: String,
    /// Source bucket.
    pub src_bucket: String,
    /// Destination bucket (secondary index).
    pub des_bucket: String,
    /// Destination key.
    pub des_key: String,
    /// Source size in bytes.
    pub size: u64,
    /// Source entity tag when the row was written.
    pub etag: String,
    /// Source version, if the source is versioned.
    pub version_id: Option<String>,
    /// Source last-modified time (milliseconds since epoch).
    pub last_modified: u64,
    /// Storage class applied at the destination.
    pub storage_class: String,
    /// Action of the job that last touched the row.
    pub action: JobAction,
    /// Replication status.
    pub status: JobStatus,
    /// When the current attempt started (milliseconds since epoch).
    pub start_time: u64,
    /// When the current attempt finished, if it has.
    pub end_time: Option<u64>,
    /// Number of attempts recorded by workers.
    pub try_count: u32,
    /// Destination entity tag after a successful transfer.
    pub dest_etag: Option<String>,
    /// Error message of the last failed attempt.
    pub error: Option<String>,
}

impl JobRecord {
    /// Create a PENDING row for a job message.
    pub fn pending(msg: &JobMessage, now_ms: u64) -> Self {
        Self {
            object_key: msg.ledger_key(),
            src_bucket: msg.source.bucket.clone(),
            des_bucket: msg.dest.bucket.clone(),
            des_key: msg.dest.key.clone(),
            size: msg.size,
            etag: msg.etag.clone(),
            version_id: msg.version_id.clone(),
            last_modified: msg.last_modified,
            storage_class: msg.storage_class.clone(),
            action: msg.action,
            status: JobStatus::Pending,
            start_time: now_ms,
            end_time: None,
            try_count: 0,
            dest_etag: None,
            error: None,
        }
    }

    /// Returns true if the row was written for the source object as it is now.
    ///
    /// Version ids are compared only when both sides carry one; otherwise the
    /// entity tag, size and last-modified time decide.
    pub fn matches_source(&self, obj: &ObjectSummary) -> bool {
        if let (Some(recorded), Some(current)) = (&self.version_id, &obj.version_id) {
            if recorded != current {
                return false;
            }
        }
        self.etag == obj.etag && self.size == obj.size && self.last_modified == obj.last_modified
    }
}

/// Ephemeral unit of work carried by the work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Source location.
    pub source: ObjectLocation,
    /// Destination location.
    pub dest: ObjectLocation,
    /// Source size in bytes.
    pub size: u64,
    /// Source entity tag at discovery time.
    #[serde(default)]
    pub etag: String,
    /// Source version to read, if any.
    #[serde(default)]
    pub version_id: Option<String>,
    /// Source last-modified time (milliseconds since epoch).
    #[serde(default)]
    pub last_modified: u64,
    /// Destination storage class.
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
    /// What to do with the destination key.
    #[serde(default)]
    pub action: JobAction,
    /// When the message was produced (milliseconds since epoch).
    #[serde(default)]
    pub enqueued_at: u64,
}

fn default_storage_class() -> String {
    "STANDARD".to_string()
}

impl JobMessage {
    /// The ledger partition key for this job.
    pub fn ledger_key(&self) -> String {
        ledger_key(&self.source.bucket, &self.source.key)
    }

    /// Encode as a queue message body.
    pub fn to_body(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a queue message body.
    pub fn from_body(body: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

/// Ledger partition key for a source object.
pub fn ledger_key(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, key)
}

/// Join `key` under `prefix`, e.g. `append_prefix("c/d", "a/b") == "a/b/c/d"`.
pub fn append_prefix(key: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", prefix, key.trim_start_matches('/'))
    }
}

/// Strip `prefix` from `key`, e.g. `remove_prefix("a/b/c/d", "a/b") == "c/d"`.
/// Only whole path segments are stripped; a key that merely shares leading
/// characters with `prefix` comes back unchanged.
pub fn remove_prefix(key: &str, prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return key.to_string();
    }
    match key.strip_prefix(prefix) {
        Some("") => String::new(),
        Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/').to_string(),
        _ => key.to_string(),
    }
}

/// Map a source key to its destination key: relative to the source prefix,
/// re-rooted under the destination prefix. Directory markers keep their `/`.
pub fn map_dest_key(src_key: &str, src_prefix: &str, dest_prefix: &str) -> String {
    let relative = remove_prefix(src_key, src_prefix);
    let mut mapped = append_prefix(&relative, dest_prefix);
    if src_key.ends_with('/') && !mapped.ends_with('/') {
        mapped.push('/');
    }
    mapped
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
