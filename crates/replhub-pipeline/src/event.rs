//! Change notifications from the source store.
//!
//! Notifications enter the pipeline two ways: the [`EventTrigger`] turns a
//! notification into job messages on the work queue, and workers accept raw
//! notification bodies delivered straight to the queue through
//! [`decode_message_body`]. Both paths feed the same jobs; duplicates with
//! the finder are absorbed by the ledger.

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use replhub_core::config::EventMode;
use replhub_core::error::{ReplError, Result};
use replhub_core::model::{JobMessage, ObjectSummary};
use replhub_core::queue::{WorkQueue, MAX_SEND_BATCH};

use crate::mapping::KeyMapping;

const TEST_EVENT: &str = "s3:TestEvent";

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `ObjectCreated:*`
    Created,
    /// `ObjectRemoved:*`
    Removed,
    /// Anything else (restore, replication, lifecycle).
    Other,
}

impl EventKind {
    fn from_name(name: &str) -> Self {
        if name.starts_with("ObjectCreated") {
            Self::Created
        } else if name.starts_with("ObjectRemoved") {
            Self::Removed
        } else {
            Self::Other
        }
    }
}

/// One decoded notification record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEvent {
    /// Event kind.
    pub kind: EventKind,
    /// Bucket the event came from.
    pub bucket: String,
    /// URL-decoded object key.
    pub key: String,
    /// Object size (0 for removals).
    pub size: u64,
    /// Quoted entity tag, empty for removals.
    pub etag: String,
    /// Version id, if the bucket is versioned.
    pub version_id: Option<String>,
    /// Hexadecimal ordering token.
    pub sequencer: Option<String>,
}

impl ObjectEvent {
    fn summary(&self) -> ObjectSummary {
        ObjectSummary {
            key: self.key.clone(),
            size: self.size,
            etag: self.etag.clone(),
            version_id: self.version_id.clone(),
            last_modified: 0,
            storage_class: "STANDARD".to_string(),
        }
    }
}

/// A parsed notification body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The store's configuration test message.
    Test,
    /// Object records.
    Records(Vec<ObjectEvent>),
}

/// A decoded work-queue message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedBody {
    /// Test message; acknowledge and move on.
    Test,
    /// Jobs to execute; all must succeed before the message is acknowledged.
    Jobs(Vec<JobMessage>),
}

#[derive(Deserialize)]
struct RawNotification {
    #[serde(rename = "Records")]
    records: Vec<RawRecord>,
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(rename = "eventName", default)]
    event_name: String,
    s3: Option<RawS3>,
}

#[derive(Deserialize)]
struct RawS3 {
    bucket: RawBucket,
    object: RawObject,
}

#[derive(Deserialize)]
struct RawBucket {
    name: String,
}

#[derive(Deserialize)]
struct RawObject {
    key: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "eTag", default)]
    etag: Option<String>,
    #[serde(rename = "versionId", default)]
    version_id: Option<String>,
    #[serde(default)]
    sequencer: Option<String>,
}

fn invalid(msg: impl Into<String>) -> ReplError {
    ReplError::InvalidMessage { msg: msg.into() }
}

/// Decode a notification key: `+` is a space, then percent escapes.
pub fn decode_key(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|k| k.into_owned())
        .map_err(|e| invalid(format!("key {:?} is not valid UTF-8: {}", raw, e)))
}

fn quote_etag(etag: &str) -> String {
    if etag.is_empty() || etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{}\"", etag)
    }
}

fn is_test_event(value: &serde_json::Value) -> bool {
    value.get("Event").and_then(|e| e.as_str()) == Some(TEST_EVENT)
}

/// Parse a store notification.
pub fn parse_notification(body: &str) -> Result<Notification> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| invalid(format!("body is not JSON: {}", e)))?;
    if is_test_event(&value) {
        return Ok(Notification::Test);
    }
    parse_records(value)
}

fn parse_records(value: serde_json::Value) -> Result<Notification> {
    let raw: RawNotification = serde_json::from_value(value)
        .map_err(|e| invalid(format!("not a notification: {}", e)))?;
    let mut events = Vec::with_capacity(raw.records.len());
    for record in raw.records {
        let s3 = record
            .s3
            .ok_or_else(|| invalid("notification record without an s3 section"))?;
        let version_id = s3.object.version_id.filter(|v| !v.is_empty() && v != "null");
        events.push(ObjectEvent {
            kind: EventKind::from_name(&record.event_name),
            bucket: s3.bucket.name,
            key: decode_key(&s3.object.key)?,
            size: s3.object.size,
            etag: quote_etag(s3.object.etag.as_deref().unwrap_or_default()),
            version_id,
            sequencer: s3.object.sequencer,
        });
    }
    Ok(Notification::Records(events))
}

/// Decode a work-queue body: a job message, a notification or a test event.
///
/// Removal records become delete jobs only when `mode` handles deletes.
/// Malformed bodies are an [`ReplError::InvalidMessage`]; the caller must
/// not acknowledge them so they end up in the dead-letter queue.
pub fn decode_message_body(body: &str, mapping: &KeyMapping, mode: EventMode) -> Result<DecodedBody> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| invalid(format!("body is not JSON: {}", e)))?;
    if is_test_event(&value) {
        return Ok(DecodedBody::Test);
    }
    if value.get("Records").is_some() {
        let events = match parse_records(value)? {
            Notification::Records(events) => events,
            Notification::Test => return Ok(DecodedBody::Test),
        };
        let jobs = events
            .iter()
            .filter_map(|event| match event.kind {
                EventKind::Created => Some(mapping.transfer_job(&event.summary())),
                EventKind::Removed if mode.handles_delete() => {
                    Some(mapping.delete_job(&event.key, event.version_id.clone()))
                }
                _ => None,
            })
            .collect();
        return Ok(DecodedBody::Jobs(jobs));
    }
    let job: JobMessage = serde_json::from_value(value)
        .map_err(|e| invalid(format!("not a job message: {}", e)))?;
    Ok(DecodedBody::Jobs(vec![job]))
}

/// Compare two hexadecimal sequencers by value. `None` if either is not hex.
pub fn compare_sequencers(a: &str, b: &str) -> Option<Ordering> {
    fn normalise(s: &str) -> Option<String> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let trimmed = s.trim_start_matches('0');
        Some(trimmed.to_ascii_uppercase())
    }
    let (a, b) = (normalise(a)?, normalise(b)?);
    Some(a.len().cmp(&b.len()).then_with(|| a.cmp(&b)))
}

/// Highest sequencer seen per key.
#[derive(Debug, Default)]
pub struct SequencerTracker {
    seen: DashMap<String, String>,
}

impl SequencerTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if an event for `key` with `sequencer` is newer than any
    /// recorded so far. Unparseable sequencers always pass.
    pub fn is_newer(&self, key: &str, sequencer: &str) -> bool {
        let Some(recorded) = self.seen.get(key) else {
            return true;
        };
        match compare_sequencers(sequencer, recorded.value()) {
            Some(Ordering::Greater) => true,
            Some(_) => {
                debug!(key = key, sequencer = sequencer, "ignoring out-of-order event");
                false
            }
            None => {
                warn!(key = key, sequencer = sequencer, "unparseable sequencer");
                true
            }
        }
    }

    /// Record `sequencer` as handled for `key` unless a newer one is already
    /// recorded.
    pub fn record(&self, key: &str, sequencer: &str) {
        if compare_sequencers(sequencer, sequencer).is_none() {
            return;
        }
        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut recorded) => {
                if compare_sequencers(sequencer, recorded.get()) == Some(Ordering::Greater) {
                    recorded.insert(sequencer.to_string());
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(sequencer.to_string());
            }
        }
    }

    /// [`is_newer`](Self::is_newer) followed by [`record`](Self::record).
    pub fn should_handle(&self, key: &str, sequencer: &str) -> bool {
        if !self.is_newer(key, sequencer) {
            return false;
        }
        self.record(key, sequencer);
        true
    }

    /// Number of keys tracked.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Returns true if no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Outcome of one notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// Job messages sent.
    pub enqueued: usize,
    /// Records older than one already handled.
    pub stale: usize,
    /// Records outside the mode, bucket or prefix.
    pub ignored: usize,
    /// The notification was the store's test message.
    pub test: bool,
}

/// Feeds source notifications into the work queue.
pub struct EventTrigger {
    mode: EventMode,
    mapping: KeyMapping,
    queue: Arc<dyn WorkQueue>,
    tracker: SequencerTracker,
}

impl EventTrigger {
    /// Create a trigger for `mode`.
    pub fn new(mode: EventMode, mapping: KeyMapping, queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            mode,
            mapping,
            queue,
            tracker: SequencerTracker::new(),
        }
    }

    /// Configured mode.
    pub fn mode(&self) -> EventMode {
        self.mode
    }

    fn wanted(&self, event: &ObjectEvent) -> bool {
        let kind_ok = match event.kind {
            EventKind::Created => self.mode.handles_create(),
            EventKind::Removed => self.mode.handles_delete(),
            EventKind::Other => false,
        };
        kind_ok && event.bucket == self.mapping.src_bucket && self.mapping.covers(&event.key)
    }

    /// Turn one notification body into job messages on the queue.
    pub async fn handle_notification(&self, body: &str) -> Result<TriggerReport> {
        let mut report = TriggerReport::default();
        let events = match parse_notification(body)? {
            Notification::Test => {
                info!("skipping store test notification");
                report.test = true;
                return Ok(report);
            }
            Notification::Records(events) => events,
        };

        // Sequencers become handled only once their message is on the queue.
        let batch = SequencerTracker::new();
        let mut bodies = Vec::new();
        let mut sequencers = Vec::new();
        for event in &events {
            if !self.wanted(event) {
                report.ignored += 1;
                continue;
            }
            if let Some(seq) = &event.sequencer {
                if !self.tracker.is_newer(&event.key, seq) || !batch.should_handle(&event.key, seq) {
                    report.stale += 1;
                    continue;
                }
            }
            let job = match event.kind {
                EventKind::Removed => self.mapping.delete_job(&event.key, event.version_id.clone()),
                _ => self.mapping.transfer_job(&event.summary()),
            };
            bodies.push(job.to_body()?);
            sequencers.push(event.sequencer.as_deref().map(|seq| (event.key.as_str(), seq)));
        }

        for (chunk, seqs) in bodies.chunks(MAX_SEND_BATCH).zip(sequencers.chunks(MAX_SEND_BATCH)) {
            let ids = self.queue.send_batch(chunk.to_vec()).await?;
            report.enqueued += ids.len();
            for (key, seq) in seqs.iter().flatten() {
                self.tracker.record(key, seq);
            }
        }
        debug!(
            enqueued = report.enqueued,
            stale = report.stale,
            ignored = report.ignored,
            "handled notification"
        );
        Ok(report)
    }
}
