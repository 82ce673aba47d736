//! Turning source objects into job messages.

use replhub_core::config::ReplicationConfig;
use replhub_core::model::{map_dest_key, now_ms, JobAction, JobMessage, ObjectLocation, ObjectSummary};

/// Source-to-destination addressing for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapping {
    /// Source bucket.
    pub src_bucket: String,
    /// Source prefix keys are made relative to.
    pub src_prefix: String,
    /// Destination bucket.
    pub dest_bucket: String,
    /// Destination prefix keys are re-rooted under.
    pub dest_prefix: String,
    /// Storage class requested for destination objects.
    pub storage_class: String,
    /// Carry source version ids in jobs.
    pub include_version: bool,
}

impl KeyMapping {
    /// Mapping described by `config`.
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            src_bucket: config.source.bucket.clone(),
            src_prefix: config.source.prefix.clone(),
            dest_bucket: config.destination.bucket.clone(),
            dest_prefix: config.destination.prefix.clone(),
            storage_class: config.destination.storage_class.clone(),
            include_version: config.transfer.include_version,
        }
    }

    /// Destination key for `src_key`.
    pub fn dest_key(&self, src_key: &str) -> String {
        map_dest_key(src_key, &self.src_prefix, &self.dest_prefix)
    }

    /// Returns true if `src_key` lies under the source prefix.
    pub fn covers(&self, src_key: &str) -> bool {
        src_key.starts_with(&self.src_prefix)
    }

    /// Transfer job for a listed (or notified) object.
    pub fn transfer_job(&self, obj: &ObjectSummary) -> JobMessage {
        JobMessage {
            source: ObjectLocation::new(&self.src_bucket, &obj.key),
            dest: ObjectLocation::new(&self.dest_bucket, self.dest_key(&obj.key)),
            size: obj.size,
            etag: obj.etag.clone(),
            version_id: if self.include_version {
                obj.version_id.clone()
            } else {
                None
            },
            last_modified: obj.last_modified,
            storage_class: self.storage_class.clone(),
            action: JobAction::Transfer,
            enqueued_at: now_ms(),
        }
    }

    /// Delete job for a removed source key.
    pub fn delete_job(&self, src_key: &str, version_id: Option<String>) -> JobMessage {
        JobMessage {
            source: ObjectLocation::new(&self.src_bucket, src_key),
            dest: ObjectLocation::new(&self.dest_bucket, self.dest_key(src_key)),
            size: 0,
            etag: String::new(),
            version_id: if self.include_version { version_id } else { None },
            last_modified: 0,
            storage_class: self.storage_class.clone(),
            action: JobAction::Delete,
            enqueued_at: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> KeyMapping {
        let mut config = ReplicationConfig::default();
        config.source.bucket = "src".into();
        config.source.prefix = "data".into();
        config.destination.bucket = "dst".into();
        config.destination.prefix = "backup/2024".into();
        config.destination.storage_class = "STANDARD_IA".into();
        KeyMapping::from_config(&config)
    }

    fn summary(key: &str) -> ObjectSummary {
        ObjectSummary {
            key: key.into(),
            size: 4,
            etag: "\"e\"".into(),
            version_id: Some("v9".into()),
            last_modified: 77,
            storage_class: "STANDARD".into(),
        }
    }

    #[test]
    fn test_transfer_job_addresses() {
        let job = mapping().transfer_job(&summary("data/x/y.bin"));
        assert_eq!(job.source, ObjectLocation::new("src", "data/x/y.bin"));
        assert_eq!(job.dest, ObjectLocation::new("dst", "backup/2024/x/y.bin"));
        assert_eq!(job.storage_class, "STANDARD_IA");
        assert_eq!(job.ledger_key(), "src/data/x/y.bin");
        assert!(job.version_id.is_none());
    }

    #[test]
    fn test_versions_carried_when_enabled() {
        let mut m = mapping();
        m.include_version = true;
        assert_eq!(m.transfer_job(&summary("data/a")).version_id.as_deref(), Some("v9"));
    }

    #[test]
    fn test_delete_job() {
        let job = mapping().delete_job("data/gone", None);
        assert_eq!(job.action, JobAction::Delete);
        assert_eq!(job.dest.key, "backup/2024/gone");
    }

    #[test]
    fn test_covers() {
        let m = mapping();
        assert!(m.covers("data/a"));
        assert!(!m.covers("other/a"));
    }
}
