//! Immutable pipeline configuration.
//!
//! A [`ReplicationConfig`] is built once at process start (file first, then an
//! optional environment overlay) and handed to every component constructor.
//! Nothing in the pipeline reads the environment after that point.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReplError, Result};

const MB: u64 = 1024 * 1024;

/// Maximum number of parts a multipart upload may have.
pub const MAX_PARTS: u64 = 10_000;

/// Kind of object store the source lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SourceType {
    /// Amazon S3.
    #[default]
    #[serde(rename = "Amazon_S3")]
    AmazonS3,
    /// Aliyun OSS.
    #[serde(rename = "Aliyun_OSS")]
    AliyunOss,
    /// Tencent COS.
    #[serde(rename = "Tencent_COS")]
    TencentCos,
    /// Qiniu Kodo.
    #[serde(rename = "Qiniu_Kodo")]
    QiniuKodo,
    /// Google Cloud Storage (S3 interoperability API).
    #[serde(rename = "Google_GCS")]
    GoogleGcs,
}

impl SourceType {
    /// Parse the names used by deployment parameters.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Amazon_S3" => Ok(Self::AmazonS3),
            "Aliyun_OSS" => Ok(Self::AliyunOss),
            "Tencent_COS" => Ok(Self::TencentCos),
            "Qiniu_Kodo" => Ok(Self::QiniuKodo),
            "Google_GCS" => Ok(Self::GoogleGcs),
            other => Err(ReplError::config(format!("unknown source type: {}", other))),
        }
    }

    /// Default endpoint for `region`, or `None` when the SDK default applies.
    pub fn endpoint_url(&self, region: &str) -> Option<String> {
        match self {
            Self::AmazonS3 => None,
            Self::AliyunOss => Some(format!("https://oss-{}.aliyuncs.com", region)),
            Self::TencentCos => Some(format!("https://cos.{}.myqcloud.com", region)),
            Self::QiniuKodo => Some(format!("https://s3-{}.qiniucs.com", region)),
            Self::GoogleGcs => Some("https://storage.googleapis.com".to_string()),
        }
    }
}

/// Which source change notifications feed the work queue directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventMode {
    /// Polling only.
    #[default]
    No,
    /// Object-created events.
    Create,
    /// Object-created and object-removed events.
    CreateAndDelete,
}

impl EventMode {
    /// Parse the names used by deployment parameters.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "No" | "" => Ok(Self::No),
            "Create" => Ok(Self::Create),
            "CreateAndDelete" => Ok(Self::CreateAndDelete),
            other => Err(ReplError::config(format!("unknown event mode: {}", other))),
        }
    }

    /// Returns true if creation events are handled.
    pub fn handles_create(&self) -> bool {
        !matches!(self, Self::No)
    }

    /// Returns true if removal events are handled.
    pub fn handles_delete(&self) -> bool {
        matches!(self, Self::CreateAndDelete)
    }
}

/// Where objects are read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Kind of store.
    pub source_type: SourceType,
    /// Bucket name (a directory for the filesystem backend).
    pub bucket: String,
    /// Key prefix bounding enumeration.
    pub prefix: String,
    /// Optional file with one prefix root per line.
    pub prefix_list: Option<PathBuf>,
    /// Region used to derive the endpoint.
    pub region: String,
    /// Explicit endpoint; wins over the derived one.
    pub endpoint: Option<String>,
    /// Named credential reference; empty means none.
    pub credentials: String,
    /// Bucket belongs to the account the pipeline runs in.
    pub in_current_account: bool,
    /// Change-notification mode.
    pub event_mode: EventMode,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_type: SourceType::AmazonS3,
            bucket: String::new(),
            prefix: String::new(),
            prefix_list: None,
            region: String::new(),
            endpoint: None,
            credentials: String::new(),
            in_current_account: false,
            event_mode: EventMode::No,
        }
    }
}

impl SourceConfig {
    /// Endpoint to use: explicit one first, then the per-type default.
    pub fn resolved_endpoint(&self) -> Option<String> {
        self.endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .or_else(|| self.source_type.endpoint_url(&self.region))
    }
}

/// Where objects are written to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Bucket name (a directory for the filesystem backend).
    pub bucket: String,
    /// Key prefix objects are re-rooted under.
    pub prefix: String,
    /// Region of the destination.
    pub region: String,
    /// Explicit endpoint.
    pub endpoint: Option<String>,
    /// Named credential reference; empty means none.
    pub credentials: String,
    /// Bucket belongs to the account the pipeline runs in.
    pub in_current_account: bool,
    /// Storage class applied to written objects.
    pub storage_class: String,
    /// Canned ACL applied to written objects.
    pub acl: Option<String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            region: String::new(),
            endpoint: None,
            credentials: String::new(),
            in_current_account: true,
            storage_class: "STANDARD".to_string(),
            acl: None,
        }
    }
}

/// How a single object is moved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Objects larger than this many MB use multipart upload.
    pub multipart_threshold_mb: u64,
    /// Multipart chunk size in MB.
    pub chunk_size_mb: u64,
    /// Maximum concurrent part transfers per job.
    pub max_threads: usize,
    /// Retries per part download/upload and per store call.
    pub max_retries: u32,
    /// Wall-clock budget for one job, in seconds.
    pub job_timeout_secs: u64,
    /// Carry content headers and user metadata to the destination.
    pub include_metadata: bool,
    /// List and read specific source versions.
    pub include_version: bool,
    /// Abort leftover multipart uploads instead of resuming them.
    pub clean_unfinished_upload: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold_mb: 50,
            chunk_size_mb: 10,
            max_threads: 10,
            max_retries: 5,
            job_timeout_secs: 870,
            include_metadata: true,
            include_version: false,
            clean_unfinished_upload: false,
        }
    }
}

impl TransferConfig {
    /// Multipart threshold in bytes.
    pub fn multipart_threshold_bytes(&self) -> u64 {
        self.multipart_threshold_mb * MB
    }

    /// Chunk size in bytes.
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * MB
    }
}

/// Finder behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// Leading path components used to shard enumeration (0 = single listing).
    pub depth: usize,
    /// Shards enumerated concurrently.
    pub parallelism: usize,
    /// Enqueue every listed object without consulting the ledger.
    pub skip_compare: bool,
    /// Skip the run while the work queue still holds messages.
    pub require_empty_queue: bool,
    /// Keys requested per listing page.
    pub page_size: usize,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            depth: 0,
            parallelism: 1,
            skip_compare: false,
            require_empty_queue: true,
            page_size: 1000,
        }
    }
}

/// Worker behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker loops per pool slot.
    pub worker_number: usize,
    /// Pause after an empty receive, in milliseconds.
    pub idle_wait_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_number: 4,
            idle_wait_ms: 1000,
        }
    }
}

/// Work queue behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Seconds a received message stays invisible.
    pub visibility_timeout_secs: u64,
    /// Receives allowed before a message is moved to the DLQ.
    pub max_receive_count: u32,
    /// Messages per send batch.
    pub send_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 900,
            max_receive_count: 5,
            send_batch_size: 10,
        }
    }
}

/// Worker pool capacity bounds and controller timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Lower capacity bound.
    pub min_capacity: usize,
    /// Upper capacity bound.
    pub max_capacity: usize,
    /// Capacity at start.
    pub desired_capacity: usize,
    /// Seconds between queue-depth samples.
    pub sample_interval_secs: u64,
    /// Seconds to hold after a capacity change (0 = no hysteresis).
    pub cooldown_secs: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            max_capacity: 20,
            desired_capacity: 1,
            sample_interval_secs: 60,
            cooldown_secs: 0,
        }
    }
}

/// The complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Source store.
    pub source: SourceConfig,
    /// Destination store.
    pub destination: DestinationConfig,
    /// Per-object transfer settings.
    pub transfer: TransferConfig,
    /// Finder settings.
    pub finder: FinderConfig,
    /// Worker settings.
    pub worker: WorkerConfig,
    /// Queue settings.
    pub queue: QueueConfig,
    /// Pool bounds and controller timing.
    pub scaling: ScalingConfig,
}

impl ReplicationConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| ReplError::config(format!("invalid TOML config: {}", e))),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(ReplError::config(format!(
                "unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Overlay values from deployment environment variables.
    ///
    /// `lookup` is consulted once per recognised name; unset or empty names
    /// leave the current value alone.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = get("SOURCE_TYPE") {
            self.source.source_type = SourceType::parse(&v)?;
        }
        if let Some(v) = get("SRC_BUCKET") {
            self.source.bucket = v;
        }
        if let Some(v) = get("SRC_PREFIX") {
            self.source.prefix = v;
        }
        if let Some(v) = get("SRC_PREFIX_LIST") {
            self.source.prefix_list = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SRC_REGION") {
            self.source.region = v;
        }
        if let Some(v) = get("SRC_ENDPOINT") {
            self.source.endpoint = Some(v);
        }
        if let Some(v) = get("SRC_CREDENTIALS") {
            self.source.credentials = v;
        }
        if let Some(v) = get("SRC_IN_CURRENT_ACCOUNT") {
            self.source.in_current_account = parse_bool("SRC_IN_CURRENT_ACCOUNT", &v)?;
        }
        if let Some(v) = get("EVENT_TYPE") {
            self.source.event_mode = EventMode::parse(&v)?;
        }
        if let Some(v) = get("SKIP_COMPARE") {
            self.finder.skip_compare = parse_bool("SKIP_COMPARE", &v)?;
        }

        if let Some(v) = get("DEST_BUCKET") {
            self.destination.bucket = v;
        }
        if let Some(v) = get("DEST_PREFIX") {
            self.destination.prefix = v;
        }
        if let Some(v) = get("DEST_REGION") {
            self.destination.region = v;
        }
        if let Some(v) = get("DEST_CREDENTIALS") {
            self.destination.credentials = v;
        }
        if let Some(v) = get("DEST_IN_CURRENT_ACCOUNT") {
            self.destination.in_current_account = parse_bool("DEST_IN_CURRENT_ACCOUNT", &v)?;
        }
        if let Some(v) = get("DEST_STORAGE_CLASS") {
            self.destination.storage_class = v;
        }
        if let Some(v) = get("DEST_ACL") {
            self.destination.acl = Some(v);
        }

        if let Some(v) = get("MULTIPART_THRESHOLD") {
            self.transfer.multipart_threshold_mb = parse_num("MULTIPART_THRESHOLD", &v)?;
        }
        if let Some(v) = get("CHUNK_SIZE") {
            self.transfer.chunk_size_mb = parse_num("CHUNK_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_THREADS") {
            self.transfer.max_threads = parse_num("MAX_THREADS", &v)?;
        }
        if let Some(v) = get("INCLUDE_METADATA") {
            self.transfer.include_metadata = parse_bool("INCLUDE_METADATA", &v)?;
        }
        if let Some(v) = get("INCLUDE_VERSION") {
            self.transfer.include_version = parse_bool("INCLUDE_VERSION", &v)?;
        }

        if let Some(v) = get("FINDER_DEPTH") {
            self.finder.depth = parse_num("FINDER_DEPTH", &v)?;
        }
        if let Some(v) = get("FINDER_NUMBER") {
            self.finder.parallelism = parse_num("FINDER_NUMBER", &v)?;
        }
        if let Some(v) = get("WORKER_NUMBER") {
            self.worker.worker_number = parse_num("WORKER_NUMBER", &v)?;
        }

        Ok(self)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.source.bucket.is_empty() {
            return Err(ReplError::config("source bucket is required"));
        }
        if self.destination.bucket.is_empty() {
            return Err(ReplError::config("destination bucket is required"));
        }
        if self.transfer.chunk_size_mb == 0 {
            return Err(ReplError::config("chunk size must be at least 1 MB"));
        }
        if self.transfer.chunk_size_mb > self.transfer.multipart_threshold_mb {
            return Err(ReplError::config(format!(
                "chunk size {} MB exceeds multipart threshold {} MB",
                self.transfer.chunk_size_mb, self.transfer.multipart_threshold_mb
            )));
        }
        if self.transfer.max_threads == 0 {
            return Err(ReplError::config("max threads must be at least 1"));
        }
        if self.worker.worker_number == 0 {
            return Err(ReplError::config("worker number must be at least 1"));
        }
        if self.finder.parallelism == 0 {
            return Err(ReplError::config("finder parallelism must be at least 1"));
        }
        if self.finder.page_size == 0 {
            return Err(ReplError::config("listing page size must be at least 1"));
        }
        if self.transfer.job_timeout_secs >= self.queue.visibility_timeout_secs {
            return Err(ReplError::config(format!(
                "job timeout {}s must be below the visibility timeout {}s",
                self.transfer.job_timeout_secs, self.queue.visibility_timeout_secs
            )));
        }
        if self.queue.max_receive_count == 0 {
            return Err(ReplError::config("max receive count must be at least 1"));
        }
        let s = &self.scaling;
        if s.min_capacity > s.max_capacity {
            return Err(ReplError::config(format!(
                "pool min capacity {} exceeds max capacity {}",
                s.min_capacity, s.max_capacity
            )));
        }
        if s.desired_capacity < s.min_capacity || s.desired_capacity > s.max_capacity {
            return Err(ReplError::config(format!(
                "desired capacity {} outside [{}, {}]",
                s.desired_capacity, s.min_capacity, s.max_capacity
            )));
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ReplError::config(format!(
            "{} must be a boolean, got {:?}",
            name, value
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        ReplError::config(format!("{} must be a non-negative integer, got {:?}", name, value))
    })
}
