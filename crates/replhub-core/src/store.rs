//! Object store capability and the in-memory backend.
//!
//! The pipeline talks to source and destination stores only through
//! [`ObjectStore`]. [`MemoryObjectStore`] backs tests and supports fault
//! injection; the filesystem backend lives in [`crate::fs_store`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum::{etag_for, multipart_etag};
use crate::config::MAX_PARTS;
use crate::error::{ReplError, Result};
use crate::model::{now_ms, ObjectSummary};

/// Default number of keys per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Parameters of one listing call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Only keys starting with this prefix are listed.
    pub prefix: String,
    /// Roll keys up to the first delimiter after the prefix into common prefixes.
    pub delimiter: Option<String>,
    /// Token from the previous page.
    pub continuation: Option<String>,
    /// Entries per page (objects plus common prefixes); 0 means the default.
    pub max_keys: usize,
    /// Report version ids of the latest versions.
    pub versions: bool,
}

impl ListRequest {
    /// Request for everything under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Set the delimiter.
    pub fn with_delimiter(mut self, delimiter: &str) -> Self {
        self.delimiter = Some(delimiter.to_string());
        self
    }

    /// Set the page size.
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Request version ids.
    pub fn with_versions(mut self, versions: bool) -> Self {
        self.versions = versions;
        self
    }

    /// Continue after `token`.
    pub fn after(mut self, token: Option<String>) -> Self {
        self.continuation = token;
        self
    }

    fn page_size(&self) -> usize {
        if self.max_keys == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.max_keys
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Objects on this page, in key order.
    pub objects: Vec<ObjectSummary>,
    /// Prefixes rolled up by the delimiter.
    pub common_prefixes: Vec<String>,
    /// Token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Content headers and user metadata carried with an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Content-Type.
    pub content_type: Option<String>,
    /// Cache-Control.
    pub cache_control: Option<String>,
    /// Content-Encoding.
    pub content_encoding: Option<String>,
    /// Content-Disposition.
    pub content_disposition: Option<String>,
    /// Content-Language.
    pub content_language: Option<String>,
    /// Expires.
    pub expires: Option<String>,
    /// User-defined metadata.
    pub user: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Returns true if no header or user entry is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of a head request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    /// Size in bytes.
    pub size: u64,
    /// Entity tag.
    pub etag: String,
    /// Version id, on versioned stores.
    pub version_id: Option<String>,
    /// Last modification time (milliseconds since epoch).
    pub last_modified: u64,
    /// Storage class.
    pub storage_class: String,
    /// Content headers and user metadata.
    pub metadata: ObjectMetadata,
}

/// Attributes applied when writing an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOptions {
    /// Storage class of the written object.
    pub storage_class: String,
    /// Canned ACL.
    pub acl: Option<String>,
    /// Headers and user metadata to store.
    pub metadata: ObjectMetadata,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            storage_class: "STANDARD".to_string(),
            acl: None,
            metadata: ObjectMetadata::default(),
        }
    }
}

/// Byte range `[start, end)` of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
}

impl ByteRange {
    /// Range of `len` bytes at `start`.
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Returns true if the range covers nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A part acknowledged by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// Part number, 1-based.
    pub part_number: u32,
    /// Entity tag returned by the part upload.
    pub etag: String,
    /// Part size in bytes.
    pub size: u64,
}

/// An upload that was initiated but neither completed nor aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartUploadInfo {
    /// Destination key.
    pub key: String,
    /// Upload identifier.
    pub upload_id: String,
    /// Initiation time (milliseconds since epoch).
    pub initiated: u64,
    /// Metadata the upload was initiated with.
    pub metadata: ObjectMetadata,
}

/// Operations of an object store, as consumed by the finder and workers.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket (or root) this handle is bound to, for log lines.
    fn bucket(&self) -> &str;

    /// List one page of keys.
    async fn list_page(&self, req: &ListRequest) -> Result<ListPage>;

    /// Size, tag, version and metadata of an object.
    async fn head(&self, key: &str, version_id: Option<&str>) -> Result<ObjectHead>;

    /// Read an object or a range of it.
    async fn get(&self, key: &str, range: Option<ByteRange>, version_id: Option<&str>)
        -> Result<Bytes>;

    /// Write a whole object, overwriting any previous one. Returns the entity tag.
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<String>;

    /// Remove an object. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Start a multipart upload. Returns the upload id.
    async fn initiate_multipart(&self, key: &str, options: &PutOptions) -> Result<String>;

    /// Upload one part. Re-uploading a part number replaces it.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Assemble the listed parts into the object. Returns the entity tag.
    async fn complete_multipart(&self, key: &str, upload_id: &str, parts: &[PartInfo])
        -> Result<String>;

    /// Discard an upload and its parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Unfinished uploads whose key starts with `prefix`.
    async fn list_multipart_uploads(&self, prefix: &str) -> Result<Vec<MultipartUploadInfo>>;

    /// Parts already stored for an upload, by part number.
    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<PartInfo>>;
}

/// Cut one page out of `entries`, which must be sorted by key and all start
/// with `req.prefix`. Shared by the in-process backends.
pub fn paginate<I>(entries: I, req: &ListRequest) -> ListPage
where
    I: IntoIterator<Item = ObjectSummary>,
{
    let limit = req.page_size();
    let delimiter = req.delimiter.as_deref().filter(|d| !d.is_empty());
    let token = req.continuation.as_deref();
    let token_is_prefix = match (token, delimiter) {
        (Some(t), Some(d)) => t.ends_with(d),
        _ => false,
    };

    let mut page = ListPage::default();
    let mut emitted = 0usize;
    let mut last: Option<String> = None;

    for obj in entries {
        if let Some(t) = token {
            if obj.key.as_str() <= t || (token_is_prefix && obj.key.starts_with(t)) {
                continue;
            }
        }

        let rolled = delimiter.and_then(|d| {
            let rest = obj.key.strip_prefix(req.prefix.as_str())?;
            rest.find(d)
                .map(|pos| format!("{}{}", req.prefix, &rest[..pos + d.len()]))
        });

        if let Some(common) = rolled {
            if page.common_prefixes.last() == Some(&common) {
                continue;
            }
            if emitted == limit {
                page.next_token = last;
                return page;
            }
            last = Some(common.clone());
            page.common_prefixes.push(common);
        } else {
            if emitted == limit {
                page.next_token = last;
                return page;
            }
            last = Some(obj.key.clone());
            page.objects.push(obj);
        }
        emitted += 1;
    }
    page
}

/// Check the part list handed to `complete_multipart` against stored parts.
pub(crate) fn check_completion(
    upload_id: &str,
    requested: &[PartInfo],
    stored: &BTreeMap<u32, String>,
) -> Result<()> {
    if requested.is_empty() {
        return Err(ReplError::Multipart {
            upload_id: upload_id.to_string(),
            msg: "no parts to complete".into(),
        });
    }
    let mut previous = 0u32;
    for part in requested {
        if part.part_number == 0 || part.part_number as u64 > MAX_PARTS {
            return Err(ReplError::Multipart {
                upload_id: upload_id.to_string(),
                msg: format!("part number {} out of range", part.part_number),
            });
        }
        if part.part_number <= previous {
            return Err(ReplError::Multipart {
                upload_id: upload_id.to_string(),
                msg: format!("part {} listed out of order", part.part_number),
            });
        }
        previous = part.part_number;
        match stored.get(&part.part_number) {
            Some(etag) if *etag == part.etag => {}
            Some(_) => {
                return Err(ReplError::Multipart {
                    upload_id: upload_id.to_string(),
                    msg: format!("part {} entity tag mismatch", part.part_number),
                })
            }
            None => {
                return Err(ReplError::Multipart {
                    upload_id: upload_id.to_string(),
                    msg: format!("part {} was never uploaded", part.part_number),
                })
            }
        }
    }
    Ok(())
}

/// Operations that can be made to fail in [`MemoryObjectStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `list_page`
    List,
    /// `head`
    Head,
    /// `get`
    Get,
    /// `put`
    Put,
    /// `delete`
    Delete,
    /// `initiate_multipart`
    Initiate,
    /// `upload_part`
    UploadPart,
    /// `complete_multipart`
    Complete,
    /// `abort_multipart`
    Abort,
}

impl StoreOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Head => "head",
            Self::Get => "get",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Initiate => "initiate_multipart",
            Self::UploadPart => "upload_part",
            Self::Complete => "complete_multipart",
            Self::Abort => "abort_multipart",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Transient(u32),
    Permanent,
}

/// Counters kept by [`MemoryObjectStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Listing pages served.
    pub lists: u64,
    /// Head requests.
    pub heads: u64,
    /// Get requests.
    pub gets: u64,
    /// Whole-object puts.
    pub puts: u64,
    /// Deletes.
    pub deletes: u64,
    /// Multipart uploads initiated.
    pub initiated: u64,
    /// Parts uploaded.
    pub parts_uploaded: u64,
    /// Multipart uploads completed.
    pub completed: u64,
    /// Multipart uploads aborted.
    pub aborted: u64,
    /// Bytes written by puts and part uploads.
    pub bytes_written: u64,
}

/// A stored object version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object contents.
    pub data: Bytes,
    /// Entity tag.
    pub etag: String,
    /// Version id, on versioned stores.
    pub version_id: Option<String>,
    /// Last modification time (milliseconds since epoch).
    pub last_modified: u64,
    /// Storage class.
    pub storage_class: String,
    /// Canned ACL it was written with.
    pub acl: Option<String>,
    /// Headers and user metadata.
    pub metadata: ObjectMetadata,
}

impl StoredObject {
    fn summary(&self, key: &str, with_version: bool) -> ObjectSummary {
        ObjectSummary {
            key: key.to_string(),
            size: self.data.len() as u64,
            etag: self.etag.clone(),
            version_id: if with_version {
                self.version_id.clone()
            } else {
                None
            },
            last_modified: self.last_modified,
            storage_class: self.storage_class.clone(),
        }
    }
}

struct PendingUpload {
    key: String,
    initiated: u64,
    options: PutOptions,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Default)]
struct MemoryState {
    // Versions of each key, oldest first.
    objects: BTreeMap<String, Vec<StoredObject>>,
    uploads: BTreeMap<String, PendingUpload>,
    aborted: Vec<String>,
    faults: HashMap<StoreOp, Fault>,
    denied: HashSet<String>,
    stats: MemoryStoreStats,
    version_seq: u64,
}

impl MemoryState {
    fn check_fault(&mut self, op: StoreOp) -> Result<()> {
        match self.faults.get_mut(&op) {
            Some(Fault::Transient(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Err(ReplError::transient(op.as_str(), "injected fault"))
            }
            Some(Fault::Permanent) => Err(ReplError::AccessDenied {
                msg: format!("{} denied by injected fault", op.as_str()),
            }),
            _ => Ok(()),
        }
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if self.denied.contains(key) {
            return Err(ReplError::AccessDenied {
                msg: format!("access to {} denied", key),
            });
        }
        Ok(())
    }

    fn find(&self, key: &str, version_id: Option<&str>) -> Result<&StoredObject> {
        let versions = self.objects.get(key).ok_or_else(|| ReplError::NotFound {
            key: key.to_string(),
        })?;
        let found = match version_id {
            Some(v) => versions
                .iter()
                .rev()
                .find(|o| o.version_id.as_deref() == Some(v)),
            None => versions.last(),
        };
        found.ok_or_else(|| ReplError::NotFound {
            key: format!("{}?versionId={}", key, version_id.unwrap_or_default()),
        })
    }

    fn store(&mut self, key: &str, obj: StoredObject, versioned: bool) {
        let versions = self.objects.entry(key.to_string()).or_default();
        if !versioned {
            versions.clear();
        }
        versions.push(obj);
    }

    fn next_version(&mut self, versioned: bool) -> Option<String> {
        if !versioned {
            return None;
        }
        self.version_seq += 1;
        Some(format!("v{:06}", self.version_seq))
    }
}

/// In-memory object store with fault injection.
pub struct MemoryObjectStore {
    bucket: String,
    versioned: bool,
    part_latency: Mutex<Option<Duration>>,
    state: Mutex<MemoryState>,
}

impl MemoryObjectStore {
    /// Create an unversioned store for `bucket`.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            versioned: false,
            part_latency: Mutex::new(None),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Create a store that keeps every version of every key.
    pub fn versioned(bucket: impl Into<String>) -> Self {
        Self {
            versioned: true,
            ..Self::new(bucket)
        }
    }

    /// Seed an object in the STANDARD class. Returns its version id.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) -> Option<String> {
        self.insert_with_class(key, data, "STANDARD")
    }

    /// Seed an object in `storage_class`. Returns its version id.
    pub fn insert_with_class(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        storage_class: &str,
    ) -> Option<String> {
        let data = data.into();
        let mut state = self.state.lock();
        let version_id = state.next_version(self.versioned);
        let obj = StoredObject {
            etag: etag_for(&data),
            data,
            version_id: version_id.clone(),
            last_modified: now_ms(),
            storage_class: storage_class.to_string(),
            acl: None,
            metadata: ObjectMetadata::default(),
        };
        state.store(key, obj, self.versioned);
        version_id
    }

    /// Replace the metadata of the latest version of `key`.
    pub fn set_metadata(&self, key: &str, metadata: ObjectMetadata) {
        let mut state = self.state.lock();
        if let Some(latest) = state.objects.get_mut(key).and_then(|v| v.last_mut()) {
            latest.metadata = metadata;
        }
    }

    /// Latest version of `key`.
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .objects
            .get(key)
            .and_then(|v| v.last().cloned())
    }

    /// Number of keys stored.
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Sorted list of stored keys.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Fail the next `times` calls of `op` with a transient error.
    pub fn fail_next(&self, op: StoreOp, times: u32) {
        self.state.lock().faults.insert(op, Fault::Transient(times));
    }

    /// Fail every call of `op` with access denied.
    pub fn fail_always(&self, op: StoreOp) {
        self.state.lock().faults.insert(op, Fault::Permanent);
    }

    /// Remove any fault set for `op`.
    pub fn clear_fault(&self, op: StoreOp) {
        self.state.lock().faults.remove(&op);
    }

    /// Deny head and get requests for `key`.
    pub fn deny_key(&self, key: &str) {
        self.state.lock().denied.insert(key.to_string());
    }

    /// Delay every part upload by `latency`.
    pub fn set_part_latency(&self, latency: Duration) {
        *self.part_latency.lock() = Some(latency);
    }

    /// Upload ids that were aborted, in order.
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state.lock().aborted.clone()
    }

    /// Number of uploads neither completed nor aborted.
    pub fn incomplete_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> MemoryStoreStats {
        self.state.lock().stats.clone()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list_page(&self, req: &ListRequest) -> Result<ListPage> {
        let mut state = self.state.lock();
        state.check_fault(StoreOp::List)?;
        state.stats.lists += 1;
        let entries: Vec<ObjectSummary> = state
            .objects
            .range(req.prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(req.prefix.as_str()))
            .filter_map(|(k, versions)| versions.last().map(|o| o.summary(k, req.versions)))
            .collect();
        Ok(paginate(entries, req))
    }

    async fn head(&self, key: &str, version_id: Option<&str>) -> Result<ObjectHead> {
        let mut state = self.state.lock();
        state.check_fault(StoreOp::Head)?;
        state.check_key(key)?;
        state.stats.heads += 1;
        let obj = state.find(key, version_id)?;
        Ok(ObjectHead {
            size: obj.data.len() as u64,
            etag: obj.etag.clone(),
            version_id: obj.version_id.clone(),
            last_modified: obj.last_modified,
            storage_class: obj.storage_class.clone(),
            metadata: obj.metadata.clone(),
        })
    }

    async fn get(
        &self,
        key: &str,
        range: Option<ByteRange>,
        version_id: Option<&str>,
    ) -> Result<Bytes> {
        let mut state = self.state.lock();
        state.check_fault(StoreOp::Get)?;
        state.check_key(key)?;
        state.stats.gets += 1;
        let obj = state.find(key, version_id)?;
        let data = match range {
            None => obj.data.clone(),
            Some(r) => {
                let len = obj.data.len() as u64;
                let start = r.start.min(len) as usize;
                let end = r.end.min(len) as usize;
                obj.data.slice(start..end.max(start))
            }
        };
        Ok(data)
    }

    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<String> {
        let mut state = self.state.lock();
        state.check_fault(StoreOp::Put)?;
        state.stats.puts += 1;
        state.stats.bytes_written += data.len() as u64;
        let etag = etag_for(&data);
        let version_id = state.next_version(self.versioned);
        let obj = StoredObject {
            data,
            etag: etag.clone(),
            version_id,
            last_modified: now_ms(),
            storage_class: options.storage_class.clone(),
            acl: options.acl.clone(),
            metadata: options.metadata.clone(),
        };
        state.store(key, obj, self.versioned);
        Ok(etag)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_fault(StoreOp::Delete)?;
        state.stats.deletes += 1;
        state.objects.remove(key);
        Ok(())
    }

    async fn initiate_multipart(&self, key: &str, options: &PutOptions) -> Result<String> {
        let mut state = self.state.lock();
        state.check_fault(StoreOp::Initiate)?;
        state.stats.initiated += 1;
        let upload_id = uuid::Uuid::new_v4().to_string();
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                initiated: now_ms(),
                options: options.clone(),
                parts: BTreeMap::new(),
            },
        );
        debug!(bucket = %self.bucket, key = key, upload_id = %upload_id, "initiated multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let latency = *self.part_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        state.check_fault(StoreOp::UploadPart)?;
        if part_number == 0 || part_number as u64 > MAX_PARTS {
            return Err(ReplError::Multipart {
                upload_id: upload_id.to_string(),
                msg: format!("part number {} out of range", part_number),
            });
        }
        let upload = match state.uploads.get_mut(upload_id) {
            Some(u) if u.key == key => u,
            _ => {
                return Err(ReplError::NotFound {
                    key: format!("{} upload {}", key, upload_id),
                })
            }
        };
        let etag = etag_for(&data);
        let size = data.len() as u64;
        upload.parts.insert(part_number, (etag.clone(), data));
        state.stats.parts_uploaded += 1;
        state.stats.bytes_written += size;
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[PartInfo],
    ) -> Result<String> {
        let mut state = self.state.lock();
        state.check_fault(StoreOp::Complete)?;
        let upload = match state.uploads.get(upload_id) {
            Some(u) if u.key == key => u,
            _ => {
                return Err(ReplError::NotFound {
                    key: format!("{} upload {}", key, upload_id),
                })
            }
        };

        let stored: BTreeMap<u32, String> = upload
            .parts
            .iter()
            .map(|(n, (etag, _))| (*n, etag.clone()))
            .collect();
        check_completion(upload_id, parts, &stored)?;

        let mut assembled = BytesMut::new();
        for part in parts {
            if let Some((_, data)) = upload.parts.get(&part.part_number) {
                assembled.extend_from_slice(data);
            }
        }
        let etags: Vec<String> = parts.iter().map(|p| p.etag.clone()).collect();
        let etag = multipart_etag(&etags);
        let options = upload.options.clone();

        state.uploads.remove(upload_id);
        let version_id = state.next_version(self.versioned);
        let obj = StoredObject {
            data: assembled.freeze(),
            etag: etag.clone(),
            version_id,
            last_modified: now_ms(),
            storage_class: options.storage_class,
            acl: options.acl,
            metadata: options.metadata,
        };
        state.store(key, obj, self.versioned);
        state.stats.completed += 1;
        Ok(etag)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check_fault(StoreOp::Abort)?;
        match state.uploads.get(upload_id) {
            Some(u) if u.key == key => {}
            _ => {
                return Err(ReplError::NotFound {
                    key: format!("{} upload {}", key, upload_id),
                })
            }
        }
        state.uploads.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        state.stats.aborted += 1;
        debug!(bucket = %self.bucket, key = key, upload_id = upload_id, "aborted multipart upload");
        Ok(())
    }

    async fn list_multipart_uploads(&self, prefix: &str) -> Result<Vec<MultipartUploadInfo>> {
        let state = self.state.lock();
        let mut uploads: Vec<MultipartUploadInfo> = state
            .uploads
            .iter()
            .filter(|(_, u)| u.key.starts_with(prefix))
            .map(|(id, u)| MultipartUploadInfo {
                key: u.key.clone(),
                upload_id: id.clone(),
                initiated: u.initiated,
                metadata: u.options.metadata.clone(),
            })
            .collect();
        uploads.sort_by(|a, b| a.key.cmp(&b.key).then(a.initiated.cmp(&b.initiated)));
        Ok(uploads)
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<PartInfo>> {
        let state = self.state.lock();
        match state.uploads.get(upload_id) {
            Some(u) if u.key == key => Ok(u
                .parts
                .iter()
                .map(|(n, (etag, data))| PartInfo {
                    part_number: *n,
                    etag: etag.clone(),
                    size: data.len() as u64,
                })
                .collect()),
            _ => Err(ReplError::NotFound {
                key: format!("{} upload {}", key, upload_id),
            }),
        }
    }
}
