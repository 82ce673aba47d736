//! Moving one object from the source to the destination store.
//!
//! Objects up to the multipart threshold are copied with one get and one
//! put. Larger objects go through [`MultipartTransfer`]: the object is split
//! into fixed-size parts, parts are copied with bounded concurrency, and the
//! upload is completed only after every part is acknowledged. Any part
//! failure, or running past the job deadline, aborts the upload so no partial
//! upload outlives the job.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use replhub_core::config::{TransferConfig, MAX_PARTS};
use replhub_core::error::{ReplError, Result};
use replhub_core::model::JobMessage;
use replhub_core::retry::{RetryConfig, RetryExecutor};
use replhub_core::store::{
    ByteRange, MultipartUploadInfo, ObjectHead, ObjectMetadata, ObjectStore, PartInfo, PutOptions,
};

use crate::context::PipelineContext;

/// One planned part of a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    /// Part number, 1-based.
    pub part_number: u32,
    /// Bytes of the source object the part covers.
    pub range: ByteRange,
}

/// Chunk size actually used for an object of `size` bytes.
///
/// Grows the configured chunk when the object would need more than
/// [`MAX_PARTS`] parts.
pub fn effective_chunk_size(size: u64, chunk_size: u64) -> u64 {
    let chunk_size = chunk_size.max(1);
    if size / chunk_size + 1 > MAX_PARTS {
        size / MAX_PARTS + 1024
    } else {
        chunk_size
    }
}

/// Split `size` bytes into contiguous parts of at most the effective chunk size.
pub fn split_parts(size: u64, chunk_size: u64) -> Vec<PartPlan> {
    let chunk = effective_chunk_size(size, chunk_size);
    let mut parts = Vec::new();
    let mut start = 0u64;
    let mut part_number = 1u32;
    while start < size {
        let len = chunk.min(size - start);
        parts.push(PartPlan {
            part_number,
            range: ByteRange::new(start, len),
        });
        start += len;
        part_number += 1;
    }
    parts
}

/// Result of a finished multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartResult {
    /// Entity tag of the assembled object.
    pub etag: String,
    /// Parts in the object.
    pub parts: usize,
    /// Parts taken over from an earlier unfinished upload.
    pub resumed_parts: usize,
}

/// User metadata key naming the source entity tag an upload was started for.
pub const SOURCE_ETAG_METADATA: &str = "replhub-source-etag";

/// A single multipart copy of one object.
pub struct MultipartTransfer<'a> {
    /// Store read from.
    pub source: &'a dyn ObjectStore,
    /// Store written to.
    pub destination: &'a dyn ObjectStore,
    /// Retry policy for every store call.
    pub retry: &'a RetryExecutor,
    /// Source key.
    pub src_key: &'a str,
    /// Source version to read.
    pub version_id: Option<&'a str>,
    /// Entity tag of the source content being copied.
    pub source_etag: &'a str,
    /// Destination key.
    pub dest_key: &'a str,
    /// Object size in bytes.
    pub size: u64,
    /// Configured chunk size in bytes.
    pub chunk_size: u64,
    /// Parts copied concurrently.
    pub max_threads: usize,
    /// Attributes of the destination object.
    pub options: &'a PutOptions,
    /// Abort leftover uploads for the key instead of resuming one.
    pub clean_unfinished: bool,
    /// Job timeout, reported when the deadline passes.
    pub timeout_secs: u64,
}

impl MultipartTransfer<'_> {
    fn timeout(&self) -> ReplError {
        ReplError::Timeout {
            key: self.src_key.to_string(),
            secs: self.timeout_secs,
        }
    }

    /// Copy the object, finishing before `deadline` or aborting the upload.
    pub async fn run(&self, deadline: Instant) -> Result<MultipartResult> {
        let (upload_id, existing) = tokio::time::timeout_at(deadline, self.prepare())
            .await
            .map_err(|_| self.timeout())??;

        match tokio::time::timeout_at(deadline, self.copy_and_complete(&upload_id, existing)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                self.abort(&upload_id, &e).await;
                Err(e)
            }
            Err(_) => {
                let e = self.timeout();
                self.abort(&upload_id, &e).await;
                Err(e)
            }
        }
    }

    async fn copy_and_complete(
        &self,
        upload_id: &str,
        existing: HashMap<u32, PartInfo>,
    ) -> Result<MultipartResult> {
        let plan = split_parts(self.size, self.chunk_size);

        let mut done: Vec<PartInfo> = Vec::with_capacity(plan.len());
        let mut pending = Vec::new();
        for part in &plan {
            match existing.get(&part.part_number) {
                Some(info) if info.size == part.range.len() => done.push(info.clone()),
                _ => pending.push(*part),
            }
        }
        let resumed_parts = done.len();
        debug!(
            key = self.dest_key,
            upload_id = upload_id,
            parts = plan.len(),
            resumed = resumed_parts,
            "copying parts"
        );

        let uploaded = stream::iter(pending)
            .map(|part| self.copy_part(upload_id, part))
            .buffer_unordered(self.max_threads.max(1))
            .try_collect::<Vec<PartInfo>>()
            .await?;
        done.extend(uploaded);
        done.sort_by_key(|p| p.part_number);

        let etag = self
            .retry
            .execute("complete_multipart", || {
                self.destination
                    .complete_multipart(self.dest_key, upload_id, &done)
            })
            .await?;
        Ok(MultipartResult {
            etag,
            parts: done.len(),
            resumed_parts,
        })
    }

    fn started_for_source(&self, upload: &MultipartUploadInfo) -> bool {
        upload.metadata.user.get(SOURCE_ETAG_METADATA).map(String::as_str) == Some(self.source_etag)
    }

    async fn discard(&self, upload: &MultipartUploadInfo, reason: &str) -> Result<()> {
        warn!(key = self.dest_key, upload_id = %upload.upload_id, reason = reason, "aborting unfinished upload");
        self.retry
            .execute("abort_multipart", || {
                self.destination.abort_multipart(self.dest_key, &upload.upload_id)
            })
            .await
    }

    async fn prepare(&self) -> Result<(String, HashMap<u32, PartInfo>)> {
        let leftovers: Vec<_> = self
            .retry
            .execute("list_multipart_uploads", || {
                self.destination.list_multipart_uploads(self.dest_key)
            })
            .await?
            .into_iter()
            .filter(|u| u.key == self.dest_key)
            .collect();

        let mut resumable = None;
        for upload in &leftovers {
            if self.clean_unfinished {
                self.discard(upload, "clean requested").await?;
            } else if !self.started_for_source(upload) {
                self.discard(upload, "source changed").await?;
            } else if resumable.is_none() {
                resumable = Some(upload);
            } else {
                self.discard(upload, "duplicate upload").await?;
            }
        }

        if let Some(upload) = resumable {
            let parts = self
                .retry
                .execute("list_parts", || {
                    self.destination.list_parts(self.dest_key, &upload.upload_id)
                })
                .await?;
            info!(
                key = self.dest_key,
                upload_id = %upload.upload_id,
                parts = parts.len(),
                "resuming unfinished upload"
            );
            let parts = parts.into_iter().map(|p| (p.part_number, p)).collect();
            return Ok((upload.upload_id.clone(), parts));
        }

        let mut options = self.options.clone();
        options
            .metadata
            .user
            .insert(SOURCE_ETAG_METADATA.to_string(), self.source_etag.to_string());
        let upload_id = self
            .retry
            .execute("initiate_multipart", || {
                self.destination.initiate_multipart(self.dest_key, &options)
            })
            .await?;
        Ok((upload_id, HashMap::new()))
    }

    async fn copy_part(&self, upload_id: &str, part: PartPlan) -> Result<PartInfo> {
        let data = self
            .retry
            .execute("download_part", || {
                self.source.get(self.src_key, Some(part.range), self.version_id)
            })
            .await?;
        if data.len() as u64 != part.range.len() {
            return Err(ReplError::SizeMismatch {
                key: format!("{} part {}", self.src_key, part.part_number),
                expected: part.range.len(),
                actual: data.len() as u64,
            });
        }
        let etag = self
            .retry
            .execute("upload_part", || {
                self.destination
                    .upload_part(self.dest_key, upload_id, part.part_number, data.clone())
            })
            .await?;
        debug!(key = self.dest_key, part = part.part_number, bytes = data.len(), "part copied");
        Ok(PartInfo {
            part_number: part.part_number,
            etag,
            size: part.range.len(),
        })
    }

    async fn abort(&self, upload_id: &str, cause: &ReplError) {
        let aborted = self
            .retry
            .execute("abort_multipart", || {
                self.destination.abort_multipart(self.dest_key, upload_id)
            })
            .await;
        match aborted {
            Ok(()) => warn!(
                key = self.dest_key,
                upload_id = upload_id,
                cause = %cause,
                "aborted multipart upload"
            ),
            Err(e) => error!(
                key = self.dest_key,
                upload_id = upload_id,
                cause = %cause,
                error = %e,
                "could not abort multipart upload"
            ),
        }
    }
}

/// What a successful transfer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Bytes written to the destination.
    pub bytes: u64,
    /// Entity tag of the destination object.
    pub dest_etag: String,
    /// Parts used; 0 for a single put.
    pub parts: usize,
    /// Source head at transfer time.
    pub source: ObjectHead,
}

/// Executes transfer and delete jobs against the configured stores.
pub struct Transferrer {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    settings: TransferConfig,
    acl: Option<String>,
    retry: RetryExecutor,
}

impl Transferrer {
    /// Transferrer for the stores and settings in `ctx`.
    pub fn new(ctx: &PipelineContext) -> Self {
        Self {
            source: ctx.source.clone(),
            destination: ctx.destination.clone(),
            settings: ctx.config.transfer.clone(),
            acl: ctx.config.destination.acl.clone(),
            retry: RetryExecutor::new(RetryConfig::with_retries(ctx.config.transfer.max_retries)),
        }
    }

    /// Replace the retry policy.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    fn timeout(&self, key: &str) -> ReplError {
        ReplError::Timeout {
            key: key.to_string(),
            secs: self.settings.job_timeout_secs,
        }
    }

    fn put_options(&self, job: &JobMessage, metadata: &ObjectMetadata) -> PutOptions {
        PutOptions {
            storage_class: job.storage_class.clone(),
            acl: self.acl.clone(),
            metadata: if self.settings.include_metadata {
                metadata.clone()
            } else {
                ObjectMetadata::default()
            },
        }
    }

    /// Copy the job's object, finishing before `deadline`.
    pub async fn transfer(&self, job: &JobMessage, deadline: Instant) -> Result<TransferOutcome> {
        let src_key = job.source.key.as_str();
        let version = job.version_id.as_deref();

        let head = tokio::time::timeout_at(
            deadline,
            self.retry
                .execute("head", || self.source.head(src_key, version)),
        )
        .await
        .map_err(|_| self.timeout(src_key))??;
        if job.size != head.size {
            debug!(key = src_key, queued = job.size, current = head.size, "source size changed since discovery");
        }

        let options = self.put_options(job, &head.metadata);
        if head.size > self.settings.multipart_threshold_bytes() {
            let multipart = MultipartTransfer {
                source: self.source.as_ref(),
                destination: self.destination.as_ref(),
                retry: &self.retry,
                src_key,
                version_id: version,
                source_etag: &head.etag,
                dest_key: &job.dest.key,
                size: head.size,
                chunk_size: self.settings.chunk_size_bytes(),
                max_threads: self.settings.max_threads,
                options: &options,
                clean_unfinished: self.settings.clean_unfinished_upload,
                timeout_secs: self.settings.job_timeout_secs,
            };
            let result = multipart.run(deadline).await?;
            return Ok(TransferOutcome {
                bytes: head.size,
                dest_etag: result.etag,
                parts: result.parts,
                source: head,
            });
        }

        let copy = async {
            let data: Bytes = self
                .retry
                .execute("get", || self.source.get(src_key, None, version))
                .await?;
            if data.len() as u64 != head.size {
                return Err(ReplError::SizeMismatch {
                    key: src_key.to_string(),
                    expected: head.size,
                    actual: data.len() as u64,
                });
            }
            self.retry
                .execute("put", || {
                    self.destination.put(&job.dest.key, data.clone(), &options)
                })
                .await
        };
        let dest_etag = tokio::time::timeout_at(deadline, copy)
            .await
            .map_err(|_| self.timeout(src_key))??;
        Ok(TransferOutcome {
            bytes: head.size,
            dest_etag,
            parts: 0,
            source: head,
        })
    }

    /// Remove the job's destination key, finishing before `deadline`.
    pub async fn delete(&self, job: &JobMessage, deadline: Instant) -> Result<()> {
        let dest_key = job.dest.key.as_str();
        tokio::time::timeout_at(
            deadline,
            self.retry
                .execute("delete", || self.destination.delete(dest_key)),
        )
        .await
        .map_err(|_| self.timeout(&job.source.key))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replhub_core::store::{MemoryObjectStore, StoreOp};
    use std::time::Duration;

    fn fast_retry(n: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig {
            max_retries: n,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            jitter: false,
        })
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    fn multipart<'a>(
        src: &'a MemoryObjectStore,
        dst: &'a MemoryObjectStore,
        retry: &'a RetryExecutor,
        options: &'a PutOptions,
        source_etag: &'a str,
        size: u64,
    ) -> MultipartTransfer<'a> {
        MultipartTransfer {
            source: src,
            destination: dst,
            retry,
            src_key: "big",
            version_id: None,
            source_etag,
            dest_key: "copy/big",
            size,
            chunk_size: 10,
            max_threads: 3,
            options,
            clean_unfinished: false,
            timeout_secs: 5,
        }
    }

    fn tagged(etag: &str) -> PutOptions {
        let mut options = PutOptions::default();
        options
            .metadata
            .user
            .insert(SOURCE_ETAG_METADATA.to_string(), etag.to_string());
        options
    }

    mod splitting {
        use super::*;

        #[test]
        fn test_split_exact_and_remainder() {
            let parts = split_parts(25, 10);
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0].range, ByteRange::new(0, 10));
            assert_eq!(parts[2].range, ByteRange::new(20, 5));
            assert_eq!(parts[2].part_number, 3);
            assert_eq!(split_parts(20, 10).len(), 2);
            assert!(split_parts(0, 10).is_empty());
        }

        #[test]
        fn test_chunk_grows_past_part_limit() {
            let size = 10_000 * 10 + 5;
            let chunk = effective_chunk_size(size, 10);
            assert_eq!(chunk, size / 10_000 + 1024);
            assert!(split_parts(size, 10).len() as u64 <= MAX_PARTS);
            assert_eq!(effective_chunk_size(1000, 10), 10);
        }
    }

    mod multipart_copy {
        use super::*;

        #[tokio::test]
        async fn test_copies_all_parts_in_order() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            let data = payload(95);
            src.insert("big", data.clone());
            let etag = src.object("big").unwrap().etag;
            let retry = fast_retry(2);
            let opts = PutOptions::default();

            let result = multipart(&src, &dst, &retry, &opts, &etag, 95)
                .run(Instant::now() + Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result.parts, 10);
            assert!(result.etag.ends_with("-10\""));
            let written = dst.object("copy/big").unwrap();
            assert_eq!(written.data, data);
            assert_eq!(written.metadata.user.get(SOURCE_ETAG_METADATA), Some(&etag));
            assert_eq!(dst.incomplete_uploads(), 0);
        }

        #[tokio::test]
        async fn test_part_failure_aborts_upload() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            src.insert("big", payload(50));
            dst.fail_always(StoreOp::UploadPart);
            let retry = fast_retry(1);
            let opts = PutOptions::default();

            let err = multipart(&src, &dst, &retry, &opts, "\"e\"", 50)
                .run(Instant::now() + Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::AccessDenied { .. }));
            assert!(dst.object("copy/big").is_none());
            assert_eq!(dst.incomplete_uploads(), 0);
            assert_eq!(dst.aborted_uploads().len(), 1);
        }

        #[tokio::test]
        async fn test_transient_part_errors_retried() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            src.insert("big", payload(30));
            src.fail_next(StoreOp::Get, 2);
            dst.fail_next(StoreOp::UploadPart, 2);
            let retry = fast_retry(5);
            let opts = PutOptions::default();

            multipart(&src, &dst, &retry, &opts, "\"e\"", 30)
                .run(Instant::now() + Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(dst.object("copy/big").unwrap().data.len(), 30);
            assert!(dst.aborted_uploads().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_deadline_aborts_upload() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            src.insert("big", payload(40));
            dst.set_part_latency(Duration::from_secs(10));
            let retry = fast_retry(0);
            let opts = PutOptions::default();

            let err = multipart(&src, &dst, &retry, &opts, "\"e\"", 40)
                .run(Instant::now() + Duration::from_secs(3))
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::Timeout { .. }));
            assert_eq!(dst.incomplete_uploads(), 0);
            assert_eq!(dst.aborted_uploads().len(), 1);
            assert!(dst.object("copy/big").is_none());
        }

        #[tokio::test(start_paused = true)]
        async fn test_deadline_covers_completion_retries() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            src.insert("big", payload(20));
            dst.fail_next(StoreOp::Complete, 100);
            let retry = RetryExecutor::new(RetryConfig {
                max_retries: 50,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(10),
                backoff_multiplier: 2.0,
                jitter: false,
            });
            let opts = PutOptions::default();

            let started = Instant::now();
            let err = multipart(&src, &dst, &retry, &opts, "\"e\"", 20)
                .run(started + Duration::from_secs(3))
                .await
                .unwrap_err();
            assert!(matches!(err, ReplError::Timeout { .. }));
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(dst.incomplete_uploads(), 0);
            assert_eq!(dst.aborted_uploads().len(), 1);
        }

        #[tokio::test]
        async fn test_resumes_unfinished_upload() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            let data = payload(30);
            src.insert("big", data.clone());
            let etag = src.object("big").unwrap().etag;

            let id = dst.initiate_multipart("copy/big", &tagged(&etag)).await.unwrap();
            dst.upload_part("copy/big", &id, 1, data.slice(0..10)).await.unwrap();
            dst.upload_part("copy/big", &id, 2, data.slice(10..20)).await.unwrap();

            let retry = fast_retry(1);
            let opts = PutOptions::default();
            let result = multipart(&src, &dst, &retry, &opts, &etag, 30)
                .run(Instant::now() + Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result.resumed_parts, 2);
            assert_eq!(dst.stats().parts_uploaded, 3);
            assert_eq!(dst.object("copy/big").unwrap().data, data);
        }

        #[tokio::test]
        async fn test_upload_from_older_content_not_resumed() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            src.insert("big", "o".repeat(30));
            let old_etag = src.object("big").unwrap().etag;
            let stale = dst.initiate_multipart("copy/big", &tagged(&old_etag)).await.unwrap();
            dst.upload_part("copy/big", &stale, 1, Bytes::from("o".repeat(10)))
                .await
                .unwrap();

            src.insert("big", "n".repeat(30));
            let new_etag = src.object("big").unwrap().etag;
            assert_ne!(old_etag, new_etag);

            let retry = fast_retry(1);
            let opts = PutOptions::default();
            let result = multipart(&src, &dst, &retry, &opts, &new_etag, 30)
                .run(Instant::now() + Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result.resumed_parts, 0);
            assert_eq!(dst.aborted_uploads(), vec![stale]);
            assert_eq!(dst.object("copy/big").unwrap().data, "n".repeat(30));
        }

        #[tokio::test]
        async fn test_untagged_leftover_discarded() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            src.insert("big", payload(20));
            let etag = src.object("big").unwrap().etag;
            let foreign = dst.initiate_multipart("copy/big", &PutOptions::default()).await.unwrap();

            let retry = fast_retry(1);
            let opts = PutOptions::default();
            multipart(&src, &dst, &retry, &opts, &etag, 20)
                .run(Instant::now() + Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(dst.aborted_uploads(), vec![foreign]);
            assert_eq!(dst.incomplete_uploads(), 0);
        }

        #[tokio::test]
        async fn test_clean_unfinished_aborts_leftovers() {
            let src = MemoryObjectStore::new("src");
            let dst = MemoryObjectStore::new("dst");
            src.insert("big", payload(20));
            let etag = src.object("big").unwrap().etag;
            let stale = dst.initiate_multipart("copy/big", &tagged(&etag)).await.unwrap();

            let retry = fast_retry(1);
            let opts = PutOptions::default();
            let mut m = multipart(&src, &dst, &retry, &opts, &etag, 20);
            m.clean_unfinished = true;
            let result = m.run(Instant::now() + Duration::from_secs(5)).await.unwrap();
            assert_eq!(result.resumed_parts, 0);
            assert_eq!(dst.aborted_uploads(), vec![stale]);
            assert_eq!(dst.incomplete_uploads(), 0);
        }
    }
}
