//! Finder: enumerate the source and enqueue what the ledger says is stale.
//!
//! With `depth > 0` the source is cut into shards along `/` so several
//! listings run concurrently without overlapping. Every level above the
//! cut contributes a *flat* shard holding only the objects stored directly
//! at that level; the prefixes found at the cut become recursive shards.
//!
//! Enqueueing is idempotent: a re-run over an unchanged source finds every
//! row current and sends nothing. A failed run leaves what it already sent;
//! the next run picks up the rest.

use std::collections::BTreeSet;
use std::path::Path;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use replhub_core::error::{ReplError, Result};
use replhub_core::model::{now_ms, JobAction, JobRecord, JobStatus, ObjectSummary};
use replhub_core::queue::MAX_SEND_BATCH;
use replhub_core::retry::{RetryConfig, RetryExecutor};
use replhub_core::store::ListRequest;

use crate::context::PipelineContext;
use crate::mapping::KeyMapping;

const DELIMITER: &str = "/";

/// Slice of the source keyspace listed by one finder task.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Shard {
    /// Listing prefix.
    pub prefix: String,
    /// List everything below `prefix`; otherwise only objects directly at it.
    pub recursive: bool,
}

impl Shard {
    fn recursive(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            recursive: true,
        }
    }

    fn flat(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            recursive: false,
        }
    }
}

/// Counters for one finder run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderReport {
    /// Shards listed.
    pub shards: usize,
    /// Listing pages fetched.
    pub pages: u64,
    /// Objects seen.
    pub listed: u64,
    /// Jobs sent to the queue (or that would be, in a dry run).
    pub enqueued: u64,
    /// Objects whose ledger row is current.
    pub skipped_unchanged: u64,
    /// Objects in an archive storage class.
    pub skipped_archived: u64,
}

impl FinderReport {
    fn merge(&mut self, other: &FinderReport) {
        self.pages += other.pages;
        self.listed += other.listed;
        self.enqueued += other.enqueued;
        self.skipped_unchanged += other.skipped_unchanged;
        self.skipped_archived += other.skipped_archived;
    }
}

/// Result of [`Finder::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinderOutcome {
    /// The queue still held work; nothing was listed.
    Skipped {
        /// Depth that caused the skip.
        depth: u64,
    },
    /// Enumeration finished.
    Completed(FinderReport),
}

/// Returns true if `obj` must be (re)replicated given its ledger row.
///
/// A missing row, a row written for a different version of the object, a
/// row that ended FAILED, or a row whose last job deleted the destination
/// copy of an object still listed all qualify. PENDING and IN_PROGRESS
/// transfer rows for the current version are already queued.
pub fn needs_replication(obj: &ObjectSummary, row: Option<&JobRecord>) -> bool {
    match row {
        None => true,
        Some(row) => {
            row.action == JobAction::Delete
                || !row.matches_source(obj)
                || row.status == JobStatus::Failed
        }
    }
}

/// Read a prefix-list file: one root per line, trimmed, blank lines and
/// repeats dropped, first occurrence order kept.
pub fn load_prefix_list(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    let mut seen = BTreeSet::new();
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect())
}

/// Source enumerator.
pub struct Finder {
    ctx: PipelineContext,
    mapping: KeyMapping,
    retry: RetryExecutor,
    dry_run: bool,
}

impl Finder {
    /// Finder over `ctx`.
    pub fn new(ctx: PipelineContext) -> Self {
        let retry = RetryExecutor::new(RetryConfig::with_retries(ctx.config.transfer.max_retries));
        Self {
            mapping: KeyMapping::from_config(&ctx.config),
            retry,
            dry_run: false,
            ctx,
        }
    }

    /// Count candidates without writing the ledger or the queue.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Replace the retry policy for listing and ledger calls.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    fn roots(&self) -> Result<Vec<String>> {
        match &self.ctx.config.source.prefix_list {
            Some(path) => {
                let roots = load_prefix_list(path)?;
                info!(path = %path.display(), roots = roots.len(), "loaded prefix list");
                Ok(roots)
            }
            None => Ok(vec![self.ctx.config.source.prefix.clone()]),
        }
    }

    async fn list_all_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut token = None;
        loop {
            let req = ListRequest::new(prefix)
                .with_delimiter(DELIMITER)
                .with_max_keys(self.ctx.config.finder.page_size)
                .after(token);
            let page = self
                .retry
                .execute("list_prefixes", || self.ctx.source.list_page(&req))
                .await?;
            prefixes.extend(page.common_prefixes);
            token = page.next_token;
            if token.is_none() {
                return Ok(prefixes);
            }
        }
    }

    /// Cut `roots` into shards `depth` levels deep.
    pub async fn plan_shards(&self, roots: &[String]) -> Result<Vec<Shard>> {
        let depth = self.ctx.config.finder.depth;
        let mut shards = Vec::new();
        for root in roots {
            let mut level = vec![root.clone()];
            for _ in 0..depth {
                let mut next = Vec::new();
                for prefix in &level {
                    shards.push(Shard::flat(prefix.clone()));
                    next.extend(self.list_all_prefixes(prefix).await?);
                }
                level = next;
            }
            shards.extend(level.into_iter().map(Shard::recursive));
        }
        shards.sort();
        shards.dedup();
        debug!(depth, shards = shards.len(), "planned finder shards");
        Ok(shards)
    }

    /// Run one enumeration pass.
    pub async fn run(&self) -> Result<FinderOutcome> {
        let config = &self.ctx.config;
        if config.finder.require_empty_queue && !self.dry_run {
            let depth = self.ctx.queue.depth().await?;
            // A lone visible message is the store's initial test notification.
            if depth.in_flight > 0 || depth.visible > 1 {
                info!(visible = depth.visible, in_flight = depth.in_flight, "queue not empty, skipping finder run");
                return Ok(FinderOutcome::Skipped {
                    depth: depth.total(),
                });
            }
        }

        let roots = self.roots()?;
        let shards = self.plan_shards(&roots).await?;
        info!(
            bucket = %config.source.bucket,
            shards = shards.len(),
            dry_run = self.dry_run,
            skip_compare = config.finder.skip_compare,
            "finder started"
        );

        let results: Vec<(Shard, Result<FinderReport>)> = stream::iter(shards.iter().cloned())
            .map(|shard| async move {
                let result = self.scan_shard(&shard).await;
                (shard, result)
            })
            .buffer_unordered(config.finder.parallelism.max(1))
            .collect()
            .await;

        let mut report = FinderReport {
            shards: shards.len(),
            ..FinderReport::default()
        };
        let mut first_error = None;
        for (shard, result) in results {
            match result {
                Ok(part) => report.merge(&part),
                Err(e) => {
                    error!(prefix = %shard.prefix, error = %e, "shard enumeration failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            listed = report.listed,
            enqueued = report.enqueued,
            unchanged = report.skipped_unchanged,
            archived = report.skipped_archived,
            "finder finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(FinderOutcome::Completed(report)),
        }
    }

    async fn scan_shard(&self, shard: &Shard) -> Result<FinderReport> {
        let finder = &self.ctx.config.finder;
        let mut report = FinderReport::default();
        let mut token = None;
        loop {
            let mut req = ListRequest::new(&shard.prefix)
                .with_max_keys(finder.page_size)
                .with_versions(self.mapping.include_version)
                .after(token);
            if !shard.recursive {
                req = req.with_delimiter(DELIMITER);
            }
            let page = self
                .retry
                .execute("list_objects", || self.ctx.source.list_page(&req))
                .await?;
            report.pages += 1;

            let mut candidates = Vec::new();
            for obj in &page.objects {
                report.listed += 1;
                if obj.is_archived() {
                    debug!(key = %obj.key, class = %obj.storage_class, "skipping archived object");
                    report.skipped_archived += 1;
                    continue;
                }
                match self.consider(obj).await? {
                    Some(candidate) => candidates.push(candidate),
                    None => report.skipped_unchanged += 1,
                }
            }
            report.enqueued += self.enqueue(candidates).await?;

            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        debug!(prefix = %shard.prefix, listed = report.listed, enqueued = report.enqueued, "shard done");
        Ok(report)
    }

    /// Decide on one object; returns the job to send if it needs one.
    async fn consider(&self, obj: &ObjectSummary) -> Result<Option<Candidate>> {
        let job = self.mapping.transfer_job(obj);
        let key = job.ledger_key();

        let previous = if self.ctx.config.finder.skip_compare {
            None
        } else {
            let row = self
                .retry
                .execute("ledger_get", || self.ctx.ledger.get(&key))
                .await?;
            if !needs_replication(obj, row.as_ref()) {
                return Ok(None);
            }
            row
        };

        let mut row = JobRecord::pending(&job, now_ms());
        if let Some(previous) = &previous {
            row.try_count = previous.try_count;
        }
        Ok(Some(Candidate {
            body: job.to_body()?,
            row,
        }))
    }

    /// Send `candidates` in batches, then record a PENDING row for each
    /// accepted message. Returns the number of messages sent.
    ///
    /// Rows are written only after the queue accepted the message, so a
    /// failed send leaves the object stale for the next run.
    async fn enqueue(&self, candidates: Vec<Candidate>) -> Result<u64> {
        if self.dry_run || candidates.is_empty() {
            return Ok(candidates.len() as u64);
        }
        let batch = self.ctx.config.queue.send_batch_size.clamp(1, MAX_SEND_BATCH);
        let mut sent = 0u64;
        for chunk in candidates.chunks(batch) {
            let bodies: Vec<String> = chunk.iter().map(|c| c.body.clone()).collect();
            let ids = self
                .retry
                .execute("send_batch", || self.ctx.queue.send_batch(bodies.clone()))
                .await?;
            if ids.len() != chunk.len() {
                warn!(sent = ids.len(), expected = chunk.len(), "partial batch send");
                return Err(ReplError::Queue {
                    msg: format!("sent {} of {} messages", ids.len(), chunk.len()),
                });
            }
            for candidate in chunk {
                self.record_pending(&candidate.row).await?;
            }
            sent += chunk.len() as u64;
        }
        Ok(sent)
    }

    async fn record_pending(&self, row: &JobRecord) -> Result<()> {
        let current = self
            .retry
            .execute("ledger_get", || self.ctx.ledger.get(&row.object_key))
            .await?;
        // A worker may already hold the message; its row wins.
        if let Some(current) = current {
            let advanced = matches!(current.status, JobStatus::InProgress | JobStatus::Done);
            if advanced && current.start_time >= row.start_time {
                debug!(key = %row.object_key, status = ?current.status, "row already advanced");
                return Ok(());
            }
        }
        self.retry
            .execute("ledger_put", || self.ctx.ledger.put(row.clone()))
            .await
    }
}

/// A job the finder decided to send, with the row recorded once it is queued.
struct Candidate {
    body: String,
    row: JobRecord,
}
