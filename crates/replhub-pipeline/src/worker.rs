//! Worker loop: receive one message, run its jobs, settle the ledger.
//!
//! A message is acknowledged only after every job it carries succeeded.
//! Failures leave it leased; the queue redelivers it after the visibility
//! timeout and parks it in the dead-letter queue once the receive limit is
//! reached. Two workers holding the same key is tolerated: destination
//! writes are whole-object overwrites and ledger writes are upserts.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use replhub_core::error::{ReplError, Result};
use replhub_core::model::{now_ms, JobAction, JobMessage, JobRecord, JobStatus};
use replhub_core::queue::ReceivedMessage;
use replhub_core::retry::{RetryConfig, RetryExecutor};

use crate::context::PipelineContext;
use crate::event::{decode_message_body, DecodedBody};
use crate::mapping::KeyMapping;
use crate::transfer::Transferrer;

/// How one received message was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Every job succeeded and the message was acknowledged.
    Completed {
        /// Jobs carried by the message.
        jobs: usize,
        /// Bytes written to the destination.
        bytes: u64,
    },
    /// Test notification, acknowledged without work.
    Skipped,
    /// A job failed; the message stays leased until redelivery.
    Failed {
        /// Ledger key of the failed job.
        key: String,
        /// Failure description.
        error: String,
    },
    /// The body could not be decoded; left for the dead-letter queue.
    Rejected {
        /// Decoding error.
        error: String,
    },
}

/// One worker loop.
pub struct Worker {
    id: usize,
    ctx: PipelineContext,
    mapping: KeyMapping,
    transferrer: Transferrer,
    retry: RetryExecutor,
}

impl Worker {
    /// Worker number `id` over `ctx`.
    pub fn new(id: usize, ctx: PipelineContext) -> Self {
        let retry = RetryExecutor::new(RetryConfig::with_retries(ctx.config.transfer.max_retries));
        Self {
            id,
            mapping: KeyMapping::from_config(&ctx.config),
            transferrer: Transferrer::new(&ctx),
            retry,
            ctx,
        }
    }

    /// Replace the retry policy for ledger and store calls.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.transferrer = self.transferrer.with_retry(retry.clone());
        self.retry = retry;
        self
    }

    /// Worker number.
    pub fn id(&self) -> usize {
        self.id
    }

    fn visibility(&self) -> Duration {
        Duration::from_secs(self.ctx.config.queue.visibility_timeout_secs)
    }

    fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.ctx.config.transfer.job_timeout_secs)
    }

    /// Receive at most one message and process it.
    pub async fn poll_once(&self) -> Result<Option<JobOutcome>> {
        let mut messages = self.ctx.queue.receive(1, self.visibility()).await?;
        match messages.pop() {
            Some(msg) => Ok(Some(self.process_message(&msg).await)),
            None => Ok(None),
        }
    }

    /// Run until `shutdown` turns true, pausing when the queue is empty.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let idle = Duration::from_millis(self.ctx.config.worker.idle_wait_ms);
        info!(worker = self.id, "worker started");
        while !*shutdown.borrow() {
            let wait = match self.poll_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => idle,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "receive failed");
                    idle
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(worker = self.id, "worker stopped");
    }

    /// Execute every job in `msg` and acknowledge it if all succeeded.
    pub async fn process_message(&self, msg: &ReceivedMessage) -> JobOutcome {
        let mode = self.ctx.config.source.event_mode;
        let jobs = match decode_message_body(&msg.body, &self.mapping, mode) {
            Ok(DecodedBody::Test) => {
                info!(worker = self.id, "skipping store test notification");
                self.ack(msg).await;
                return JobOutcome::Skipped;
            }
            Ok(DecodedBody::Jobs(jobs)) => jobs,
            Err(e) => {
                warn!(
                    worker = self.id,
                    message_id = %msg.message_id,
                    receive_count = msg.receive_count,
                    error = %e,
                    "rejecting malformed message"
                );
                self.ctx.metrics.inc_failed_objects();
                return JobOutcome::Rejected {
                    error: e.to_string(),
                };
            }
        };

        let deadline = Instant::now() + self.job_timeout();
        let mut bytes = 0u64;
        for job in &jobs {
            match self.run_job(job, deadline, msg.receive_count).await {
                Ok(written) => bytes += written,
                Err(e) => {
                    return JobOutcome::Failed {
                        key: job.ledger_key(),
                        error: e.to_string(),
                    }
                }
            }
        }

        self.ack(msg).await;
        JobOutcome::Completed {
            jobs: jobs.len(),
            bytes,
        }
    }

    async fn ack(&self, msg: &ReceivedMessage) {
        if let Err(e) = self.ctx.queue.ack(&msg.receipt).await {
            // The lease expired; another delivery will redo the work.
            warn!(worker = self.id, message_id = %msg.message_id, error = %e, "ack failed");
        }
    }

    async fn load_row(&self, job: &JobMessage) -> Result<JobRecord> {
        let key = job.ledger_key();
        let existing = self
            .retry
            .execute("ledger_get", || self.ctx.ledger.get(&key))
            .await?;
        Ok(existing.unwrap_or_else(|| JobRecord::pending(job, now_ms())))
    }

    async fn save_row(&self, row: &JobRecord) -> Result<()> {
        self.retry
            .execute("ledger_put", || self.ctx.ledger.put(row.clone()))
            .await
    }

    /// Run one job. Returns the bytes written.
    async fn run_job(&self, job: &JobMessage, deadline: Instant, receive_count: u32) -> Result<u64> {
        let key = job.ledger_key();
        info!(worker = self.id, key = %key, action = ?job.action, attempt = receive_count, "job started");

        let mut row = self.load_row(job).await.map_err(|e| self.fail(&key, e))?;
        row.des_bucket = job.dest.bucket.clone();
        row.des_key = job.dest.key.clone();
        row.action = job.action;
        row.storage_class = job.storage_class.clone();
        row.status = JobStatus::InProgress;
        row.start_time = now_ms();
        row.end_time = None;
        row.try_count += 1;
        row.error = None;
        self.save_row(&row).await.map_err(|e| self.fail(&key, e))?;

        let result = match job.action {
            JobAction::Transfer => self.transferrer.transfer(job, deadline).await.map(|outcome| {
                row.size = outcome.source.size;
                row.etag = outcome.source.etag.clone();
                row.last_modified = outcome.source.last_modified;
                row.version_id = outcome.source.version_id.clone().or(row.version_id.take());
                row.dest_etag = Some(outcome.dest_etag.clone());
                debug!(key = %key, parts = outcome.parts, "transfer finished");
                outcome.bytes
            }),
            JobAction::Delete => self.transferrer.delete(job, deadline).await.map(|()| {
                row.dest_etag = None;
                0
            }),
        };

        match result {
            Ok(bytes) => {
                row.status = JobStatus::Done;
                row.end_time = Some(now_ms());
                self.save_row(&row).await.map_err(|e| self.fail(&key, e))?;
                self.ctx.metrics.add_completed_bytes(bytes);
                self.ctx.metrics.inc_transferred_objects();
                info!("----->Completed {} bytes from {}", bytes, key);
                info!("----->Transferred {} DONE", key);
                Ok(bytes)
            }
            Err(e) => {
                row.status = JobStatus::Failed;
                row.end_time = Some(now_ms());
                row.error = Some(e.to_string());
                if let Err(ledger_err) = self.save_row(&row).await {
                    warn!(key = %key, error = %ledger_err, "could not record failure");
                }
                Err(self.fail(&key, e))
            }
        }
    }

    fn fail(&self, key: &str, e: ReplError) -> ReplError {
        self.ctx.metrics.inc_failed_objects();
        error!(worker = self.id, key = key, error = %e, "job failed");
        error!("----->Transferred {} ERROR", key);
        e
    }
}
