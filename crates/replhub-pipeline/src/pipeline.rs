//! Replication pipeline
//!
//! Wires the finder, the worker pool and the scaling controller around one
//! work queue and one job ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use replhub_core::config::ReplicationConfig;
use replhub_core::credentials::{resolve_for, CredentialStore, Credentials};
use replhub_core::error::{ReplError, Result};
use replhub_core::ledger::JobLedger;
use replhub_core::metrics::{MetricsSnapshot, PipelineMetrics};
use replhub_core::queue::WorkQueue;
use replhub_core::store::ObjectStore;

use crate::context::PipelineContext;
use crate::event::EventTrigger;
use crate::finder::{Finder, FinderOutcome};
use crate::mapping::KeyMapping;
use crate::pool::{CapacityTarget, WorkerPool};
use crate::scaling::ScalingController;

/// Capabilities a pipeline is assembled from.
pub struct Backends {
    /// Store objects are read from.
    pub source: Arc<dyn ObjectStore>,
    /// Store objects are written to.
    pub destination: Arc<dyn ObjectStore>,
    /// Work queue with its dead-letter queue.
    pub queue: Arc<dyn WorkQueue>,
    /// Job ledger.
    pub ledger: Arc<dyn JobLedger>,
    /// Resolves the credential references named in the configuration.
    pub credentials: Arc<dyn CredentialStore>,
}

/// Pipeline lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    /// Built, no drain running.
    Idle,
    /// Workers are consuming the queue.
    Running,
    /// Queue is empty; workers are finishing.
    Draining,
    /// Last drain completed.
    Stopped,
}

/// Pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    /// Finder passes that listed the source.
    pub finder_runs: u64,
    /// Finder passes skipped because the queue held work.
    pub finder_skips: u64,
    /// Jobs enqueued by the finder.
    pub jobs_enqueued: u64,
    /// Completed drains.
    pub drains: u64,
}

/// Summary of one [`Pipeline::drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs completed during the drain.
    pub transferred: u64,
    /// Failed attempts during the drain.
    pub failed: u64,
    /// Bytes written during the drain.
    pub bytes: u64,
    /// Messages parked in the dead-letter queue when the drain ended.
    pub dead_letters: usize,
}

/// An assembled replication pipeline.
pub struct Pipeline {
    ctx: PipelineContext,
    metrics: Arc<PipelineMetrics>,
    source_credentials: Credentials,
    destination_credentials: Credentials,
    state: Arc<Mutex<PipelineState>>,
    stats: Arc<Mutex<PipelineStats>>,
}

impl Pipeline {
    /// Validate `config` and resolve both sides' credentials.
    ///
    /// Either failing is fatal for this pipeline.
    pub async fn from_config(config: ReplicationConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let source_credentials = resolve_for(
            backends.credentials.as_ref(),
            &config.source.credentials,
            config.source.in_current_account,
        )
        .await?;
        let destination_credentials = resolve_for(
            backends.credentials.as_ref(),
            &config.destination.credentials,
            config.destination.in_current_account,
        )
        .await?;

        let metrics = Arc::new(PipelineMetrics::new(
            config.source.bucket.clone(),
            config.destination.bucket.clone(),
        ));
        info!(
            source = %config.source.bucket,
            destination = %config.destination.bucket,
            source_type = ?config.source.source_type,
            source_auth = source_credentials.mode(),
            destination_auth = destination_credentials.mode(),
            "pipeline configured"
        );
        let ctx = PipelineContext {
            config: Arc::new(config),
            source: backends.source,
            destination: backends.destination,
            queue: backends.queue,
            ledger: backends.ledger,
            metrics: metrics.clone(),
        };
        Ok(Self {
            ctx,
            metrics,
            source_credentials,
            destination_credentials,
            state: Arc::new(Mutex::new(PipelineState::Idle)),
            stats: Arc::new(Mutex::new(PipelineStats::default())),
        })
    }

    /// Shared component context.
    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Credentials resolved for the source and destination.
    pub fn credentials(&self) -> (&Credentials, &Credentials) {
        (&self.source_credentials, &self.destination_credentials)
    }

    /// Event trigger feeding this pipeline's queue.
    pub fn event_trigger(&self) -> EventTrigger {
        EventTrigger::new(
            self.ctx.config.source.event_mode,
            KeyMapping::from_config(&self.ctx.config),
            self.ctx.queue.clone(),
        )
    }

    /// Run one finder pass.
    pub async fn run_finder(&self, dry_run: bool) -> Result<FinderOutcome> {
        let outcome = Finder::new(self.ctx.clone()).with_dry_run(dry_run).run().await?;
        let mut stats = self.stats.lock().await;
        match &outcome {
            FinderOutcome::Skipped { .. } => stats.finder_skips += 1,
            FinderOutcome::Completed(report) => {
                stats.finder_runs += 1;
                if !dry_run {
                    stats.jobs_enqueued += report.enqueued;
                }
            }
        }
        Ok(outcome)
    }

    /// Run the worker pool and scaling controller until the queue is empty.
    ///
    /// Failing messages stay in flight until the queue redrives them to the
    /// dead-letter queue, so the drain ends once every job either completed
    /// or was parked.
    pub async fn drain(&self) -> Result<DrainReport> {
        {
            let mut state = self.state.lock().await;
            if *state == PipelineState::Running || *state == PipelineState::Draining {
                return Err(ReplError::config("pipeline is already draining"));
            }
            *state = PipelineState::Running;
        }
        let before = self.metrics.snapshot();
        let config = &self.ctx.config;

        let pool = Arc::new(WorkerPool::start(self.ctx.clone(), config.scaling.desired_capacity));
        let (stop, stop_rx) = watch::channel(false);
        let controller = ScalingController::new(&config.scaling).with_metrics(self.metrics.clone());
        let target: Arc<dyn CapacityTarget> = pool.clone();
        let scaler = tokio::spawn(controller.run(self.ctx.queue.clone(), target, stop_rx));

        let poll = Duration::from_millis(config.worker.idle_wait_ms.max(1));
        let result = loop {
            tokio::time::sleep(poll).await;
            match self.ctx.queue.depth().await {
                Ok(depth) if depth.is_empty() => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }
        };

        *self.state.lock().await = PipelineState::Draining;
        let _ = stop.send(true);
        if let Err(e) = scaler.await {
            warn!(error = %e, "scaling controller ended abnormally");
        }
        pool.shutdown().await;
        *self.state.lock().await = PipelineState::Stopped;
        result?;

        let after = self.metrics.snapshot();
        let dead_letters = self.ctx.queue.dead_letters().await?.len();
        self.stats.lock().await.drains += 1;
        let report = DrainReport {
            transferred: after.transferred_objects - before.transferred_objects,
            failed: after.failed_objects - before.failed_objects,
            bytes: after.completed_bytes - before.completed_bytes,
            dead_letters,
        };
        info!(
            transferred = report.transferred,
            failed = report.failed,
            dead_letters = report.dead_letters,
            "queue drained"
        );
        Ok(report)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> PipelineState {
        self.state.lock().await.clone()
    }

    /// Snapshot of the pipeline counters.
    pub async fn stats(&self) -> PipelineStats {
        self.stats.lock().await.clone()
    }

    /// Snapshot of the progress metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Progress metrics in Prometheus text format.
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replhub_core::credentials::StaticCredentialStore;
    use replhub_core::ledger::MemoryLedger;
    use replhub_core::queue::MemoryQueue;
    use replhub_core::store::MemoryObjectStore;

    fn config() -> ReplicationConfig {
        let mut config = ReplicationConfig::default();
        config.source.bucket = "src".into();
        config.destination.bucket = "dst".into();
        config
    }

    fn backends(credentials: StaticCredentialStore) -> Backends {
        Backends {
            source: Arc::new(MemoryObjectStore::new("src")),
            destination: Arc::new(MemoryObjectStore::new("dst")),
            queue: Arc::new(MemoryQueue::new(5)),
            ledger: Arc::new(MemoryLedger::new()),
            credentials: Arc::new(credentials),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut cfg = config();
        cfg.transfer.job_timeout_secs = 900;
        let err = Pipeline::from_config(cfg, backends(StaticCredentialStore::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReplError::Config { .. }));
    }

    #[tokio::test]
    async fn test_missing_credential_is_fatal() {
        let mut cfg = config();
        cfg.source.credentials = "partner-keys".into();
        let err = Pipeline::from_config(cfg, backends(StaticCredentialStore::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ReplError::Credential { .. }));
    }

    #[tokio::test]
    async fn test_credentials_resolved_per_side() {
        let mut store = StaticCredentialStore::new();
        store
            .insert_json(
                "partner-keys",
                r#"{"access_key_id": "AK", "secret_access_key": "SK", "region_name": "eu-west-1"}"#,
            )
            .unwrap();
        let mut cfg = config();
        cfg.source.credentials = "partner-keys".into();
        let pipeline = Pipeline::from_config(cfg, backends(store)).await.unwrap();
        let (src, dst) = pipeline.credentials();
        assert_eq!(src.mode(), "static");
        assert_eq!(dst.mode(), "implicit");
        assert_eq!(pipeline.state().await, PipelineState::Idle);
    }

    #[tokio::test]
    async fn test_dry_run_counted_without_enqueue() {
        let pipeline = Pipeline::from_config(config(), backends(StaticCredentialStore::new()))
            .await
            .unwrap();
        pipeline.run_finder(true).await.unwrap();
        let stats = pipeline.stats().await;
        assert_eq!(stats.finder_runs, 1);
        assert_eq!(stats.jobs_enqueued, 0);
    }
}
