#![allow(dead_code)]

use std::sync::Arc;

use replhub_core::config::ReplicationConfig;
use replhub_core::credentials::StaticCredentialStore;
use replhub_core::ledger::MemoryLedger;
use replhub_core::queue::MemoryQueue;
use replhub_core::store::MemoryObjectStore;
use replhub_pipeline::{Backends, FinderOutcome, FinderReport, Pipeline, PipelineContext};

pub const MB: usize = 1024 * 1024;

/// In-memory pipeline plus handles on every backend.
pub struct Harness {
    pub src: Arc<MemoryObjectStore>,
    pub dst: Arc<MemoryObjectStore>,
    pub queue: Arc<MemoryQueue>,
    pub ledger: Arc<MemoryLedger>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn ctx(&self) -> PipelineContext {
        self.pipeline.context().clone()
    }

    pub async fn find(&self) -> FinderReport {
        match self.pipeline.run_finder(false).await.unwrap() {
            FinderOutcome::Completed(report) => report,
            other => panic!("finder did not complete: {:?}", other),
        }
    }
}

/// Small thresholds and short timeouts so tests run under paused time.
pub fn test_config() -> ReplicationConfig {
    let mut config = ReplicationConfig::default();
    config.source.bucket = "src".into();
    config.source.prefix = "data/".into();
    config.destination.bucket = "dst".into();
    config.destination.prefix = "data/".into();
    config.transfer.multipart_threshold_mb = 1;
    config.transfer.chunk_size_mb = 1;
    config.transfer.max_threads = 4;
    config.transfer.max_retries = 1;
    config.transfer.job_timeout_secs = 20;
    config.queue.visibility_timeout_secs = 30;
    config.queue.max_receive_count = 3;
    config.worker.worker_number = 2;
    config.worker.idle_wait_ms = 50;
    config.scaling.sample_interval_secs = 1;
    config.finder.page_size = 2;
    config
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

pub async fn harness_with(tweak: impl FnOnce(&mut ReplicationConfig)) -> Harness {
    let mut config = test_config();
    tweak(&mut config);
    let src = Arc::new(if config.transfer.include_version {
        MemoryObjectStore::versioned("src")
    } else {
        MemoryObjectStore::new("src")
    });
    let dst = Arc::new(MemoryObjectStore::new("dst"));
    let queue = Arc::new(MemoryQueue::new(config.queue.max_receive_count));
    let ledger = Arc::new(MemoryLedger::new());
    let backends = Backends {
        source: src.clone(),
        destination: dst.clone(),
        queue: queue.clone(),
        ledger: ledger.clone(),
        credentials: Arc::new(StaticCredentialStore::new()),
    };
    let pipeline = Pipeline::from_config(config, backends).await.unwrap();
    Harness {
        src,
        dst,
        queue,
        ledger,
        pipeline,
    }
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
