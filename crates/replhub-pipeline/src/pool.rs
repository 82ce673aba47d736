//! Elastic pool of worker loops.
//!
//! Capacity counts pool slots; each slot runs `worker_number` loops that
//! share one stop signal. Shrinking signals the newest slots to stop after
//! their current message.

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::context::PipelineContext;
use crate::worker::Worker;

/// Something whose capacity the scaling controller adjusts.
pub trait CapacityTarget: Send + Sync {
    /// Current capacity.
    fn capacity(&self) -> usize;

    /// Request a new capacity. Returns the capacity actually applied.
    fn set_capacity(&self, capacity: usize) -> usize;
}

struct Slot {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct PoolInner {
    slots: Vec<Slot>,
    retired: Vec<JoinHandle<()>>,
    next_worker_id: usize,
}

/// Worker loops sized between the configured minimum and maximum capacity.
pub struct WorkerPool {
    ctx: PipelineContext,
    min: usize,
    max: usize,
    per_slot: usize,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    /// Start a pool with `capacity` slots, clamped to the configured bounds.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(ctx: PipelineContext, capacity: usize) -> Self {
        let scaling = &ctx.config.scaling;
        let pool = Self {
            min: scaling.min_capacity,
            max: scaling.max_capacity,
            per_slot: ctx.config.worker.worker_number.max(1),
            inner: Mutex::new(PoolInner::default()),
            ctx,
        };
        let applied = pool.set_capacity(capacity);
        info!(capacity = applied, workers = pool.active_workers(), "worker pool started");
        pool
    }

    fn spawn_slot(&self, inner: &mut PoolInner) {
        let (stop, rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.per_slot);
        for _ in 0..self.per_slot {
            let worker = Worker::new(inner.next_worker_id, self.ctx.clone());
            inner.next_worker_id += 1;
            let rx = rx.clone();
            tasks.push(tokio::spawn(async move { worker.run(rx).await }));
        }
        inner.slots.push(Slot { stop, tasks });
    }

    /// Running worker loops.
    pub fn active_workers(&self) -> usize {
        self.inner.lock().slots.len() * self.per_slot
    }

    /// Stop every loop and wait for in-flight messages to settle.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut inner = self.inner.lock();
            let mut handles = std::mem::take(&mut inner.retired);
            for slot in inner.slots.drain(..) {
                let _ = slot.stop.send(true);
                handles.extend(slot.tasks);
            }
            handles
        };
        self.ctx.metrics.set_worker_concurrency(0);
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                debug!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

impl CapacityTarget for WorkerPool {
    fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    fn set_capacity(&self, capacity: usize) -> usize {
        let target = capacity.clamp(self.min, self.max);
        let mut inner = self.inner.lock();
        let current = inner.slots.len();
        while inner.slots.len() < target {
            self.spawn_slot(&mut inner);
        }
        while inner.slots.len() > target {
            if let Some(slot) = inner.slots.pop() {
                let _ = slot.stop.send(true);
                inner.retired.extend(slot.tasks);
            }
        }
        inner.retired.retain(|h| !h.is_finished());
        let workers = inner.slots.len() * self.per_slot;
        drop(inner);

        if current != target {
            info!(from = current, to = target, workers, "pool capacity changed");
        }
        self.ctx.metrics.set_worker_concurrency(workers as u64);
        target
    }
}
