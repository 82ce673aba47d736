//! Queue-depth driven pool scaling.
//!
//! Depth is `visible + in-flight`, sampled every `sample_interval_secs`.
//! The step policy turns it into a capacity delta which is then clamped to
//! the pool bounds. There is no smoothing unless `cooldown_secs` is set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use replhub_core::config::ScalingConfig;
use replhub_core::error::Result;
use replhub_core::metrics::MetricsSink;
use replhub_core::queue::WorkQueue;

use crate::pool::CapacityTarget;

/// Depth-to-delta step function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPolicy {
    /// Delta applied when the queue is empty.
    pub empty_delta: i64,
    /// `(lower_bound, delta)` pairs in ascending order of bound.
    pub steps: Vec<(u64, i64)>,
}

impl Default for StepPolicy {
    fn default() -> Self {
        Self {
            empty_delta: -10_000,
            steps: vec![(100, 1), (500, 2), (2_000, 5), (10_000, 10)],
        }
    }
}

impl StepPolicy {
    /// Capacity delta for a sampled `depth`.
    pub fn delta_for(&self, depth: u64) -> i64 {
        if depth == 0 {
            return self.empty_delta;
        }
        self.steps
            .iter()
            .rev()
            .find(|(lower, _)| depth >= *lower)
            .map(|(_, delta)| *delta)
            .unwrap_or(0)
    }
}

/// One evaluation of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingDecision {
    /// Sampled queue depth.
    pub depth: u64,
    /// Capacity before the decision.
    pub current: usize,
    /// Delta proposed by the step policy.
    pub delta: i64,
    /// Clamped capacity to apply.
    pub target: usize,
}

impl ScalingDecision {
    /// Returns true if the decision changes capacity.
    pub fn changes(&self) -> bool {
        self.target != self.current
    }
}

/// Translates queue depth into pool capacity.
pub struct ScalingController {
    policy: StepPolicy,
    min: usize,
    max: usize,
    interval: Duration,
    cooldown: Duration,
    last_change: Option<Instant>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ScalingController {
    /// Controller with the default step policy and bounds from `config`.
    pub fn new(config: &ScalingConfig) -> Self {
        Self {
            policy: StepPolicy::default(),
            min: config.min_capacity,
            max: config.max_capacity,
            interval: Duration::from_secs(config.sample_interval_secs.max(1)),
            cooldown: Duration::from_secs(config.cooldown_secs),
            last_change: None,
            metrics: None,
        }
    }

    /// Use a different step policy.
    pub fn with_policy(mut self, policy: StepPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publish sampled depth to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decide the capacity for `depth` given the `current` capacity.
    pub fn evaluate(&self, depth: u64, current: usize) -> ScalingDecision {
        let delta = self.policy.delta_for(depth);
        let proposed = (current as i64).saturating_add(delta);
        let target = proposed.min(self.max as i64).max(self.min as i64) as usize;
        ScalingDecision {
            depth,
            current,
            delta,
            target,
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        match self.last_change {
            Some(at) => !self.cooldown.is_zero() && now.duration_since(at) < self.cooldown,
            None => false,
        }
    }

    /// Sample the queue once and apply the decision to `target`.
    pub async fn step(
        &mut self,
        queue: &dyn WorkQueue,
        target: &dyn CapacityTarget,
    ) -> Result<ScalingDecision> {
        let depth = queue.depth().await?.total();
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(depth);
        }
        let decision = self.evaluate(depth, target.capacity());
        if !decision.changes() {
            debug!(depth, capacity = decision.current, "capacity unchanged");
            return Ok(decision);
        }

        let now = Instant::now();
        if self.cooling_down(now) {
            debug!(depth, proposed = decision.target, "scaling held by cooldown");
            return Ok(ScalingDecision {
                delta: 0,
                target: decision.current,
                ..decision
            });
        }

        let applied = target.set_capacity(decision.target);
        self.last_change = Some(now);
        info!(
            depth,
            delta = decision.delta,
            from = decision.current,
            to = applied,
            "scaled worker pool"
        );
        Ok(ScalingDecision {
            target: applied,
            ..decision
        })
    }

    /// Sample on every interval until `shutdown` turns true.
    pub async fn run(
        mut self,
        queue: Arc<dyn WorkQueue>,
        target: Arc<dyn CapacityTarget>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.step(queue.as_ref(), target.as_ref()).await {
                        warn!(error = %e, "queue depth sample failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("scaling controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replhub_core::metrics::PipelineMetrics;
    use replhub_core::queue::{MemoryQueue, WorkQueue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedPool {
        capacity: AtomicUsize,
        min: usize,
        max: usize,
    }

    impl FixedPool {
        fn new(capacity: usize) -> Self {
            Self {
                capacity: AtomicUsize::new(capacity),
                min: 1,
                max: 20,
            }
        }
    }

    impl CapacityTarget for FixedPool {
        fn capacity(&self) -> usize {
            self.capacity.load(Ordering::SeqCst)
        }

        fn set_capacity(&self, capacity: usize) -> usize {
            let applied = capacity.clamp(self.min, self.max);
            self.capacity.store(applied, Ordering::SeqCst);
            applied
        }
    }

    fn config() -> ScalingConfig {
        ScalingConfig::default()
    }

    async fn fill(queue: &MemoryQueue, n: usize) {
        for i in 0..n {
            queue.send(format!("m{}", i)).await.unwrap();
        }
    }

    mod policy {
        use super::*;

        #[test]
        fn test_default_steps() {
            let p = StepPolicy::default();
            assert_eq!(p.delta_for(0), -10_000);
            assert_eq!(p.delta_for(1), 0);
            assert_eq!(p.delta_for(99), 0);
            assert_eq!(p.delta_for(100), 1);
            assert_eq!(p.delta_for(499), 1);
            assert_eq!(p.delta_for(500), 2);
            assert_eq!(p.delta_for(1_999), 2);
            assert_eq!(p.delta_for(2_000), 5);
            assert_eq!(p.delta_for(3_000), 5);
            assert_eq!(p.delta_for(10_000), 10);
            assert_eq!(p.delta_for(u64::MAX), 10);
        }

        #[test]
        fn test_evaluate_clamps() {
            let c = ScalingController::new(&config());
            let d = c.evaluate(3_000, 4);
            assert_eq!((d.delta, d.target), (5, 9));
            assert_eq!(c.evaluate(3_000, 18).target, 20);
            assert_eq!(c.evaluate(0, 15).target, 1);
            assert!(!c.evaluate(50, 3).changes());
        }

        #[test]
        fn test_inverted_bounds_do_not_panic() {
            let mut inverted = config();
            inverted.min_capacity = 8;
            inverted.max_capacity = 2;
            let c = ScalingController::new(&inverted);
            assert_eq!(c.evaluate(3_000, 4).target, 8);
            assert_eq!(c.evaluate(0, 4).target, 8);
        }
    }

    mod control {
        use super::*;

        #[tokio::test]
        async fn test_step_applies_and_reports_depth() {
            let queue = MemoryQueue::new(5);
            fill(&queue, 150).await;
            let metrics = Arc::new(PipelineMetrics::new("s", "d"));
            let mut c = ScalingController::new(&config()).with_metrics(metrics.clone());
            let pool = FixedPool::new(1);

            let d = c.step(&queue, &pool).await.unwrap();
            assert_eq!(d.target, 2);
            assert_eq!(pool.capacity(), 2);
            assert_eq!(metrics.snapshot().queue_depth, 150);
        }

        #[tokio::test]
        async fn test_in_flight_counts_toward_depth() {
            let queue = MemoryQueue::new(5);
            fill(&queue, 120).await;
            queue.receive(60, Duration::from_secs(60)).await.unwrap();
            let mut c = ScalingController::new(&config());
            let pool = FixedPool::new(1);
            assert_eq!(c.step(&queue, &pool).await.unwrap().depth, 120);
        }

        #[tokio::test(start_paused = true)]
        async fn test_cooldown_holds_second_change() {
            let queue = MemoryQueue::new(5);
            fill(&queue, 600).await;
            let mut cfg = config();
            cfg.cooldown_secs = 120;
            let mut c = ScalingController::new(&cfg);
            let pool = FixedPool::new(1);

            assert_eq!(c.step(&queue, &pool).await.unwrap().target, 3);
            let held = c.step(&queue, &pool).await.unwrap();
            assert_eq!((held.delta, held.target), (0, 3));

            tokio::time::advance(Duration::from_secs(121)).await;
            assert_eq!(c.step(&queue, &pool).await.unwrap().target, 5);
        }

        #[tokio::test(start_paused = true)]
        async fn test_run_until_shutdown() {
            let queue = Arc::new(MemoryQueue::new(5));
            fill(&queue, 2_500).await;
            let pool = Arc::new(FixedPool::new(1));
            let (stop, rx) = watch::channel(false);
            let mut cfg = config();
            cfg.sample_interval_secs = 60;

            let handle = tokio::spawn(
                ScalingController::new(&cfg).run(queue.clone(), pool.clone(), rx),
            );
            // First tick fires immediately, the second after one interval.
            tokio::time::sleep(Duration::from_secs(61)).await;
            stop.send(true).unwrap();
            handle.await.unwrap();
            assert_eq!(pool.capacity(), 11);
        }
    }
}
