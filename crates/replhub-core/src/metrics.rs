//! Pipeline counters and gauges, rendered in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

/// Kind of Prometheus series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Point-in-time gauge.
    Gauge,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// One exported series.
#[derive(Debug, Clone)]
pub struct Metric {
    /// Series name, e.g. `replhub_transferred_objects_total`.
    pub name: &'static str,
    /// Help text.
    pub help: &'static str,
    /// Counter or gauge.
    pub kind: MetricKind,
    /// Label pairs.
    pub labels: Vec<(&'static str, String)>,
    /// Current value.
    pub value: u64,
}

impl Metric {
    /// Render as `# HELP`, `# TYPE` and the sample line.
    pub fn format(&self) -> String {
        let mut out = format!("# HELP {} {}\n", self.name, self.help);
        out.push_str(&format!("# TYPE {} {}\n", self.name, self.kind.as_str()));
        if self.labels.is_empty() {
            out.push_str(&format!("{} {}\n", self.name, self.value));
        } else {
            let labels = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&format!("{}{{{}}} {}\n", self.name, labels, self.value));
        }
        out
    }
}

/// Receiver of pipeline progress signals.
pub trait MetricsSink: Send + Sync {
    /// Bytes written to the destination by a finished job.
    fn add_completed_bytes(&self, bytes: u64);
    /// One object replicated (or one delete applied).
    fn inc_transferred_objects(&self);
    /// One job attempt failed.
    fn inc_failed_objects(&self);
    /// Latest sampled queue depth.
    fn set_queue_depth(&self, depth: u64);
    /// Current number of running worker loops.
    fn set_worker_concurrency(&self, workers: u64);
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total bytes written by successful jobs.
    pub completed_bytes: u64,
    /// Total successful jobs.
    pub transferred_objects: u64,
    /// Total failed attempts.
    pub failed_objects: u64,
    /// Last sampled queue depth.
    pub queue_depth: u64,
    /// Running worker loops.
    pub worker_concurrency: u64,
}

/// Atomic [`MetricsSink`] labelled with the replication direction.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    source: String,
    destination: String,
    completed_bytes: AtomicU64,
    transferred_objects: AtomicU64,
    failed_objects: AtomicU64,
    queue_depth: AtomicU64,
    worker_concurrency: AtomicU64,
}

impl PipelineMetrics {
    /// Metrics for replication from `source` to `destination`.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    /// Current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            completed_bytes: self.completed_bytes.load(Ordering::Relaxed),
            transferred_objects: self.transferred_objects.load(Ordering::Relaxed),
            failed_objects: self.failed_objects.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            worker_concurrency: self.worker_concurrency.load(Ordering::Relaxed),
        }
    }

    /// Every series with its labels.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let snap = self.snapshot();
        let labels = vec![
            ("source", self.source.clone()),
            ("destination", self.destination.clone()),
        ];
        let series = [
            (
                "replhub_completed_bytes_total",
                "Bytes written to the destination by completed jobs",
                MetricKind::Counter,
                snap.completed_bytes,
            ),
            (
                "replhub_transferred_objects_total",
                "Objects replicated or deleted at the destination",
                MetricKind::Counter,
                snap.transferred_objects,
            ),
            (
                "replhub_failed_objects_total",
                "Failed job attempts",
                MetricKind::Counter,
                snap.failed_objects,
            ),
            (
                "replhub_queue_depth",
                "Visible plus in-flight messages in the work queue",
                MetricKind::Gauge,
                snap.queue_depth,
            ),
            (
                "replhub_worker_concurrency",
                "Running worker loops",
                MetricKind::Gauge,
                snap.worker_concurrency,
            ),
        ];
        series
            .into_iter()
            .map(|(name, help, kind, value)| Metric {
                name,
                help,
                kind,
                labels: labels.clone(),
                value,
            })
            .collect()
    }

    /// Prometheus text exposition of every series.
    pub fn render(&self) -> String {
        self.to_metrics().iter().map(Metric::format).collect()
    }
}

impl MetricsSink for PipelineMetrics {
    fn add_completed_bytes(&self, bytes: u64) {
        self.completed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn inc_transferred_objects(&self) {
        self.transferred_objects.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_failed_objects(&self) {
        self.failed_objects.fetch_add(1, Ordering::Relaxed);
    }

    fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    fn set_worker_concurrency(&self, workers: u64) {
        self.worker_concurrency.store(workers, Ordering::Relaxed);
    }
}
