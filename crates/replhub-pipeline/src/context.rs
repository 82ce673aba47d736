//! Handles shared by every pipeline component.

use std::sync::Arc;

use replhub_core::config::ReplicationConfig;
use replhub_core::ledger::JobLedger;
use replhub_core::metrics::MetricsSink;
use replhub_core::queue::WorkQueue;
use replhub_core::store::ObjectStore;

/// Configuration plus the capabilities a component talks to.
///
/// Cloning is cheap; every field is reference counted.
#[derive(Clone)]
pub struct PipelineContext {
    /// Immutable configuration built at process start.
    pub config: Arc<ReplicationConfig>,
    /// Store objects are read from.
    pub source: Arc<dyn ObjectStore>,
    /// Store objects are written to.
    pub destination: Arc<dyn ObjectStore>,
    /// Work queue between the finder and the workers.
    pub queue: Arc<dyn WorkQueue>,
    /// Job ledger.
    pub ledger: Arc<dyn JobLedger>,
    /// Progress metrics.
    pub metrics: Arc<dyn MetricsSink>,
}
