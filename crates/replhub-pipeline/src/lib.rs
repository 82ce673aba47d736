#![warn(missing_docs)]

//! replhub pipeline: finder, transfer workers, elastic worker pool,
//! scaling controller and event trigger over the `replhub-core` capabilities.

pub mod cli;
pub mod context;
pub mod event;
pub mod finder;
pub mod mapping;
pub mod pipeline;
pub mod pool;
pub mod scaling;
pub mod transfer;
pub mod worker;

pub use context::PipelineContext;
pub use event::{EventTrigger, SequencerTracker};
pub use finder::{Finder, FinderOutcome, FinderReport};
pub use mapping::KeyMapping;
pub use pipeline::{Backends, DrainReport, Pipeline, PipelineState, PipelineStats};
pub use pool::{CapacityTarget, WorkerPool};
pub use scaling::{ScalingController, ScalingDecision, StepPolicy};
pub use transfer::{split_parts, MultipartTransfer, Transferrer};
pub use worker::{JobOutcome, Worker};
