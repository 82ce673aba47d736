#![warn(missing_docs)]

//! replhub core: data model, configuration and the capabilities the replication pipeline consumes
//! (object store, credential store, work queue, job ledger, metrics sink).

pub mod checksum;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fs_store;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod retry;
pub mod store;

pub use error::{ReplError, Result};
