//! Rollout records, their SQLite store, and the batch pipeline.

pub mod batch;
pub mod stats;
pub mod store;
pub mod types;

pub use batch::{BatchSettings, RolloutBatchManager};
pub use stats::BatchStats;
pub use store::{CachedStep, RolloutStore};
pub use types::{BatchRef, Rollout, Stage, Turn};
