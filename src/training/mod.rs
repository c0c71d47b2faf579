//! The training-free GRPO loop and the artifact it produces.
//!
//! - [`pipeline::TrainingFreeGrpo`] -- epochs, batches, step cache, evaluation.
//! - [`artifact`] -- writes the agent configuration with the learned experiences.

pub mod artifact;
pub mod pipeline;

pub use artifact::materialize_agent_config;
pub use pipeline::{use_cache_for, EvalRecord, RunSummary, StepRecord, TrainingFreeGrpo};
