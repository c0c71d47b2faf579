//! tfgrpo: training-free group relative policy optimization.
//!
//! Instead of updating model weights, the engine runs groups of agent
//! rollouts per problem, judges them, and distils the reward contrast inside
//! each group into a shared library of natural-language experiences that is
//! injected into later prompts.

pub mod config;
pub mod data;
pub mod error;
pub mod experience;
pub mod mistake;
pub mod model;
pub mod rollout;
pub mod runtime;
pub mod training;

#[cfg(test)]
pub(crate) mod test_support;
