//! Collaborator boundary: the agent runtime and the verifier.
//!
//! The engine only needs two capabilities from the outside world:
//!
//! - [`AgentRuntime::run`]: prompt in, transcript and final text out.
//! - [`Verifier::verify`]: rollout in, scalar reward and optional reasoning out.
//!
//! [`agent::LlmAgent`] and [`verifier::ExactMatchVerifier`] are the built-in
//! implementations used by the CLI.

pub mod agent;
pub mod verifier;

use serde::{Deserialize, Serialize};

use crate::rollout::types::{Rollout, Turn};

pub use agent::{AgentHooks, LlmAgent};
pub use verifier::ExactMatchVerifier;

/// Output of one agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub transcript: Vec<Turn>,
    pub final_text: String,
}

/// Verifier judgement for one rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub reward: f64,
    pub reasoning: Option<String>,
}

/// Executes the agent on a rendered prompt.
#[allow(async_fn_in_trait)]
pub trait AgentRuntime: Send + Sync {
    async fn run(&self, prompt: &str) -> anyhow::Result<RunOutput>;
}

/// Scores a rolled-out attempt.
#[allow(async_fn_in_trait)]
pub trait Verifier: Send + Sync {
    async fn verify(&self, rollout: &Rollout) -> anyhow::Result<Verdict>;
}
