//! Model client abstractions.
//!
//! This module provides:
//! - [`LlmClient`] -- the capability every experience-synthesis stage talks to:
//!   `query(system, user, params) -> text`, with failures classified as
//!   [`LlmError`](crate::error::LlmError).
//! - [`api::ApiClient`] -- OpenAI-compatible chat completion client implementing
//!   [`LlmClient`].
//! - [`retry::RetryPolicy`] -- exponential backoff driven by the error class.
//! - [`prompt`] -- every prompt template used by the engine.

pub mod api;
pub mod prompt;
pub mod retry;

use crate::error::LlmError;

pub use api::{ApiClient, ChatMessage, ChatResponse, Choice, Usage};
pub use retry::RetryPolicy;

/// Sampling parameters for a single query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    pub temperature: f64,
    pub max_tokens: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// A text-in / text-out language model.
///
/// Implementations must report rate limiting as [`LlmError::RateLimited`] so
/// that the retry policy can tell it apart from other failures.
#[allow(async_fn_in_trait)]
pub trait LlmClient: Send + Sync {
    async fn query(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        params: &QueryParams,
    ) -> Result<String, LlmError>;

    /// Multi-turn completion. The default flattens the conversation into a
    /// single query: system messages become the system prompt, the rest is
    /// rendered as `role: content` blocks.
    async fn chat(&self, messages: &[ChatMessage], params: &QueryParams) -> Result<String, LlmError> {
        let system = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let rest: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();
        let user = match rest.as_slice() {
            [only] => only.content.clone(),
            _ => rest
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        self.query(&system, &user, params).await
    }
}
