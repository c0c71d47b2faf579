//! Typed errors the engine branches on.
//!
//! Everything else in the crate is plumbed through `anyhow::Result`; these two
//! enums exist because callers make decisions based on the variant:
//!
//! - [`LlmError`] drives the retry-vs-drop decision in
//!   [`crate::model::retry::RetryPolicy`].
//! - [`ConfigError`] marks precondition failures that abort a run before any
//!   rollout is created.

use std::time::Duration;

use thiserror::Error;

/// Failure classification surfaced by every [`crate::model::LlmClient`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    /// The provider asked us to slow down (HTTP 429 or equivalent).
    #[error("rate limited by provider{}", .retry_after.map(|d| format!(" (retry after {}ms)", d.as_millis())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// A failure that may succeed on a later attempt (5xx, connection reset,
    /// request timeout).
    #[error("transient provider error: {0}")]
    Transient(String),

    /// A failure that will not go away by retrying (bad request, auth,
    /// malformed response).
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl LlmError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

/// Configuration / precondition errors. Always fatal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("batch_size ({batch_size}) must be a positive multiple of grpo_n ({grpo_n})")]
    BatchNotDivisible { batch_size: usize, grpo_n: usize },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("dataset not found: {0}")]
    MissingDataset(String),

    #[error("dataset {0} contains no problems")]
    EmptyDataset(String),
}
