//! OpenAI-compatible LLM API client.
//!
//! Provides typed request/response structures and a chat-completion call whose
//! failures are classified into [`LlmError`] variants: HTTP 429 is a rate
//! limit, 5xx and transport failures are transient, everything else is
//! permanent.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LlmClient, QueryParams};
use crate::error::LlmError;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A single message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author: `"system"`, `"user"`, or `"assistant"`.
    pub role: String,
    /// The textual content of the message.
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A single completion choice returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    /// The reason the model stopped generating (e.g. `"stop"`, `"length"`).
    pub finish_reason: Option<String>,
}

/// Token usage statistics for a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// A chat completion response from the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    /// Text of the first choice, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    api_base: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Create a client pointing at `base_url` (e.g. `"https://api.openai.com/v1"`)
    /// that sends every request to `model`.
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            api_base: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            http,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a chat completion request and return the parsed response.
    ///
    /// Calls `POST {base_url}/chat/completions`.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        params: &QueryParams,
    ) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.api_base);
        debug!(
            model = %self.model,
            temperature = params.temperature,
            max_tokens = params.max_tokens,
            "sending chat completion request"
        );

        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), retry_after, &text));
        }

        let chat_response: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Permanent(format!("failed to parse chat completion response: {e}")))?;

        debug!(
            model = %self.model,
            prompt_tokens = chat_response.usage.prompt_tokens,
            completion_tokens = chat_response.usage.completion_tokens,
            "chat completion succeeded"
        );

        Ok(chat_response)
    }
}

impl LlmClient for ApiClient {
    async fn query(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        params: &QueryParams,
    ) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.push(ChatMessage::user(user_prompt));

        self.chat(&messages, params).await
    }

    async fn chat(&self, messages: &[ChatMessage], params: &QueryParams) -> Result<String, LlmError> {
        let resp = self.chat_completion(messages, params).await?;
        resp.first_text()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Permanent("response contained no choices".into()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map an HTTP error status to an error class.
fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> LlmError {
    match status {
        429 => LlmError::RateLimited { retry_after },
        500..=599 => LlmError::Transient(format!("API returned {status}: {body}")),
        _ => LlmError::Permanent(format!("API returned {status}: {body}")),
    }
}

fn classify_transport_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        LlmError::Transient(format!("request failed: {err}"))
    } else {
        LlmError::Permanent(format!("request failed: {err}"))
    }
}
