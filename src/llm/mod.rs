//! Language-model client used by the planner and response composer.
//!
//! The core talks to exactly two completion shapes: `plan` (low temperature,
//! structured JSON expected back) and `compose` (conversational register).
//! Both route through the same OpenAI-compatible chat completions endpoint;
//! tests substitute a scripted implementation of [`LlmClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// LLM client errors.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request to the provider failed.
    #[error("llm request failed: {0}")]
    RequestFailed(String),
    /// Provider answered but the body had an unexpected shape.
    #[error("llm response malformed: {0}")]
    MalformedResponse(String),
}

/// The two completion calls the core makes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Produce a structured plan for the given planning prompt.
    async fn plan(&self, prompt: &str) -> Result<String, LlmError>;

    /// Produce a user-facing reply for the given composition prompt.
    async fn compose(&self, prompt: &str) -> Result<String, LlmError>;
}

// ── OpenAI-compatible provider ──

/// Chat completion request body.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

/// A single chat message.
#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Chat completion response body.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// A single choice in a chat completion response.
#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Max tokens for planning calls.
const PLAN_MAX_TOKENS: u32 = 1000;

/// Max tokens for composition calls.
const COMPOSE_MAX_TOKENS: u32 = 800;

/// Low temperature keeps plans deterministic enough to parse reliably.
const PLAN_TEMPERATURE: f32 = 0.3;

/// Conversational register for user-facing replies.
const COMPOSE_TEMPERATURE: f32 = 0.7;

/// HTTP provider for any OpenAI-compatible `/v1/chat/completions` endpoint.
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    /// Create a client for the given endpoint and model.
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            model: model.to_owned(),
            client: reqwest::Client::new(),
        }
    }

    /// Model name this client is configured with.
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_owned(),
                content: prompt.to_owned(),
            }],
            max_tokens,
            temperature,
        };

        let mut request = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("(body unreadable: {e})"));
            return Err(LlmError::RequestFailed(format!("HTTP {status}: {text}")));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::MalformedResponse("no choices in response".to_owned()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn plan(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete(prompt, PLAN_MAX_TOKENS, PLAN_TEMPERATURE).await
    }

    async fn compose(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete(prompt, COMPOSE_MAX_TOKENS, COMPOSE_TEMPERATURE)
            .await
    }
}
