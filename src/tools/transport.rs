//! HTTP transport to a tool server.
//!
//! Tool servers expose `GET /tools` (introspection) and `POST /invoke`
//! (execution). Responses use the `{success, data | error}` envelope; the
//! transport maps that envelope onto [`ToolError`] so callers never parse
//! error strings themselves.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{ToolEnvelope, ToolError, ToolSpec, ToolTransport};

/// Invocation request body sent to the tool server.
#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    tool: &'a str,
    arguments: serde_json::Value,
}

/// HTTP client for one tool server.
pub struct HttpToolTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpToolTransport {
    /// Create a transport with the given per-invocation timeout.
    ///
    /// # Errors
    ///
    /// Returns a [`ToolError::Transport`] if the underlying HTTP client
    /// cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let url = format!("{}/tools", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ToolError::Transport(format!(
                "tool listing failed: HTTP {}",
                resp.status()
            )));
        }

        let specs: Vec<ToolSpec> = resp
            .json()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        debug!(url = %url, count = specs.len(), "tool listing fetched");
        Ok(specs)
    }

    async fn invoke(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let url = format!("{}/invoke", self.base_url);
        let body = InvokeRequest { tool, arguments };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ToolError::UnknownTool(tool.to_owned()));
        }
        if !resp.status().is_success() {
            return Err(ToolError::Transport(format!(
                "tool {tool} failed: HTTP {}",
                resp.status()
            )));
        }

        let envelope: ToolEnvelope = resp
            .json()
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;

        if envelope.success {
            Ok(envelope.data.unwrap_or(serde_json::Value::Null))
        } else {
            Err(ToolError::Domain(
                envelope
                    .error
                    .unwrap_or_else(|| "tool reported failure without a message".to_owned()),
            ))
        }
    }
}
