//! Tool layer: a uniform view over heterogeneous backend tool servers.
//!
//! Every external capability (inventory CRUD, menu generation, recipe
//! search, conversational fallback) is a named tool invoked with a JSON
//! argument object over a [`ToolTransport`]. The [`registry::ToolRegistry`]
//! routes tool names to transports and injects the caller's credential.

pub mod registry;
pub mod transport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use registry::ToolRegistry;
pub use transport::HttpToolTransport;

/// Introspected description of one tool, as advertised by its transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name, unique across all transports.
    pub name: String,
    /// Human-readable description shown to the planner.
    pub description: String,
    /// JSON Schema for the tool's argument object.
    pub input_schema: serde_json::Value,
}

/// Tool layer errors.
///
/// `Transport` covers network failures, timeouts and 5xx responses and is
/// retryable. `Domain` means the tool ran and reported failure; its message
/// is surfaced verbatim to the composer.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Network / timeout / HTTP-level failure reaching the tool server.
    #[error("tool transport error: {0}")]
    Transport(String),
    /// The tool executed and returned `success: false`.
    #[error("{0}")]
    Domain(String),
    /// No transport advertises a tool with this name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

impl ToolError {
    /// Whether the retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Domain(_))
    }
}

/// Wire envelope every tool server answers with.
#[derive(Debug, Deserialize)]
pub struct ToolEnvelope {
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Result payload, present on success.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Error message, present on failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// Asynchronous transport to one tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Enumerate the tools this transport serves.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError>;

    /// Invoke a tool with a JSON argument object.
    async fn invoke(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError>;
}
