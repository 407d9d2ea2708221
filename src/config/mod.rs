//! Configuration loading and management.
//!
//! Loads configuration from `./larder.toml` (or `$LARDER_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration loaded from TOML.
///
/// Path: `./larder.toml` or `$LARDER_CONFIG_PATH`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LarderConfig {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// LLM provider settings.
    pub llm: LlmConfig,
    /// Tool transport locations.
    pub tools: ToolsConfig,
    /// Turn/session timing and concurrency limits.
    pub runtime: RuntimeConfig,
    /// Log file location for production mode.
    pub paths: PathsConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address, e.g. `0.0.0.0:8000`.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_owned(),
        }
    }
}

/// LLM provider settings (OpenAI-compatible chat completions endpoint).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the provider.
    pub base_url: String,
    /// API key. Empty means unauthenticated (local server).
    pub api_key: String,
    /// Model identifier.
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_owned(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_owned(),
        }
    }
}

/// Tool transport locations and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Base URL of the inventory/db tool server.
    pub db_url: String,
    /// Base URL of the recipe tool server.
    pub recipe_url: String,
    /// Per-invocation timeout in seconds.
    pub timeout_seconds: u64,
    /// Service credential substituted for the `dummy-token` sentinel.
    pub service_token: Option<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            db_url: "http://127.0.0.1:8100".to_owned(),
            recipe_url: "http://127.0.0.1:8200".to_owned(),
            timeout_seconds: 30,
            service_token: None,
        }
    }
}

/// Timing and concurrency limits for turn execution.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Idle minutes before a session expires.
    pub session_timeout_minutes: u64,
    /// Seconds a pending confirmation stays valid.
    pub confirmation_timeout_seconds: u64,
    /// Upper bound on tasks dispatched in parallel within one plan.
    pub max_concurrent_tasks: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_timeout_minutes: 30,
            confirmation_timeout_seconds: 300,
            max_concurrent_tasks: 4,
        }
    }
}

/// Filesystem paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            logs_dir: "./logs".to_owned(),
        }
    }
}

impl LarderConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the config file does not exist, defaults are used.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: LarderConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(LarderConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config file path: `$LARDER_CONFIG_PATH` or `./larder.toml`.
    fn config_path() -> PathBuf {
        std::env::var("LARDER_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("larder.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("LARDER_BIND") {
            self.server.bind = v;
        }

        if let Some(v) = env("LARDER_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = env("LARDER_LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = env("LARDER_LLM_MODEL") {
            self.llm.model = v;
        }

        if let Some(v) = env("LARDER_DB_TOOLS_URL") {
            self.tools.db_url = v;
        }
        if let Some(v) = env("LARDER_RECIPE_TOOLS_URL") {
            self.tools.recipe_url = v;
        }
        if let Some(v) = env("LARDER_SERVICE_TOKEN") {
            self.tools.service_token = Some(v);
        }

        if let Some(v) = env("LARDER_SESSION_TIMEOUT_MINUTES") {
            match v.parse() {
                Ok(n) => self.runtime.session_timeout_minutes = n,
                Err(_) => tracing::warn!(
                    var = "LARDER_SESSION_TIMEOUT_MINUTES",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("LARDER_CONFIRMATION_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.runtime.confirmation_timeout_seconds = n,
                Err(_) => tracing::warn!(
                    var = "LARDER_CONFIRMATION_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("LARDER_TOOL_TIMEOUT_SECS") {
            match v.parse() {
                Ok(n) => self.tools.timeout_seconds = n,
                Err(_) => tracing::warn!(
                    var = "LARDER_TOOL_TIMEOUT_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("LARDER_MAX_CONCURRENT_TASKS") {
            match v.parse() {
                Ok(n) => self.runtime.max_concurrent_tasks = n,
                Err(_) => tracing::warn!(
                    var = "LARDER_MAX_CONCURRENT_TASKS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        if let Some(v) = env("LARDER_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
    }

    /// Session idle timeout as a [`Duration`].
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.session_timeout_minutes.saturating_mul(60))
    }

    /// Confirmation timeout as a [`Duration`].
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime.confirmation_timeout_seconds)
    }

    /// Tool invocation timeout as a [`Duration`].
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_seconds)
    }
}
