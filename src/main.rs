//! larder — smart-pantry agent service.
//!
//! Builds the explicitly constructed service graph (tool registry, LLM
//! client, session store, progress hub, turn pipeline) and serves the
//! HTTP surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::info;

use larder::agent::AgentRuntime;
use larder::api::{router, AppState};
use larder::config::LarderConfig;
use larder::llm::OpenAiClient;
use larder::logging::{self, LogMode};
use larder::session::SessionStore;
use larder::stream::ProgressHub;
use larder::tools::{HttpToolTransport, ToolRegistry, ToolTransport};

#[derive(Parser)]
#[command(name = "larder", about = "Smart-pantry conversational agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default).
    Serve,
    /// Load and print the effective configuration, then exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Environment files are optional; absence is not an error.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::CheckConfig => {
            let config = LarderConfig::load()?;
            let _log = logging::init(LogMode::OneShot, &config)?;
            println!("{config:#?}");
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    let config = LarderConfig::load()?;
    let _log = logging::init(LogMode::Service, &config)?;

    info!(model = %config.llm.model, bind = %config.server.bind, "larder starting");

    // Tool transports and registry.
    let timeout = config.tool_timeout();
    let db_transport: Arc<dyn ToolTransport> = Arc::new(
        HttpToolTransport::new(&config.tools.db_url, timeout)
            .map_err(|e| anyhow::anyhow!("db transport: {e}"))?,
    );
    let recipe_transport: Arc<dyn ToolTransport> = Arc::new(
        HttpToolTransport::new(&config.tools.recipe_url, timeout)
            .map_err(|e| anyhow::anyhow!("recipe transport: {e}"))?,
    );
    let registry = Arc::new(ToolRegistry::new(
        db_transport,
        recipe_transport,
        config.tools.service_token.clone(),
    ));

    let discovered = registry.discover().await;
    info!(count = discovered, "tool catalogue discovered");

    // LLM client.
    let llm = Arc::new(OpenAiClient::new(
        &config.llm.base_url,
        &config.llm.api_key,
        &config.llm.model,
    ));

    // Session store and progress hub.
    let sessions = Arc::new(Mutex::new(SessionStore::new(config.session_timeout())));
    let hub = Arc::new(ProgressHub::new());

    let agent = Arc::new(AgentRuntime::new(
        registry,
        llm,
        sessions,
        hub,
        config.confirmation_timeout(),
        config.runtime.max_concurrent_tasks,
    ));

    let state = AppState {
        agent,
        model_name: config.llm.model.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    info!(bind = %config.server.bind, "larder ready");
    axum::serve(listener, router(state))
        .await
        .context("server error")?;

    Ok(())
}
