mod repl;

use agent_core::config::{AppConfig, TransportKind};
use agent_core::preview::preview;
use agent_core::{AgentLoop, McpSession, ModelGateway, OpenAiBackend, ToolCatalog};
use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mcp-agent",
    about = "Chat with a language model that can call tools on an MCP server",
    version,
    author
)]
struct Cli {
    /// Path to config file (default: ~/.config/mcp-agent/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tool server base URL
    #[arg(long)]
    server_url: Option<String>,

    /// Path the protocol endpoint is mounted under
    #[arg(long)]
    mount_path: Option<String>,

    /// Wire transport: streamable or ndjson
    #[arg(long)]
    transport: Option<TransportKind>,

    /// Pre-load a data file through the server's load tool
    #[arg(long, value_name = "FILE")]
    load: Option<PathBuf>,

    /// Model to try first
    #[arg(short, long)]
    model: Option<String>,

    /// Print the models the backend offers and exit
    #[arg(long)]
    list_models: bool,

    /// Maximum tokens per model response
    #[arg(long)]
    max_tokens: Option<u32>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with answers.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mcp_agent=info,agent_core=info,warn".into()),
        )
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AppConfig::load()?,
    };
    config.apply_env();
    apply_cli_overrides(&mut config, &cli);

    let Some(api_key) = config.provider.resolve_api_key() else {
        eprintln!(
            "No API key found. Set {} or provider.api_key in {}",
            config.provider.api_key_env,
            AppConfig::default_path().display()
        );
        std::process::exit(1);
    };

    let backend = Arc::new(OpenAiBackend::new(&config.provider, Some(api_key)));
    let gateway = ModelGateway::new(backend);

    if cli.list_models {
        let models = gateway.list_models().await;
        if models.is_empty() {
            println!("No models reported by {}", config.provider.api_base);
        }
        for model in models {
            println!("{}", model);
        }
        return Ok(());
    }

    if let Err(e) = run(cli, config, gateway).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(url) = &cli.server_url {
        config.server.base_url = url.clone();
    }
    if let Some(mount) = &cli.mount_path {
        config.server.mount_path = mount.clone();
    }
    if let Some(transport) = cli.transport {
        config.server.transport = transport;
    }
    if let Some(max_tokens) = cli.max_tokens {
        config.provider.max_tokens = max_tokens;
    }
}

async fn run(cli: Cli, config: AppConfig, gateway: ModelGateway) -> Result<()> {
    let transport = agent_transport::connect(&config.server);
    let session = Arc::new(
        McpSession::new(transport)
            .with_request_timeout(Duration::from_secs(config.server.request_timeout_secs)),
    );

    let outcome = start(&cli, &config, gateway, session.clone()).await;
    if let Err(e) = session.close().await {
        tracing::debug!("Error closing session: {}", e);
    }
    outcome
}

async fn start(
    cli: &Cli,
    config: &AppConfig,
    gateway: ModelGateway,
    session: Arc<McpSession>,
) -> Result<()> {
    session.initialize().await;

    let catalog = Arc::new(ToolCatalog::new());
    let count = catalog
        .refresh(&session)
        .await
        .with_context(|| format!("could not list tools at {}", config.server.endpoint_url()))?;
    tracing::info!(
        "Loaded {} tools, model: {}, server: {}",
        count,
        cli.model.as_deref().unwrap_or(&config.provider.model),
        config.server.endpoint_url(),
    );

    if let Some(path) = &cli.load {
        preload(&session, &config.server.load_tool, path).await?;
    }

    let agent = AgentLoop::new(session, gateway, catalog, config.clone())
        .with_model_override(cli.model.clone());
    repl::run(&agent, config).await
}

/// Hand a local file to the server's load tool before the first query.
async fn preload(session: &McpSession, tool: &str, path: &Path) -> Result<()> {
    if !path.is_file() {
        bail!("file not found: {}", path.display());
    }
    let absolute = std::fs::canonicalize(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    let absolute = absolute.to_string_lossy().to_string();

    let result = session
        .call_tool(tool, json!({ "file_path": absolute }))
        .await
        .with_context(|| format!("failed to load {}", absolute))?;
    println!("Loaded {}: {}", absolute, preview(&result.flatten_text()));
    Ok(())
}
