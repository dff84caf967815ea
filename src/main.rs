use anyhow::Context;
use clap::{Parser, Subcommand};
use modeld::config::Config;
use modeld::http::client::HttpClient;
use modeld::http::server::HttpServer;
use modeld::models::{ArtifactStore, Orchestrator};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modeld")]
#[command(about = "Model lifecycle daemon: load, train, version and serve models by key", long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/modeld/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Daemon URL for client commands (default: derived from server.bind)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Serve,
    #[command(flatten)]
    Client(ClientCommand),
}

/// Commands sent to a running daemon
#[derive(Subcommand)]
enum ClientCommand {
    /// List model records
    List,
    /// Show one model and its stored versions
    Status { key: String },
    /// Upload a pre-built model bundle
    Load {
        key: String,
        /// Model file or zip bundle
        model: PathBuf,
        #[arg(long)]
        metadata: PathBuf,
        #[arg(long)]
        io_params: PathBuf,
    },
    /// Train a new version from a dataset (waits for completion)
    Train {
        key: String,
        training_data: PathBuf,
        #[arg(long)]
        io_params: PathBuf,
    },
    /// Run inference; PAYLOAD is a JSON object, or '-' to read stdin
    Eval { key: String, payload: String },
    /// Download every version of a model as a zip
    Export {
        key: String,
        /// Output file (default: <key>.zip)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Publish the versions in a zip produced by export
    Import { key: String, archive: PathBuf },
    /// Delete a model and all its versions
    Delete { key: String },
    /// Show process, disk and latency statistics
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_daemon(config).await,
        Commands::Client(command) => {
            let client = match cli.server {
                Some(url) => HttpClient::new(url)?,
                None => HttpClient::from_config(&config)?,
            };
            run_client(&client, command).await
        }
    }
}

async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let root = config.store_root()?;
    let store = ArtifactStore::open(&root)
        .with_context(|| format!("Failed to open model store at {}", root.display()))?;
    let engine = modeld::engine::from_config(&config.engine).context("Failed to create engine")?;

    tracing::info!(
        "Starting modeld (engine: {}, store: {})",
        engine.engine_name(),
        root.display()
    );

    let orchestrator = Arc::new(Orchestrator::new(store, engine));
    let report = orchestrator.recover().await?;
    if !report.failed.is_empty() {
        tracing::warn!("Models that failed to recover: {}", report.failed.join(", "));
    }

    HttpServer::new(orchestrator, &config)?.start().await?;
    tracing::info!("Daemon stopped");
    Ok(())
}

async fn run_client(client: &HttpClient, command: ClientCommand) -> anyhow::Result<()> {
    match command {
        ClientCommand::List => print_json(&client.list().await?),
        ClientCommand::Status { key } => print_json(&client.status(&key).await?),
        ClientCommand::Load {
            key,
            model,
            metadata,
            io_params,
        } => print_json(&client.load(&key, &model, &metadata, &io_params).await?),
        ClientCommand::Train {
            key,
            training_data,
            io_params,
        } => print_json(&client.train(&key, &training_data, &io_params).await?),
        ClientCommand::Eval { key, payload } => {
            let raw = if payload == "-" {
                std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?
            } else {
                payload
            };
            let payload: serde_json::Value =
                serde_json::from_str(&raw).context("Payload is not valid JSON")?;
            print_json(&client.eval(&key, &payload).await?)
        }
        ClientCommand::Export { key, output } => {
            let bytes = client.export(&key).await?;
            let output = output.unwrap_or_else(|| PathBuf::from(format!("{key}.zip")));
            tokio::fs::write(&output, &bytes)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("✓ Wrote {} ({} bytes)", output.display(), bytes.len());
            Ok(())
        }
        ClientCommand::Import { key, archive } => {
            let bytes = tokio::fs::read(&archive)
                .await
                .with_context(|| format!("Failed to read {}", archive.display()))?;
            print_json(&client.import(&key, bytes).await?)
        }
        ClientCommand::Delete { key } => {
            client.delete(&key).await?;
            println!("✓ Deleted model '{key}'");
            Ok(())
        }
        ClientCommand::Stats => print_json(&client.stats().await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
