// ABOUTME: Entry point for the corral server binary
// ABOUTME: Parses flags over environment configuration, initialises logging and runs the server

use anyhow::Context;
use clap::{Parser, Subcommand};
use corral_cli::{run_server, Engine};
use corral_config::EngineConfig;
use corral_sandbox::{DockerProvider, DockerSettings};
use corral_webhooks::HttpTransport;
use std::process;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "Corral - session and execution orchestration for sandboxed coding agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Interface to bind (overrides CORRAL_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides CORRAL_PORT)
        #[arg(long)]
        port: Option<u16>,
        /// SQLite database URL (overrides CORRAL_DATABASE_URL)
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Create the database if needed and apply migrations
    Migrate {
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    if let Err(e) = handle_command(cli.command).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env().context("Invalid configuration")?;

    match command {
        Commands::Serve {
            host,
            port,
            database_url,
        } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(database_url) = database_url {
                config.database_url = database_url;
            }

            let provider = DockerProvider::new(DockerSettings {
                image: config.sandbox.image.clone(),
                memory_mb: config.sandbox.memory_mb,
                cpu_cores: config.sandbox.cpu_cores,
                network_mode: config.sandbox.network_mode.clone(),
                working_dir: config.sandbox.working_dir.clone(),
                pull_timeout: config.sandbox.pull_timeout,
            })
            .context("Failed to create Docker client")?;
            let transport = HttpTransport::new(config.webhooks.request_timeout)
                .context("Failed to create webhook client")?;

            let engine = Engine::start(&config, Arc::new(provider), Arc::new(transport))
                .await
                .context("Failed to start engine")?;
            run_server(config, engine).await.context("Server error")?;
        }
        Commands::Migrate { database_url } => {
            let database_url = database_url.unwrap_or(config.database_url);
            corral_storage::connect(&database_url)
                .await
                .context("Failed to migrate database")?;
            info!("Database is up to date: {}", database_url);
        }
    }

    Ok(())
}
