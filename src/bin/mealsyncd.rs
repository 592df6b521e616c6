//! mealsyncd: meal analysis daemon.
//!
//! Serves `POST /analyze` over HTTP, running each record id through the
//! provider fallback chain exactly once.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use mealsync::server::config::{Config, Secrets};
use mealsync::server::{AppState, MemoryResultSink, build_orchestrator, serve};

/// Mealsync daemon: nutrition analysis service.
#[derive(Parser)]
#[command(name = "mealsyncd")]
#[command(version = mealsync::PKG_VERSION)]
#[command(about = "Mealsync meal analysis daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Override the bind address from the config file.
    #[arg(short, long, env = "MEALSYNCD_ADDRESS")]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let secrets = Secrets::load()?;
    let orchestrator = build_orchestrator(&config, &secrets)?;
    let address = args.address.unwrap_or_else(|| config.server.address.clone());

    info!(
        version = mealsync::version_string(),
        %address,
        providers = ?orchestrator.provider_names(),
        "mealsyncd starting"
    );

    let state = AppState::new(
        Arc::new(orchestrator),
        Arc::new(MemoryResultSink::new()),
        &config.server,
    );
    serve(&address, state).await?;

    Ok(())
}
