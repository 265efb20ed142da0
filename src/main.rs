//! Entry point: parse CLI flags, load (or seed) the server configuration,
//! and run the supervisor until interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use warden_dns::config::ServerConfiguration;
use warden_dns::error::{ProxyError, Result};
use warden_dns::events::EventBus;
use warden_dns::supervisor::Supervisor;

/// A local DNS resolving proxy: caches answers, enforces allow/deny lists,
/// and falls back across configured upstream providers.
#[derive(Parser, Debug)]
#[command(name = "warden-dns", version, about)]
struct Cli {
    /// Path to the JSON configuration file. Created with defaults if absent.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// UDP port to listen on, overriding the value in the configuration file.
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Directory for driver-owned state (logs, cache, block/allow lists).
    #[arg(long, value_name = "DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("config.json"));

    let mut config = match load_or_seed_config(&config_path).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, path = %config_path.display(), "failed to load configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let events = Arc::new(EventBus::new());
    let supervisor = Supervisor::new(cli.data_dir.clone(), config_path.clone(), config, events);

    if let Err(err) = supervisor.start().await {
        tracing::error!(%err, "server failed to start");
        return std::process::ExitCode::FAILURE;
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received shutdown signal"),
        Err(err) => tracing::warn!(%err, "failed to listen for ctrl-c, shutting down anyway"),
    }

    if let Err(err) = supervisor.stop().await {
        tracing::error!(%err, "error while stopping server");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}

/// Load `path`, or write out a default configuration if nothing exists yet.
async fn load_or_seed_config(path: &std::path::Path) -> Result<ServerConfiguration> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return ServerConfiguration::load(path).await;
    }

    let config = ServerConfiguration::default();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(ProxyError::Io)?;
    }
    config.save(path).await?;
    Ok(config)
}
