//! Warden Daemon - incident and decision governance service
//!
//! The daemon provides:
//! - Decision ingestion, incident aggregation and call admission
//! - Kill-switch, replay and integration-loop operator APIs
//! - Live loop event streams
//! - Background expiry of stale incidents

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use warden_daemon::{DaemonConfig, DaemonError, DaemonResult, Server};

/// Warden Daemon CLI
#[derive(Parser)]
#[command(name = "wardend")]
#[command(about = "Warden Daemon - incident and decision governance", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<String>,

    /// Listen address; overrides the configuration file
    #[arg(short, long, env = "WARDEN_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level; overrides `logging.level`
    #[arg(long, env = "WARDEN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "WARDEN_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())
        .map_err(|e| DaemonError::Config(e.to_string()))?;

    // Initialize tracing
    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| DaemonError::Config(format!("Invalid listen address: {}", e)))?;
    }

    if config.engine.graduation.allow_simulation {
        tracing::warn!("Graduation simulation is enabled; do not run this configuration in production");
    }

    println!(
        r#"
 __        __            _
 \ \      / /_ _ _ __ __| | ___ _ __
  \ \ /\ / / _` | '__/ _` |/ _ \ '_ \
   \ V  V / (_| | | | (_| |  __/ | | |
    \_/\_/ \__,_|_|  \__,_|\___|_| |_|

  Incident & Decision Governance
  Version: {}
  Storage: {}
  Listening: {}
"#,
        env!("CARGO_PKG_VERSION"),
        match config.storage {
            warden_daemon::config::StorageConfig::Memory => "memory",
            warden_daemon::config::StorageConfig::Postgres { .. } => "postgres",
        },
        config.server.listen_addr
    );

    let server = Server::new(config).await?;
    server.run().await
}
