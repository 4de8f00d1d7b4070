//! Server setup and lifecycle management

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::config::{DaemonConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use crate::scheduler::Sweeper;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use warden_engine::{GovernanceEngine, InMemoryStorage};

/// Warden daemon server
pub struct Server {
    config: DaemonConfig,
    engine: Arc<GovernanceEngine>,
}

impl Server {
    /// Create a new server, connecting the configured storage backend
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let engine = Arc::new(build_engine(&config).await?);
        // Fail startup rather than the first status request
        engine.graduation().load().await?;
        Ok(Self { config, engine })
    }

    /// Create a server over an existing engine
    pub fn with_engine(config: DaemonConfig, engine: Arc<GovernanceEngine>) -> Self {
        Self { config, engine }
    }

    /// Run the server until a shutdown signal arrives
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = AppState::new(
            self.engine.clone(),
            self.config.server.clone(),
            shutdown_tx.clone(),
        );
        let app = create_router(state);

        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Warden daemon listening on {}", addr);

        // Start sweeper in background
        let sweeper = Arc::new(Sweeper::new(self.engine.clone()));
        let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))?;

        tracing::info!("Warden daemon shutting down");

        let _ = shutdown_tx.send(true);
        if let Err(e) = sweeper_handle.await {
            tracing::warn!(error = %e, "Sweeper task ended abnormally");
        }

        Ok(())
    }
}

async fn build_engine(config: &DaemonConfig) -> DaemonResult<GovernanceEngine> {
    match &config.storage {
        StorageConfig::Memory => {
            tracing::info!("Using in-memory storage");
            Ok(GovernanceEngine::new(
                Arc::new(InMemoryStorage::default()),
                config.engine.clone(),
            ))
        }
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            connect_timeout_secs,
        } => {
            let storage =
                warden_engine::PostgresStorage::new(url, *max_connections, *connect_timeout_secs)
                    .await?;
            tracing::info!(max_connections = *max_connections, "Using PostgreSQL storage");
            Ok(GovernanceEngine::new(Arc::new(storage), config.engine.clone()))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(DaemonError::Config(
            "postgres storage requires the `postgres` feature".to_string(),
        )),
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
