//! Incident sweeper
//!
//! Periodically auto-resolves open, unacknowledged incidents whose
//! aggregation window has expired.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use warden_engine::GovernanceEngine;

/// Sweeper state
pub struct Sweeper {
    engine: Arc<GovernanceEngine>,
    period: Duration,
}

impl Sweeper {
    pub fn new(engine: Arc<GovernanceEngine>) -> Self {
        let secs = engine.config().aggregation.sweep_interval_secs.max(1);
        Self {
            engine,
            period: Duration::from_secs(secs),
        }
    }

    /// Run one sweep. Returns how many incidents were auto-resolved.
    pub async fn sweep_once(&self) -> usize {
        match self.engine.sweep(Utc::now()).await {
            Ok(resolved) => {
                if !resolved.is_empty() {
                    tracing::debug!(count = resolved.len(), "Sweep closed incidents");
                }
                resolved.len()
            }
            Err(e) => {
                tracing::error!(error = %e, "Incident sweep failed");
                0
            }
        }
    }

    /// Sweep on every tick until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.period.as_secs(), "Sweeper started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Sweeper stopped");
    }
}
