//! Warden Engine - incident and decision governance
//!
//! This crate implements the governance core:
//!
//! - **Decision Ledger**: append-only, write-once record of policy-evaluated calls
//! - **Incident Aggregator**: windowed grouping with a rolling-hour storm cap
//! - **Kill-Switch**: cascading tenant/key freezes with fail-closed reads
//! - **Replay Engine**: categorized, time-bounded evidence views
//! - **Integration Loop**: staged automation gated by human checkpoints
//! - **Graduation Gates**: evidence for promoting automation out of shadow mode
//!
//! [`GovernanceEngine`] wires all of them over a single [`GovernanceStorage`]
//! backend: in-memory for development and tests, PostgreSQL behind the
//! `postgres` feature.
//!
//! ```ignore
//! use std::sync::Arc;
//! use warden_engine::{EngineConfig, GovernanceEngine, InMemoryStorage};
//!
//! let engine = GovernanceEngine::new(Arc::new(InMemoryStorage::default()), EngineConfig::default());
//! let outcome = engine.record_decision(record).await?;
//! ```

#![deny(unsafe_code)]

pub mod aggregator;
pub mod config;
pub mod error;
pub mod governance;
pub mod graduation;
pub mod integration;
pub mod killswitch;
pub mod ledger;
mod locks;
pub mod replay;
pub mod storage;

pub use aggregator::{Aggregation, AggregationKind, IncidentAggregator, IncidentMetrics};
pub use config::{
    AggregationConfig, AutomationConfig, EngineConfig, GraduationConfig, KillSwitchConfig,
    ReplayConfig,
};
pub use error::{GovernanceError, GovernanceResult, StorageError, StorageResult};
pub use governance::{DecisionOutcome, GovernanceEngine};
pub use graduation::{GraduationEvaluator, SimulationKind};
pub use integration::{LoopController, LoopStats, LoopSubscription, RegretOutcome, StageHandlers};
pub use killswitch::{KeyFreezeView, KillSwitch, TenantFreezeStatus};
pub use ledger::{AppendOutcome, DecisionLedger};
pub use replay::{ReplayEngine, SliceParams};
pub use storage::{
    CheckpointQuery, DecisionQuery, GovernanceStorage, InMemoryStorage, IncidentQuery,
};

#[cfg(feature = "postgres")]
pub use storage::PostgresStorage;
