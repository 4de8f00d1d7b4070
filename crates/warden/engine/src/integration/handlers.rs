//! Stage handler interfaces
//!
//! Each loop stage is driven by a differently shaped collaborator. The
//! controller only sees [`StageHandler`], a tagged variant selected by the
//! stage being attempted.
//!
//! Handlers propose through `evaluate` without side effects. Externally
//! visible changes happen only in `commit`, and every committed change must
//! be reversible through `compensate` so that a revert can unwind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use warden_types::{ConfidenceBand, FailureState, Incident, IncidentId, LoopInstance, LoopStage};

/// Result type for stage handler calls
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Stage handler failures
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// The collaborator could not be reached
    #[error("handler unavailable: {0}")]
    Unavailable(String),

    /// The collaborator answered but refused to produce a result
    #[error("{failure_state}: {message}")]
    Failed {
        failure_state: FailureState,
        message: String,
        details: Value,
    },
}

impl HandlerError {
    pub fn failed(failure_state: FailureState, message: impl Into<String>) -> Self {
        Self::Failed {
            failure_state,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn failure_state(&self) -> FailureState {
        match self {
            HandlerError::Unavailable(_) => FailureState::DependencyUnavailable,
            HandlerError::Failed { failure_state, .. } => *failure_state,
        }
    }
}

/// Everything a handler may read while attempting a stage
#[derive(Debug, Clone)]
pub struct LoopContext {
    pub incident: Incident,
    pub instance: LoopInstance,
    pub stage: LoopStage,
    /// Set once after an operator approved an override_guardrail checkpoint
    pub override_guardrail: bool,
}

impl LoopContext {
    /// Details recorded by an earlier, completed stage
    pub fn prior(&self, stage: LoopStage) -> Option<&Value> {
        self.instance
            .stage(stage)
            .filter(|status| status.completed)
            .map(|status| &status.details)
    }
}

/// Proposal returned by a handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub confidence_band: ConfidenceBand,
    pub summary: String,
    pub details: Value,
}

impl StageOutcome {
    pub fn new(confidence_band: ConfidenceBand, summary: impl Into<String>, details: Value) -> Self {
        Self {
            confidence_band,
            summary: summary.into(),
            details,
        }
    }
}

/// Matches an incident against known failure patterns
#[async_trait]
pub trait PatternMatcher: Send + Sync {
    async fn match_pattern(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome>;
}

/// Suggests recovery steps for a matched pattern
#[async_trait]
pub trait RecoveryEngine: Send + Sync {
    async fn suggest_recovery(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome>;
}

/// Generates, activates and withdraws guard policies
#[async_trait]
pub trait PolicyGenerator: Send + Sync {
    async fn generate_policy(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome>;

    async fn activate_policy(&self, incident_id: &IncidentId, proposal: &Value) -> HandlerResult<()>;

    async fn withdraw_policy(&self, incident_id: &IncidentId, proposal: &Value) -> HandlerResult<()>;
}

/// Adjusts model routing and can roll its adjustments back
#[async_trait]
pub trait RoutingAdjuster: Send + Sync {
    async fn propose_adjustment(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome>;

    async fn apply_adjustment(&self, incident_id: &IncidentId, proposal: &Value) -> HandlerResult<()>;

    async fn rollback_adjustment(&self, incident_id: &IncidentId, proposal: &Value)
        -> HandlerResult<()>;
}

/// One handler per automated stage
#[derive(Clone)]
pub enum StageHandler {
    PatternMatcher(Arc<dyn PatternMatcher>),
    Recovery(Arc<dyn RecoveryEngine>),
    Policy(Arc<dyn PolicyGenerator>),
    Routing(Arc<dyn RoutingAdjuster>),
}

impl StageHandler {
    /// The stage this handler attempts
    pub fn stage(&self) -> LoopStage {
        match self {
            StageHandler::PatternMatcher(_) => LoopStage::PatternMatched,
            StageHandler::Recovery(_) => LoopStage::RecoverySuggested,
            StageHandler::Policy(_) => LoopStage::PolicyGenerated,
            StageHandler::Routing(_) => LoopStage::RoutingAdjusted,
        }
    }

    /// Whether committing this stage changes anything outside the loop
    pub fn has_side_effects(&self) -> bool {
        matches!(self, StageHandler::Policy(_) | StageHandler::Routing(_))
    }

    pub async fn evaluate(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome> {
        match self {
            StageHandler::PatternMatcher(h) => h.match_pattern(ctx).await,
            StageHandler::Recovery(h) => h.suggest_recovery(ctx).await,
            StageHandler::Policy(h) => h.generate_policy(ctx).await,
            StageHandler::Routing(h) => h.propose_adjustment(ctx).await,
        }
    }

    pub async fn commit(&self, incident_id: &IncidentId, proposal: &Value) -> HandlerResult<()> {
        match self {
            StageHandler::PatternMatcher(_) | StageHandler::Recovery(_) => Ok(()),
            StageHandler::Policy(h) => h.activate_policy(incident_id, proposal).await,
            StageHandler::Routing(h) => h.apply_adjustment(incident_id, proposal).await,
        }
    }

    pub async fn compensate(&self, incident_id: &IncidentId, proposal: &Value) -> HandlerResult<()> {
        match self {
            StageHandler::PatternMatcher(_) | StageHandler::Recovery(_) => Ok(()),
            StageHandler::Policy(h) => h.withdraw_policy(incident_id, proposal).await,
            StageHandler::Routing(h) => h.rollback_adjustment(incident_id, proposal).await,
        }
    }
}

/// The handler set a controller drives
#[derive(Clone)]
pub struct StageHandlers {
    pub pattern: Arc<dyn PatternMatcher>,
    pub recovery: Arc<dyn RecoveryEngine>,
    pub policy: Arc<dyn PolicyGenerator>,
    pub routing: Arc<dyn RoutingAdjuster>,
}

impl StageHandlers {
    pub fn for_stage(&self, stage: LoopStage) -> Option<StageHandler> {
        match stage {
            LoopStage::PatternMatched => Some(StageHandler::PatternMatcher(self.pattern.clone())),
            LoopStage::RecoverySuggested => Some(StageHandler::Recovery(self.recovery.clone())),
            LoopStage::PolicyGenerated => Some(StageHandler::Policy(self.policy.clone())),
            LoopStage::RoutingAdjusted => Some(StageHandler::Routing(self.routing.clone())),
            LoopStage::IncidentDetected | LoopStage::LoopComplete => None,
        }
    }
}
