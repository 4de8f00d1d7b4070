//! Integration loop types
//!
//! A loop walks a fixed six-stage pipeline per incident:
//!
//! ```text
//! incident_detected → pattern_matched → recovery_suggested
//!                   → policy_generated → routing_adjusted → loop_complete
//! ```
//!
//! Stages only move forward, one at a time. The single exception is an
//! explicit revert, which rolls the loop back to an earlier stage.

use crate::ids::{CheckpointId, IncidentId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Stage of the integration loop, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStage {
    IncidentDetected,
    PatternMatched,
    RecoverySuggested,
    PolicyGenerated,
    RoutingAdjusted,
    LoopComplete,
}

impl LoopStage {
    pub const ALL: [LoopStage; 6] = [
        LoopStage::IncidentDetected,
        LoopStage::PatternMatched,
        LoopStage::RecoverySuggested,
        LoopStage::PolicyGenerated,
        LoopStage::RoutingAdjusted,
        LoopStage::LoopComplete,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<LoopStage> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(&self) -> Option<LoopStage> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopStage::LoopComplete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopStage::IncidentDetected => "incident_detected",
            LoopStage::PatternMatched => "pattern_matched",
            LoopStage::RecoverySuggested => "recovery_suggested",
            LoopStage::PolicyGenerated => "policy_generated",
            LoopStage::RoutingAdjusted => "routing_adjusted",
            LoopStage::LoopComplete => "loop_complete",
        }
    }
}

impl fmt::Display for LoopStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown loop stage '{}'", s))
    }
}

/// Certainty classification of a stage handler's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    Strong,
    Weak,
    Novel,
}

impl ConfidenceBand {
    /// Only strong results auto-commit
    pub fn auto_commits(&self) -> bool {
        matches!(self, ConfidenceBand::Strong)
    }
}

/// Why a stage could not advance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureState {
    MatchFailed,
    RecoveryFailed,
    PolicyRejected,
    RoutingGuardrailBlocked,
    /// The stage handler could not be reached
    DependencyUnavailable,
    /// An operator rejected the stage at its checkpoint
    CheckpointRejected,
}

impl FailureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureState::MatchFailed => "match_failed",
            FailureState::RecoveryFailed => "recovery_failed",
            FailureState::PolicyRejected => "policy_rejected",
            FailureState::RoutingGuardrailBlocked => "routing_guardrail_blocked",
            FailureState::DependencyUnavailable => "dependency_unavailable",
            FailureState::CheckpointRejected => "checkpoint_rejected",
        }
    }
}

impl fmt::Display for FailureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage status within a loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub completed: bool,
    pub timestamp: Option<DateTime<Utc>>,
    pub details: Value,
    pub failure_state: Option<FailureState>,
    pub confidence_band: Option<ConfidenceBand>,
    #[serde(default)]
    pub attempts: u32,
}

impl StageStatus {
    pub fn pending() -> Self {
        Self {
            completed: false,
            timestamp: None,
            details: Value::Null,
            failure_state: None,
            confidence_band: None,
            attempts: 0,
        }
    }
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::pending()
    }
}

/// How the loop moved between stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Advance,
    Revert,
    Abandon,
}

/// One recorded stage move
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: LoopStage,
    pub to: LoopStage,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
    pub actor: String,
    pub confidence_band: Option<ConfidenceBand>,
}

/// Automation state for one incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopInstance {
    pub incident_id: IncidentId,
    pub tenant_id: TenantId,
    pub current_stage: LoopStage,
    pub stages: BTreeMap<LoopStage, StageStatus>,
    pub is_complete: bool,
    pub is_blocked: bool,
    #[serde(default)]
    pub is_abandoned: bool,
    pub failure_state: Option<FailureState>,
    pub pending_checkpoints: Vec<CheckpointId>,
    pub history: Vec<StageTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every persisted mutation
    pub version: u64,
}

impl LoopInstance {
    /// A fresh loop with `incident_detected` already completed
    pub fn new(incident_id: IncidentId, tenant_id: TenantId, details: Value) -> Self {
        let now = Utc::now();
        let mut stages = BTreeMap::new();
        for stage in LoopStage::ALL {
            stages.insert(stage, StageStatus::pending());
        }
        stages.insert(
            LoopStage::IncidentDetected,
            StageStatus {
                completed: true,
                timestamp: Some(now),
                details,
                failure_state: None,
                confidence_band: Some(ConfidenceBand::Strong),
                attempts: 1,
            },
        );

        Self {
            incident_id,
            tenant_id,
            current_stage: LoopStage::IncidentDetected,
            stages,
            is_complete: false,
            is_blocked: false,
            is_abandoned: false,
            failure_state: None,
            pending_checkpoints: Vec::new(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Terminal loops accept no further transitions
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.is_abandoned
    }

    pub fn next_stage(&self) -> Option<LoopStage> {
        self.current_stage.next()
    }

    pub fn stage(&self, stage: LoopStage) -> Option<&StageStatus> {
        self.stages.get(&stage)
    }

    pub fn stage_mut(&mut self, stage: LoopStage) -> &mut StageStatus {
        self.stages.entry(stage).or_default()
    }

    pub fn completed_stages(&self) -> impl Iterator<Item = (&LoopStage, &StageStatus)> {
        self.stages.iter().filter(|(_, status)| status.completed)
    }
}

/// On-demand narrative derived from stage history; never stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopNarrative {
    pub incident_id: IncidentId,
    pub current_stage: LoopStage,
    pub what_happened: String,
    pub what_we_learned: String,
    pub what_we_changed: String,
    pub generated_at: DateTime<Utc>,
}
