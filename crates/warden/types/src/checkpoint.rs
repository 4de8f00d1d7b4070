//! Human checkpoint types

use crate::ids::{CheckpointId, IncidentId, TenantId};
use crate::integration::LoopStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// What the operator is asked to decide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    ApprovePolicy,
    ApproveRecovery,
    SimulateRouting,
    RevertLoop,
    OverrideGuardrail,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::ApprovePolicy => "approve_policy",
            CheckpointType::ApproveRecovery => "approve_recovery",
            CheckpointType::SimulateRouting => "simulate_routing",
            CheckpointType::RevertLoop => "revert_loop",
            CheckpointType::OverrideGuardrail => "override_guardrail",
        }
    }

    /// Checkpoint raised when the handler for `stage` returns a weak or novel result
    pub fn for_stage(stage: LoopStage) -> Option<CheckpointType> {
        match stage {
            LoopStage::PatternMatched | LoopStage::RecoverySuggested => {
                Some(CheckpointType::ApproveRecovery)
            }
            LoopStage::PolicyGenerated => Some(CheckpointType::ApprovePolicy),
            LoopStage::RoutingAdjusted => Some(CheckpointType::SimulateRouting),
            LoopStage::IncidentDetected | LoopStage::LoopComplete => None,
        }
    }

    pub fn default_options(&self) -> Vec<String> {
        vec!["approve".to_string(), "reject".to_string()]
    }
}

impl FromStr for CheckpointType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve_policy" => Ok(CheckpointType::ApprovePolicy),
            "approve_recovery" => Ok(CheckpointType::ApproveRecovery),
            "simulate_routing" => Ok(CheckpointType::SimulateRouting),
            "revert_loop" => Ok(CheckpointType::RevertLoop),
            "override_guardrail" => Ok(CheckpointType::OverrideGuardrail),
            other => Err(format!("unknown checkpoint type '{}'", other)),
        }
    }
}

/// Operator decision on a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointResolution {
    Approve,
    Reject,
    /// Closed by a revert that rolled the loop past the checkpoint's stage
    Superseded,
}

impl CheckpointResolution {
    pub fn is_approving(&self) -> bool {
        matches!(self, CheckpointResolution::Approve)
    }
}

/// A blocking gate requiring operator resolution before loop progression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanCheckpoint {
    pub id: CheckpointId,
    pub checkpoint_type: CheckpointType,
    pub incident_id: IncidentId,
    /// Tenant owning the incident
    pub tenant_id: TenantId,
    /// What the checkpoint gates, e.g. `incident:<uuid>#policy_generated`
    pub target_id: String,
    pub stage: Option<LoopStage>,
    pub options: Vec<String>,
    /// Handler output or operator request awaiting the decision
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution: Option<CheckpointResolution>,
    pub notes: Option<String>,
}

impl HumanCheckpoint {
    pub fn new(
        checkpoint_type: CheckpointType,
        incident_id: IncidentId,
        tenant_id: TenantId,
        stage: Option<LoopStage>,
        context: Value,
        created_by: impl Into<String>,
    ) -> Self {
        let target_id = match stage {
            Some(stage) => format!("{}#{}", incident_id, stage),
            None => incident_id.to_string(),
        };
        Self {
            id: CheckpointId::generate(),
            checkpoint_type,
            incident_id,
            tenant_id,
            target_id,
            stage,
            options: checkpoint_type.default_options(),
            context,
            created_at: Utc::now(),
            created_by: created_by.into(),
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            notes: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.resolution.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_checkpoint_mapping() {
        assert_eq!(
            CheckpointType::for_stage(LoopStage::RecoverySuggested),
            Some(CheckpointType::ApproveRecovery)
        );
        assert_eq!(
            CheckpointType::for_stage(LoopStage::PolicyGenerated),
            Some(CheckpointType::ApprovePolicy)
        );
        assert_eq!(
            CheckpointType::for_stage(LoopStage::RoutingAdjusted),
            Some(CheckpointType::SimulateRouting)
        );
        assert_eq!(CheckpointType::for_stage(LoopStage::LoopComplete), None);
    }

    #[test]
    fn test_new_checkpoint_is_pending() {
        let incident = IncidentId::generate();
        let cp = HumanCheckpoint::new(
            CheckpointType::ApprovePolicy,
            incident,
            TenantId::new("t1"),
            Some(LoopStage::PolicyGenerated),
            Value::Null,
            "system",
        );
        assert!(cp.is_pending());
        assert_eq!(cp.tenant_id.as_str(), "t1");
        assert!(cp.target_id.ends_with("#policy_generated"));
        assert_eq!(cp.options, vec!["approve".to_string(), "reject".to_string()]);
    }
}
