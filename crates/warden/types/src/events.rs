//! Loop event stream types
//!
//! Subscribers to an incident's loop receive a `Snapshot` first, then one
//! event per change. The channel is push-only.

use crate::checkpoint::{CheckpointResolution, CheckpointType};
use crate::ids::{CheckpointId, IncidentId};
use crate::integration::{ConfidenceBand, FailureState, LoopInstance, LoopStage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping every loop event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopEventEnvelope {
    pub id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub incident_id: IncidentId,
    /// Loop version after the change
    pub version: u64,
    pub event: LoopEvent,
}

impl LoopEventEnvelope {
    pub fn new(incident_id: IncidentId, version: u64, event: LoopEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            incident_id,
            version,
            event,
        }
    }

    /// SSE event name
    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

/// Loop events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// Current state, sent first to every new subscriber
    Snapshot { instance: Box<LoopInstance> },

    StageAdvanced {
        from: LoopStage,
        to: LoopStage,
        confidence_band: Option<ConfidenceBand>,
    },

    CheckpointRaised {
        checkpoint_id: CheckpointId,
        checkpoint_type: CheckpointType,
        stage: Option<LoopStage>,
    },

    CheckpointResolved {
        checkpoint_id: CheckpointId,
        resolution: CheckpointResolution,
        resolved_by: String,
    },

    StageFailed {
        stage: LoopStage,
        failure_state: FailureState,
        message: String,
    },

    Reverted {
        from: LoopStage,
        to: LoopStage,
        abandoned: bool,
        actor: String,
    },

    Completed,
}

impl LoopEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LoopEvent::Snapshot { .. } => "snapshot",
            LoopEvent::StageAdvanced { .. } => "stage_advanced",
            LoopEvent::CheckpointRaised { .. } => "checkpoint_raised",
            LoopEvent::CheckpointResolved { .. } => "checkpoint_resolved",
            LoopEvent::StageFailed { .. } => "stage_failed",
            LoopEvent::Reverted { .. } => "reverted",
            LoopEvent::Completed => "completed",
        }
    }
}
