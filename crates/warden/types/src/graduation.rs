//! Graduation evidence types

use crate::ids::{IncidentId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A loop outcome that prevented a recurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreventionEvent {
    pub incident_id: IncidentId,
    pub tenant_id: TenantId,
    pub description: String,
    pub verified: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Automation did something an operator regrets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegretEvent {
    pub incident_id: IncidentId,
    pub tenant_id: TenantId,
    pub reason: String,
    /// Whether the engine's automatic rollback in response succeeded
    pub rolled_back: bool,
    pub recorded_at: DateTime<Utc>,
}

/// A human viewed a prevention timeline in the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleViewEvent {
    pub incident_id: IncidentId,
    pub tenant_id: TenantId,
    pub viewer: String,
    pub recorded_at: DateTime<Utc>,
}

/// One piece of persisted graduation evidence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraduationEvent {
    Prevention(PreventionEvent),
    Regret(RegretEvent),
    ConsoleView(ConsoleViewEvent),
}

impl GraduationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GraduationEvent::Prevention(_) => "prevention",
            GraduationEvent::Regret(_) => "regret",
            GraduationEvent::ConsoleView(_) => "console_view",
        }
    }

    pub fn incident_id(&self) -> IncidentId {
        match self {
            GraduationEvent::Prevention(e) => e.incident_id,
            GraduationEvent::Regret(e) => e.incident_id,
            GraduationEvent::ConsoleView(e) => e.incident_id,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            GraduationEvent::Prevention(e) => &e.tenant_id,
            GraduationEvent::Regret(e) => &e.tenant_id,
            GraduationEvent::ConsoleView(e) => &e.tenant_id,
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            GraduationEvent::Prevention(e) => e.recorded_at,
            GraduationEvent::Regret(e) => e.recorded_at,
            GraduationEvent::ConsoleView(e) => e.recorded_at,
        }
    }
}

/// Result of one graduation gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEvidence {
    pub passed: bool,
    /// Most recent evidence lines, oldest first
    pub evidence: Vec<String>,
    /// Evidence lines recorded overall, including ones no longer listed
    #[serde(default)]
    pub evidence_total: usize,
    pub passed_at: Option<DateTime<Utc>>,
}

impl GateEvidence {
    pub fn pending() -> Self {
        Self {
            passed: false,
            evidence: Vec::new(),
            evidence_total: 0,
            passed_at: None,
        }
    }
}

/// Promotion evidence for moving automation from shadow to active mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraduationStatus {
    pub prevention: GateEvidence,
    pub rollback: GateEvidence,
    pub console_view: GateEvidence,
    pub is_graduated: bool,
}

impl GraduationStatus {
    pub fn from_gates(
        prevention: GateEvidence,
        rollback: GateEvidence,
        console_view: GateEvidence,
    ) -> Self {
        let is_graduated = prevention.passed && rollback.passed && console_view.passed;
        Self {
            prevention,
            rollback,
            console_view,
            is_graduated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format_is_tagged() {
        let event = GraduationEvent::ConsoleView(ConsoleViewEvent {
            incident_id: IncidentId::generate(),
            tenant_id: TenantId::new("t1"),
            viewer: "alice".to_string(),
            recorded_at: Utc::now(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "console_view");
        assert_eq!(value["viewer"], "alice");

        let back: GraduationEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.tenant_id().as_str(), "t1");
    }
}
