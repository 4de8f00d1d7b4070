//! Incident types

use crate::ids::{DecisionId, IncidentId, KeyId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Incident severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Incident status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl IncidentStatus {
    /// Legal transitions: open→acknowledged, open→resolved, acknowledged→resolved.
    /// Resolved incidents are never re-opened.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        matches!(
            (self, next),
            (IncidentStatus::Open, IncidentStatus::Acknowledged)
                | (IncidentStatus::Open, IncidentStatus::Resolved)
                | (IncidentStatus::Acknowledged, IncidentStatus::Resolved)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Resolved)
    }

    pub fn lifecycle(&self) -> IncidentLifecycle {
        match self {
            IncidentStatus::Open => IncidentLifecycle::Active,
            IncidentStatus::Acknowledged => IncidentLifecycle::Acked,
            IncidentStatus::Resolved => IncidentLifecycle::Resolved,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IncidentStatus::Open),
            "acknowledged" => Ok(IncidentStatus::Acknowledged),
            "resolved" => Ok(IncidentStatus::Resolved),
            other => Err(format!("unknown incident status '{}'", other)),
        }
    }
}

/// Dashboard lifecycle buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentLifecycle {
    Active,
    Acked,
    Resolved,
}

impl FromStr for IncidentLifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(IncidentLifecycle::Active),
            "acked" => Ok(IncidentLifecycle::Acked),
            "resolved" => Ok(IncidentLifecycle::Resolved),
            other => Err(format!("unknown lifecycle '{}'", other)),
        }
    }
}

/// Aggregation of decision records sharing a trigger pattern within a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub tenant_id: TenantId,
    pub source_record_ids: Vec<DecisionId>,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub trigger_type: String,
    pub action_taken: String,
    pub cost_delta_cents: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Timestamp of the most recent attached record; the window slides from here
    pub last_event_at: DateTime<Utc>,
    #[serde(default)]
    pub key_ids: Vec<KeyId>,
    #[serde(default)]
    pub run_ids: Vec<String>,
    /// Records folded in after the tenant hit its hourly incident cap
    #[serde(default)]
    pub folded_record_count: u32,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_by: Option<String>,
    pub resolution_note: Option<String>,
    #[serde(default)]
    pub auto_resolved: bool,
}

impl Incident {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// End of the sliding window at which this incident stops accepting records
    pub fn window_end(&self, window: chrono::Duration) -> DateTime<Utc> {
        self.last_event_at + window
    }

    pub fn touches_run(&self, run_id: &str) -> bool {
        self.run_ids.iter().any(|r| r == run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(
            [Severity::Medium, Severity::Critical, Severity::Low]
                .into_iter()
                .max(),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn test_status_transitions() {
        assert!(IncidentStatus::Open.can_transition_to(IncidentStatus::Acknowledged));
        assert!(IncidentStatus::Open.can_transition_to(IncidentStatus::Resolved));
        assert!(IncidentStatus::Acknowledged.can_transition_to(IncidentStatus::Resolved));
        assert!(!IncidentStatus::Resolved.can_transition_to(IncidentStatus::Open));
        assert!(!IncidentStatus::Acknowledged.can_transition_to(IncidentStatus::Open));
        assert!(!IncidentStatus::Resolved.can_transition_to(IncidentStatus::Acknowledged));
    }

    #[test]
    fn test_lifecycle_buckets() {
        assert_eq!(IncidentStatus::Open.lifecycle(), IncidentLifecycle::Active);
        assert_eq!(
            serde_json::to_string(&IncidentLifecycle::Acked).unwrap(),
            "\"acked\""
        );
    }
}
