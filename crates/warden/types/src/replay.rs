//! Replay projections
//!
//! Replay items are never stored. They are regenerated on every query from the
//! ledger and the incident store, so they always match the ledger at read time.

use crate::decision::PolicyEvaluation;
use crate::ids::{DecisionId, IncidentId, TenantId};
use crate::incident::{IncidentStatus, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Evidence category of a replay item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayCategory {
    Input,
    Decision,
    Action,
    SideEffect,
}

impl ReplayCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayCategory::Input => "input",
            ReplayCategory::Decision => "decision",
            ReplayCategory::Action => "action",
            ReplayCategory::SideEffect => "side_effect",
        }
    }
}

/// One derived evidence item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayItem {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: ReplayCategory,
    pub label: String,
    pub summary: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cents: Option<i64>,
}

/// Categorized, paginated view of an incident's evidence window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySliceResponse {
    pub incident_id: IncidentId,
    pub window_seconds: u64,
    pub center_time: Option<DateTime<Utc>>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub input: Vec<ReplayItem>,
    pub decision: Vec<ReplayItem>,
    pub action: Vec<ReplayItem>,
    pub side_effect: Vec<ReplayItem>,
    pub timeline: Vec<ReplayItem>,
    pub page: usize,
    pub page_size: usize,
    pub total_items: usize,
    pub has_more: bool,
}

/// Structured explanation of a single replay item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayExplanation {
    pub incident_id: IncidentId,
    pub item: ReplayItem,
    pub record_id: Option<DecisionId>,
    pub is_source_record: bool,
    pub evaluations: Vec<PolicyEvaluation>,
    pub factors: Vec<String>,
    pub related_item_ids: Vec<String>,
}

/// Aggregate view of an incident's evidence window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub incident_id: IncidentId,
    pub tenant_id: TenantId,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub trigger_type: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_items: usize,
    pub input_count: usize,
    pub decision_count: usize,
    pub action_count: usize,
    pub side_effect_count: usize,
    pub record_count: usize,
    pub source_record_count: usize,
    pub blocked_calls: usize,
    pub total_cost_cents: i64,
    pub models: Vec<String>,
    pub policies: Vec<String>,
}
