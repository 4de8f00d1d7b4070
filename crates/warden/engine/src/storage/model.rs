use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_types::{
    CheckpointType, DecisionRecord, Incident, IncidentId, IncidentLifecycle, IncidentStatus,
    KeyId, PolicyResult, Severity, TenantId,
};

/// Ledger row: the record plus the digest of its canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDecision {
    pub record: DecisionRecord,
    pub content_hash: String,
    pub appended_at: DateTime<Utc>,
}

/// Result of an insert-if-absent on the ledger.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id already exists; it is returned untouched.
    Existing(StoredDecision),
}

/// Ledger filters. Results are always ordered by `timestamp` ascending,
/// then by id, so pagination is deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionQuery {
    pub tenant_id: Option<TenantId>,
    pub key_id: Option<KeyId>,
    pub run_id: Option<String>,
    pub model: Option<String>,
    /// Match records with at least one evaluation with this result
    pub result: Option<PolicyResult>,
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl DecisionQuery {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Default::default()
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn matches(&self, record: &DecisionRecord) -> bool {
        if let Some(ref tenant) = self.tenant_id {
            if &record.tenant_id != tenant {
                return false;
            }
        }
        if let Some(ref key) = self.key_id {
            if record.key_id.as_ref() != Some(key) {
                return false;
            }
        }
        if let Some(ref run) = self.run_id {
            if record.run_id.as_deref() != Some(run.as_str()) {
                return false;
            }
        }
        if let Some(ref model) = self.model {
            if &record.model != model {
                return false;
            }
        }
        if let Some(result) = self.result {
            if !record.evaluations.iter().any(|e| e.result == result) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if record.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if record.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// Incident filters. Results are ordered newest `started_at` first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentQuery {
    pub tenant_id: Option<TenantId>,
    pub statuses: Option<Vec<IncidentStatus>>,
    pub lifecycle: Option<IncidentLifecycle>,
    pub severity: Option<Severity>,
    pub trigger_type: Option<String>,
    pub run_id: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl IncidentQuery {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            ..Default::default()
        }
    }

    pub fn active_only(mut self) -> Self {
        self.statuses = Some(vec![IncidentStatus::Open, IncidentStatus::Acknowledged]);
        self
    }

    pub fn matches(&self, incident: &Incident) -> bool {
        if let Some(ref tenant) = self.tenant_id {
            if &incident.tenant_id != tenant {
                return false;
            }
        }
        if let Some(ref statuses) = self.statuses {
            if !statuses.contains(&incident.status) {
                return false;
            }
        }
        if let Some(lifecycle) = self.lifecycle {
            if incident.status.lifecycle() != lifecycle {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if incident.severity != severity {
                return false;
            }
        }
        if let Some(ref trigger) = self.trigger_type {
            if &incident.trigger_type != trigger {
                return false;
            }
        }
        if let Some(ref run) = self.run_id {
            if !incident.touches_run(run) {
                return false;
            }
        }
        if let Some(after) = self.started_after {
            if incident.started_at < after {
                return false;
            }
        }
        if let Some(before) = self.started_before {
            if incident.started_at > before {
                return false;
            }
        }
        true
    }
}

/// Checkpoint filters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointQuery {
    pub tenant_id: Option<TenantId>,
    pub incident_id: Option<IncidentId>,
    pub checkpoint_type: Option<CheckpointType>,
    #[serde(default)]
    pub pending_only: bool,
    pub limit: Option<usize>,
}

pub(crate) fn apply_page<T>(values: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let iter = values.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}
