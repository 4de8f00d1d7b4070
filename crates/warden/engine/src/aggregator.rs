//! Incident aggregator
//!
//! Groups violating decision records into incidents per tenant and trigger
//! type using a sliding window, with a rolling-hour cap per tenant. Once a
//! tenant has opened `hourly_incident_cap` incidents in the last hour, new
//! records fold into the most recent active incident, or into the newest
//! incident of that hour when all of them have already closed. Folding never
//! reopens a resolved incident. A tenant therefore opens at most
//! `max(cap, 1)` incidents in any rolling hour.
//!
//! All mutations for one tenant are serialized through a per-tenant lock;
//! different tenants aggregate in parallel.

use crate::config::AggregationConfig;
use crate::error::{require_actor, GovernanceError, GovernanceResult};
use crate::locks::KeyedLocks;
use crate::storage::{IncidentQuery, IncidentStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use warden_types::{DecisionRecord, Incident, IncidentId, IncidentStatus, Severity, TenantId};

/// Actor recorded on incidents closed by window expiry
pub const SWEEPER_ACTOR: &str = "system:sweeper";

/// `action_taken` of a freshly opened incident
pub const ACTION_RECORDED: &str = "recorded";

/// `action_taken` of an incident opened only to absorb capped overflow
pub const ACTION_STORM_OVERFLOW: &str = "storm_overflow";

const MAX_LIST_LIMIT: usize = 1_000;

/// How a record was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// A new incident was opened
    Opened,
    /// Attached to an open window with the same trigger
    Attached,
    /// The tenant hit its hourly cap; folded into an incident of the last hour
    Folded,
}

/// Result of ingesting a violating record
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub incident: Incident,
    pub kind: AggregationKind,
}

/// Incident counts for dashboards
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentMetrics {
    pub total: usize,
    pub active: usize,
    pub acked: usize,
    pub resolved: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_trigger: BTreeMap<String, usize>,
    pub total_cost_delta_cents: i64,
}

/// Windowed incident aggregator
pub struct IncidentAggregator {
    store: Arc<dyn IncidentStore>,
    config: AggregationConfig,
    tenant_locks: KeyedLocks<TenantId>,
}

impl IncidentAggregator {
    pub fn new(store: Arc<dyn IncidentStore>, config: AggregationConfig) -> Self {
        Self {
            store,
            config,
            tenant_locks: KeyedLocks::default(),
        }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Feed one ledger record through the aggregation rules.
    ///
    /// Returns `None` for records without any violation.
    pub async fn ingest(&self, record: &DecisionRecord) -> GovernanceResult<Option<Aggregation>> {
        let (trigger, severity) = match (record.primary_violation(), record.max_severity()) {
            (Some(primary), Some(severity)) => (primary.trigger().to_string(), severity),
            _ => return Ok(None),
        };

        let _guard = self.tenant_locks.lock(record.tenant_id.clone()).await;

        let window = self.config.window();
        let at = record.timestamp;
        let active = self
            .store
            .list_incidents(&IncidentQuery::for_tenant(record.tenant_id.clone()).active_only())
            .await?;

        let open_window = active
            .iter()
            .filter(|i| i.trigger_type == trigger)
            .filter(|i| i.started_at - window <= at && at <= i.window_end(window))
            .max_by_key(|i| i.last_event_at);
        if let Some(existing) = open_window {
            let mut incident = existing.clone();
            absorb(&mut incident, record, severity);
            self.store.save_incident(incident.clone()).await?;
            debug!(
                tenant_id = %record.tenant_id,
                incident_id = %incident.id,
                records = incident.source_record_ids.len(),
                "Record attached to incident"
            );
            return Ok(Some(Aggregation {
                incident,
                kind: AggregationKind::Attached,
            }));
        }

        let mut still_active = Vec::with_capacity(active.len());
        for incident in active {
            if incident.status == IncidentStatus::Open && incident.window_end(window) < at {
                self.expire(incident).await?;
            } else {
                still_active.push(incident);
            }
        }

        let recent = self
            .store
            .list_incidents(&IncidentQuery {
                tenant_id: Some(record.tenant_id.clone()),
                started_after: Some(at - Duration::hours(1)),
                ..Default::default()
            })
            .await?;
        let recent: Vec<Incident> = recent.into_iter().filter(|i| i.started_at <= at).collect();

        if recent.len() >= self.config.hourly_incident_cap {
            // Active incidents first; closed ones of the same hour still absorb
            let target = still_active
                .iter()
                .max_by_key(|i| i.started_at)
                .or_else(|| recent.iter().max_by_key(|i| i.started_at));
            if let Some(target) = target {
                let mut incident = target.clone();
                absorb(&mut incident, record, severity);
                incident.folded_record_count += 1;
                self.store.save_incident(incident.clone()).await?;
                warn!(
                    tenant_id = %record.tenant_id,
                    incident_id = %incident.id,
                    incident_status = ?incident.status,
                    trigger_type = %trigger,
                    folded = incident.folded_record_count,
                    "Hourly incident cap reached; record folded"
                );
                return Ok(Some(Aggregation {
                    incident,
                    kind: AggregationKind::Folded,
                }));
            }

            // Only reachable with a zero cap
            let incident = open_incident(record, trigger, severity, ACTION_STORM_OVERFLOW);
            self.store.insert_incident(incident.clone()).await?;
            warn!(
                tenant_id = %record.tenant_id,
                incident_id = %incident.id,
                "Hourly incident cap reached with no incident this hour; overflow incident opened"
            );
            return Ok(Some(Aggregation {
                incident,
                kind: AggregationKind::Opened,
            }));
        }

        let incident = open_incident(record, trigger, severity, ACTION_RECORDED);
        self.store.insert_incident(incident.clone()).await?;
        info!(
            tenant_id = %incident.tenant_id,
            incident_id = %incident.id,
            trigger_type = %incident.trigger_type,
            severity = %incident.severity,
            "Incident opened"
        );
        Ok(Some(Aggregation {
            incident,
            kind: AggregationKind::Opened,
        }))
    }

    /// Human acknowledgement. Stops window-based auto-resolution.
    pub async fn acknowledge(
        &self,
        id: &IncidentId,
        actor: &str,
        note: Option<String>,
    ) -> GovernanceResult<Incident> {
        require_actor(actor)?;
        self.transition(id, IncidentStatus::Acknowledged, |incident, now| {
            incident.acknowledged_at = Some(now);
            incident.acknowledged_by = Some(actor.to_string());
            if note.is_some() {
                incident.resolution_note = note;
            }
        })
        .await
    }

    /// Human resolution. Terminal regardless of window state.
    pub async fn resolve(
        &self,
        id: &IncidentId,
        actor: &str,
        note: Option<String>,
    ) -> GovernanceResult<Incident> {
        require_actor(actor)?;
        self.transition(id, IncidentStatus::Resolved, |incident, now| {
            incident.ended_at = Some(now);
            incident.resolved_by = Some(actor.to_string());
            incident.resolution_note = note;
        })
        .await
    }

    async fn transition<F>(
        &self,
        id: &IncidentId,
        next: IncidentStatus,
        apply: F,
    ) -> GovernanceResult<Incident>
    where
        F: FnOnce(&mut Incident, DateTime<Utc>),
    {
        let tenant_id = self.get(id).await?.tenant_id;
        let _guard = self.tenant_locks.lock(tenant_id).await;

        let mut incident = self.get(id).await?;
        if !incident.status.can_transition_to(next) {
            return Err(GovernanceError::conflict(format!(
                "incident {} cannot move from {} to {}",
                id,
                incident.status.as_str(),
                next.as_str()
            )));
        }
        incident.status = next;
        apply(&mut incident, Utc::now());
        self.store.save_incident(incident.clone()).await?;
        info!(incident_id = %id, status = next.as_str(), "Incident status changed");
        Ok(incident)
    }

    /// Auto-resolve every open, unacknowledged incident whose window ended
    /// before `now`. Returns the incidents closed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> GovernanceResult<Vec<Incident>> {
        let window = self.config.window();
        let candidates = self
            .store
            .list_incidents(&IncidentQuery {
                statuses: Some(vec![IncidentStatus::Open]),
                ..Default::default()
            })
            .await?;

        let mut closed = Vec::new();
        for candidate in candidates {
            if candidate.window_end(window) >= now {
                continue;
            }
            let _guard = self.tenant_locks.lock(candidate.tenant_id.clone()).await;

            // Re-read under the lock; a record may have extended the window
            let current = match self.store.get_incident(&candidate.id).await? {
                Some(incident) => incident,
                None => continue,
            };
            if current.status == IncidentStatus::Open && current.window_end(window) < now {
                closed.push(self.expire(current).await?);
            }
        }

        if !closed.is_empty() {
            info!(count = closed.len(), "Expired incidents auto-resolved");
        }
        Ok(closed)
    }

    async fn expire(&self, mut incident: Incident) -> GovernanceResult<Incident> {
        incident.status = IncidentStatus::Resolved;
        incident.ended_at = Some(incident.window_end(self.config.window()));
        incident.resolved_by = Some(SWEEPER_ACTOR.to_string());
        incident.auto_resolved = true;
        self.store.save_incident(incident.clone()).await?;
        debug!(incident_id = %incident.id, "Incident window expired");
        Ok(incident)
    }

    /// Record the automated response taken for an incident
    pub async fn set_action_taken(
        &self,
        id: &IncidentId,
        action: impl Into<String>,
    ) -> GovernanceResult<Incident> {
        let tenant_id = self.get(id).await?.tenant_id;
        let _guard = self.tenant_locks.lock(tenant_id).await;

        let mut incident = self.get(id).await?;
        incident.action_taken = action.into();
        self.store.save_incident(incident.clone()).await?;
        Ok(incident)
    }

    pub async fn get(&self, id: &IncidentId) -> GovernanceResult<Incident> {
        self.store
            .get_incident(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(format!("incident {}", id)))
    }

    pub async fn list(&self, query: &IncidentQuery) -> GovernanceResult<Vec<Incident>> {
        match query.limit {
            Some(0) => return Err(GovernanceError::validation("limit must be positive")),
            Some(limit) if limit > MAX_LIST_LIMIT => {
                return Err(GovernanceError::validation(format!(
                    "limit must not exceed {}",
                    MAX_LIST_LIMIT
                )))
            }
            _ => {}
        }
        if let (Some(after), Some(before)) = (query.started_after, query.started_before) {
            if after > before {
                return Err(GovernanceError::validation(
                    "started_after must not be later than started_before",
                ));
            }
        }
        Ok(self.store.list_incidents(query).await?)
    }

    /// Incidents that include at least one record from the given run
    pub async fn by_run(
        &self,
        tenant_id: Option<TenantId>,
        run_id: &str,
    ) -> GovernanceResult<Vec<Incident>> {
        if run_id.trim().is_empty() {
            return Err(GovernanceError::validation("run_id must not be empty"));
        }
        self.list(&IncidentQuery {
            tenant_id,
            run_id: Some(run_id.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn metrics(&self, tenant_id: Option<TenantId>) -> GovernanceResult<IncidentMetrics> {
        let incidents = self
            .store
            .list_incidents(&IncidentQuery {
                tenant_id,
                ..Default::default()
            })
            .await?;

        let mut metrics = IncidentMetrics::default();
        for incident in &incidents {
            metrics.total += 1;
            match incident.status {
                IncidentStatus::Open => metrics.active += 1,
                IncidentStatus::Acknowledged => metrics.acked += 1,
                IncidentStatus::Resolved => metrics.resolved += 1,
            }
            *metrics
                .by_severity
                .entry(incident.severity.as_str().to_string())
                .or_default() += 1;
            *metrics
                .by_trigger
                .entry(incident.trigger_type.clone())
                .or_default() += 1;
            metrics.total_cost_delta_cents += incident.cost_delta_cents;
        }
        Ok(metrics)
    }
}

fn open_incident(
    record: &DecisionRecord,
    trigger_type: String,
    severity: Severity,
    action_taken: &str,
) -> Incident {
    Incident {
        id: IncidentId::generate(),
        tenant_id: record.tenant_id.clone(),
        source_record_ids: vec![record.id.clone()],
        severity,
        status: IncidentStatus::Open,
        trigger_type,
        action_taken: action_taken.to_string(),
        cost_delta_cents: record.cost_cents,
        started_at: record.timestamp,
        ended_at: None,
        last_event_at: record.timestamp,
        key_ids: record.key_id.iter().cloned().collect(),
        run_ids: record.run_id.iter().cloned().collect(),
        folded_record_count: 0,
        acknowledged_at: None,
        acknowledged_by: None,
        resolved_by: None,
        resolution_note: None,
        auto_resolved: false,
    }
}

fn absorb(incident: &mut Incident, record: &DecisionRecord, severity: Severity) {
    if incident.source_record_ids.contains(&record.id) {
        return;
    }
    incident.source_record_ids.push(record.id.clone());
    incident.severity = incident.severity.max(severity);
    incident.cost_delta_cents += record.cost_cents;
    incident.started_at = incident.started_at.min(record.timestamp);
    incident.last_event_at = incident.last_event_at.max(record.timestamp);
    if let Some(ref key) = record.key_id {
        if !incident.key_ids.contains(key) {
            incident.key_ids.push(key.clone());
        }
    }
    if let Some(ref run) = record.run_id {
        if !incident.touches_run(run) {
            incident.run_ids.push(run.clone());
        }
    }
}
