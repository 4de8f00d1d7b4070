//! Replay engine
//!
//! Pure reads. Every view is regenerated from the ledger and the incident
//! store, bounded by the incident's own time span widened by the requested
//! window, so pagination stays stable while the ledger keeps growing.

use crate::config::ReplayConfig;
use crate::error::{GovernanceError, GovernanceResult};
use crate::storage::{DecisionQuery, DecisionStore, IncidentStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use warden_types::{
    DecisionId, DecisionRecord, Incident, IncidentId, ReplayCategory, ReplayExplanation,
    ReplayItem, ReplaySliceResponse, ReplaySummary,
};

const ITEM_OPENED: &str = "incident:opened";
const ITEM_ACKNOWLEDGED: &str = "incident:acknowledged";
const ITEM_RESOLVED: &str = "incident:resolved";

/// Parameters of a slice request; unset fields take configured defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SliceParams {
    pub window_seconds: Option<u64>,
    pub center_time: Option<DateTime<Utc>>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// Read-only evidence reconstruction for incidents
pub struct ReplayEngine {
    decisions: Arc<dyn DecisionStore>,
    incidents: Arc<dyn IncidentStore>,
    config: ReplayConfig,
}

impl ReplayEngine {
    pub fn new(
        decisions: Arc<dyn DecisionStore>,
        incidents: Arc<dyn IncidentStore>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            decisions,
            incidents,
            config,
        }
    }

    /// Categorized, paginated slice of an incident's evidence
    pub async fn slice(
        &self,
        incident_id: &IncidentId,
        params: SliceParams,
    ) -> GovernanceResult<ReplaySliceResponse> {
        let window_seconds = self.validate_window(params.window_seconds)?;
        let page = params.page.unwrap_or(1);
        if page == 0 {
            return Err(GovernanceError::validation("page starts at 1"));
        }
        let page_size = params.page_size.unwrap_or(self.config.default_page_size);
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(GovernanceError::validation(format!(
                "page_size must be between 1 and {}",
                self.config.max_page_size
            )));
        }

        let incident = self.incident(incident_id).await?;
        let window = Duration::seconds(window_seconds as i64);
        let bounds = incident_bounds(&incident, window);
        let range = match params.center_time {
            Some(center) => {
                if !bounds.contains(center) {
                    return Err(GovernanceError::validation(format!(
                        "center_time {} is outside the incident window [{}, {}]",
                        center, bounds.start, bounds.end
                    )));
                }
                TimeRange {
                    start: bounds.start.max(center - window),
                    end: bounds.end.min(center + window),
                }
            }
            None => bounds,
        };

        let items = self.items_in(&incident, range).await?;
        let total_items = items.len();
        let timeline: Vec<ReplayItem> = items
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        let has_more = page.saturating_mul(page_size) < total_items;

        let by_category = |category: ReplayCategory| -> Vec<ReplayItem> {
            timeline
                .iter()
                .filter(|item| item.category == category)
                .cloned()
                .collect()
        };

        debug!(
            incident_id = %incident_id,
            total_items,
            page,
            "Replay slice generated"
        );

        Ok(ReplaySliceResponse {
            incident_id: *incident_id,
            window_seconds,
            center_time: params.center_time,
            window_start: range.start,
            window_end: range.end,
            input: by_category(ReplayCategory::Input),
            decision: by_category(ReplayCategory::Decision),
            action: by_category(ReplayCategory::Action),
            side_effect: by_category(ReplayCategory::SideEffect),
            timeline,
            page,
            page_size,
            total_items,
            has_more,
        })
    }

    /// Unpaginated ordered items over the default window
    pub async fn timeline(
        &self,
        incident_id: &IncidentId,
        limit: Option<usize>,
    ) -> GovernanceResult<Vec<ReplayItem>> {
        let limit = limit.unwrap_or(self.config.max_timeline_limit);
        if limit == 0 || limit > self.config.max_timeline_limit {
            return Err(GovernanceError::validation(format!(
                "limit must be between 1 and {}",
                self.config.max_timeline_limit
            )));
        }

        let incident = self.incident(incident_id).await?;
        let range = incident_bounds(&incident, self.default_window());
        let mut items = self.items_in(&incident, range).await?;
        items.truncate(limit);
        Ok(items)
    }

    /// Explain one item by its id
    pub async fn explain(
        &self,
        incident_id: &IncidentId,
        item_id: &str,
    ) -> GovernanceResult<ReplayExplanation> {
        if item_id.trim().is_empty() {
            return Err(GovernanceError::validation("item_id must not be empty"));
        }
        let incident = self.incident(incident_id).await?;

        if let Some(item) = incident_items(&incident)
            .into_iter()
            .find(|item| item.id == item_id)
        {
            return Ok(explain_incident_item(&incident, item));
        }

        let (record_id, category) = parse_record_item_id(item_id)
            .ok_or_else(|| GovernanceError::not_found(format!("replay item {}", item_id)))?;
        let record = self
            .decisions
            .get_decision(&record_id)
            .await?
            .map(|stored| stored.record)
            .filter(|record| record.tenant_id == incident.tenant_id)
            .ok_or_else(|| GovernanceError::not_found(format!("replay item {}", item_id)))?;

        let items = record_items(&record);
        let item = items
            .iter()
            .find(|item| item.category == category)
            .cloned()
            .ok_or_else(|| GovernanceError::not_found(format!("replay item {}", item_id)))?;
        let related_item_ids = items
            .iter()
            .filter(|other| other.id != item.id)
            .map(|other| other.id.clone())
            .collect();

        let is_source_record = incident.source_record_ids.contains(&record.id);
        Ok(ReplayExplanation {
            incident_id: *incident_id,
            factors: record_factors(&record, category, &incident, is_source_record),
            item,
            record_id: Some(record.id.clone()),
            is_source_record,
            evaluations: record.evaluations.clone(),
            related_item_ids,
        })
    }

    /// Counts and totals over the default window
    pub async fn summary(&self, incident_id: &IncidentId) -> GovernanceResult<ReplaySummary> {
        let incident = self.incident(incident_id).await?;
        let range = incident_bounds(&incident, self.default_window());
        let records = self.records_in(&incident, range).await?;
        let items = self.items_in(&incident, range).await?;

        let count = |category: ReplayCategory| items.iter().filter(|i| i.category == category).count();
        let models: BTreeSet<String> = records.iter().map(|r| r.model.clone()).collect();
        let policies: BTreeSet<String> = records
            .iter()
            .flat_map(|r| r.evaluations.iter().map(|e| e.policy_id.clone()))
            .collect();

        Ok(ReplaySummary {
            incident_id: *incident_id,
            tenant_id: incident.tenant_id.clone(),
            severity: incident.severity,
            status: incident.status,
            trigger_type: incident.trigger_type.clone(),
            window_start: range.start,
            window_end: range.end,
            total_items: items.len(),
            input_count: count(ReplayCategory::Input),
            decision_count: count(ReplayCategory::Decision),
            action_count: count(ReplayCategory::Action),
            side_effect_count: count(ReplayCategory::SideEffect),
            record_count: records.len(),
            source_record_count: incident.source_record_ids.len(),
            blocked_calls: records.iter().filter(|r| r.is_blocked()).count(),
            total_cost_cents: records.iter().map(|r| r.cost_cents).sum(),
            models: models.into_iter().collect(),
            policies: policies.into_iter().collect(),
        })
    }

    fn default_window(&self) -> Duration {
        Duration::seconds(self.config.default_window_secs as i64)
    }

    fn validate_window(&self, window_seconds: Option<u64>) -> GovernanceResult<u64> {
        let window = window_seconds.unwrap_or(self.config.default_window_secs);
        if window == 0 || window > self.config.max_window_secs {
            return Err(GovernanceError::validation(format!(
                "window must be between 1 and {} seconds",
                self.config.max_window_secs
            )));
        }
        Ok(window)
    }

    async fn incident(&self, id: &IncidentId) -> GovernanceResult<Incident> {
        self.incidents
            .get_incident(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(format!("incident {}", id)))
    }

    async fn records_in(
        &self,
        incident: &Incident,
        range: TimeRange,
    ) -> GovernanceResult<Vec<DecisionRecord>> {
        let query =
            DecisionQuery::for_tenant(incident.tenant_id.clone()).between(range.start, range.end);
        let rows = self.decisions.query_decisions(&query).await?;
        Ok(rows.into_iter().map(|stored| stored.record).collect())
    }

    async fn items_in(
        &self,
        incident: &Incident,
        range: TimeRange,
    ) -> GovernanceResult<Vec<ReplayItem>> {
        let records = self.records_in(incident, range).await?;
        let mut items: Vec<ReplayItem> = records.iter().flat_map(record_items).collect();
        items.extend(
            incident_items(incident)
                .into_iter()
                .filter(|item| range.contains(item.timestamp)),
        );
        items.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.category.cmp(&b.category))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(items)
    }
}

fn incident_bounds(incident: &Incident, window: Duration) -> TimeRange {
    let end = incident.ended_at.unwrap_or(incident.last_event_at);
    TimeRange {
        start: incident.started_at - window,
        end: end.max(incident.last_event_at) + window,
    }
}

fn parse_record_item_id(item_id: &str) -> Option<(DecisionId, ReplayCategory)> {
    let (record, suffix) = item_id.rsplit_once(':')?;
    let category = match suffix {
        "input" => ReplayCategory::Input,
        "decision" => ReplayCategory::Decision,
        "action" => ReplayCategory::Action,
        "side_effect" => ReplayCategory::SideEffect,
        _ => return None,
    };
    if record.is_empty() {
        return None;
    }
    Some((DecisionId::new(record), category))
}

fn record_items(record: &DecisionRecord) -> Vec<ReplayItem> {
    let id = record.id.as_str();
    let violations: Vec<_> = record.violations().collect();
    let (outcome, action_summary) = if record.is_blocked() {
        ("call_blocked", "Call blocked by policy".to_string())
    } else if let Some(primary) = record.primary_violation() {
        (
            "call_flagged",
            format!("Call allowed but flagged by {}", primary.policy_id),
        )
    } else {
        ("call_allowed", "Call allowed".to_string())
    };

    vec![
        ReplayItem {
            id: format!("{}:input", id),
            timestamp: record.timestamp,
            category: ReplayCategory::Input,
            label: format!("Request to {}", record.model),
            summary: match record.key_id {
                Some(ref key) => format!("Input {} sent with key {}", record.input_hash, key),
                None => format!("Input {}", record.input_hash),
            },
            data: json!({
                "record_id": id,
                "model": record.model,
                "input_hash": record.input_hash,
                "key_id": record.key_id,
                "run_id": record.run_id,
            }),
            duration_ms: None,
            cost_cents: None,
        },
        ReplayItem {
            id: format!("{}:decision", id),
            timestamp: record.timestamp,
            category: ReplayCategory::Decision,
            label: "Policy evaluation".to_string(),
            summary: format!(
                "{} policies evaluated, {} violated",
                record.evaluations.len(),
                violations.len()
            ),
            data: json!({
                "record_id": id,
                "evaluations": record.evaluations,
                "max_severity": record.max_severity(),
            }),
            duration_ms: None,
            cost_cents: None,
        },
        ReplayItem {
            id: format!("{}:action", id),
            timestamp: record.timestamp,
            category: ReplayCategory::Action,
            label: outcome.to_string(),
            summary: action_summary,
            data: json!({
                "record_id": id,
                "outcome": outcome,
                "primary_policy": record.primary_violation().map(|e| e.policy_id.clone()),
            }),
            duration_ms: None,
            cost_cents: None,
        },
        ReplayItem {
            id: format!("{}:side_effect", id),
            timestamp: record.timestamp,
            category: ReplayCategory::SideEffect,
            label: "Spend and latency".to_string(),
            summary: format!(
                "{} cents spent, {} ms latency",
                record.cost_cents, record.latency_ms
            ),
            data: json!({
                "record_id": id,
                "output_hash": record.output_hash,
            }),
            duration_ms: Some(record.latency_ms),
            cost_cents: Some(record.cost_cents),
        },
    ]
}

fn incident_items(incident: &Incident) -> Vec<ReplayItem> {
    let mut items = vec![ReplayItem {
        id: ITEM_OPENED.to_string(),
        timestamp: incident.started_at,
        category: ReplayCategory::Action,
        label: "incident_opened".to_string(),
        summary: format!(
            "{} incident opened for {}; action: {}",
            incident.severity, incident.trigger_type, incident.action_taken
        ),
        data: json!({
            "incident_id": incident.id,
            "trigger_type": incident.trigger_type,
            "action_taken": incident.action_taken,
        }),
        duration_ms: None,
        cost_cents: None,
    }];

    if let Some(at) = incident.acknowledged_at {
        items.push(ReplayItem {
            id: ITEM_ACKNOWLEDGED.to_string(),
            timestamp: at,
            category: ReplayCategory::Action,
            label: "incident_acknowledged".to_string(),
            summary: format!(
                "Acknowledged by {}",
                incident.acknowledged_by.as_deref().unwrap_or("unknown")
            ),
            data: json!({ "acknowledged_by": incident.acknowledged_by }),
            duration_ms: None,
            cost_cents: None,
        });
    }

    if let Some(at) = incident.ended_at {
        items.push(ReplayItem {
            id: ITEM_RESOLVED.to_string(),
            timestamp: at,
            category: ReplayCategory::Action,
            label: "incident_resolved".to_string(),
            summary: if incident.auto_resolved {
                "Auto-resolved after the window expired".to_string()
            } else {
                format!(
                    "Resolved by {}",
                    incident.resolved_by.as_deref().unwrap_or("unknown")
                )
            },
            data: json!({
                "resolved_by": incident.resolved_by,
                "auto_resolved": incident.auto_resolved,
                "note": incident.resolution_note,
            }),
            duration_ms: None,
            cost_cents: Some(incident.cost_delta_cents),
        });
    }

    items
}

fn explain_incident_item(incident: &Incident, item: ReplayItem) -> ReplayExplanation {
    let mut factors = vec![
        format!("trigger type {}", incident.trigger_type),
        format!("severity {}", incident.severity),
        format!("{} source records", incident.source_record_ids.len()),
        format!("action taken: {}", incident.action_taken),
    ];
    if incident.folded_record_count > 0 {
        factors.push(format!(
            "{} records folded in after the hourly incident cap",
            incident.folded_record_count
        ));
    }
    ReplayExplanation {
        incident_id: incident.id,
        item,
        record_id: None,
        is_source_record: false,
        evaluations: Vec::new(),
        factors,
        related_item_ids: incident
            .source_record_ids
            .iter()
            .map(|id| format!("{}:decision", id))
            .collect(),
    }
}

fn record_factors(
    record: &DecisionRecord,
    category: ReplayCategory,
    incident: &Incident,
    is_source_record: bool,
) -> Vec<String> {
    let mut factors: Vec<String> = record
        .violations()
        .map(|e| {
            format!(
                "{} returned {} ({}): {}",
                e.policy_id,
                e.result.as_str(),
                e.effective_severity(),
                e.reason
            )
        })
        .collect();

    if category == ReplayCategory::SideEffect {
        factors.push(format!(
            "{} cents spent over {} ms",
            record.cost_cents, record.latency_ms
        ));
    }
    if is_source_record {
        factors.push(format!("aggregated into {}", incident.id));
    } else {
        factors.push("inside the incident window but not aggregated into it".to_string());
    }
    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryStorage, InsertOutcome, StoredDecision};
    use chrono::TimeZone;
    use warden_types::{IncidentStatus, KeyId, PolicyEvaluation, PolicyResult, Severity, TenantId};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn record(id: &str, tenant: &str, offset_secs: i64, result: PolicyResult) -> DecisionRecord {
        DecisionRecord {
            id: DecisionId::new(id),
            tenant_id: TenantId::new(tenant),
            key_id: Some(KeyId::new("k1")),
            run_id: None,
            timestamp: base() + Duration::seconds(offset_secs),
            evaluations: vec![PolicyEvaluation::new("budget", result, "over budget")],
            model: "gpt-4o".to_string(),
            input_hash: "in".to_string(),
            output_hash: "out".to_string(),
            cost_cents: 25,
            latency_ms: 400,
        }
    }

    fn incident(sources: &[&str]) -> Incident {
        Incident {
            id: IncidentId::generate(),
            tenant_id: TenantId::new("t1"),
            source_record_ids: sources.iter().map(|s| DecisionId::new(*s)).collect(),
            severity: Severity::Critical,
            status: IncidentStatus::Resolved,
            trigger_type: "budget".to_string(),
            action_taken: "recorded".to_string(),
            cost_delta_cents: 50,
            started_at: base(),
            ended_at: Some(base() + Duration::seconds(60)),
            last_event_at: base() + Duration::seconds(60),
            key_ids: vec![KeyId::new("k1")],
            run_ids: Vec::new(),
            folded_record_count: 0,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_by: Some("alice".to_string()),
            resolution_note: None,
            auto_resolved: false,
        }
    }

    async fn seed(storage: &InMemoryStorage, records: Vec<DecisionRecord>) {
        for record in records {
            let outcome = storage
                .insert_decision(StoredDecision {
                    record,
                    content_hash: "h".to_string(),
                    appended_at: Utc::now(),
                })
                .await
                .unwrap();
            assert!(matches!(outcome, InsertOutcome::Inserted));
        }
    }

    async fn fixture() -> (ReplayEngine, Incident) {
        let storage = Arc::new(InMemoryStorage::new());
        seed(
            &storage,
            vec![
                record("before", "t1", -400, PolicyResult::Pass),
                record("a", "t1", 0, PolicyResult::Blocked),
                record("mid", "t1", 30, PolicyResult::Pass),
                record("b", "t1", 60, PolicyResult::Blocked),
                record("other-tenant", "t2", 30, PolicyResult::Blocked),
                record("after", "t1", 400, PolicyResult::Pass),
            ],
        )
        .await;
        let incident = incident(&["a", "b"]);
        storage.insert_incident(incident.clone()).await.unwrap();
        let engine = ReplayEngine::new(storage.clone(), storage, ReplayConfig::default());
        (engine, incident)
    }

    #[tokio::test]
    async fn test_slice_stays_inside_bounds() {
        let (engine, incident) = fixture().await;
        let slice = engine
            .slice(
                &incident.id,
                SliceParams {
                    window_seconds: Some(300),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // 3 tenant records x 4 items + opened + resolved
        assert_eq!(slice.total_items, 14);
        let start = incident.started_at - Duration::seconds(300);
        let end = incident.ended_at.unwrap() + Duration::seconds(300);
        assert!(slice
            .timeline
            .iter()
            .all(|item| item.timestamp >= start && item.timestamp <= end));
        assert!(slice.timeline.iter().all(|i| !i.id.starts_with("other-tenant")));
        assert_eq!(slice.input.len(), 3);
        assert!(!slice.has_more);
    }

    #[tokio::test]
    async fn test_slice_is_ordered_and_paginated() {
        let (engine, incident) = fixture().await;
        let first = engine
            .slice(
                &incident.id,
                SliceParams {
                    page: Some(1),
                    page_size: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(first.has_more);
        assert_eq!(first.timeline.len(), 5);
        assert_eq!(first.timeline[0].id, "a:input");
        assert_eq!(first.timeline[1].id, "a:decision");
        assert_eq!(first.timeline[2].id, "a:action");
        assert_eq!(first.timeline[3].id, ITEM_OPENED);

        let third = engine
            .slice(
                &incident.id,
                SliceParams {
                    page: Some(3),
                    page_size: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(third.timeline.len(), 4);
        assert!(!third.has_more);
    }

    #[tokio::test]
    async fn test_center_time_narrows_and_validates() {
        let (engine, incident) = fixture().await;
        let slice = engine
            .slice(
                &incident.id,
                SliceParams {
                    window_seconds: Some(10),
                    center_time: Some(base() + Duration::seconds(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(slice.timeline.iter().all(|i| i.id.starts_with("mid:")));

        let err = engine
            .slice(
                &incident.id,
                SliceParams {
                    window_seconds: Some(10),
                    center_time: Some(base() + Duration::hours(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GovernanceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_invalid_params_rejected() {
        let (engine, incident) = fixture().await;
        for params in [
            SliceParams {
                window_seconds: Some(0),
                ..Default::default()
            },
            SliceParams {
                page: Some(0),
                ..Default::default()
            },
            SliceParams {
                page_size: Some(10_000),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                engine.slice(&incident.id, params).await,
                Err(GovernanceError::Validation(_))
            ));
        }
        assert!(matches!(
            engine.timeline(&incident.id, Some(0)).await,
            Err(GovernanceError::Validation(_))
        ));
        assert!(matches!(
            engine.timeline(&IncidentId::generate(), None).await,
            Err(GovernanceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_explain_record_item() {
        let (engine, incident) = fixture().await;
        let explanation = engine.explain(&incident.id, "b:action").await.unwrap();
        assert!(explanation.is_source_record);
        assert_eq!(explanation.item.label, "call_blocked");
        assert_eq!(explanation.related_item_ids.len(), 3);

        let mid = engine.explain(&incident.id, "mid:decision").await.unwrap();
        assert!(!mid.is_source_record);

        assert!(matches!(
            engine.explain(&incident.id, "other-tenant:input").await,
            Err(GovernanceError::NotFound(_))
        ));
        assert!(matches!(
            engine.explain(&incident.id, "a:bogus").await,
            Err(GovernanceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_explain_incident_item() {
        let (engine, incident) = fixture().await;
        let explanation = engine.explain(&incident.id, ITEM_OPENED).await.unwrap();
        assert_eq!(explanation.record_id, None);
        assert_eq!(
            explanation.related_item_ids,
            vec!["a:decision".to_string(), "b:decision".to_string()]
        );
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let (engine, incident) = fixture().await;
        let summary = engine.summary(&incident.id).await.unwrap();
        assert_eq!(summary.record_count, 3);
        assert_eq!(summary.source_record_count, 2);
        assert_eq!(summary.blocked_calls, 2);
        assert_eq!(summary.total_cost_cents, 75);
        assert_eq!(summary.action_count, 5);
        assert_eq!(summary.models, vec!["gpt-4o".to_string()]);
    }

    #[tokio::test]
    async fn test_timeline_limit() {
        let (engine, incident) = fixture().await;
        let items = engine.timeline(&incident.id, Some(2)).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "a:input");
    }
}
