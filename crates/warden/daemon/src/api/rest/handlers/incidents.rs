//! Incident handlers

use super::{parse_incident_id, parse_opt};
use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use warden_engine::{IncidentMetrics, IncidentQuery};
use warden_types::{Incident, IncidentLifecycle, IncidentStatus, Severity, TenantId};

/// Incident list filters. `status` takes a comma-separated list.
#[derive(Debug, Default, Deserialize)]
pub struct ListIncidentsQuery {
    pub tenant_id: Option<String>,
    pub status: Option<String>,
    pub lifecycle: Option<String>,
    pub severity: Option<String>,
    pub trigger_type: Option<String>,
    pub run_id: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ListIncidentsQuery {
    fn into_query(self) -> ApiResult<IncidentQuery> {
        let statuses = self
            .status
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<IncidentStatus>()
                            .map_err(|e| ApiError::BadRequest(format!("status: {}", e)))
                    })
                    .collect::<ApiResult<Vec<_>>>()
            })
            .transpose()?;

        Ok(IncidentQuery {
            tenant_id: self.tenant_id.map(TenantId::new),
            statuses,
            lifecycle: parse_opt::<IncidentLifecycle>("lifecycle", self.lifecycle.as_deref())?,
            severity: parse_opt::<Severity>("severity", self.severity.as_deref())?,
            trigger_type: self.trigger_type,
            run_id: self.run_id,
            started_after: self.started_after,
            started_before: self.started_before,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// Tenant scope for aggregate views
#[derive(Debug, Default, Deserialize)]
pub struct TenantScopeQuery {
    pub tenant_id: Option<String>,
}

/// Operator action on an incident
#[derive(Debug, Deserialize)]
pub struct IncidentActionRequest {
    pub actor: String,
    #[serde(default)]
    pub note: Option<String>,
}

/// List incidents
pub async fn list_incidents(
    State(state): State<AppState>,
    Query(query): Query<ListIncidentsQuery>,
) -> ApiResult<Json<Vec<Incident>>> {
    let query = query.into_query()?;
    let incidents = state.engine.incidents().list(&query).await?;
    Ok(Json(incidents))
}

/// Get a specific incident
pub async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Incident>> {
    let incident_id = parse_incident_id(&id)?;
    let incident = state.engine.incidents().get(&incident_id).await?;
    Ok(Json(incident))
}

/// Incidents containing records from one run
pub async fn incidents_by_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(scope): Query<TenantScopeQuery>,
) -> ApiResult<Json<Vec<Incident>>> {
    let incidents = state
        .engine
        .incidents()
        .by_run(scope.tenant_id.map(TenantId::new), &run_id)
        .await?;
    Ok(Json(incidents))
}

/// Counts by lifecycle, severity and trigger
pub async fn incident_metrics(
    State(state): State<AppState>,
    Query(scope): Query<TenantScopeQuery>,
) -> ApiResult<Json<IncidentMetrics>> {
    let metrics = state
        .engine
        .incidents()
        .metrics(scope.tenant_id.map(TenantId::new))
        .await?;
    Ok(Json(metrics))
}

/// Acknowledge an incident
pub async fn acknowledge_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<IncidentActionRequest>,
) -> ApiResult<Json<Incident>> {
    let incident_id = parse_incident_id(&id)?;
    let incident = state
        .engine
        .incidents()
        .acknowledge(&incident_id, &request.actor, request.note)
        .await?;
    Ok(Json(incident))
}

/// Resolve an incident
pub async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<IncidentActionRequest>,
) -> ApiResult<Json<Incident>> {
    let incident_id = parse_incident_id(&id)?;
    let incident = state
        .engine
        .incidents()
        .resolve(&incident_id, &request.actor, request.note)
        .await?;
    Ok(Json(incident))
}
