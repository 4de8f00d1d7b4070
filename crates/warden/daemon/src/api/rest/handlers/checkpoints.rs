//! Human checkpoint handlers

use super::{parse_checkpoint_id, parse_incident_id, parse_opt};
use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use warden_engine::{CheckpointQuery, LoopStats};
use warden_types::{CheckpointResolution, CheckpointType, HumanCheckpoint, TenantId};

/// Checkpoint list filters
#[derive(Debug, Default, Deserialize)]
pub struct ListCheckpointsQuery {
    pub tenant_id: Option<String>,
    pub incident_id: Option<String>,
    pub checkpoint_type: Option<String>,
    #[serde(default)]
    pub pending_only: bool,
    pub limit: Option<usize>,
}

/// Operator-raised checkpoint
#[derive(Debug, Deserialize)]
pub struct CreateCheckpointRequest {
    pub incident_id: String,
    pub checkpoint_type: CheckpointType,
    #[serde(default)]
    pub context: Value,
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveCheckpointRequest {
    pub resolution: CheckpointResolution,
    pub actor: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub tenant_id: Option<String>,
}

pub async fn list_checkpoints(
    State(state): State<AppState>,
    Query(query): Query<ListCheckpointsQuery>,
) -> ApiResult<Json<Vec<HumanCheckpoint>>> {
    let incident_id = query
        .incident_id
        .as_deref()
        .map(parse_incident_id)
        .transpose()?;
    let checkpoint_query = CheckpointQuery {
        tenant_id: query.tenant_id.map(TenantId::new),
        incident_id,
        checkpoint_type: parse_opt::<CheckpointType>(
            "checkpoint_type",
            query.checkpoint_type.as_deref(),
        )?,
        pending_only: query.pending_only,
        limit: query.limit,
    };
    let checkpoints = state.engine.loops().list_checkpoints(&checkpoint_query).await?;
    Ok(Json(checkpoints))
}

pub async fn get_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<HumanCheckpoint>> {
    let checkpoint_id = parse_checkpoint_id(&id)?;
    Ok(Json(state.engine.loops().get_checkpoint(&checkpoint_id).await?))
}

/// Raise a manual checkpoint; it never blocks the loop
pub async fn create_checkpoint(
    State(state): State<AppState>,
    Json(request): Json<CreateCheckpointRequest>,
) -> ApiResult<(StatusCode, Json<HumanCheckpoint>)> {
    let incident_id = parse_incident_id(&request.incident_id)?;
    let context = match request.context {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    let checkpoint = state
        .engine
        .loops()
        .create_checkpoint(&incident_id, request.checkpoint_type, context, &request.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(checkpoint)))
}

/// Resolve a checkpoint exactly once
pub async fn resolve_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveCheckpointRequest>,
) -> ApiResult<Json<HumanCheckpoint>> {
    let checkpoint_id = parse_checkpoint_id(&id)?;
    let checkpoint = state
        .engine
        .loops()
        .resolve_checkpoint(&checkpoint_id, request.resolution, &request.actor, request.notes)
        .await?;
    Ok(Json(checkpoint))
}

/// Loop counters, including the stalled checkpoint backlog
pub async fn loop_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<LoopStats>> {
    let tenant_id = query.tenant_id.map(TenantId::new);
    Ok(Json(state.engine.loops().stats(tenant_id.as_ref()).await?))
}
