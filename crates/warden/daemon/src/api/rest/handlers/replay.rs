//! Replay handlers

use super::parse_incident_id;
use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use warden_engine::SliceParams;
use warden_types::{ReplayExplanation, ReplayItem, ReplaySliceResponse, ReplaySummary};

/// Slice query; `window` is in seconds
#[derive(Debug, Default, Deserialize)]
pub struct SliceQuery {
    pub window: Option<u64>,
    pub center_time: Option<DateTime<Utc>>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// Timeline query. A named `viewer` is recorded as a console view.
#[derive(Debug, Default, Deserialize)]
pub struct TimelineQuery {
    pub limit: Option<usize>,
    pub viewer: Option<String>,
}

pub async fn replay_slice(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SliceQuery>,
) -> ApiResult<Json<ReplaySliceResponse>> {
    let incident_id = parse_incident_id(&id)?;
    let params = SliceParams {
        window_seconds: query.window,
        center_time: query.center_time,
        page: query.page,
        page_size: query.page_size,
    };
    let slice = state.engine.replay().slice(&incident_id, params).await?;
    Ok(Json(slice))
}

pub async fn replay_timeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> ApiResult<Json<Vec<ReplayItem>>> {
    let incident_id = parse_incident_id(&id)?;
    let items = state
        .engine
        .view_timeline(&incident_id, query.limit, query.viewer.as_deref())
        .await?;
    Ok(Json(items))
}

pub async fn replay_explain(
    State(state): State<AppState>,
    Path((id, item_id)): Path<(String, String)>,
) -> ApiResult<Json<ReplayExplanation>> {
    let incident_id = parse_incident_id(&id)?;
    let explanation = state.engine.replay().explain(&incident_id, &item_id).await?;
    Ok(Json(explanation))
}

pub async fn replay_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReplaySummary>> {
    let incident_id = parse_incident_id(&id)?;
    let summary = state.engine.replay().summary(&incident_id).await?;
    Ok(Json(summary))
}
