//! Graduation gate handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use warden_engine::SimulationKind;
use warden_types::GraduationStatus;

#[derive(Debug, Deserialize)]
pub struct SimulateRequest {
    pub actor: String,
}

pub async fn graduation_status(State(state): State<AppState>) -> ApiResult<Json<GraduationStatus>> {
    Ok(Json(state.engine.graduation().status().await?))
}

/// Fast-track gate evidence. Refused unless simulation is enabled.
pub async fn simulate_graduation(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(request): Json<SimulateRequest>,
) -> ApiResult<Json<GraduationStatus>> {
    if !state.engine.config().graduation.allow_simulation {
        return Err(ApiError::Forbidden(
            "graduation simulation is disabled".to_string(),
        ));
    }
    let kind: SimulationKind = kind.parse().map_err(ApiError::BadRequest)?;

    tracing::warn!(kind = ?kind, actor = %request.actor, "Simulated graduation evidence");
    let status = state
        .engine
        .graduation()
        .simulate(kind, &request.actor)
        .await?;
    Ok(Json(status))
}
