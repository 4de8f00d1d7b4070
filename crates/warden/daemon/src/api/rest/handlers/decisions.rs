//! Decision ledger handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use warden_engine::{DecisionOutcome, DecisionQuery};
use warden_types::{DecisionId, DecisionRecord};

/// Append a decision and run it through the governance pipeline.
///
/// Returns 201 for a new record and 200 for an identical re-append.
pub async fn record_decision(
    State(state): State<AppState>,
    Json(record): Json<DecisionRecord>,
) -> ApiResult<(StatusCode, Json<DecisionOutcome>)> {
    let outcome = state.engine.record_decision(record).await?;

    let status = if outcome.append.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    if let Some(incident) = &outcome.incident {
        tracing::debug!(
            decision_id = %outcome.append.id,
            incident_id = %incident.id,
            aggregation = ?outcome.aggregation,
            "Decision recorded with incident"
        );
    }

    Ok((status, Json(outcome)))
}

/// Query the ledger
pub async fn list_decisions(
    State(state): State<AppState>,
    Query(query): Query<DecisionQuery>,
) -> ApiResult<Json<Vec<DecisionRecord>>> {
    let records = state.engine.ledger().query(&query).await?;
    Ok(Json(records))
}

/// Get a single decision record
pub async fn get_decision(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DecisionRecord>> {
    let record = state.engine.ledger().get(&DecisionId::new(id)).await?;
    Ok(Json(record))
}
