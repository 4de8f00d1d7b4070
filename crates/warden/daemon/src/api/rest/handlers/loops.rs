//! Integration loop handlers and the live loop stream

use super::parse_incident_id;
use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use warden_engine::{LoopSubscription, RegretOutcome};
use warden_types::{LoopEventEnvelope, LoopInstance, LoopNarrative, LoopStage, StageStatus};

/// Retry request
#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub stage: LoopStage,
    pub actor: String,
}

/// Revert request. With `abandon` the loop becomes terminal after unwinding.
#[derive(Debug, Deserialize)]
pub struct RevertRequest {
    pub to_stage: LoopStage,
    pub actor: String,
    #[serde(default)]
    pub abandon: bool,
}

/// Regret report on what automation did for an incident
#[derive(Debug, Deserialize)]
pub struct RegretRequest {
    pub reason: String,
    pub actor: String,
}

pub async fn get_loop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LoopInstance>> {
    let incident_id = parse_incident_id(&id)?;
    Ok(Json(state.engine.loops().get(&incident_id).await?))
}

pub async fn get_loop_stages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BTreeMap<LoopStage, StageStatus>>> {
    let incident_id = parse_incident_id(&id)?;
    Ok(Json(state.engine.loops().stages(&incident_id).await?))
}

pub async fn get_loop_narrative(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LoopNarrative>> {
    let incident_id = parse_incident_id(&id)?;
    Ok(Json(state.engine.loops().narrative(&incident_id).await?))
}

/// Re-invoke the handler of the stage the loop is blocked on
pub async fn retry_loop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RetryRequest>,
) -> ApiResult<Json<LoopInstance>> {
    let incident_id = parse_incident_id(&id)?;
    let instance = state
        .engine
        .loops()
        .retry(&incident_id, request.stage, &request.actor)
        .await?;
    Ok(Json(instance))
}

pub async fn revert_loop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RevertRequest>,
) -> ApiResult<Json<LoopInstance>> {
    let incident_id = parse_incident_id(&id)?;
    let instance = state
        .engine
        .loops()
        .revert(&incident_id, request.to_stage, &request.actor, request.abandon)
        .await?;
    Ok(Json(instance))
}

/// Report a regret; the engine abandons the loop and unwinds its
/// committed policy and routing changes
pub async fn report_regret(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RegretRequest>,
) -> ApiResult<Json<RegretOutcome>> {
    let incident_id = parse_incident_id(&id)?;
    let outcome = state
        .engine
        .record_regret(&incident_id, &request.reason, &request.actor)
        .await?;
    Ok(Json(outcome))
}

/// Stream loop events via SSE: the current snapshot first, then one event
/// per change. The SSE event name is the loop event kind.
pub async fn stream_loop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let incident_id = parse_incident_id(&id)?;
    let LoopSubscription { snapshot, receiver } =
        state.engine.loops().subscribe(&incident_id).await?;

    let snapshot = stream::once(async move { Ok::<_, Infallible>(to_sse_event(&snapshot)) });
    let updates = stream::unfold(receiver, |mut rx| async move {
        match rx.recv().await {
            Ok(envelope) => Some((Ok(to_sse_event(&envelope)), rx)),
            Err(RecvError::Lagged(skipped)) => {
                // Client fell behind; it can re-sync from GET /loop/:id
                let comment = format!("lagged {}", skipped);
                Some((Ok(Event::default().comment(comment)), rx))
            }
            Err(RecvError::Closed) => None,
        }
    });

    Ok(Sse::new(snapshot.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn to_sse_event(envelope: &LoopEventEnvelope) -> Event {
    let json = serde_json::to_string(envelope).unwrap_or_default();
    Event::default()
        .event(envelope.kind())
        .id(envelope.id.to_string())
        .data(json)
}
