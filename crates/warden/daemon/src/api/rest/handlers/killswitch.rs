//! Kill-switch handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use warden_engine::TenantFreezeStatus;
use warden_types::{AdmissionDecision, EntityRef, FreezeState, KeyId, TenantId};

/// Tenant-scoped query
#[derive(Debug, Deserialize)]
pub struct FreezeStatusQuery {
    pub tenant_id: String,
}

/// Admission check query
#[derive(Debug, Deserialize)]
pub struct AdmitQuery {
    pub tenant_id: String,
    #[serde(default)]
    pub key_id: Option<String>,
}

/// Freeze or unfreeze a tenant
#[derive(Debug, Deserialize)]
pub struct TenantFreezeRequest {
    pub tenant_id: String,
    pub reason: String,
    pub actor: String,
}

/// Freeze or unfreeze a key
#[derive(Debug, Deserialize)]
pub struct KeyFreezeRequest {
    pub tenant_id: String,
    pub key_id: String,
    pub reason: String,
    pub actor: String,
}

/// Stored and effective freeze state for a tenant
pub async fn freeze_status(
    State(state): State<AppState>,
    Query(query): Query<FreezeStatusQuery>,
) -> ApiResult<Json<TenantFreezeStatus>> {
    let status = state
        .engine
        .killswitch()
        .status(&TenantId::new(query.tenant_id))
        .await?;
    Ok(Json(status))
}

/// Call-admission check. A rejection is a normal 200 response carrying
/// `allowed = false` and a machine-readable reason.
pub async fn admit(
    State(state): State<AppState>,
    Query(query): Query<AdmitQuery>,
) -> ApiResult<Json<AdmissionDecision>> {
    if query.tenant_id.trim().is_empty() {
        return Err(ApiError::Validation("tenant_id must not be empty".to_string()));
    }
    let tenant_id = TenantId::new(query.tenant_id);
    let key_id = query
        .key_id
        .filter(|k| !k.trim().is_empty())
        .map(KeyId::new);

    let decision = state.engine.admit(&tenant_id, key_id.as_ref()).await;
    Ok(Json(decision))
}

pub async fn freeze_tenant(
    State(state): State<AppState>,
    Json(request): Json<TenantFreezeRequest>,
) -> ApiResult<Json<FreezeState>> {
    let entity = EntityRef::tenant(request.tenant_id.as_str());
    let frozen = state
        .engine
        .killswitch()
        .freeze(&entity, &request.reason, &request.actor)
        .await?;
    Ok(Json(frozen))
}

pub async fn unfreeze_tenant(
    State(state): State<AppState>,
    Json(request): Json<TenantFreezeRequest>,
) -> ApiResult<Json<FreezeState>> {
    let entity = EntityRef::tenant(request.tenant_id.as_str());
    let unfrozen = state
        .engine
        .killswitch()
        .unfreeze(&entity, &request.reason, &request.actor)
        .await?;
    Ok(Json(unfrozen))
}

pub async fn freeze_key(
    State(state): State<AppState>,
    Json(request): Json<KeyFreezeRequest>,
) -> ApiResult<Json<FreezeState>> {
    let entity = EntityRef::key(request.tenant_id.as_str(), request.key_id.as_str());
    let frozen = state
        .engine
        .killswitch()
        .freeze(&entity, &request.reason, &request.actor)
        .await?;
    Ok(Json(frozen))
}

pub async fn unfreeze_key(
    State(state): State<AppState>,
    Json(request): Json<KeyFreezeRequest>,
) -> ApiResult<Json<FreezeState>> {
    let entity = EntityRef::key(request.tenant_id.as_str(), request.key_id.as_str());
    let unfrozen = state
        .engine
        .killswitch()
        .unfreeze(&entity, &request.reason, &request.actor)
        .await?;
    Ok(Json(unfrozen))
}
