//! Kill-switch controller
//!
//! Tenant and key freeze states are stored independently. A key's effective
//! state is computed on every read as `key.is_frozen || tenant.is_frozen`;
//! nothing denormalized is ever written to the key.
//!
//! Reads fail closed: if the store cannot be consulted the entity is
//! reported frozen and the failure is logged at error level.

use crate::config::KillSwitchConfig;
use crate::error::{require_actor, GovernanceError, GovernanceResult, StorageResult};
use crate::locks::KeyedLocks;
use crate::storage::FreezeStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use warden_types::{
    AdmissionDecision, EntityRef, EntityType, FreezeState, Incident, KeyId, RejectionReason,
    Severity, TenantId,
};

/// Actor recorded on freezes raised by incident severity
pub const AUTO_FREEZE_ACTOR: &str = "system:auto-freeze";

/// A key's stored state plus its computed effective state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFreezeView {
    pub state: FreezeState,
    pub effective_frozen: bool,
}

/// Freeze status of a tenant and every key with stored state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantFreezeStatus {
    pub tenant_id: TenantId,
    pub tenant: FreezeState,
    pub keys: Vec<KeyFreezeView>,
}

/// Cascading freeze controller
pub struct KillSwitch {
    store: Arc<dyn FreezeStore>,
    config: KillSwitchConfig,
    entity_locks: KeyedLocks<EntityRef>,
}

impl KillSwitch {
    pub fn new(store: Arc<dyn FreezeStore>, config: KillSwitchConfig) -> Self {
        Self {
            store,
            config,
            entity_locks: KeyedLocks::default(),
        }
    }

    /// Freeze an entity. Takes effect for the next admission check.
    ///
    /// Freezing an already-frozen entity returns the existing state.
    pub async fn freeze(
        &self,
        entity: &EntityRef,
        reason: &str,
        actor: &str,
    ) -> GovernanceResult<FreezeState> {
        validate_entity(entity)?;
        require_actor(actor)?;
        self.write_freeze(entity, reason, actor, None).await
    }

    /// Freeze raised by the engine in response to an incident
    pub async fn auto_freeze(
        &self,
        entity: &EntityRef,
        incident: &Incident,
    ) -> GovernanceResult<FreezeState> {
        validate_entity(entity)?;
        let reason = format!(
            "{} incident {} ({})",
            incident.severity, incident.id, incident.trigger_type
        );
        self.write_freeze(
            entity,
            &reason,
            AUTO_FREEZE_ACTOR,
            Some(incident.trigger_type.clone()),
        )
        .await
    }

    async fn write_freeze(
        &self,
        entity: &EntityRef,
        reason: &str,
        actor: &str,
        trigger_type: Option<String>,
    ) -> GovernanceResult<FreezeState> {
        let _guard = self.entity_locks.lock(entity.clone()).await;

        let current = self
            .store
            .get_freeze(entity)
            .await?
            .unwrap_or_else(|| FreezeState::unfrozen(entity));
        if current.is_frozen {
            return Ok(current);
        }

        let state = FreezeState {
            is_frozen: true,
            frozen_at: Some(Utc::now()),
            frozen_by: Some(actor.to_string()),
            reason: Some(reason.to_string()),
            auto_triggered: trigger_type.is_some(),
            trigger_type,
            ..current
        };
        self.store.put_freeze(state.clone()).await?;

        warn!(
            entity = %entity,
            actor = %actor,
            auto_triggered = state.auto_triggered,
            reason = %reason,
            "Entity frozen"
        );
        Ok(state)
    }

    /// Lift a freeze. Always operator-driven; the engine never unfreezes.
    pub async fn unfreeze(
        &self,
        entity: &EntityRef,
        reason: &str,
        actor: &str,
    ) -> GovernanceResult<FreezeState> {
        validate_entity(entity)?;
        require_actor(actor)?;

        let _guard = self.entity_locks.lock(entity.clone()).await;

        let current = self
            .store
            .get_freeze(entity)
            .await?
            .unwrap_or_else(|| FreezeState::unfrozen(entity));
        if !current.is_frozen {
            return Ok(current);
        }

        let state = FreezeState {
            is_frozen: false,
            unfrozen_at: Some(Utc::now()),
            unfrozen_by: Some(actor.to_string()),
            unfreeze_reason: Some(reason.to_string()),
            ..current
        };
        self.store.put_freeze(state.clone()).await?;

        info!(entity = %entity, actor = %actor, reason = %reason, "Entity unfrozen");
        Ok(state)
    }

    /// Effective frozen state. Fails closed.
    pub async fn is_frozen(&self, entity: &EntityRef) -> bool {
        match self.check(entity).await {
            Ok(frozen) => frozen.is_some(),
            Err(err) => {
                error!(entity = %entity, error = %err, "Kill-switch state unavailable; failing closed");
                true
            }
        }
    }

    /// Like [`is_frozen`](Self::is_frozen) but surfaces the store failure
    pub async fn try_is_frozen(&self, entity: &EntityRef) -> GovernanceResult<bool> {
        match self.check(entity).await {
            Ok(frozen) => Ok(frozen.is_some()),
            Err(err) => {
                error!(entity = %entity, error = %err, "Kill-switch state unavailable; failing closed");
                Err(GovernanceError::FailClosed(err.to_string()))
            }
        }
    }

    /// Which level is frozen, if any. The tenant wins over its key.
    async fn check(&self, entity: &EntityRef) -> StorageResult<Option<RejectionReason>> {
        let tenant = EntityRef::tenant(entity.tenant_id().clone());
        if self.stored_frozen(&tenant).await? {
            return Ok(Some(RejectionReason::TenantFrozen));
        }
        if entity.entity_type() == EntityType::Key && self.stored_frozen(entity).await? {
            return Ok(Some(RejectionReason::KeyFrozen));
        }
        Ok(None)
    }

    async fn stored_frozen(&self, entity: &EntityRef) -> StorageResult<bool> {
        Ok(self
            .store
            .get_freeze(entity)
            .await?
            .map_or(false, |s| s.is_frozen))
    }

    /// Call-admission check with a machine-readable rejection reason
    pub async fn admit(&self, tenant_id: &TenantId, key_id: Option<&KeyId>) -> AdmissionDecision {
        let entity = match key_id {
            Some(key) => EntityRef::key(tenant_id.clone(), key.clone()),
            None => EntityRef::tenant(tenant_id.clone()),
        };

        match self.check(&entity).await {
            Ok(None) => AdmissionDecision::allow(),
            Ok(Some(reason)) => {
                AdmissionDecision::reject(reason, format!("{} is frozen", frozen_level(&entity, reason)))
            }
            Err(err) => {
                error!(entity = %entity, error = %err, "Kill-switch state unavailable; rejecting call");
                AdmissionDecision::reject(
                    RejectionReason::StateUnavailable,
                    format!("kill-switch state unavailable: {}", err),
                )
            }
        }
    }

    /// Stored tenant state plus every key of the tenant with stored state
    pub async fn status(&self, tenant_id: &TenantId) -> GovernanceResult<TenantFreezeStatus> {
        if tenant_id.as_str().trim().is_empty() {
            return Err(GovernanceError::validation("tenant_id must not be empty"));
        }
        let states = self.store.list_freezes(tenant_id).await?;

        let tenant_entity = EntityRef::tenant(tenant_id.clone());
        let tenant = states
            .iter()
            .find(|s| s.entity_type == EntityType::Tenant)
            .cloned()
            .unwrap_or_else(|| FreezeState::unfrozen(&tenant_entity));

        let keys = states
            .into_iter()
            .filter(|s| s.entity_type == EntityType::Key)
            .map(|state| KeyFreezeView {
                effective_frozen: state.is_frozen || tenant.is_frozen,
                state,
            })
            .collect();

        Ok(TenantFreezeStatus {
            tenant_id: tenant_id.clone(),
            tenant,
            keys,
        })
    }

    /// Entity to freeze for an incident, if its severity qualifies: the single
    /// key responsible, or the whole tenant when several keys (or none) contributed.
    pub fn auto_freeze_target(&self, incident: &Incident) -> Option<EntityRef> {
        if !self.config.auto_freeze_enabled || !qualifies(incident.severity, &self.config) {
            return None;
        }
        match incident.key_ids.as_slice() {
            [key] => Some(EntityRef::key(incident.tenant_id.clone(), key.clone())),
            _ => Some(EntityRef::tenant(incident.tenant_id.clone())),
        }
    }
}

fn qualifies(severity: Severity, config: &KillSwitchConfig) -> bool {
    severity >= config.auto_freeze_min_severity
}

fn frozen_level(entity: &EntityRef, reason: RejectionReason) -> String {
    match reason {
        RejectionReason::TenantFrozen => format!("tenant {}", entity.tenant_id()),
        _ => entity.to_string(),
    }
}

fn validate_entity(entity: &EntityRef) -> GovernanceResult<()> {
    if entity.tenant_id().as_str().trim().is_empty() || entity.entity_id().trim().is_empty() {
        return Err(GovernanceError::validation(format!(
            "invalid {} entity: ids must not be empty",
            entity.entity_type().as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;

    fn killswitch() -> KillSwitch {
        KillSwitch::new(Arc::new(InMemoryStorage::new()), KillSwitchConfig::default())
    }

    struct UnreachableStore;

    #[async_trait]
    impl FreezeStore for UnreachableStore {
        async fn get_freeze(&self, _entity: &EntityRef) -> StorageResult<Option<FreezeState>> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        async fn put_freeze(&self, _state: FreezeState) -> StorageResult<()> {
            Err(StorageError::Unavailable("connection refused".into()))
        }

        async fn list_freezes(&self, _tenant_id: &TenantId) -> StorageResult<Vec<FreezeState>> {
            Err(StorageError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_tenant_freeze_cascades_to_keys() {
        let ks = killswitch();
        ks.freeze(&EntityRef::tenant("t1"), "abuse", "alice")
            .await
            .unwrap();

        assert!(ks.is_frozen(&EntityRef::key("t1", "k1")).await);
        assert!(ks.is_frozen(&EntityRef::key("t1", "k2")).await);
        assert!(!ks.is_frozen(&EntityRef::key("t2", "k1")).await);

        ks.unfreeze(&EntityRef::tenant("t1"), "resolved", "alice")
            .await
            .unwrap();
        assert!(!ks.is_frozen(&EntityRef::key("t1", "k1")).await);
    }

    #[tokio::test]
    async fn test_unfreeze_keeps_freeze_reason() {
        let ks = killswitch();
        let entity = EntityRef::key("t1", "k1");
        ks.freeze(&entity, "leaked in ci logs", "alice").await.unwrap();

        let state = ks.unfreeze(&entity, "key rotated", "bob").await.unwrap();
        assert!(!state.is_frozen);
        assert_eq!(state.reason.as_deref(), Some("leaked in ci logs"));
        assert_eq!(state.frozen_by.as_deref(), Some("alice"));
        assert_eq!(state.unfreeze_reason.as_deref(), Some("key rotated"));
        assert_eq!(state.unfrozen_by.as_deref(), Some("bob"));

        let status = ks.status(&TenantId::new("t1")).await.unwrap();
        assert_eq!(status.keys[0].state.reason.as_deref(), Some("leaked in ci logs"));
    }

    #[tokio::test]
    async fn test_key_freeze_does_not_freeze_tenant() {
        let ks = killswitch();
        ks.freeze(&EntityRef::key("t1", "k1"), "leak", "alice")
            .await
            .unwrap();

        assert!(!ks.is_frozen(&EntityRef::tenant("t1")).await);
        assert!(ks.is_frozen(&EntityRef::key("t1", "k1")).await);
        assert!(!ks.is_frozen(&EntityRef::key("t1", "k2")).await);
    }

    #[tokio::test]
    async fn test_unfreeze_requires_actor() {
        let ks = killswitch();
        let entity = EntityRef::tenant("t1");
        ks.freeze(&entity, "abuse", "alice").await.unwrap();
        assert!(matches!(
            ks.unfreeze(&entity, "done", " ").await,
            Err(GovernanceError::Validation(_))
        ));
        assert!(ks.is_frozen(&entity).await);
    }

    #[tokio::test]
    async fn test_freeze_is_idempotent() {
        let ks = killswitch();
        let entity = EntityRef::tenant("t1");
        let first = ks.freeze(&entity, "abuse", "alice").await.unwrap();
        let second = ks.freeze(&entity, "again", "bob").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_closed() {
        let ks = KillSwitch::new(Arc::new(UnreachableStore), KillSwitchConfig::default());
        let entity = EntityRef::key("t1", "k1");

        assert!(ks.is_frozen(&entity).await);
        assert!(matches!(
            ks.try_is_frozen(&entity).await,
            Err(GovernanceError::FailClosed(_))
        ));

        let decision = ks
            .admit(&TenantId::new("t1"), Some(&KeyId::new("k1")))
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some(RejectionReason::StateUnavailable));
    }

    #[tokio::test]
    async fn test_admit_reports_reason() {
        let ks = killswitch();
        let tenant = TenantId::new("t1");
        let key = KeyId::new("k1");
        assert!(ks.admit(&tenant, Some(&key)).await.allowed);

        ks.freeze(&EntityRef::key("t1", "k1"), "leak", "alice")
            .await
            .unwrap();
        let decision = ks.admit(&tenant, Some(&key)).await;
        assert_eq!(decision.reason, Some(RejectionReason::KeyFrozen));

        ks.freeze(&EntityRef::tenant("t1"), "abuse", "alice")
            .await
            .unwrap();
        let decision = ks.admit(&tenant, Some(&key)).await;
        assert_eq!(decision.reason, Some(RejectionReason::TenantFrozen));
    }

    #[tokio::test]
    async fn test_status_computes_effective_state() {
        let ks = killswitch();
        ks.freeze(&EntityRef::key("t1", "k1"), "leak", "alice")
            .await
            .unwrap();
        ks.freeze(&EntityRef::key("t1", "k2"), "leak", "alice")
            .await
            .unwrap();
        ks.unfreeze(&EntityRef::key("t1", "k2"), "fixed", "alice")
            .await
            .unwrap();

        let status = ks.status(&TenantId::new("t1")).await.unwrap();
        assert!(!status.tenant.is_frozen);
        assert_eq!(status.keys.len(), 2);
        let k2 = status
            .keys
            .iter()
            .find(|k| k.state.entity_id == "k2")
            .unwrap();
        assert!(!k2.effective_frozen);

        ks.freeze(&EntityRef::tenant("t1"), "abuse", "alice")
            .await
            .unwrap();
        let status = ks.status(&TenantId::new("t1")).await.unwrap();
        assert!(status.keys.iter().all(|k| k.effective_frozen));
        assert!(status.keys.iter().any(|k| !k.state.is_frozen));
    }
}
