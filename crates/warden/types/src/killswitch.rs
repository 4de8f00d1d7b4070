//! Kill-switch state types

use crate::ids::{KeyId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of entity that can be frozen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Tenant,
    Key,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Tenant => "tenant",
            EntityType::Key => "key",
        }
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant" => Ok(EntityType::Tenant),
            "key" => Ok(EntityType::Key),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// A freezable entity. Keys are always scoped to their tenant so the
/// cascade can be computed without a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "lowercase")]
pub enum EntityRef {
    Tenant { tenant_id: TenantId },
    Key { tenant_id: TenantId, key_id: KeyId },
}

impl EntityRef {
    pub fn tenant(tenant_id: impl Into<TenantId>) -> Self {
        EntityRef::Tenant {
            tenant_id: tenant_id.into(),
        }
    }

    pub fn key(tenant_id: impl Into<TenantId>, key_id: impl Into<KeyId>) -> Self {
        EntityRef::Key {
            tenant_id: tenant_id.into(),
            key_id: key_id.into(),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityRef::Tenant { .. } => EntityType::Tenant,
            EntityRef::Key { .. } => EntityType::Key,
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            EntityRef::Tenant { tenant_id } | EntityRef::Key { tenant_id, .. } => tenant_id,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            EntityRef::Tenant { tenant_id } => tenant_id.as_str(),
            EntityRef::Key { key_id, .. } => key_id.as_str(),
        }
    }

    /// The owning tenant entity, if this is a key
    pub fn parent(&self) -> Option<EntityRef> {
        match self {
            EntityRef::Tenant { .. } => None,
            EntityRef::Key { tenant_id, .. } => Some(EntityRef::Tenant {
                tenant_id: tenant_id.clone(),
            }),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Tenant { tenant_id } => write!(f, "tenant:{}", tenant_id),
            EntityRef::Key { tenant_id, key_id } => write!(f, "key:{}/{}", tenant_id, key_id),
        }
    }
}

/// Stored freeze state of one entity. Never holds a derived "effective"
/// flag: a key's effective state is computed from its own and its tenant's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeState {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub tenant_id: TenantId,
    pub is_frozen: bool,
    pub frozen_at: Option<DateTime<Utc>>,
    pub frozen_by: Option<String>,
    /// Why the entity was last frozen. Survives the unfreeze.
    pub reason: Option<String>,
    pub auto_triggered: bool,
    pub trigger_type: Option<String>,
    pub unfrozen_at: Option<DateTime<Utc>>,
    pub unfrozen_by: Option<String>,
    #[serde(default)]
    pub unfreeze_reason: Option<String>,
}

impl FreezeState {
    /// Lazily created default state
    pub fn unfrozen(entity: &EntityRef) -> Self {
        Self {
            entity_type: entity.entity_type(),
            entity_id: entity.entity_id().to_string(),
            tenant_id: entity.tenant_id().clone(),
            is_frozen: false,
            frozen_at: None,
            frozen_by: None,
            reason: None,
            auto_triggered: false,
            trigger_type: None,
            unfrozen_at: None,
            unfrozen_by: None,
            unfreeze_reason: None,
        }
    }

    pub fn entity(&self) -> EntityRef {
        match self.entity_type {
            EntityType::Tenant => EntityRef::tenant(self.tenant_id.clone()),
            EntityType::Key => EntityRef::key(self.tenant_id.clone(), self.entity_id.as_str()),
        }
    }
}

/// Machine-readable reason for rejecting a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    TenantFrozen,
    KeyFrozen,
    /// The kill-switch store could not be consulted; rejected fail-closed
    StateUnavailable,
}

/// Result of a call-admission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<RejectionReason>,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            detail: None,
            checked_at: Utc::now(),
        }
    }

    pub fn reject(reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            detail: Some(detail.into()),
            checked_at: Utc::now(),
        }
    }
}
