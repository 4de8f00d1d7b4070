//! In-memory storage implementation

use super::model::{
    apply_page, CheckpointQuery, DecisionQuery, IncidentQuery, InsertOutcome, StoredDecision,
};
use super::traits::*;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use warden_types::{
    CheckpointId, CheckpointResolution, DecisionId, EntityRef, FreezeState, GraduationEvent,
    HumanCheckpoint, Incident, IncidentId, LoopInstance, TenantId,
};

/// In-memory storage for development and testing
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    decisions: Arc<RwLock<HashMap<DecisionId, StoredDecision>>>,
    incidents: Arc<RwLock<HashMap<IncidentId, Incident>>>,
    freezes: Arc<RwLock<HashMap<EntityRef, FreezeState>>>,
    loops: Arc<RwLock<HashMap<IncidentId, LoopInstance>>>,
    checkpoints: Arc<RwLock<HashMap<CheckpointId, HumanCheckpoint>>>,
    graduation: Arc<RwLock<Vec<GraduationEvent>>>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DecisionStore for InMemoryStorage {
    async fn insert_decision(&self, decision: StoredDecision) -> StorageResult<InsertOutcome> {
        let mut decisions = self.decisions.write().await;
        if let Some(existing) = decisions.get(&decision.record.id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        decisions.insert(decision.record.id.clone(), decision);
        Ok(InsertOutcome::Inserted)
    }

    async fn get_decision(&self, id: &DecisionId) -> StorageResult<Option<StoredDecision>> {
        let decisions = self.decisions.read().await;
        Ok(decisions.get(id).cloned())
    }

    async fn query_decisions(&self, query: &DecisionQuery) -> StorageResult<Vec<StoredDecision>> {
        let decisions = self.decisions.read().await;
        let mut matched: Vec<StoredDecision> = decisions
            .values()
            .filter(|d| query.matches(&d.record))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.record
                .timestamp
                .cmp(&b.record.timestamp)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        Ok(apply_page(matched, query.offset, query.limit))
    }
}

#[async_trait]
impl IncidentStore for InMemoryStorage {
    async fn insert_incident(&self, incident: Incident) -> StorageResult<()> {
        let mut incidents = self.incidents.write().await;
        if incidents.contains_key(&incident.id) {
            return Err(StorageError::Conflict(format!(
                "incident {} already exists",
                incident.id
            )));
        }
        incidents.insert(incident.id, incident);
        Ok(())
    }

    async fn save_incident(&self, incident: Incident) -> StorageResult<()> {
        let mut incidents = self.incidents.write().await;
        match incidents.get_mut(&incident.id) {
            Some(slot) => {
                *slot = incident;
                Ok(())
            }
            None => Err(StorageError::NotFound(incident.id.to_string())),
        }
    }

    async fn get_incident(&self, id: &IncidentId) -> StorageResult<Option<Incident>> {
        let incidents = self.incidents.read().await;
        Ok(incidents.get(id).cloned())
    }

    async fn list_incidents(&self, query: &IncidentQuery) -> StorageResult<Vec<Incident>> {
        let incidents = self.incidents.read().await;
        let mut matched: Vec<Incident> = incidents
            .values()
            .filter(|i| query.matches(i))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(apply_page(matched, query.offset, query.limit))
    }
}

#[async_trait]
impl FreezeStore for InMemoryStorage {
    async fn get_freeze(&self, entity: &EntityRef) -> StorageResult<Option<FreezeState>> {
        let freezes = self.freezes.read().await;
        Ok(freezes.get(entity).cloned())
    }

    async fn put_freeze(&self, state: FreezeState) -> StorageResult<()> {
        let mut freezes = self.freezes.write().await;
        freezes.insert(state.entity(), state);
        Ok(())
    }

    async fn list_freezes(&self, tenant_id: &TenantId) -> StorageResult<Vec<FreezeState>> {
        let freezes = self.freezes.read().await;
        let mut states: Vec<FreezeState> = freezes
            .values()
            .filter(|s| &s.tenant_id == tenant_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| {
            a.entity_type
                .as_str()
                .cmp(b.entity_type.as_str())
                .reverse()
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        Ok(states)
    }
}

#[async_trait]
impl LoopStore for InMemoryStorage {
    async fn get_loop(&self, incident_id: &IncidentId) -> StorageResult<Option<LoopInstance>> {
        let loops = self.loops.read().await;
        Ok(loops.get(incident_id).cloned())
    }

    async fn save_loop(
        &self,
        instance: LoopInstance,
        expected_version: Option<u64>,
    ) -> StorageResult<()> {
        let mut loops = self.loops.write().await;
        let stored_version = loops.get(&instance.incident_id).map(|l| l.version);
        if stored_version != expected_version {
            return Err(StorageError::Conflict(format!(
                "loop {} version mismatch: expected {:?}, found {:?}",
                instance.incident_id, expected_version, stored_version
            )));
        }
        loops.insert(instance.incident_id, instance);
        Ok(())
    }

    async fn list_loops(&self, tenant_id: Option<&TenantId>) -> StorageResult<Vec<LoopInstance>> {
        let loops = self.loops.read().await;
        let mut matched: Vec<LoopInstance> = loops
            .values()
            .filter(|l| tenant_id.map_or(true, |t| &l.tenant_id == t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStorage {
    async fn insert_checkpoint(&self, checkpoint: HumanCheckpoint) -> StorageResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        if checkpoints.contains_key(&checkpoint.id) {
            return Err(StorageError::Conflict(format!(
                "checkpoint {} already exists",
                checkpoint.id
            )));
        }
        checkpoints.insert(checkpoint.id, checkpoint);
        Ok(())
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> StorageResult<Option<HumanCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(id).cloned())
    }

    async fn resolve_checkpoint(
        &self,
        id: &CheckpointId,
        resolution: CheckpointResolution,
        resolved_by: &str,
        notes: Option<String>,
    ) -> StorageResult<HumanCheckpoint> {
        let mut checkpoints = self.checkpoints.write().await;
        let checkpoint = checkpoints
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if !checkpoint.is_pending() {
            return Err(StorageError::Conflict(format!(
                "checkpoint {} already resolved",
                id
            )));
        }
        checkpoint.resolution = Some(resolution);
        checkpoint.resolved_by = Some(resolved_by.to_string());
        checkpoint.resolved_at = Some(Utc::now());
        checkpoint.notes = notes;
        Ok(checkpoint.clone())
    }

    async fn list_checkpoints(
        &self,
        query: &CheckpointQuery,
    ) -> StorageResult<Vec<HumanCheckpoint>> {
        let checkpoints = self.checkpoints.read().await;
        let mut matched: Vec<HumanCheckpoint> = checkpoints
            .values()
            .filter(|c| query.tenant_id.as_ref().map_or(true, |t| &c.tenant_id == t))
            .filter(|c| query.incident_id.map_or(true, |id| c.incident_id == id))
            .filter(|c| query.checkpoint_type.map_or(true, |t| c.checkpoint_type == t))
            .filter(|c| !query.pending_only || c.is_pending())
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apply_page(matched, 0, query.limit))
    }
}

#[async_trait]
impl GraduationStore for InMemoryStorage {
    async fn append_graduation_event(&self, event: GraduationEvent) -> StorageResult<()> {
        self.graduation.write().await.push(event);
        Ok(())
    }

    async fn list_graduation_events(&self) -> StorageResult<Vec<GraduationEvent>> {
        Ok(self.graduation.read().await.clone())
    }
}
