//! Storage trait definitions

use super::model::{
    CheckpointQuery, DecisionQuery, IncidentQuery, InsertOutcome, StoredDecision,
};
use crate::error::StorageResult;
use async_trait::async_trait;
use warden_types::{
    CheckpointId, CheckpointResolution, DecisionId, EntityRef, FreezeState, GraduationEvent,
    HumanCheckpoint, Incident, IncidentId, LoopInstance, TenantId,
};

/// Combined storage trait
pub trait GovernanceStorage:
    DecisionStore
    + IncidentStore
    + FreezeStore
    + LoopStore
    + CheckpointStore
    + GraduationStore
    + Send
    + Sync
{
}

impl<T> GovernanceStorage for T where
    T: DecisionStore
        + IncidentStore
        + FreezeStore
        + LoopStore
        + CheckpointStore
        + GraduationStore
        + Send
        + Sync
{
}

/// Append-only decision ledger.
///
/// Implementations never expose update or delete. Rows are write-once.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Insert if no row with the same id exists. Must be atomic with respect
    /// to concurrent inserts of the same id.
    async fn insert_decision(&self, decision: StoredDecision) -> StorageResult<InsertOutcome>;

    async fn get_decision(&self, id: &DecisionId) -> StorageResult<Option<StoredDecision>>;

    /// Records ordered by timestamp ascending, then id
    async fn query_decisions(&self, query: &DecisionQuery) -> StorageResult<Vec<StoredDecision>>;
}

/// Incident storage
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Fails with `Conflict` if the id is taken
    async fn insert_incident(&self, incident: Incident) -> StorageResult<()>;

    /// Replace an existing incident. Fails with `NotFound` if absent.
    async fn save_incident(&self, incident: Incident) -> StorageResult<()>;

    async fn get_incident(&self, id: &IncidentId) -> StorageResult<Option<Incident>>;

    /// Incidents ordered newest `started_at` first
    async fn list_incidents(&self, query: &IncidentQuery) -> StorageResult<Vec<Incident>>;
}

/// Kill-switch state storage
#[async_trait]
pub trait FreezeStore: Send + Sync {
    /// `None` means the entity has never been frozen
    async fn get_freeze(&self, entity: &EntityRef) -> StorageResult<Option<FreezeState>>;

    async fn put_freeze(&self, state: FreezeState) -> StorageResult<()>;

    /// All stored states for a tenant, including its keys
    async fn list_freezes(&self, tenant_id: &TenantId) -> StorageResult<Vec<FreezeState>>;
}

/// Integration loop storage
#[async_trait]
pub trait LoopStore: Send + Sync {
    async fn get_loop(&self, incident_id: &IncidentId) -> StorageResult<Option<LoopInstance>>;

    /// Optimistic write. `expected_version` is the version the caller read
    /// (`None` for a new loop); the stored version must match or the write
    /// fails with `Conflict`. The caller bumps `instance.version`.
    async fn save_loop(
        &self,
        instance: LoopInstance,
        expected_version: Option<u64>,
    ) -> StorageResult<()>;

    async fn list_loops(&self, tenant_id: Option<&TenantId>) -> StorageResult<Vec<LoopInstance>>;
}

/// Human checkpoint storage
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn insert_checkpoint(&self, checkpoint: HumanCheckpoint) -> StorageResult<()>;

    async fn get_checkpoint(&self, id: &CheckpointId) -> StorageResult<Option<HumanCheckpoint>>;

    /// Atomically resolve a pending checkpoint. A second resolution fails
    /// with `Conflict` and leaves the first one untouched.
    async fn resolve_checkpoint(
        &self,
        id: &CheckpointId,
        resolution: CheckpointResolution,
        resolved_by: &str,
        notes: Option<String>,
    ) -> StorageResult<HumanCheckpoint>;

    /// Checkpoints ordered by creation time
    async fn list_checkpoints(&self, query: &CheckpointQuery)
        -> StorageResult<Vec<HumanCheckpoint>>;
}

/// Graduation evidence. Append-only; gates are rebuilt from it on start.
#[async_trait]
pub trait GraduationStore: Send + Sync {
    async fn append_graduation_event(&self, event: GraduationEvent) -> StorageResult<()>;

    /// Every event in append order
    async fn list_graduation_events(&self) -> StorageResult<Vec<GraduationEvent>>;
}
