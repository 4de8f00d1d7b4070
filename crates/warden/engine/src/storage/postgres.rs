//! PostgreSQL storage implementation
//!
//! Tenant-owned rows carry `tenant_id`. The decision ledger table is guarded by a
//! trigger that rejects UPDATE and DELETE, so write-once holds even for
//! clients that bypass this crate.
//!
//! List queries filter and page in SQL. Filters on fields that only live in
//! the JSONB `data` column compare against their serde string form.

use super::model::{CheckpointQuery, DecisionQuery, IncidentQuery, InsertOutcome, StoredDecision};
use super::traits::*;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;
use warden_types::{
    CheckpointId, CheckpointResolution, DecisionId, EntityRef, FreezeState, GraduationEvent,
    HumanCheckpoint, Incident, IncidentId, IncidentStatus, LoopInstance, TenantId,
};

/// PostgreSQL-backed storage
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to PostgreSQL and initialize schema
    pub async fn new(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let storage = Self { pool };
        storage.initialize_schema().await?;
        Ok(storage)
    }

    async fn initialize_schema(&self) -> StorageResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS warden_decision_records (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                key_id TEXT,
                run_id TEXT,
                timestamp TIMESTAMPTZ NOT NULL,
                content_hash TEXT NOT NULL,
                appended_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS warden_decision_records_tenant_ts ON warden_decision_records(tenant_id, timestamp);"#,
            r#"
            CREATE OR REPLACE FUNCTION warden_reject_ledger_mutation() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION 'warden_decision_records is append-only';
            END;
            $$ LANGUAGE plpgsql;
            "#,
            r#"DROP TRIGGER IF EXISTS warden_decision_records_append_only ON warden_decision_records;"#,
            r#"
            CREATE TRIGGER warden_decision_records_append_only
                BEFORE UPDATE OR DELETE ON warden_decision_records
                FOR EACH ROW EXECUTE FUNCTION warden_reject_ledger_mutation();
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS warden_incidents (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS warden_incidents_tenant_started ON warden_incidents(tenant_id, started_at DESC);"#,
            r#"
            CREATE TABLE IF NOT EXISTS warden_freeze_states (
                entity_key TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS warden_freeze_states_tenant ON warden_freeze_states(tenant_id);"#,
            r#"
            CREATE TABLE IF NOT EXISTS warden_loops (
                incident_id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                version BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS warden_checkpoints (
                id UUID PRIMARY KEY,
                incident_id UUID NOT NULL,
                tenant_id TEXT NOT NULL,
                resolved BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS warden_checkpoints_incident ON warden_checkpoints(incident_id);"#,
            r#"CREATE INDEX IF NOT EXISTS warden_checkpoints_tenant_pending ON warden_checkpoints(tenant_id, resolved);"#,
            r#"
            CREATE TABLE IF NOT EXISTS warden_graduation_events (
                seq BIGSERIAL PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                incident_id UUID NOT NULL,
                kind TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS warden_graduation_events_tenant ON warden_graduation_events(tenant_id, kind);"#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }

        Ok(())
    }

    fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<Value> {
        serde_json::to_value(value)
            .map_err(|e| StorageError::Serialization(format!("json serialize error: {}", e)))
    }

    fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> StorageResult<T> {
        serde_json::from_value(value)
            .map_err(|e| StorageError::Serialization(format!("json deserialize error: {}", e)))
    }

    fn data_column<T: serde::de::DeserializeOwned>(row: &sqlx::postgres::PgRow) -> StorageResult<T> {
        let data: Value = row.try_get("data").map_err(map_sqlx)?;
        Self::from_json(data)
    }

    fn decision_row(row: &sqlx::postgres::PgRow) -> StorageResult<StoredDecision> {
        let record = Self::data_column(row)?;
        let content_hash: String = row.try_get("content_hash").map_err(map_sqlx)?;
        let appended_at = row.try_get("appended_at").map_err(map_sqlx)?;
        Ok(StoredDecision {
            record,
            content_hash,
            appended_at,
        })
    }
}

/// `LIMIT NULL` is `LIMIT ALL` in PostgreSQL
fn sql_limit(limit: Option<usize>) -> Option<i64> {
    limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
}

fn sql_offset(offset: usize) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

/// Status names an incident query admits, or `None` for no status filter
fn admitted_statuses(query: &IncidentQuery) -> Option<Vec<String>> {
    if query.statuses.is_none() && query.lifecycle.is_none() {
        return None;
    }
    let all = [
        IncidentStatus::Open,
        IncidentStatus::Acknowledged,
        IncidentStatus::Resolved,
    ];
    Some(
        all.into_iter()
            .filter(|s| query.statuses.as_ref().map_or(true, |allowed| allowed.contains(s)))
            .filter(|s| query.lifecycle.map_or(true, |l| s.lifecycle() == l))
            .map(|s| s.as_str().to_string())
            .collect(),
    )
}

fn map_sqlx(error: sqlx::Error) -> StorageError {
    match error {
        sqlx::Error::RowNotFound => StorageError::NotFound(error.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Unavailable(error.to_string())
        }
        sqlx::Error::Database(ref db) if db.message().contains("append-only") => {
            StorageError::ImmutabilityViolation(db.message().to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}

#[async_trait]
impl DecisionStore for PostgresStorage {
    async fn insert_decision(&self, decision: StoredDecision) -> StorageResult<InsertOutcome> {
        let data = Self::to_json(&decision.record)?;
        let result = sqlx::query(
            r#"
            INSERT INTO warden_decision_records
                (id, tenant_id, key_id, run_id, timestamp, content_hash, appended_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(decision.record.id.as_str())
        .bind(decision.record.tenant_id.as_str())
        .bind(decision.record.key_id.as_ref().map(|k| k.as_str().to_string()))
        .bind(decision.record.run_id.clone())
        .bind(decision.record.timestamp)
        .bind(&decision.content_hash)
        .bind(decision.appended_at)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        let existing = self
            .get_decision(&decision.record.id)
            .await?
            .ok_or_else(|| StorageError::Backend("conflicting row vanished".to_string()))?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn get_decision(&self, id: &DecisionId) -> StorageResult<Option<StoredDecision>> {
        let row = sqlx::query(
            "SELECT content_hash, appended_at, data FROM warden_decision_records WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(Self::decision_row).transpose()
    }

    async fn query_decisions(&self, query: &DecisionQuery) -> StorageResult<Vec<StoredDecision>> {
        let rows = sqlx::query(
            r#"
            SELECT content_hash, appended_at, data FROM warden_decision_records
            WHERE ($1::TEXT IS NULL OR tenant_id = $1)
              AND ($2::TEXT IS NULL OR key_id = $2)
              AND ($3::TEXT IS NULL OR run_id = $3)
              AND ($4::TEXT IS NULL OR data->>'model' = $4)
              AND ($5::TEXT IS NULL OR EXISTS (
                    SELECT 1 FROM jsonb_array_elements(data->'evaluations') AS e
                    WHERE e->>'result' = $5))
              AND ($6::TIMESTAMPTZ IS NULL OR timestamp >= $6)
              AND ($7::TIMESTAMPTZ IS NULL OR timestamp <= $7)
            ORDER BY timestamp ASC, id ASC
            LIMIT $8 OFFSET $9
            "#,
        )
        .bind(query.tenant_id.as_ref().map(|t| t.as_str().to_string()))
        .bind(query.key_id.as_ref().map(|k| k.as_str().to_string()))
        .bind(query.run_id.clone())
        .bind(query.model.clone())
        .bind(query.result.map(|r| r.as_str()))
        .bind(query.from)
        .bind(query.to)
        .bind(sql_limit(query.limit))
        .bind(sql_offset(query.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(Self::decision_row).collect()
    }
}

#[async_trait]
impl IncidentStore for PostgresStorage {
    async fn insert_incident(&self, incident: Incident) -> StorageResult<()> {
        let data = Self::to_json(&incident)?;
        let result = sqlx::query(
            r#"
            INSERT INTO warden_incidents (id, tenant_id, status, trigger_type, started_at, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*incident.id.as_uuid())
        .bind(incident.tenant_id.as_str())
        .bind(incident.status.as_str())
        .bind(&incident.trigger_type)
        .bind(incident.started_at)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "incident {} already exists",
                incident.id
            )));
        }
        Ok(())
    }

    async fn save_incident(&self, incident: Incident) -> StorageResult<()> {
        let data = Self::to_json(&incident)?;
        let result = sqlx::query(
            "UPDATE warden_incidents SET status = $2, data = $3 WHERE id = $1",
        )
        .bind(*incident.id.as_uuid())
        .bind(incident.status.as_str())
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(incident.id.to_string()));
        }
        Ok(())
    }

    async fn get_incident(&self, id: &IncidentId) -> StorageResult<Option<Incident>> {
        let row = sqlx::query("SELECT data FROM warden_incidents WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(Self::data_column).transpose()
    }

    async fn list_incidents(&self, query: &IncidentQuery) -> StorageResult<Vec<Incident>> {
        let statuses = admitted_statuses(query);
        if statuses.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT data FROM warden_incidents
            WHERE ($1::TEXT IS NULL OR tenant_id = $1)
              AND ($2::TEXT[] IS NULL OR status = ANY($2))
              AND ($3::TEXT IS NULL OR data->>'severity' = $3)
              AND ($4::TEXT IS NULL OR trigger_type = $4)
              AND ($5::TEXT IS NULL OR data->'run_ids' @> jsonb_build_array($5::TEXT))
              AND ($6::TIMESTAMPTZ IS NULL OR started_at >= $6)
              AND ($7::TIMESTAMPTZ IS NULL OR started_at <= $7)
            ORDER BY started_at DESC, id ASC
            LIMIT $8 OFFSET $9
            "#,
        )
        .bind(query.tenant_id.as_ref().map(|t| t.as_str().to_string()))
        .bind(statuses)
        .bind(query.severity.map(|s| s.as_str()))
        .bind(query.trigger_type.clone())
        .bind(query.run_id.clone())
        .bind(query.started_after)
        .bind(query.started_before)
        .bind(sql_limit(query.limit))
        .bind(sql_offset(query.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(Self::data_column).collect()
    }
}

#[async_trait]
impl FreezeStore for PostgresStorage {
    async fn get_freeze(&self, entity: &EntityRef) -> StorageResult<Option<FreezeState>> {
        let row = sqlx::query("SELECT data FROM warden_freeze_states WHERE entity_key = $1")
            .bind(entity.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(Self::data_column).transpose()
    }

    async fn put_freeze(&self, state: FreezeState) -> StorageResult<()> {
        let data = Self::to_json(&state)?;
        sqlx::query(
            r#"
            INSERT INTO warden_freeze_states (entity_key, tenant_id, entity_type, data, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_key) DO UPDATE SET
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.entity().to_string())
        .bind(state.tenant_id.as_str())
        .bind(state.entity_type.as_str())
        .bind(data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_freezes(&self, tenant_id: &TenantId) -> StorageResult<Vec<FreezeState>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM warden_freeze_states
            WHERE tenant_id = $1
            ORDER BY entity_type DESC, entity_key ASC
            "#,
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(Self::data_column).collect()
    }
}

#[async_trait]
impl LoopStore for PostgresStorage {
    async fn get_loop(&self, incident_id: &IncidentId) -> StorageResult<Option<LoopInstance>> {
        let row = sqlx::query("SELECT data FROM warden_loops WHERE incident_id = $1")
            .bind(*incident_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(Self::data_column).transpose()
    }

    async fn save_loop(
        &self,
        instance: LoopInstance,
        expected_version: Option<u64>,
    ) -> StorageResult<()> {
        let data = Self::to_json(&instance)?;
        let result = match expected_version {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO warden_loops (incident_id, tenant_id, version, created_at, data)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (incident_id) DO NOTHING
                    "#,
                )
                .bind(*instance.incident_id.as_uuid())
                .bind(instance.tenant_id.as_str())
                .bind(instance.version as i64)
                .bind(instance.created_at)
                .bind(data)
                .execute(&self.pool)
                .await
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE warden_loops SET version = $2, data = $3
                    WHERE incident_id = $1 AND version = $4
                    "#,
                )
                .bind(*instance.incident_id.as_uuid())
                .bind(instance.version as i64)
                .bind(data)
                .bind(expected as i64)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "loop {} version mismatch: expected {:?}",
                instance.incident_id, expected_version
            )));
        }
        Ok(())
    }

    async fn list_loops(&self, tenant_id: Option<&TenantId>) -> StorageResult<Vec<LoopInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM warden_loops
            WHERE ($1::TEXT IS NULL OR tenant_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(tenant_id.map(|t| t.as_str().to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(Self::data_column).collect()
    }
}

#[async_trait]
impl CheckpointStore for PostgresStorage {
    async fn insert_checkpoint(&self, checkpoint: HumanCheckpoint) -> StorageResult<()> {
        let data = Self::to_json(&checkpoint)?;
        let result = sqlx::query(
            r#"
            INSERT INTO warden_checkpoints (id, incident_id, tenant_id, resolved, created_at, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*checkpoint.id.as_uuid())
        .bind(*checkpoint.incident_id.as_uuid())
        .bind(checkpoint.tenant_id.as_str())
        .bind(!checkpoint.is_pending())
        .bind(checkpoint.created_at)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "checkpoint {} already exists",
                checkpoint.id
            )));
        }
        Ok(())
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> StorageResult<Option<HumanCheckpoint>> {
        let row = sqlx::query("SELECT data FROM warden_checkpoints WHERE id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(Self::data_column).transpose()
    }

    async fn resolve_checkpoint(
        &self,
        id: &CheckpointId,
        resolution: CheckpointResolution,
        resolved_by: &str,
        notes: Option<String>,
    ) -> StorageResult<HumanCheckpoint> {
        let mut checkpoint = self
            .get_checkpoint(id)
            .await?
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

        // The resolved flag makes the compare-and-set atomic across writers
        let result = sqlx::query(
            "UPDATE warden_checkpoints SET resolved = TRUE, data = $2 WHERE id = $1 AND resolved = FALSE",
        )
        .bind(*id.as_uuid())
        .bind(Self::to_json(&checkpoint)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "checkpoint {} already resolved",
                id
            )));
        }
        Ok(checkpoint)
    }

    async fn list_checkpoints(
        &self,
        query: &CheckpointQuery,
    ) -> StorageResult<Vec<HumanCheckpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM warden_checkpoints
            WHERE ($1::TEXT IS NULL OR tenant_id = $1)
              AND ($2::UUID IS NULL OR incident_id = $2)
              AND ($3::TEXT IS NULL OR data->>'checkpoint_type' = $3)
              AND (NOT $4 OR resolved = FALSE)
            ORDER BY created_at ASC
            LIMIT $5
            "#,
        )
        .bind(query.tenant_id.as_ref().map(|t| t.as_str().to_string()))
        .bind(query.incident_id.map(|id| *id.as_uuid()))
        .bind(query.checkpoint_type.map(|t| t.as_str()))
        .bind(query.pending_only)
        .bind(sql_limit(query.limit))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(Self::data_column).collect()
    }
}

#[async_trait]
impl GraduationStore for PostgresStorage {
    async fn append_graduation_event(&self, event: GraduationEvent) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO warden_graduation_events (tenant_id, incident_id, kind, recorded_at, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.tenant_id().as_str())
        .bind(*event.incident_id().as_uuid())
        .bind(event.kind())
        .bind(event.recorded_at())
        .bind(Self::to_json(&event)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn list_graduation_events(&self) -> StorageResult<Vec<GraduationEvent>> {
        let rows = sqlx::query("SELECT data FROM warden_graduation_events ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.iter().map(Self::data_column).collect()
    }
}
