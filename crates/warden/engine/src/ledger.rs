//! Decision ledger
//!
//! Append-only record of every policy-evaluated call. There is no update or
//! delete path: write-once is enforced by the store itself, and the ledger
//! only adds idempotent-append semantics on top.

use crate::error::{GovernanceError, GovernanceResult, StorageError};
use crate::storage::{DecisionQuery, DecisionStore, InsertOutcome, StoredDecision};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use warden_types::{DecisionId, DecisionRecord};

/// Upper bound on a single ledger page
pub const MAX_QUERY_LIMIT: usize = 1_000;

/// Result of an append
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendOutcome {
    pub id: DecisionId,
    pub content_hash: String,
    /// The record was already present with identical content
    pub duplicate: bool,
}

/// Append-only decision ledger
pub struct DecisionLedger {
    store: Arc<dyn DecisionStore>,
}

impl DecisionLedger {
    pub fn new(store: Arc<dyn DecisionStore>) -> Self {
        Self { store }
    }

    /// Append a record.
    ///
    /// Re-appending a byte-identical record is a no-op reported as
    /// `duplicate`. Re-using an id with different content is a conflict.
    pub async fn append(&self, record: DecisionRecord) -> GovernanceResult<AppendOutcome> {
        validate_record(&record)?;
        let content_hash = content_digest(&record)?;
        let id = record.id.clone();

        let stored = StoredDecision {
            record,
            content_hash: content_hash.clone(),
            appended_at: Utc::now(),
        };

        match self.store.insert_decision(stored).await? {
            InsertOutcome::Inserted => {
                debug!(decision_id = %id, hash = %content_hash, "Decision appended");
                Ok(AppendOutcome {
                    id,
                    content_hash,
                    duplicate: false,
                })
            }
            InsertOutcome::Existing(existing) if existing.content_hash == content_hash => {
                info!(decision_id = %id, "Duplicate decision append ignored");
                Ok(AppendOutcome {
                    id,
                    content_hash,
                    duplicate: true,
                })
            }
            InsertOutcome::Existing(_) => {
                warn!(decision_id = %id, "Decision id reused with different content");
                Err(GovernanceError::conflict(format!(
                    "decision {} already exists with different content",
                    id
                )))
            }
        }
    }

    pub async fn get(&self, id: &DecisionId) -> GovernanceResult<DecisionRecord> {
        self.store
            .get_decision(id)
            .await?
            .map(|stored| stored.record)
            .ok_or_else(|| GovernanceError::not_found(format!("decision {}", id)))
    }

    /// Records matching `query`, ordered by timestamp ascending
    pub async fn query(&self, query: &DecisionQuery) -> GovernanceResult<Vec<DecisionRecord>> {
        validate_query(query)?;
        let rows = self.store.query_decisions(query).await?;
        Ok(rows.into_iter().map(|stored| stored.record).collect())
    }
}

/// BLAKE3 digest of the record's canonical JSON encoding
pub fn content_digest(record: &DecisionRecord) -> GovernanceResult<String> {
    let bytes = serde_json::to_vec(record)
        .map_err(|e| GovernanceError::Storage(StorageError::Serialization(e.to_string())))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn validate_record(record: &DecisionRecord) -> GovernanceResult<()> {
    if record.id.as_str().trim().is_empty() {
        return Err(GovernanceError::validation("decision id must not be empty"));
    }
    if record.tenant_id.as_str().trim().is_empty() {
        return Err(GovernanceError::validation("tenant_id must not be empty"));
    }
    if record.model.trim().is_empty() {
        return Err(GovernanceError::validation("model must not be empty"));
    }
    if record.cost_cents < 0 {
        return Err(GovernanceError::validation("cost_cents must not be negative"));
    }
    if let Some(eval) = record
        .evaluations
        .iter()
        .find(|e| e.policy_id.trim().is_empty())
    {
        return Err(GovernanceError::validation(format!(
            "evaluation with reason '{}' has no policy_id",
            eval.reason
        )));
    }
    Ok(())
}

fn validate_query(query: &DecisionQuery) -> GovernanceResult<()> {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(GovernanceError::validation(
                "time range start must not be after its end",
            ));
        }
    }
    match query.limit {
        Some(0) => Err(GovernanceError::validation("limit must be positive")),
        Some(limit) if limit > MAX_QUERY_LIMIT => Err(GovernanceError::validation(format!(
            "limit must not exceed {}",
            MAX_QUERY_LIMIT
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use chrono::Duration;
    use warden_types::{PolicyEvaluation, PolicyResult, TenantId};

    fn record(id: &str) -> DecisionRecord {
        DecisionRecord {
            id: DecisionId::new(id),
            tenant_id: TenantId::new("t1"),
            key_id: None,
            run_id: None,
            timestamp: Utc::now(),
            evaluations: vec![PolicyEvaluation::new(
                "budget",
                PolicyResult::Warn,
                "close to budget",
            )],
            model: "gpt-4o".to_string(),
            input_hash: "in".to_string(),
            output_hash: "out".to_string(),
            cost_cents: 40,
            latency_ms: 800,
        }
    }

    fn ledger() -> DecisionLedger {
        DecisionLedger::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_identical_reappend_is_noop() {
        let ledger = ledger();
        let rec = record("d1");

        let first = ledger.append(rec.clone()).await.unwrap();
        assert!(!first.duplicate);

        let second = ledger.append(rec).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(first.content_hash, second.content_hash);
    }

    #[tokio::test]
    async fn test_reused_id_with_different_content_conflicts() {
        let ledger = ledger();
        let rec = record("d1");
        ledger.append(rec.clone()).await.unwrap();

        let mut changed = rec.clone();
        changed.cost_cents += 1;
        let err = ledger.append(changed).await.unwrap_err();
        assert!(matches!(err, GovernanceError::Conflict(_)));

        assert_eq!(ledger.get(&rec.id).await.unwrap(), rec);
    }

    #[tokio::test]
    async fn test_invalid_record_rejected() {
        let ledger = ledger();
        let mut rec = record("d1");
        rec.tenant_id = TenantId::new("");
        assert!(matches!(
            ledger.append(rec).await,
            Err(GovernanceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_query_validates_range() {
        let ledger = ledger();
        let now = Utc::now();
        let query = DecisionQuery::default().between(now, now - Duration::seconds(1));
        assert!(matches!(
            ledger.query(&query).await,
            Err(GovernanceError::Validation(_))
        ));

        let query = DecisionQuery {
            limit: Some(MAX_QUERY_LIMIT + 1),
            ..Default::default()
        };
        assert!(matches!(
            ledger.query(&query).await,
            Err(GovernanceError::Validation(_))
        ));
    }

    #[test]
    fn test_digest_is_stable() {
        let rec = record("d1");
        assert_eq!(content_digest(&rec).unwrap(), content_digest(&rec).unwrap());
        let mut other = rec.clone();
        other.output_hash = "different".to_string();
        assert_ne!(content_digest(&rec).unwrap(), content_digest(&other).unwrap());
    }
}
