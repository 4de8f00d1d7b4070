//! Governance engine facade
//!
//! Wires the components over one storage backend and runs the decision
//! pipeline: ledger append, incident aggregation, auto-freeze, and loop start.

use crate::aggregator::{Aggregation, AggregationKind, IncidentAggregator};
use crate::config::EngineConfig;
use crate::error::GovernanceResult;
use crate::graduation::GraduationEvaluator;
use crate::integration::{LoopController, RegretOutcome, StageHandlers};
use crate::killswitch::KillSwitch;
use crate::ledger::{AppendOutcome, DecisionLedger};
use crate::replay::ReplayEngine;
use crate::storage::GovernanceStorage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use warden_types::{
    AdmissionDecision, ConsoleViewEvent, DecisionRecord, FreezeState, Incident, IncidentId, KeyId,
    LoopInstance, ReplayItem, TenantId,
};

/// Everything that happened while recording one decision
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub append: AppendOutcome,
    pub incident: Option<Incident>,
    pub aggregation: Option<AggregationKind>,
    pub freeze: Option<FreezeState>,
    #[serde(rename = "loop")]
    pub loop_instance: Option<LoopInstance>,
}

/// The governance engine
pub struct GovernanceEngine {
    config: EngineConfig,
    ledger: DecisionLedger,
    aggregator: IncidentAggregator,
    killswitch: KillSwitch,
    replay: ReplayEngine,
    loops: LoopController,
    graduation: Arc<GraduationEvaluator>,
}

impl GovernanceEngine {
    /// Engine with the built-in stage handlers
    pub fn new<S>(storage: Arc<S>, config: EngineConfig) -> Self
    where
        S: GovernanceStorage + 'static,
    {
        Self::with_handlers(storage, config, StageHandlers::defaults())
    }

    pub fn with_handlers<S>(storage: Arc<S>, config: EngineConfig, handlers: StageHandlers) -> Self
    where
        S: GovernanceStorage + 'static,
    {
        let graduation = Arc::new(GraduationEvaluator::new(storage.clone()));
        Self {
            ledger: DecisionLedger::new(storage.clone()),
            aggregator: IncidentAggregator::new(storage.clone(), config.aggregation.clone()),
            killswitch: KillSwitch::new(storage.clone(), config.killswitch.clone()),
            replay: ReplayEngine::new(storage.clone(), storage.clone(), config.replay.clone()),
            loops: LoopController::new(
                storage.clone(),
                storage.clone(),
                storage,
                handlers,
                graduation.clone(),
            ),
            graduation,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &DecisionLedger {
        &self.ledger
    }

    pub fn incidents(&self) -> &IncidentAggregator {
        &self.aggregator
    }

    pub fn killswitch(&self) -> &KillSwitch {
        &self.killswitch
    }

    pub fn replay(&self) -> &ReplayEngine {
        &self.replay
    }

    pub fn loops(&self) -> &LoopController {
        &self.loops
    }

    pub fn graduation(&self) -> &GraduationEvaluator {
        &self.graduation
    }

    /// Record a completed call and react to it.
    ///
    /// Ledger and aggregation failures are returned. The record is already
    /// durable by the time auto-freeze or loop start run, so failures there
    /// are logged and leave the outcome fields empty.
    pub async fn record_decision(&self, record: DecisionRecord) -> GovernanceResult<DecisionOutcome> {
        let append = self.ledger.append(record.clone()).await?;
        let mut outcome = DecisionOutcome {
            append,
            incident: None,
            aggregation: None,
            freeze: None,
            loop_instance: None,
        };
        if outcome.append.duplicate {
            return Ok(outcome);
        }

        let Some(Aggregation { mut incident, kind }) = self.aggregator.ingest(&record).await? else {
            return Ok(outcome);
        };
        outcome.aggregation = Some(kind);

        if let Some(entity) = self.killswitch.auto_freeze_target(&incident) {
            match self.killswitch.try_is_frozen(&entity).await {
                Ok(false) => match self.killswitch.auto_freeze(&entity, &incident).await {
                    Ok(state) => {
                        match self
                            .aggregator
                            .set_action_taken(&incident.id, format!("auto_freeze:{}", entity))
                            .await
                        {
                            Ok(updated) => incident = updated,
                            Err(err) => {
                                warn!(incident_id = %incident.id, error = %err, "Could not record freeze on incident")
                            }
                        }
                        outcome.freeze = Some(state);
                    }
                    Err(err) => {
                        error!(incident_id = %incident.id, entity = %entity, error = %err, "Auto-freeze failed")
                    }
                },
                Ok(true) => debug!(entity = %entity, "Auto-freeze target already frozen"),
                // Logged at error level by the kill-switch
                Err(_) => {}
            }
        }

        let automation = &self.config.automation;
        if automation.enabled && incident.severity >= automation.min_severity {
            match self.loops.start(&incident).await {
                Ok(instance) => outcome.loop_instance = Some(instance),
                Err(err) => {
                    error!(incident_id = %incident.id, error = %err, "Integration loop did not start")
                }
            }
        }

        outcome.incident = Some(incident);
        Ok(outcome)
    }

    /// Call-admission check; never defaults to allow on store failure
    pub async fn admit(&self, tenant_id: &TenantId, key_id: Option<&KeyId>) -> AdmissionDecision {
        self.killswitch.admit(tenant_id, key_id).await
    }

    /// Replay timeline. A named viewer counts as console-view evidence.
    pub async fn view_timeline(
        &self,
        incident_id: &IncidentId,
        limit: Option<usize>,
        viewer: Option<&str>,
    ) -> GovernanceResult<Vec<ReplayItem>> {
        let items = self.replay.timeline(incident_id, limit).await?;
        if let Some(viewer) = viewer.map(str::trim).filter(|v| !v.is_empty()) {
            if let Err(err) = self.record_view(incident_id, viewer).await {
                warn!(
                    incident_id = %incident_id,
                    viewer,
                    error = %err,
                    "Console view not recorded"
                );
            }
        }
        Ok(items)
    }

    async fn record_view(&self, incident_id: &IncidentId, viewer: &str) -> GovernanceResult<()> {
        let incident = self.aggregator.get(incident_id).await?;
        self.graduation
            .record_console_view(ConsoleViewEvent {
                incident_id: *incident_id,
                tenant_id: incident.tenant_id,
                viewer: viewer.to_string(),
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// An operator regrets what automation did for an incident. The engine
    /// rolls the incident's loop back on its own; see
    /// [`LoopController::respond_to_regret`].
    pub async fn record_regret(
        &self,
        incident_id: &IncidentId,
        reason: &str,
        actor: &str,
    ) -> GovernanceResult<RegretOutcome> {
        self.loops.respond_to_regret(incident_id, reason, actor).await
    }

    /// Auto-resolve expired incidents
    pub async fn sweep(&self, now: DateTime<Utc>) -> GovernanceResult<Vec<Incident>> {
        self.aggregator.sweep(now).await
    }
}
