//! Integration loop state machine
//!
//! One [`LoopInstance`] per incident walks
//! `incident_detected → pattern_matched → recovery_suggested →
//! policy_generated → routing_adjusted → loop_complete` without skipping.
//! Strong handler results auto-commit; weak or novel ones raise a human
//! checkpoint and block the loop. Handler failures block the loop until an
//! operator retries or reverts. Revert is the only backward move.
//!
//! All mutations of one loop are serialized by a per-incident lock. Loops
//! of different incidents run in parallel.

use super::bus::LoopEventBus;
use super::handlers::{HandlerError, LoopContext, StageHandlers, StageOutcome};
use super::narrative::narrate;
use crate::error::{require_actor, GovernanceError, GovernanceResult, StorageError};
use crate::graduation::GraduationEvaluator;
use crate::locks::KeyedLocks;
use crate::storage::{CheckpointQuery, CheckpointStore, IncidentStore, LoopStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use warden_types::{
    CheckpointId, CheckpointResolution, CheckpointType, ConfidenceBand, FailureState,
    GraduationStatus, HumanCheckpoint, Incident, IncidentId, LoopEvent, LoopEventEnvelope,
    LoopInstance, LoopNarrative, LoopStage, PreventionEvent, RegretEvent, StageStatus,
    StageTransition, TenantId, TransitionKind,
};

/// Actor recorded on transitions the loop makes on its own
pub const LOOP_ACTOR: &str = "system:loop";

/// Actor recorded on rollbacks the engine performs in response to a regret
pub const REGRET_ACTOR: &str = "system:regret-rollback";

/// Snapshot plus live receiver handed to a new subscriber
#[derive(Debug)]
pub struct LoopSubscription {
    pub snapshot: LoopEventEnvelope,
    pub receiver: broadcast::Receiver<LoopEventEnvelope>,
}

/// Loop counters for operators
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopStats {
    pub total_loops: usize,
    pub active: usize,
    pub blocked: usize,
    pub completed: usize,
    pub abandoned: usize,
    /// Checkpoints never expire; stalled ones accumulate here
    pub pending_checkpoints: usize,
    pub by_stage: BTreeMap<LoopStage, usize>,
    pub oldest_pending_checkpoint_at: Option<DateTime<Utc>>,
}

/// What the engine did about a regret
#[derive(Debug, Clone, Serialize)]
pub struct RegretOutcome {
    /// The automatic rollback ran to completion
    pub rolled_back: bool,
    /// Stages whose side effects were unwound
    pub compensated_stages: Vec<LoopStage>,
    #[serde(rename = "loop")]
    pub loop_instance: Option<LoopInstance>,
    pub graduation: GraduationStatus,
}

/// A loaded loop plus the events its pending mutation will publish
struct Working {
    instance: LoopInstance,
    stored_version: Option<u64>,
    events: Vec<LoopEvent>,
}

impl Working {
    fn incident_id(&self) -> IncidentId {
        self.instance.incident_id
    }
}

/// Drives integration loops
pub struct LoopController {
    loops: Arc<dyn LoopStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    incidents: Arc<dyn IncidentStore>,
    handlers: StageHandlers,
    bus: LoopEventBus,
    graduation: Arc<GraduationEvaluator>,
    locks: KeyedLocks<IncidentId>,
}

impl LoopController {
    pub fn new(
        loops: Arc<dyn LoopStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        incidents: Arc<dyn IncidentStore>,
        handlers: StageHandlers,
        graduation: Arc<GraduationEvaluator>,
    ) -> Self {
        Self {
            loops,
            checkpoints,
            incidents,
            handlers,
            bus: LoopEventBus::default(),
            graduation,
            locks: KeyedLocks::default(),
        }
    }

    async fn load(&self, incident_id: &IncidentId) -> GovernanceResult<Working> {
        let instance = self
            .loops
            .get_loop(incident_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(format!("loop for {}", incident_id)))?;
        Ok(Working {
            stored_version: Some(instance.version),
            instance,
            events: Vec::new(),
        })
    }

    async fn incident(&self, incident_id: &IncidentId) -> GovernanceResult<Incident> {
        self.incidents
            .get_incident(incident_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(format!("incident {}", incident_id)))
    }

    /// Persist the working copy, then publish its events under the new version
    async fn save(&self, working: &mut Working) -> GovernanceResult<()> {
        let version = working.stored_version.map_or(1, |v| v + 1);
        working.instance.version = version;
        working.instance.updated_at = Utc::now();
        self.loops
            .save_loop(working.instance.clone(), working.stored_version)
            .await?;
        working.stored_version = Some(version);

        let incident_id = working.incident_id();
        for event in working.events.drain(..) {
            self.bus
                .publish(LoopEventEnvelope::new(incident_id, version, event));
        }
        Ok(())
    }

    /// Create the loop for an incident and drive it as far as it goes unattended.
    ///
    /// Starting a loop that already exists returns it unchanged.
    pub async fn start(&self, incident: &Incident) -> GovernanceResult<LoopInstance> {
        let _guard = self.locks.lock(incident.id).await;

        if let Some(existing) = self.loops.get_loop(&incident.id).await? {
            return Ok(existing);
        }

        let details = json!({
            "trigger_type": incident.trigger_type,
            "severity": incident.severity,
            "source_record_count": incident.source_record_ids.len(),
        });
        let mut working = Working {
            instance: LoopInstance::new(incident.id, incident.tenant_id.clone(), details),
            stored_version: None,
            events: Vec::new(),
        };
        self.save(&mut working).await?;
        info!(
            incident_id = %incident.id,
            tenant_id = %incident.tenant_id,
            "Integration loop started"
        );

        self.drive(&mut working, incident, LOOP_ACTOR, false).await?;
        Ok(working.instance)
    }

    /// Attempt stages until the loop completes, blocks or fails
    async fn drive(
        &self,
        working: &mut Working,
        incident: &Incident,
        actor: &str,
        mut override_guardrail: bool,
    ) -> GovernanceResult<()> {
        loop {
            if working.instance.is_terminal() || working.instance.is_blocked {
                return Ok(());
            }
            let Some(stage) = working.instance.next_stage() else {
                return Ok(());
            };

            if stage == LoopStage::LoopComplete {
                advance(
                    working,
                    stage,
                    Some(ConfidenceBand::Strong),
                    actor,
                    Value::Null,
                );
                working.instance.is_complete = true;
                working.events.push(LoopEvent::Completed);
                self.save(working).await?;

                info!(incident_id = %incident.id, "Integration loop complete");
                let prevention = PreventionEvent {
                    incident_id: incident.id,
                    tenant_id: incident.tenant_id.clone(),
                    description: format!(
                        "{} loop completed for tenant {}",
                        incident.trigger_type, incident.tenant_id
                    ),
                    verified: true,
                    recorded_at: Utc::now(),
                };
                // Loop state is already saved
                if let Err(err) = self.graduation.record_prevention(prevention).await {
                    warn!(
                        incident_id = %incident.id,
                        error = %err,
                        "Prevention evidence not recorded"
                    );
                }
                return Ok(());
            }

            let Some(handler) = self.handlers.for_stage(stage) else {
                return Err(GovernanceError::conflict(format!(
                    "no handler for stage {}",
                    stage
                )));
            };

            let ctx = LoopContext {
                incident: incident.clone(),
                instance: working.instance.clone(),
                stage,
                override_guardrail,
            };
            override_guardrail = false;
            working.instance.stage_mut(stage).attempts += 1;

            match handler.evaluate(&ctx).await {
                Ok(outcome) if outcome.confidence_band.auto_commits() => {
                    match handler.commit(&incident.id, &outcome.details).await {
                        Ok(()) => advance(
                            working,
                            stage,
                            Some(outcome.confidence_band),
                            actor,
                            outcome.details,
                        ),
                        Err(err) => fail(working, stage, &err),
                    }
                }
                Ok(outcome) => self.raise_stage_checkpoint(working, stage, outcome).await?,
                Err(err) => {
                    fail(working, stage, &err);
                    if err.failure_state() == FailureState::RoutingGuardrailBlocked {
                        self.raise_override_checkpoint(working, stage, &err).await?;
                    }
                }
            }
            self.save(working).await?;
        }
    }

    async fn raise_stage_checkpoint(
        &self,
        working: &mut Working,
        stage: LoopStage,
        outcome: StageOutcome,
    ) -> GovernanceResult<()> {
        let checkpoint_type = CheckpointType::for_stage(stage).ok_or_else(|| {
            GovernanceError::conflict(format!("stage {} takes no checkpoint", stage))
        })?;

        let context = json!({
            "stage": stage,
            "confidence_band": outcome.confidence_band,
            "summary": outcome.summary,
            "proposal": outcome.details,
        });
        let checkpoint = HumanCheckpoint::new(
            checkpoint_type,
            working.incident_id(),
            working.instance.tenant_id.clone(),
            Some(stage),
            context,
            LOOP_ACTOR,
        );
        self.checkpoints.insert_checkpoint(checkpoint.clone()).await?;

        let status = working.instance.stage_mut(stage);
        status.confidence_band = Some(outcome.confidence_band);
        status.details = outcome.details;
        status.failure_state = None;

        working.instance.is_blocked = true;
        working.instance.pending_checkpoints.push(checkpoint.id);
        working.events.push(LoopEvent::CheckpointRaised {
            checkpoint_id: checkpoint.id,
            checkpoint_type,
            stage: Some(stage),
        });

        info!(
            incident_id = %working.incident_id(),
            checkpoint_id = %checkpoint.id,
            stage = %stage,
            checkpoint_type = checkpoint_type.as_str(),
            "Checkpoint raised"
        );
        Ok(())
    }

    async fn raise_override_checkpoint(
        &self,
        working: &mut Working,
        stage: LoopStage,
        err: &HandlerError,
    ) -> GovernanceResult<()> {
        let details = match err {
            HandlerError::Failed { details, .. } => details.clone(),
            HandlerError::Unavailable(_) => Value::Null,
        };
        let checkpoint = HumanCheckpoint::new(
            CheckpointType::OverrideGuardrail,
            working.incident_id(),
            working.instance.tenant_id.clone(),
            Some(stage),
            json!({
                "stage": stage,
                "failure_state": err.failure_state(),
                "message": err.to_string(),
                "details": details,
            }),
            LOOP_ACTOR,
        );
        self.checkpoints.insert_checkpoint(checkpoint.clone()).await?;

        working.instance.pending_checkpoints.push(checkpoint.id);
        working.events.push(LoopEvent::CheckpointRaised {
            checkpoint_id: checkpoint.id,
            checkpoint_type: CheckpointType::OverrideGuardrail,
            stage: Some(stage),
        });
        Ok(())
    }

    /// Re-invoke the handler of the stage the loop is blocked on
    pub async fn retry(
        &self,
        incident_id: &IncidentId,
        stage: LoopStage,
        actor: &str,
    ) -> GovernanceResult<LoopInstance> {
        require_actor(actor)?;
        let _guard = self.locks.lock(*incident_id).await;

        let mut working = self.load(incident_id).await?;
        let instance = &mut working.instance;
        if instance.is_terminal() {
            return Err(GovernanceError::conflict(format!(
                "loop for {} is terminal",
                incident_id
            )));
        }
        if instance.next_stage() != Some(stage) {
            return Err(GovernanceError::conflict(format!(
                "cannot retry {}: loop is at {}",
                stage, instance.current_stage
            )));
        }
        if !instance.pending_checkpoints.is_empty() {
            return Err(GovernanceError::conflict(
                "loop is waiting on a checkpoint; resolve it instead",
            ));
        }

        instance.is_blocked = false;
        instance.failure_state = None;
        instance.stage_mut(stage).failure_state = None;
        info!(incident_id = %incident_id, stage = %stage, actor, "Retrying loop stage");

        let incident = self.incident(incident_id).await?;
        self.drive(&mut working, &incident, actor, false).await?;
        Ok(working.instance)
    }

    /// Roll the loop back to `to_stage`, unwinding committed side effects of
    /// every later stage in reverse order. With `abandon` the loop also
    /// becomes terminal, and `to_stage` may equal the current stage.
    pub async fn revert(
        &self,
        incident_id: &IncidentId,
        to_stage: LoopStage,
        actor: &str,
        abandon: bool,
    ) -> GovernanceResult<LoopInstance> {
        require_actor(actor)?;
        let _guard = self.locks.lock(*incident_id).await;

        let mut working = self.load(incident_id).await?;
        check_revert(&working.instance, to_stage, abandon)?;
        self.unwind(&mut working, to_stage, actor, abandon).await?;
        Ok(working.instance)
    }

    /// Answer a regret on an incident's automation: abandon its loop and
    /// unwind every committed side effect, without operator involvement.
    ///
    /// The rollback gate only counts the regret when that unwind succeeds.
    /// A compensation failure is recorded as an unanswered regret and
    /// returned; the loop stays blocked for an operator.
    pub async fn respond_to_regret(
        &self,
        incident_id: &IncidentId,
        reason: &str,
        actor: &str,
    ) -> GovernanceResult<RegretOutcome> {
        require_actor(actor)?;
        if reason.trim().is_empty() {
            return Err(GovernanceError::validation("reason must not be empty"));
        }
        let incident = self.incident(incident_id).await?;
        let _guard = self.locks.lock(*incident_id).await;

        let mut working = match self.loops.get_loop(incident_id).await? {
            Some(instance) => Working {
                stored_version: Some(instance.version),
                instance,
                events: Vec::new(),
            },
            None => {
                let reason = format!("{} (no automation to roll back)", reason);
                let graduation = self.record_regret(&incident, reason, false).await?;
                return Ok(RegretOutcome {
                    rolled_back: false,
                    compensated_stages: Vec::new(),
                    loop_instance: None,
                    graduation,
                });
            }
        };

        if working.instance.is_abandoned {
            let reason = format!("{} (loop already abandoned)", reason);
            let graduation = self.record_regret(&incident, reason, false).await?;
            return Ok(RegretOutcome {
                rolled_back: false,
                compensated_stages: Vec::new(),
                loop_instance: Some(working.instance),
                graduation,
            });
        }

        // Demote below the first stage with external side effects
        let to_stage = working
            .instance
            .current_stage
            .min(LoopStage::RecoverySuggested);
        let unwound = self.unwind(&mut working, to_stage, REGRET_ACTOR, true).await;
        let compensated_stages = match unwound {
            Ok(stages) => stages,
            Err(err) => {
                self.record_regret(
                    &incident,
                    format!("{} (automatic rollback failed: {})", reason, err),
                    false,
                )
                .await?;
                return Err(err);
            }
        };

        let reason = format!(
            "{} (reported by {}, {} stages unwound)",
            reason,
            actor,
            compensated_stages.len()
        );
        let graduation = self.record_regret(&incident, reason, true).await?;
        warn!(
            incident_id = %incident_id,
            actor,
            compensated = compensated_stages.len(),
            "Loop rolled back in response to regret"
        );
        Ok(RegretOutcome {
            rolled_back: true,
            compensated_stages,
            loop_instance: Some(working.instance),
            graduation,
        })
    }

    async fn record_regret(
        &self,
        incident: &Incident,
        reason: String,
        rolled_back: bool,
    ) -> GovernanceResult<GraduationStatus> {
        self.graduation
            .record_regret(RegretEvent {
                incident_id: incident.id,
                tenant_id: incident.tenant_id.clone(),
                reason,
                rolled_back,
                recorded_at: Utc::now(),
            })
            .await
    }

    /// Caller holds the incident lock and has checked the target stage.
    /// Returns the stages whose side effects were compensated.
    async fn unwind(
        &self,
        working: &mut Working,
        to_stage: LoopStage,
        actor: &str,
        abandon: bool,
    ) -> GovernanceResult<Vec<LoopStage>> {
        let incident_id = working.incident_id();
        let from = working.instance.current_stage;
        let mut compensated = Vec::new();

        for stage in LoopStage::ALL.into_iter().rev() {
            if stage <= to_stage {
                break;
            }
            let status = working.instance.stage(stage).cloned().unwrap_or_default();
            if status.completed {
                if let Some(handler) = self.handlers.for_stage(stage) {
                    if handler.has_side_effects() {
                        if let Err(err) = handler.compensate(&incident_id, &status.details).await {
                            warn!(
                                incident_id = %incident_id,
                                stage = %stage,
                                error = %err,
                                "Compensation failed; revert halted"
                            );
                            working.instance.is_blocked = true;
                            working.instance.failure_state =
                                Some(FailureState::DependencyUnavailable);
                            working.events.push(LoopEvent::StageFailed {
                                stage,
                                failure_state: FailureState::DependencyUnavailable,
                                message: err.to_string(),
                            });
                            self.save(working).await?;
                            return Err(GovernanceError::DependencyUnavailable(format!(
                                "could not unwind {}: {}",
                                stage, err
                            )));
                        }
                        compensated.push(stage);
                        debug!(incident_id = %incident_id, stage = %stage, "Stage compensated");
                    }
                }
            }

            *working.instance.stage_mut(stage) = StageStatus::pending();
            if stage <= working.instance.current_stage {
                if let Some(previous) = stage.previous() {
                    working.instance.current_stage = previous;
                }
            }
        }

        for checkpoint_id in std::mem::take(&mut working.instance.pending_checkpoints) {
            match self
                .checkpoints
                .resolve_checkpoint(
                    &checkpoint_id,
                    CheckpointResolution::Superseded,
                    actor,
                    Some(format!("superseded by revert to {}", to_stage)),
                )
                .await
            {
                Ok(_) => working.events.push(LoopEvent::CheckpointResolved {
                    checkpoint_id,
                    resolution: CheckpointResolution::Superseded,
                    resolved_by: actor.to_string(),
                }),
                Err(StorageError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let now = Utc::now();
        let instance = &mut working.instance;
        instance.current_stage = to_stage;
        instance.is_complete = false;
        instance.is_blocked = false;
        instance.failure_state = None;
        instance.is_abandoned = abandon;
        instance.history.push(StageTransition {
            from,
            to: to_stage,
            kind: if abandon {
                TransitionKind::Abandon
            } else {
                TransitionKind::Revert
            },
            at: now,
            actor: actor.to_string(),
            confidence_band: None,
        });
        working.events.push(LoopEvent::Reverted {
            from,
            to: to_stage,
            abandoned: abandon,
            actor: actor.to_string(),
        });
        self.save(working).await?;

        info!(
            incident_id = %incident_id,
            from = %from,
            to = %to_stage,
            abandon,
            compensated = compensated.len(),
            actor,
            "Loop reverted"
        );
        Ok(compensated)
    }

    /// Resolve a checkpoint exactly once and apply its effect on the loop
    pub async fn resolve_checkpoint(
        &self,
        checkpoint_id: &CheckpointId,
        resolution: CheckpointResolution,
        actor: &str,
        notes: Option<String>,
    ) -> GovernanceResult<HumanCheckpoint> {
        require_actor(actor)?;
        if resolution == CheckpointResolution::Superseded {
            return Err(GovernanceError::validation(
                "resolution must be approve or reject",
            ));
        }

        let checkpoint = self.get_checkpoint(checkpoint_id).await?;
        let incident_id = checkpoint.incident_id;
        let _guard = self.locks.lock(incident_id).await;

        let mut working = self.load(&incident_id).await?;
        let gating = working.instance.pending_checkpoints.contains(checkpoint_id);
        let requested_revert = if !gating
            && checkpoint.checkpoint_type == CheckpointType::RevertLoop
            && resolution.is_approving()
        {
            let (to_stage, abandon) = revert_request(&checkpoint.context)?;
            check_revert(&working.instance, to_stage, abandon)?;
            Some((to_stage, abandon))
        } else {
            None
        };

        let resolved = self
            .checkpoints
            .resolve_checkpoint(checkpoint_id, resolution, actor, notes)
            .await?;
        working.events.push(LoopEvent::CheckpointResolved {
            checkpoint_id: *checkpoint_id,
            resolution,
            resolved_by: actor.to_string(),
        });
        info!(
            incident_id = %incident_id,
            checkpoint_id = %checkpoint_id,
            checkpoint_type = resolved.checkpoint_type.as_str(),
            ?resolution,
            actor,
            "Checkpoint resolved"
        );

        if !gating {
            match requested_revert {
                Some((to_stage, abandon)) => {
                    self.unwind(&mut working, to_stage, actor, abandon).await?;
                }
                None => self.save(&mut working).await?,
            }
            return Ok(resolved);
        }

        working
            .instance
            .pending_checkpoints
            .retain(|id| id != checkpoint_id);
        let stage = resolved
            .stage
            .or_else(|| working.instance.next_stage())
            .ok_or_else(|| GovernanceError::conflict("checkpoint has no stage to gate"))?;

        if resolution == CheckpointResolution::Reject {
            working.instance.stage_mut(stage).failure_state =
                Some(FailureState::CheckpointRejected);
            working.instance.failure_state = Some(FailureState::CheckpointRejected);
            working.instance.is_blocked = true;
            working.events.push(LoopEvent::StageFailed {
                stage,
                failure_state: FailureState::CheckpointRejected,
                message: format!("rejected by {}", actor),
            });
            self.save(&mut working).await?;
            return Ok(resolved);
        }

        let incident = self.incident(&incident_id).await?;
        if resolved.checkpoint_type == CheckpointType::OverrideGuardrail {
            working.instance.stage_mut(stage).failure_state = None;
            working.instance.failure_state = None;
            working.instance.is_blocked = !working.instance.pending_checkpoints.is_empty();
            self.save(&mut working).await?;
            self.drive(&mut working, &incident, actor, true).await?;
            return Ok(resolved);
        }

        if working.instance.next_stage() != Some(stage) {
            return Err(GovernanceError::conflict(format!(
                "checkpoint gates {} but loop is at {}",
                stage, working.instance.current_stage
            )));
        }
        let handler = self.handlers.for_stage(stage).ok_or_else(|| {
            GovernanceError::conflict(format!("no handler for stage {}", stage))
        })?;
        let proposal = resolved.context.get("proposal").cloned().unwrap_or(Value::Null);
        let band = resolved
            .context
            .get("confidence_band")
            .cloned()
            .and_then(|v| serde_json::from_value::<ConfidenceBand>(v).ok());

        match handler.commit(&incident_id, &proposal).await {
            Ok(()) => {
                advance(&mut working, stage, band, actor, proposal);
                working.instance.is_blocked = !working.instance.pending_checkpoints.is_empty();
                self.save(&mut working).await?;
                self.drive(&mut working, &incident, actor, false).await?;
            }
            Err(err) => {
                fail(&mut working, stage, &err);
                self.save(&mut working).await?;
            }
        }
        Ok(resolved)
    }

    /// Raise a checkpoint on operator request. These never block the loop;
    /// an approved `revert_loop` performs the revert named in its context.
    pub async fn create_checkpoint(
        &self,
        incident_id: &IncidentId,
        checkpoint_type: CheckpointType,
        context: Value,
        actor: &str,
    ) -> GovernanceResult<HumanCheckpoint> {
        require_actor(actor)?;
        let _guard = self.locks.lock(*incident_id).await;

        let mut working = self.load(incident_id).await?;
        if checkpoint_type == CheckpointType::RevertLoop {
            let (to_stage, abandon) = revert_request(&context)?;
            check_revert(&working.instance, to_stage, abandon)?;
        }

        let checkpoint = HumanCheckpoint::new(
            checkpoint_type,
            *incident_id,
            working.instance.tenant_id.clone(),
            None,
            context,
            actor,
        );
        self.checkpoints.insert_checkpoint(checkpoint.clone()).await?;
        working.events.push(LoopEvent::CheckpointRaised {
            checkpoint_id: checkpoint.id,
            checkpoint_type,
            stage: None,
        });
        self.save(&mut working).await?;

        info!(
            incident_id = %incident_id,
            checkpoint_id = %checkpoint.id,
            checkpoint_type = checkpoint_type.as_str(),
            actor,
            "Manual checkpoint raised"
        );
        Ok(checkpoint)
    }

    pub async fn get(&self, incident_id: &IncidentId) -> GovernanceResult<LoopInstance> {
        Ok(self.load(incident_id).await?.instance)
    }

    pub async fn stages(
        &self,
        incident_id: &IncidentId,
    ) -> GovernanceResult<BTreeMap<LoopStage, StageStatus>> {
        Ok(self.get(incident_id).await?.stages)
    }

    pub async fn narrative(&self, incident_id: &IncidentId) -> GovernanceResult<LoopNarrative> {
        let instance = self.get(incident_id).await?;
        let incident = self.incident(incident_id).await?;
        Ok(narrate(&instance, &incident))
    }

    pub async fn get_checkpoint(&self, id: &CheckpointId) -> GovernanceResult<HumanCheckpoint> {
        self.checkpoints
            .get_checkpoint(id)
            .await?
            .ok_or_else(|| GovernanceError::not_found(format!("checkpoint {}", id)))
    }

    pub async fn list_checkpoints(
        &self,
        query: &CheckpointQuery,
    ) -> GovernanceResult<Vec<HumanCheckpoint>> {
        if query.limit == Some(0) {
            return Err(GovernanceError::validation("limit must be positive"));
        }
        Ok(self.checkpoints.list_checkpoints(query).await?)
    }

    /// Subscribe to a loop's events. The snapshot reflects every event the
    /// receiver will not see.
    pub async fn subscribe(&self, incident_id: &IncidentId) -> GovernanceResult<LoopSubscription> {
        let _guard = self.locks.lock(*incident_id).await;

        let instance = self.get(incident_id).await?;
        let receiver = self.bus.subscribe(*incident_id);
        let snapshot = LoopEventEnvelope::new(
            *incident_id,
            instance.version,
            LoopEvent::Snapshot {
                instance: Box::new(instance),
            },
        );
        Ok(LoopSubscription { snapshot, receiver })
    }

    pub async fn stats(&self, tenant_id: Option<&TenantId>) -> GovernanceResult<LoopStats> {
        let loops = self.loops.list_loops(tenant_id).await?;
        let pending = self
            .checkpoints
            .list_checkpoints(&CheckpointQuery {
                tenant_id: tenant_id.cloned(),
                pending_only: true,
                ..Default::default()
            })
            .await?;

        let mut stats = LoopStats {
            total_loops: loops.len(),
            pending_checkpoints: pending.len(),
            oldest_pending_checkpoint_at: pending.iter().map(|c| c.created_at).min(),
            ..Default::default()
        };
        for instance in &loops {
            if instance.is_complete {
                stats.completed += 1;
            } else if instance.is_abandoned {
                stats.abandoned += 1;
            } else {
                stats.active += 1;
                if instance.is_blocked {
                    stats.blocked += 1;
                }
            }
            *stats.by_stage.entry(instance.current_stage).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

fn advance(
    working: &mut Working,
    to: LoopStage,
    confidence_band: Option<ConfidenceBand>,
    actor: &str,
    details: Value,
) {
    let now = Utc::now();
    let instance = &mut working.instance;
    let from = instance.current_stage;
    debug_assert_eq!(from.next(), Some(to));

    let status = instance.stage_mut(to);
    status.completed = true;
    status.timestamp = Some(now);
    status.details = details;
    status.failure_state = None;
    status.confidence_band = confidence_band;

    instance.current_stage = to;
    instance.failure_state = None;
    instance.history.push(StageTransition {
        from,
        to,
        kind: TransitionKind::Advance,
        at: now,
        actor: actor.to_string(),
        confidence_band,
    });
    working.events.push(LoopEvent::StageAdvanced {
        from,
        to,
        confidence_band,
    });
    debug!(incident_id = %instance.incident_id, from = %from, to = %to, "Stage advanced");
}

fn fail(working: &mut Working, stage: LoopStage, err: &HandlerError) {
    let failure_state = err.failure_state();
    let instance = &mut working.instance;

    let status = instance.stage_mut(stage);
    status.failure_state = Some(failure_state);
    status.timestamp = Some(Utc::now());
    status.details = match err {
        HandlerError::Failed { details, .. } if !details.is_null() => {
            json!({ "error": err.to_string(), "details": details })
        }
        _ => json!({ "error": err.to_string() }),
    };

    instance.failure_state = Some(failure_state);
    instance.is_blocked = true;
    working.events.push(LoopEvent::StageFailed {
        stage,
        failure_state,
        message: err.to_string(),
    });
    warn!(
        incident_id = %instance.incident_id,
        stage = %stage,
        failure_state = %failure_state,
        error = %err,
        "Loop stage failed"
    );
}

fn check_revert(instance: &LoopInstance, to_stage: LoopStage, abandon: bool) -> GovernanceResult<()> {
    if instance.is_terminal() {
        return Err(GovernanceError::conflict(format!(
            "loop for {} is terminal",
            instance.incident_id
        )));
    }
    let current = instance.current_stage;
    let legal = if abandon {
        to_stage <= current
    } else {
        to_stage < current
    };
    if !legal {
        return Err(GovernanceError::conflict(format!(
            "cannot revert from {} to {}",
            current, to_stage
        )));
    }
    Ok(())
}

fn revert_request(context: &Value) -> GovernanceResult<(LoopStage, bool)> {
    let to_stage = context
        .get("to_stage")
        .and_then(Value::as_str)
        .ok_or_else(|| GovernanceError::validation("revert_loop context needs to_stage"))?
        .parse::<LoopStage>()
        .map_err(GovernanceError::validation)?;
    let abandon = context
        .get("abandon")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok((to_stage, abandon))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::defaults::{RecordingRoutingAdjuster, TemplatePolicyGenerator};
    use crate::integration::handlers::{
        HandlerResult, PatternMatcher, RecoveryEngine, RoutingAdjuster, StageOutcome,
    };
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use warden_types::{DecisionId, IncidentStatus, Severity};

    struct FixedRecovery(ConfidenceBand);

    #[async_trait]
    impl RecoveryEngine for FixedRecovery {
        async fn suggest_recovery(&self, _ctx: &LoopContext) -> HandlerResult<StageOutcome> {
            Ok(StageOutcome::new(
                self.0,
                "fixed",
                json!({ "steps": ["cap_spend_per_key"] }),
            ))
        }
    }

    struct DownMatcher;

    #[async_trait]
    impl PatternMatcher for DownMatcher {
        async fn match_pattern(&self, _ctx: &LoopContext) -> HandlerResult<StageOutcome> {
            Err(HandlerError::Unavailable("pattern service timed out".to_string()))
        }
    }

    struct Fixture {
        controller: LoopController,
        storage: Arc<InMemoryStorage>,
        policy: Arc<TemplatePolicyGenerator>,
        routing: Arc<RecordingRoutingAdjuster>,
        graduation: Arc<GraduationEvaluator>,
    }

    fn fixture(recovery_band: ConfidenceBand) -> Fixture {
        let storage = Arc::new(InMemoryStorage::default());
        let policy = Arc::new(TemplatePolicyGenerator::default());
        let routing = Arc::new(RecordingRoutingAdjuster::default());
        let graduation = Arc::new(GraduationEvaluator::new(storage.clone()));
        let mut handlers = StageHandlers::defaults();
        handlers.recovery = Arc::new(FixedRecovery(recovery_band));
        handlers.policy = policy.clone();
        handlers.routing = routing.clone();
        let controller = LoopController::new(
            storage.clone(),
            storage.clone(),
            storage.clone(),
            handlers,
            graduation.clone(),
        );
        Fixture {
            controller,
            storage,
            policy,
            routing,
            graduation,
        }
    }

    async fn incident(storage: &InMemoryStorage, severity: Severity) -> Incident {
        let now = Utc::now();
        let incident = Incident {
            id: IncidentId::generate(),
            tenant_id: TenantId::new("t1"),
            source_record_ids: vec![DecisionId::new("d1")],
            severity,
            status: IncidentStatus::Open,
            trigger_type: "cost_threshold".to_string(),
            action_taken: "recorded".to_string(),
            cost_delta_cents: 100,
            started_at: now,
            ended_at: None,
            last_event_at: now,
            key_ids: Vec::new(),
            run_ids: Vec::new(),
            folded_record_count: 0,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_by: None,
            resolution_note: None,
            auto_resolved: false,
        };
        storage.insert_incident(incident.clone()).await.unwrap();
        incident
    }

    #[tokio::test]
    async fn test_strong_results_run_to_completion() {
        let fx = fixture(ConfidenceBand::Strong);
        let incident = incident(&fx.storage, Severity::Medium).await;

        let instance = fx.controller.start(&incident).await.unwrap();
        assert!(instance.is_complete);
        assert_eq!(instance.current_stage, LoopStage::LoopComplete);
        assert!(fx.policy.is_active(&incident.id));
        assert!(fx.routing.is_applied(&incident.id));
        assert!(fx.graduation.status().await.unwrap().prevention.passed);

        let again = fx.controller.start(&incident).await.unwrap();
        assert_eq!(again.version, instance.version);
    }

    #[tokio::test]
    async fn test_weak_recovery_blocks_until_approved() {
        let fx = fixture(ConfidenceBand::Weak);
        let incident = incident(&fx.storage, Severity::Medium).await;

        let instance = fx.controller.start(&incident).await.unwrap();
        assert_eq!(instance.current_stage, LoopStage::PatternMatched);
        assert!(instance.is_blocked);
        assert_eq!(instance.pending_checkpoints.len(), 1);

        let checkpoint = fx
            .controller
            .get_checkpoint(&instance.pending_checkpoints[0])
            .await
            .unwrap();
        assert_eq!(checkpoint.checkpoint_type, CheckpointType::ApproveRecovery);

        fx.controller
            .resolve_checkpoint(&checkpoint.id, CheckpointResolution::Approve, "alice", None)
            .await
            .unwrap();
        let instance = fx.controller.get(&incident.id).await.unwrap();
        assert!(instance.is_complete);
        let recovery = instance.stage(LoopStage::RecoverySuggested).unwrap();
        assert!(recovery.completed);
        assert_eq!(recovery.confidence_band, Some(ConfidenceBand::Weak));
    }

    #[tokio::test]
    async fn test_rejection_keeps_loop_blocked() {
        let fx = fixture(ConfidenceBand::Novel);
        let incident = incident(&fx.storage, Severity::Medium).await;
        let instance = fx.controller.start(&incident).await.unwrap();
        let checkpoint_id = instance.pending_checkpoints[0];

        fx.controller
            .resolve_checkpoint(&checkpoint_id, CheckpointResolution::Reject, "alice", None)
            .await
            .unwrap();
        let instance = fx.controller.get(&incident.id).await.unwrap();
        assert!(instance.is_blocked);
        assert_eq!(instance.failure_state, Some(FailureState::CheckpointRejected));
        assert_eq!(instance.current_stage, LoopStage::PatternMatched);

        assert!(matches!(
            fx.controller
                .resolve_checkpoint(&checkpoint_id, CheckpointResolution::Approve, "bob", None)
                .await,
            Err(GovernanceError::Conflict(_))
        ));

        // Rejected stages can be retried once no checkpoint is pending
        let instance = fx
            .controller
            .retry(&incident.id, LoopStage::RecoverySuggested, "alice")
            .await
            .unwrap();
        assert_eq!(instance.pending_checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_handler_becomes_failure_state() {
        let fx = fixture(ConfidenceBand::Strong);
        let mut handlers = StageHandlers::defaults();
        handlers.pattern = Arc::new(DownMatcher);
        let controller = LoopController::new(
            fx.storage.clone(),
            fx.storage.clone(),
            fx.storage.clone(),
            handlers,
            fx.graduation.clone(),
        );
        let incident = incident(&fx.storage, Severity::Medium).await;

        let instance = controller.start(&incident).await.unwrap();
        assert!(instance.is_blocked);
        assert_eq!(instance.current_stage, LoopStage::IncidentDetected);
        assert_eq!(instance.failure_state, Some(FailureState::DependencyUnavailable));

        assert!(matches!(
            controller
                .retry(&incident.id, LoopStage::RecoverySuggested, "alice")
                .await,
            Err(GovernanceError::Conflict(_))
        ));
        let instance = controller
            .retry(&incident.id, LoopStage::PatternMatched, "alice")
            .await
            .unwrap();
        assert_eq!(
            instance.stage(LoopStage::PatternMatched).unwrap().attempts,
            2
        );
    }

    #[tokio::test]
    async fn test_guardrail_override() {
        let fx = fixture(ConfidenceBand::Strong);
        let incident = incident(&fx.storage, Severity::Critical).await;

        // Critical incidents get weak pattern and policy results; walk them through
        let mut instance = fx.controller.start(&incident).await.unwrap();
        while let Some(checkpoint_id) = instance.pending_checkpoints.first().copied() {
            let checkpoint = fx.controller.get_checkpoint(&checkpoint_id).await.unwrap();
            if checkpoint.checkpoint_type == CheckpointType::OverrideGuardrail {
                assert_eq!(
                    instance.failure_state,
                    Some(FailureState::RoutingGuardrailBlocked)
                );
                assert!(!fx.routing.is_applied(&incident.id));
            }
            fx.controller
                .resolve_checkpoint(&checkpoint_id, CheckpointResolution::Approve, "alice", None)
                .await
                .unwrap();
            instance = fx.controller.get(&incident.id).await.unwrap();
        }

        assert!(instance.is_complete);
        assert!(fx.routing.is_applied(&incident.id));
    }

    #[tokio::test]
    async fn test_revert_unwinds_side_effects() {
        let fx = fixture(ConfidenceBand::Strong);
        let incident = incident(&fx.storage, Severity::Medium).await;

        let instance = fx.controller.start(&incident).await.unwrap();
        assert!(instance.is_complete);
        assert!(matches!(
            fx.controller
                .revert(&incident.id, LoopStage::PatternMatched, "alice", false)
                .await,
            Err(GovernanceError::Conflict(_))
        ));

        let other = incident_with_routing_checkpoint(&fx).await;
        let instance = fx
            .controller
            .revert(&other.id, LoopStage::RecoverySuggested, "alice", false)
            .await
            .unwrap();
        assert_eq!(instance.current_stage, LoopStage::RecoverySuggested);
        assert!(!instance.stage(LoopStage::PolicyGenerated).unwrap().completed);
        assert!(!fx.policy.is_active(&other.id));
        assert!(instance.pending_checkpoints.is_empty());
        // Operator reverts are not regret evidence
        assert!(!fx.graduation.status().await.unwrap().rollback.passed);

        let superseded = fx
            .controller
            .list_checkpoints(&CheckpointQuery {
                incident_id: Some(other.id),
                checkpoint_type: Some(CheckpointType::OverrideGuardrail),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            superseded[0].resolution,
            Some(CheckpointResolution::Superseded)
        );
    }

    #[tokio::test]
    async fn test_regret_rolls_back_completed_loop() {
        let fx = fixture(ConfidenceBand::Strong);
        let incident = incident(&fx.storage, Severity::Medium).await;
        fx.controller.start(&incident).await.unwrap();
        assert!(fx.routing.is_applied(&incident.id));

        let outcome = fx
            .controller
            .respond_to_regret(&incident.id, "throttled a healthy key", "alice")
            .await
            .unwrap();
        assert!(outcome.rolled_back);
        assert_eq!(
            outcome.compensated_stages,
            vec![LoopStage::RoutingAdjusted, LoopStage::PolicyGenerated]
        );
        assert!(outcome.graduation.rollback.passed);
        assert!(!fx.policy.is_active(&incident.id));
        assert!(!fx.routing.is_applied(&incident.id));

        let instance = outcome.loop_instance.unwrap();
        assert!(instance.is_abandoned);
        assert!(!instance.is_complete);
        assert_eq!(instance.current_stage, LoopStage::RecoverySuggested);
        let last = instance.history.last().unwrap();
        assert_eq!(last.kind, TransitionKind::Abandon);
        assert_eq!(last.actor, REGRET_ACTOR);

        // Nothing left to unwind the second time
        let again = fx
            .controller
            .respond_to_regret(&incident.id, "still unhappy", "alice")
            .await
            .unwrap();
        assert!(!again.rolled_back);
        assert!(again.graduation.rollback.passed);
    }

    #[tokio::test]
    async fn test_regret_without_loop_leaves_gate_closed() {
        let fx = fixture(ConfidenceBand::Strong);
        let incident = incident(&fx.storage, Severity::Medium).await;

        let outcome = fx
            .controller
            .respond_to_regret(&incident.id, "paged the wrong team", "alice")
            .await
            .unwrap();
        assert!(!outcome.rolled_back);
        assert!(outcome.loop_instance.is_none());
        assert!(!outcome.graduation.rollback.passed);
        assert_eq!(outcome.graduation.rollback.evidence_total, 1);

        assert!(matches!(
            fx.controller
                .respond_to_regret(&incident.id, " ", "alice")
                .await,
            Err(GovernanceError::Validation(_))
        ));
    }

    struct StuckRouting(RecordingRoutingAdjuster);

    #[async_trait]
    impl RoutingAdjuster for StuckRouting {
        async fn propose_adjustment(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome> {
            self.0.propose_adjustment(ctx).await
        }

        async fn apply_adjustment(
            &self,
            incident_id: &IncidentId,
            proposal: &Value,
        ) -> HandlerResult<()> {
            self.0.apply_adjustment(incident_id, proposal).await
        }

        async fn rollback_adjustment(
            &self,
            _incident_id: &IncidentId,
            _proposal: &Value,
        ) -> HandlerResult<()> {
            Err(HandlerError::Unavailable("router unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_regret_rollback_leaves_gate_closed() {
        let fx = fixture(ConfidenceBand::Strong);
        let mut handlers = StageHandlers::defaults();
        handlers.recovery = Arc::new(FixedRecovery(ConfidenceBand::Strong));
        handlers.routing = Arc::new(StuckRouting(RecordingRoutingAdjuster::default()));
        let controller = LoopController::new(
            fx.storage.clone(),
            fx.storage.clone(),
            fx.storage.clone(),
            handlers,
            fx.graduation.clone(),
        );
        let incident = incident(&fx.storage, Severity::Medium).await;
        controller.start(&incident).await.unwrap();

        assert!(matches!(
            controller
                .respond_to_regret(&incident.id, "rerouted the wrong tenant", "alice")
                .await,
            Err(GovernanceError::DependencyUnavailable(_))
        ));
        let status = fx.graduation.status().await.unwrap();
        assert!(!status.rollback.passed);
        assert_eq!(status.rollback.evidence_total, 1);

        let instance = controller.get(&incident.id).await.unwrap();
        assert!(instance.is_blocked);
        assert!(!instance.is_abandoned);
    }

    /// High-severity incident whose routing stage is blocked by the guardrail
    async fn incident_with_routing_checkpoint(fx: &Fixture) -> Incident {
        let incident = incident(&fx.storage, Severity::Critical).await;
        let mut instance = fx.controller.start(&incident).await.unwrap();
        loop {
            let checkpoint = fx
                .controller
                .get_checkpoint(&instance.pending_checkpoints[0])
                .await
                .unwrap();
            if checkpoint.checkpoint_type == CheckpointType::OverrideGuardrail {
                return incident;
            }
            fx.controller
                .resolve_checkpoint(&checkpoint.id, CheckpointResolution::Approve, "alice", None)
                .await
                .unwrap();
            instance = fx.controller.get(&incident.id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_abandon_is_terminal() {
        let fx = fixture(ConfidenceBand::Weak);
        let incident = incident(&fx.storage, Severity::Medium).await;
        fx.controller.start(&incident).await.unwrap();

        let instance = fx
            .controller
            .revert(&incident.id, LoopStage::PatternMatched, "alice", true)
            .await
            .unwrap();
        assert!(instance.is_abandoned);
        assert!(instance.is_terminal());
        assert_eq!(instance.history.last().unwrap().kind, TransitionKind::Abandon);
        assert!(matches!(
            fx.controller
                .retry(&incident.id, LoopStage::RecoverySuggested, "alice")
                .await,
            Err(GovernanceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_revert_checkpoint() {
        let fx = fixture(ConfidenceBand::Weak);
        let incident = incident(&fx.storage, Severity::Medium).await;
        fx.controller.start(&incident).await.unwrap();

        assert!(matches!(
            fx.controller
                .create_checkpoint(
                    &incident.id,
                    CheckpointType::RevertLoop,
                    json!({ "to_stage": "loop_complete" }),
                    "alice",
                )
                .await,
            Err(GovernanceError::Conflict(_))
        ));

        let checkpoint = fx
            .controller
            .create_checkpoint(
                &incident.id,
                CheckpointType::RevertLoop,
                json!({ "to_stage": "incident_detected" }),
                "alice",
            )
            .await
            .unwrap();
        let instance = fx.controller.get(&incident.id).await.unwrap();
        assert!(!instance.pending_checkpoints.contains(&checkpoint.id));

        fx.controller
            .resolve_checkpoint(&checkpoint.id, CheckpointResolution::Approve, "bob", None)
            .await
            .unwrap();
        let instance = fx.controller.get(&incident.id).await.unwrap();
        assert_eq!(instance.current_stage, LoopStage::IncidentDetected);
        assert!(!instance.is_blocked);
    }

    #[tokio::test]
    async fn test_subscription_snapshot_then_events() {
        let fx = fixture(ConfidenceBand::Weak);
        let incident = incident(&fx.storage, Severity::Medium).await;
        let instance = fx.controller.start(&incident).await.unwrap();

        let mut subscription = fx.controller.subscribe(&incident.id).await.unwrap();
        assert_eq!(subscription.snapshot.kind(), "snapshot");
        assert_eq!(subscription.snapshot.version, instance.version);

        fx.controller
            .resolve_checkpoint(
                &instance.pending_checkpoints[0],
                CheckpointResolution::Approve,
                "alice",
                None,
            )
            .await
            .unwrap();

        let first = subscription.receiver.recv().await.unwrap();
        assert_eq!(first.kind(), "checkpoint_resolved");
        assert!(first.version > instance.version);
        let second = subscription.receiver.recv().await.unwrap();
        assert_eq!(second.kind(), "stage_advanced");
    }

    #[tokio::test]
    async fn test_stats_count_pending_checkpoints() {
        let fx = fixture(ConfidenceBand::Weak);
        let blocked = incident(&fx.storage, Severity::Medium).await;
        fx.controller.start(&blocked).await.unwrap();

        let stats = fx.controller.stats(None).await.unwrap();
        assert_eq!(stats.total_loops, 1);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.pending_checkpoints, 1);
        assert!(stats.oldest_pending_checkpoint_at.is_some());
        assert_eq!(stats.by_stage.get(&LoopStage::PatternMatched), Some(&1));

        let other = fx
            .controller
            .stats(Some(&TenantId::new("t2")))
            .await
            .unwrap();
        assert_eq!(other.total_loops, 0);
        assert_eq!(other.pending_checkpoints, 0);
    }
}
