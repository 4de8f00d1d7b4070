//! In-process stage handlers
//!
//! Deployments with real pattern, policy and routing services plug them in
//! through the traits in [`super::handlers`]. These defaults keep the loop
//! runnable on its own and record what they applied so reverts can unwind it.

use super::handlers::{
    HandlerError, HandlerResult, LoopContext, PatternMatcher, PolicyGenerator, RecoveryEngine,
    RoutingAdjuster, StageHandlers, StageOutcome,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use warden_types::{ConfidenceBand, FailureState, IncidentId, LoopStage, Severity};

impl StageHandlers {
    /// Built-in handlers
    pub fn defaults() -> Self {
        Self {
            pattern: Arc::new(CatalogPatternMatcher::default()),
            recovery: Arc::new(PlaybookRecoveryEngine),
            policy: Arc::new(TemplatePolicyGenerator::default()),
            routing: Arc::new(RecordingRoutingAdjuster::default()),
        }
    }
}

/// Matches trigger types against a fixed catalog of known patterns
#[derive(Debug, Clone)]
pub struct CatalogPatternMatcher {
    catalog: HashMap<String, String>,
}

impl CatalogPatternMatcher {
    pub fn new(catalog: HashMap<String, String>) -> Self {
        Self { catalog }
    }
}

impl Default for CatalogPatternMatcher {
    fn default() -> Self {
        let catalog = [
            ("cost_threshold", "runaway_spend"),
            ("budget", "runaway_spend"),
            ("rate_limit", "burst_traffic"),
            ("pii_detected", "data_exposure"),
            ("prompt_injection", "prompt_attack"),
            ("model_error", "provider_degradation"),
        ]
        .into_iter()
        .map(|(trigger, pattern)| (trigger.to_string(), pattern.to_string()))
        .collect();
        Self { catalog }
    }
}

#[async_trait]
impl PatternMatcher for CatalogPatternMatcher {
    async fn match_pattern(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome> {
        let trigger = &ctx.incident.trigger_type;
        match self.catalog.get(trigger) {
            Some(pattern) => {
                // Critical incidents on a known pattern still get a human look
                let band = if ctx.incident.severity >= Severity::Critical {
                    ConfidenceBand::Weak
                } else {
                    ConfidenceBand::Strong
                };
                Ok(StageOutcome::new(
                    band,
                    format!("{} matches known pattern {}", trigger, pattern),
                    json!({ "pattern": pattern, "trigger_type": trigger }),
                ))
            }
            None => Ok(StageOutcome::new(
                ConfidenceBand::Novel,
                format!("{} matches no known pattern", trigger),
                json!({ "pattern": Value::Null, "trigger_type": trigger }),
            )),
        }
    }
}

/// Maps matched patterns to canned recovery playbooks
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybookRecoveryEngine;

impl PlaybookRecoveryEngine {
    fn playbook(pattern: &str) -> Option<&'static [&'static str]> {
        match pattern {
            "runaway_spend" => Some(&["cap_spend_per_key", "notify_tenant_owner"][..]),
            "burst_traffic" => Some(&["enable_backoff", "raise_rate_limit_alert"][..]),
            "data_exposure" => Some(&["enable_pii_redaction", "rotate_exposed_key"][..]),
            "prompt_attack" => Some(&["tighten_input_filter", "quarantine_run"][..]),
            "provider_degradation" => Some(&["fail_over_model", "open_provider_ticket"][..]),
            _ => None,
        }
    }
}

#[async_trait]
impl RecoveryEngine for PlaybookRecoveryEngine {
    async fn suggest_recovery(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome> {
        let pattern = ctx
            .prior(LoopStage::PatternMatched)
            .and_then(|details| details.get("pattern"))
            .and_then(Value::as_str);

        match pattern.and_then(|p| Self::playbook(p).map(|steps| (p, steps))) {
            Some((pattern, steps)) => Ok(StageOutcome::new(
                ConfidenceBand::Strong,
                format!("playbook for {}: {}", pattern, steps.join(", ")),
                json!({ "pattern": pattern, "steps": steps }),
            )),
            None => Ok(StageOutcome::new(
                ConfidenceBand::Weak,
                "no playbook; manual investigation suggested",
                json!({ "pattern": pattern, "steps": ["manual_investigation"] }),
            )),
        }
    }
}

/// Generates a guard policy from the incident's trigger and keeps the set of
/// policies it activated
#[derive(Debug, Default)]
pub struct TemplatePolicyGenerator {
    active: DashMap<IncidentId, Value>,
}

impl TemplatePolicyGenerator {
    pub fn is_active(&self, incident_id: &IncidentId) -> bool {
        self.active.contains_key(incident_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[async_trait]
impl PolicyGenerator for TemplatePolicyGenerator {
    async fn generate_policy(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome> {
        let incident = &ctx.incident;
        let steps = ctx
            .prior(LoopStage::RecoverySuggested)
            .and_then(|details| details.get("steps"))
            .cloned()
            .unwrap_or(Value::Null);
        if steps.is_null() {
            return Err(HandlerError::failed(
                FailureState::PolicyRejected,
                "no recovery recorded to derive a policy from",
            ));
        }

        let policy_id = format!(
            "auto-{}-{}",
            incident.trigger_type,
            &incident.id.as_uuid().simple().to_string()[..8]
        );
        let band = if incident.severity >= Severity::Critical {
            ConfidenceBand::Weak
        } else {
            ConfidenceBand::Strong
        };
        let action = if incident.severity >= Severity::High {
            "block"
        } else {
            "warn"
        };
        Ok(StageOutcome::new(
            band,
            format!("guard policy {} for tenant {}", policy_id, incident.tenant_id),
            json!({
                "policy_id": policy_id,
                "tenant_id": incident.tenant_id,
                "trigger_type": incident.trigger_type,
                "action": action,
                "derived_from": steps,
            }),
        ))
    }

    async fn activate_policy(&self, incident_id: &IncidentId, proposal: &Value) -> HandlerResult<()> {
        self.active.insert(*incident_id, proposal.clone());
        info!(incident_id = %incident_id, "Guard policy activated");
        Ok(())
    }

    async fn withdraw_policy(&self, incident_id: &IncidentId, _proposal: &Value) -> HandlerResult<()> {
        self.active.remove(incident_id);
        info!(incident_id = %incident_id, "Guard policy withdrawn");
        Ok(())
    }
}

/// Shifts traffic weight away from the offending route. Critical incidents
/// trip the guardrail unless an operator overrides it.
#[derive(Debug, Default)]
pub struct RecordingRoutingAdjuster {
    applied: DashMap<IncidentId, Value>,
}

impl RecordingRoutingAdjuster {
    pub fn is_applied(&self, incident_id: &IncidentId) -> bool {
        self.applied.contains_key(incident_id)
    }
}

#[async_trait]
impl RoutingAdjuster for RecordingRoutingAdjuster {
    async fn propose_adjustment(&self, ctx: &LoopContext) -> HandlerResult<StageOutcome> {
        let incident = &ctx.incident;
        if incident.severity >= Severity::Critical && !ctx.override_guardrail {
            return Err(HandlerError::Failed {
                failure_state: FailureState::RoutingGuardrailBlocked,
                message: "automatic rerouting of critical incidents needs an override".to_string(),
                details: json!({ "severity": incident.severity }),
            });
        }

        let weight = match incident.severity {
            Severity::Critical => 0.0,
            Severity::High => 0.25,
            Severity::Medium => 0.5,
            Severity::Low => 0.75,
        };
        Ok(StageOutcome::new(
            ConfidenceBand::Strong,
            format!("reduce routing weight for {} to {}", incident.tenant_id, weight),
            json!({
                "tenant_id": incident.tenant_id,
                "key_ids": incident.key_ids,
                "weight": weight,
                "overridden": ctx.override_guardrail,
            }),
        ))
    }

    async fn apply_adjustment(&self, incident_id: &IncidentId, proposal: &Value) -> HandlerResult<()> {
        self.applied.insert(*incident_id, proposal.clone());
        info!(incident_id = %incident_id, "Routing adjustment applied");
        Ok(())
    }

    async fn rollback_adjustment(
        &self,
        incident_id: &IncidentId,
        _proposal: &Value,
    ) -> HandlerResult<()> {
        self.applied.remove(incident_id);
        info!(incident_id = %incident_id, "Routing adjustment rolled back");
        Ok(())
    }
}
