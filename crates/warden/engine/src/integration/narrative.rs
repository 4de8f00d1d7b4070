//! Loop narrative projection

use chrono::Utc;
use serde_json::Value;
use warden_types::{Incident, LoopInstance, LoopNarrative, LoopStage, TransitionKind};

/// Summarize a loop for humans. Pure function of the loop and its incident.
pub fn narrate(instance: &LoopInstance, incident: &Incident) -> LoopNarrative {
    LoopNarrative {
        incident_id: instance.incident_id,
        current_stage: instance.current_stage,
        what_happened: what_happened(incident),
        what_we_learned: what_we_learned(instance),
        what_we_changed: what_we_changed(instance),
        generated_at: Utc::now(),
    }
}

fn what_happened(incident: &Incident) -> String {
    let mut text = format!(
        "{} {} incident for tenant {}: {} decision(s) between {} and {}",
        incident.severity,
        incident.trigger_type,
        incident.tenant_id,
        incident.source_record_ids.len(),
        incident.started_at.to_rfc3339(),
        incident.last_event_at.to_rfc3339(),
    );
    if incident.folded_record_count > 0 {
        text.push_str(&format!(
            ", {} folded in during an incident storm",
            incident.folded_record_count
        ));
    }
    if incident.cost_delta_cents != 0 {
        text.push_str(&format!(", cost {} cents", incident.cost_delta_cents));
    }
    if !incident.action_taken.is_empty() {
        text.push_str(&format!(", action: {}", incident.action_taken));
    }
    text.push('.');
    text
}

fn detail_str<'a>(instance: &'a LoopInstance, stage: LoopStage, field: &str) -> Option<&'a str> {
    instance
        .stage(stage)
        .filter(|status| status.completed)
        .and_then(|status| status.details.get(field))
        .and_then(Value::as_str)
}

fn what_we_learned(instance: &LoopInstance) -> String {
    let mut parts = Vec::new();

    match instance.stage(LoopStage::PatternMatched) {
        Some(status) if status.completed => match detail_str(instance, LoopStage::PatternMatched, "pattern") {
            Some(pattern) => parts.push(format!("matched known pattern {}", pattern)),
            None => parts.push("no known pattern matched; treated as novel".to_string()),
        },
        _ => parts.push("pattern analysis has not completed".to_string()),
    }

    if let Some(steps) = instance
        .stage(LoopStage::RecoverySuggested)
        .filter(|status| status.completed)
        .and_then(|status| status.details.get("steps"))
        .and_then(Value::as_array)
    {
        let steps: Vec<&str> = steps.iter().filter_map(Value::as_str).collect();
        parts.push(format!("suggested recovery: {}", steps.join(", ")));
    }

    if let Some(failure) = instance.failure_state {
        parts.push(format!("blocked by {}", failure));
    }

    let mut text = parts.join("; ");
    text.push('.');
    text
}

fn what_we_changed(instance: &LoopInstance) -> String {
    let mut parts = Vec::new();

    if let Some(policy_id) = detail_str(instance, LoopStage::PolicyGenerated, "policy_id") {
        parts.push(format!("activated guard policy {}", policy_id));
    }
    if let Some(weight) = instance
        .stage(LoopStage::RoutingAdjusted)
        .filter(|status| status.completed)
        .and_then(|status| status.details.get("weight"))
        .and_then(Value::as_f64)
    {
        parts.push(format!("reduced routing weight to {}", weight));
    }

    let reverts = instance
        .history
        .iter()
        .filter(|t| t.kind != TransitionKind::Advance)
        .count();
    if reverts > 0 {
        parts.push(format!("{} revert(s) unwound earlier changes", reverts));
    }
    if instance.is_abandoned {
        parts.push("loop abandoned".to_string());
    }

    if parts.is_empty() {
        return "Nothing has been changed yet.".to_string();
    }
    let mut text = parts.join("; ");
    text.push('.');
    text
}
