//! End-to-end governance scenarios over the in-memory backend

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use warden_engine::{
    AggregationKind, EngineConfig, GovernanceEngine, GovernanceError, InMemoryStorage,
    IncidentQuery, SliceParams,
};
use warden_types::{
    CheckpointResolution, CheckpointType, ConfidenceBand, DecisionId, DecisionRecord, EntityRef,
    KeyId, LoopStage, PolicyEvaluation, PolicyResult, RejectionReason, Severity, TenantId,
};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn engine() -> GovernanceEngine {
    GovernanceEngine::new(Arc::new(InMemoryStorage::default()), EngineConfig::default())
}

fn violation(
    id: &str,
    at: DateTime<Utc>,
    trigger: &str,
    result: PolicyResult,
    severity: Severity,
) -> DecisionRecord {
    DecisionRecord {
        id: DecisionId::new(id),
        tenant_id: TenantId::new("t1"),
        key_id: Some(KeyId::new("k1")),
        run_id: Some("run-1".to_string()),
        timestamp: at,
        evaluations: vec![
            PolicyEvaluation::new("pii-scan", PolicyResult::Pass, "clean"),
            PolicyEvaluation::new("spend-cap", result, "over budget")
                .with_trigger(trigger)
                .with_severity(severity),
        ],
        model: "gpt-4o".to_string(),
        input_hash: format!("in-{}", id),
        output_hash: format!("out-{}", id),
        cost_cents: 125,
        latency_ms: 900,
    }
}

fn passing(id: &str, at: DateTime<Utc>) -> DecisionRecord {
    DecisionRecord {
        evaluations: vec![PolicyEvaluation::new("spend-cap", PolicyResult::Pass, "ok")],
        ..violation(id, at, "cost_threshold", PolicyResult::Pass, Severity::Low)
    }
}

#[tokio::test]
async fn test_three_cost_violations_make_one_incident() {
    let engine = engine();
    let t0 = base_time();
    let severities = [Severity::Medium, Severity::High, Severity::Low];

    for (i, severity) in severities.into_iter().enumerate() {
        engine
            .record_decision(violation(
                &format!("d{}", i),
                t0 + Duration::seconds(40 * i as i64),
                "cost_threshold",
                PolicyResult::Fail,
                severity,
            ))
            .await
            .unwrap();
    }

    let incidents = engine
        .incidents()
        .list(&IncidentQuery::for_tenant(TenantId::new("t1")))
        .await
        .unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].source_record_ids.len(), 3);
    assert_eq!(incidents[0].severity, Severity::High);
    assert_eq!(incidents[0].trigger_type, "cost_threshold");
}

#[tokio::test]
async fn test_tenant_freeze_covers_every_key() {
    let engine = engine();
    let killswitch = engine.killswitch();
    let tenant = EntityRef::tenant("t1");

    killswitch.freeze(&tenant, "abuse report", "alice").await.unwrap();
    for key in ["k1", "k2", "k3"] {
        assert!(killswitch.is_frozen(&EntityRef::key("t1", key)).await);
    }
    let decision = engine
        .admit(&TenantId::new("t1"), Some(&KeyId::new("k9")))
        .await;
    assert!(!decision.allowed);
    assert_eq!(decision.reason, Some(RejectionReason::TenantFrozen));

    killswitch.unfreeze(&tenant, "cleared", "alice").await.unwrap();
    assert!(!killswitch.is_frozen(&EntityRef::key("t1", "k1")).await);
}

#[tokio::test]
async fn test_key_freeze_leaves_tenant_unfrozen() {
    let engine = engine();
    let killswitch = engine.killswitch();

    killswitch
        .freeze(&EntityRef::key("t1", "k1"), "leaked key", "alice")
        .await
        .unwrap();
    assert!(!killswitch.is_frozen(&EntityRef::tenant("t1")).await);
    assert!(killswitch.is_frozen(&EntityRef::key("t1", "k1")).await);
    assert!(!killswitch.is_frozen(&EntityRef::key("t1", "k2")).await);
}

#[tokio::test]
async fn test_append_idempotence() {
    let engine = engine();
    let record = violation(
        "d1",
        base_time(),
        "cost_threshold",
        PolicyResult::Warn,
        Severity::Low,
    );

    let first = engine.record_decision(record.clone()).await.unwrap();
    assert!(!first.append.duplicate);
    let second = engine.record_decision(record.clone()).await.unwrap();
    assert!(second.append.duplicate);
    assert!(second.incident.is_none());

    let altered = DecisionRecord {
        cost_cents: record.cost_cents + 1,
        ..record
    };
    assert!(matches!(
        engine.record_decision(altered).await,
        Err(GovernanceError::Conflict(_))
    ));

    let incident = first.incident.unwrap();
    let incident = engine.incidents().get(&incident.id).await.unwrap();
    assert_eq!(incident.source_record_ids.len(), 1);
}

#[tokio::test]
async fn test_replay_stays_inside_incident_bounds() {
    let engine = engine();
    let t0 = base_time();

    engine
        .record_decision(passing("early", t0 - Duration::hours(1)))
        .await
        .unwrap();
    let mut incident_id = None;
    for i in 0..3 {
        let outcome = engine
            .record_decision(violation(
                &format!("d{}", i),
                t0 + Duration::seconds(30 * i),
                "cost_threshold",
                PolicyResult::Fail,
                Severity::Medium,
            ))
            .await
            .unwrap();
        incident_id = outcome.incident.map(|i| i.id);
    }
    engine
        .record_decision(passing("nearby", t0 + Duration::minutes(2)))
        .await
        .unwrap();
    engine
        .record_decision(passing("late", t0 + Duration::hours(2)))
        .await
        .unwrap();

    let incident_id = incident_id.unwrap();
    let incident = engine.incidents().get(&incident_id).await.unwrap();
    let window = Duration::seconds(120);
    let lower = incident.started_at - window;
    let upper = incident.ended_at.unwrap_or(incident.last_event_at) + window;

    let slice = engine
        .replay()
        .slice(
            &incident_id,
            SliceParams {
                window_seconds: Some(120),
                page_size: Some(500),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!slice.timeline.is_empty());
    assert!(slice
        .timeline
        .iter()
        .all(|item| lower <= item.timestamp && item.timestamp <= upper));
    assert!(slice.timeline.iter().any(|item| item.id.starts_with("nearby:")));
    assert!(!slice.timeline.iter().any(|item| item.id.starts_with("early:")));

    let timeline = engine.replay().timeline(&incident_id, None).await.unwrap();
    let default_window = Duration::seconds(engine.config().replay.default_window_secs as i64);
    assert!(timeline.iter().all(|item| {
        incident.started_at - default_window <= item.timestamp
            && item.timestamp <= incident.last_event_at + default_window
    }));
    assert!(!timeline.iter().any(|item| item.id.starts_with("late:")));
}

#[tokio::test]
async fn test_aggregation_cap_bounds_incident_count() {
    let engine = engine();
    let t0 = base_time();
    let cap = engine.incidents().config().hourly_incident_cap;

    let mut folded = 0;
    for i in 0..25 {
        let outcome = engine
            .record_decision(violation(
                &format!("d{}", i),
                t0 + Duration::minutes(2 * i),
                &format!("trigger_{}", i),
                PolicyResult::Warn,
                Severity::Low,
            ))
            .await
            .unwrap();
        if outcome.aggregation == Some(AggregationKind::Folded) {
            folded += 1;
        }
    }

    let incidents = engine
        .incidents()
        .list(&IncidentQuery::for_tenant(TenantId::new("t1")))
        .await
        .unwrap();
    assert!(incidents.len() <= cap + 1);
    assert_eq!(folded + incidents.len(), 25);
}

#[tokio::test]
async fn test_aggregation_cap_holds_across_quiet_gaps() {
    let engine = engine();
    let t0 = base_time();
    let cap = engine.incidents().config().hourly_incident_cap;
    let window = engine.incidents().config().window_secs as i64;

    for i in 0..cap as i64 {
        engine
            .record_decision(violation(
                &format!("burst{}", i),
                t0 + Duration::seconds(10 * i),
                &format!("trigger_{}", i),
                PolicyResult::Warn,
                Severity::Low,
            ))
            .await
            .unwrap();
    }

    // Each gap outlasts the window, so no incident is active when a record lands
    let mut at = t0 + Duration::seconds(10 * cap as i64);
    for i in 0..5 {
        at = at + Duration::seconds(window + 120);
        let outcome = engine
            .record_decision(violation(
                &format!("late{}", i),
                at,
                &format!("late_trigger_{}", i),
                PolicyResult::Warn,
                Severity::Low,
            ))
            .await
            .unwrap();
        assert_eq!(outcome.aggregation, Some(AggregationKind::Folded));
    }
    assert!(at < t0 + Duration::hours(1));

    let incidents = engine
        .incidents()
        .list(&IncidentQuery::for_tenant(TenantId::new("t1")))
        .await
        .unwrap();
    assert!(incidents.len() <= cap + 1);
    let folded: u32 = incidents.iter().map(|i| i.folded_record_count).sum();
    assert_eq!(folded, 5);
}

#[tokio::test]
async fn test_weak_recovery_raises_one_checkpoint_and_approval_unblocks() {
    let engine = engine();
    let outcome = engine
        .record_decision(violation(
            "d1",
            base_time(),
            "unlisted_trigger",
            PolicyResult::Fail,
            Severity::High,
        ))
        .await
        .unwrap();
    let incident_id = outcome.incident.unwrap().id;

    // The unknown trigger gets a novel pattern; approve it to reach pattern_matched
    let instance = engine.loops().get(&incident_id).await.unwrap();
    assert_eq!(instance.current_stage, LoopStage::IncidentDetected);
    engine
        .loops()
        .resolve_checkpoint(
            &instance.pending_checkpoints[0],
            CheckpointResolution::Approve,
            "alice",
            None,
        )
        .await
        .unwrap();

    // No playbook for an unmatched pattern: recovery comes back weak
    let instance = engine.loops().get(&incident_id).await.unwrap();
    assert_eq!(instance.current_stage, LoopStage::PatternMatched);
    assert!(instance.is_blocked);
    assert_eq!(instance.pending_checkpoints.len(), 1);
    let checkpoint = engine
        .loops()
        .get_checkpoint(&instance.pending_checkpoints[0])
        .await
        .unwrap();
    assert_eq!(checkpoint.checkpoint_type, CheckpointType::ApproveRecovery);
    assert_eq!(checkpoint.stage, Some(LoopStage::RecoverySuggested));
    assert_eq!(
        checkpoint.context["confidence_band"],
        serde_json::json!(ConfidenceBand::Weak)
    );

    engine
        .loops()
        .resolve_checkpoint(&checkpoint.id, CheckpointResolution::Approve, "alice", None)
        .await
        .unwrap();
    let instance = engine.loops().get(&incident_id).await.unwrap();
    assert!(instance.current_stage >= LoopStage::RecoverySuggested);
    assert!(instance.stage(LoopStage::RecoverySuggested).unwrap().completed);
    assert!(!instance.is_blocked);
    assert!(instance.is_complete);
}

#[tokio::test]
async fn test_checkpoint_resolves_exactly_once() {
    let engine = engine();
    let outcome = engine
        .record_decision(violation(
            "d1",
            base_time(),
            "unlisted_trigger",
            PolicyResult::Fail,
            Severity::High,
        ))
        .await
        .unwrap();
    let instance = outcome.loop_instance.unwrap();
    let checkpoint_id = instance.pending_checkpoints[0];

    let first = engine
        .loops()
        .resolve_checkpoint(
            &checkpoint_id,
            CheckpointResolution::Reject,
            "alice",
            Some("not convinced".to_string()),
        )
        .await
        .unwrap();

    let second = engine
        .loops()
        .resolve_checkpoint(&checkpoint_id, CheckpointResolution::Approve, "bob", None)
        .await;
    assert!(matches!(second, Err(GovernanceError::Conflict(_))));

    let stored = engine.loops().get_checkpoint(&checkpoint_id).await.unwrap();
    assert_eq!(stored.resolution, Some(CheckpointResolution::Reject));
    assert_eq!(stored.resolved_by.as_deref(), Some("alice"));
    assert_eq!(stored.resolved_at, first.resolved_at);
}

#[tokio::test]
async fn test_critical_incident_freezes_its_key() {
    let engine = engine();
    let outcome = engine
        .record_decision(violation(
            "d1",
            base_time(),
            "prompt_injection",
            PolicyResult::Blocked,
            Severity::Critical,
        ))
        .await
        .unwrap();

    let freeze = outcome.freeze.unwrap();
    assert!(freeze.is_frozen);
    assert!(freeze.auto_triggered);
    assert_eq!(freeze.trigger_type.as_deref(), Some("prompt_injection"));
    assert!(outcome.incident.unwrap().action_taken.starts_with("auto_freeze:"));

    assert!(engine.killswitch().is_frozen(&EntityRef::key("t1", "k1")).await);
    assert!(!engine.killswitch().is_frozen(&EntityRef::tenant("t1")).await);
}

#[tokio::test]
async fn test_graduation_from_loop_outcomes() {
    let engine = engine();
    let outcome = engine
        .record_decision(violation(
            "d1",
            base_time(),
            "cost_threshold",
            PolicyResult::Fail,
            Severity::High,
        ))
        .await
        .unwrap();
    let incident_id = outcome.incident.unwrap().id;
    let instance = outcome.loop_instance.unwrap();
    assert!(instance.is_complete);
    assert!(engine.graduation().status().await.unwrap().prevention.passed);

    engine
        .view_timeline(&incident_id, None, Some("alice"))
        .await
        .unwrap();
    let status = engine.graduation().status().await.unwrap();
    assert!(status.console_view.passed);
    assert!(!status.rollback.passed);
    assert!(!status.is_graduated);

    let regret = engine
        .record_regret(&incident_id, "spend cap hit a paying customer", "alice")
        .await
        .unwrap();
    assert!(regret.rolled_back);
    assert!(regret.loop_instance.unwrap().is_abandoned);
    assert!(regret.graduation.rollback.passed);
    assert!(regret.graduation.is_graduated);
}

#[tokio::test]
async fn test_graduation_survives_engine_restart() {
    let storage = Arc::new(InMemoryStorage::default());
    let engine = GovernanceEngine::new(storage.clone(), EngineConfig::default());
    let outcome = engine
        .record_decision(violation(
            "d1",
            base_time(),
            "cost_threshold",
            PolicyResult::Fail,
            Severity::Medium,
        ))
        .await
        .unwrap();
    let incident_id = outcome.incident.unwrap().id;
    engine
        .view_timeline(&incident_id, None, Some("alice"))
        .await
        .unwrap();
    let before = engine.graduation().status().await.unwrap();
    assert!(before.prevention.passed);
    assert!(before.console_view.passed);
    drop(engine);

    let restarted = GovernanceEngine::new(storage, EngineConfig::default());
    let after = restarted.graduation().load().await.unwrap();
    assert_eq!(after, before);
}
