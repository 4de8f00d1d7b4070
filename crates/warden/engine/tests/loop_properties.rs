//! Property tests for integration loop transitions

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use warden_engine::{EngineConfig, GovernanceEngine, InMemoryStorage};
use warden_types::{
    CheckpointResolution, DecisionId, DecisionRecord, KeyId, LoopInstance, LoopStage,
    PolicyEvaluation, PolicyResult, Severity, TenantId, TransitionKind,
};

#[derive(Debug, Clone)]
enum Op {
    Approve,
    Reject,
    Retry,
    Revert { to: usize, abandon: bool },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => Just(Op::Approve),
        1 => Just(Op::Reject),
        2 => Just(Op::Retry),
        1 => (0..LoopStage::ALL.len(), prop::bool::weighted(0.2))
            .prop_map(|(to, abandon)| Op::Revert { to, abandon }),
    ]
}

fn severity_strategy() -> impl Strategy<Value = Severity> {
    prop::sample::select(vec![Severity::Medium, Severity::High, Severity::Critical])
}

fn record(trigger: &str, severity: Severity) -> DecisionRecord {
    DecisionRecord {
        id: DecisionId::new("d1"),
        tenant_id: TenantId::new("t1"),
        key_id: Some(KeyId::new("k1")),
        run_id: None,
        timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        evaluations: vec![PolicyEvaluation::new("guard", PolicyResult::Fail, "violation")
            .with_trigger(trigger)
            .with_severity(severity)],
        model: "gpt-4o".to_string(),
        input_hash: "in".to_string(),
        output_hash: "out".to_string(),
        cost_cents: 10,
        latency_ms: 100,
    }
}

async fn run_ops(trigger: &str, severity: Severity, ops: Vec<Op>) -> LoopInstance {
    let engine = GovernanceEngine::new(Arc::new(InMemoryStorage::default()), EngineConfig::default());
    let outcome = engine.record_decision(record(trigger, severity)).await.unwrap();
    let incident_id = outcome.incident.unwrap().id;
    let loops = engine.loops();

    // Operator actions may legitimately be refused; only the resulting walk matters
    for op in ops {
        let instance = loops.get(&incident_id).await.unwrap();
        match op {
            Op::Approve | Op::Reject => {
                if let Some(checkpoint_id) = instance.pending_checkpoints.first() {
                    let resolution = if matches!(op, Op::Approve) {
                        CheckpointResolution::Approve
                    } else {
                        CheckpointResolution::Reject
                    };
                    let _ = loops
                        .resolve_checkpoint(checkpoint_id, resolution, "operator", None)
                        .await;
                }
            }
            Op::Retry => {
                if let Some(stage) = instance.next_stage() {
                    let _ = loops.retry(&incident_id, stage, "operator").await;
                }
            }
            Op::Revert { to, abandon } => {
                let _ = loops
                    .revert(&incident_id, LoopStage::ALL[to], "operator", abandon)
                    .await;
            }
        }
    }

    loops.get(&incident_id).await.unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stage_walk_only_moves_back_through_revert(
        trigger in prop::sample::select(vec!["cost_threshold", "rate_limit", "unlisted_trigger"]),
        severity in severity_strategy(),
        ops in prop::collection::vec(op_strategy(), 0..16),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let instance = runtime.block_on(run_ops(trigger, severity, ops));

        let mut current = LoopStage::IncidentDetected;
        for transition in &instance.history {
            prop_assert_eq!(transition.from, current);
            match transition.kind {
                TransitionKind::Advance => prop_assert_eq!(transition.from.next(), Some(transition.to)),
                TransitionKind::Revert => prop_assert!(transition.to < transition.from),
                TransitionKind::Abandon => prop_assert!(transition.to <= transition.from),
            }
            current = transition.to;
        }
        prop_assert_eq!(instance.current_stage, current);

        if instance.is_complete {
            prop_assert_eq!(instance.current_stage, LoopStage::LoopComplete);
        }
        // Completed stages form a prefix of the pipeline
        let completed: Vec<bool> = LoopStage::ALL
            .iter()
            .map(|stage| instance.stage(*stage).map_or(false, |s| s.completed))
            .collect();
        prop_assert!(completed.windows(2).all(|w| w[0] || !w[1]));
        prop_assert!(completed[instance.current_stage.index()]);
    }
}
