//! Graduation gate evaluator
//!
//! Three independent gates decide whether automation may move from shadow
//! to active mode. Gates are monotonic: once a gate passes, later evidence
//! is appended but never retracts it.
//!
//! Every event is persisted before it is applied. The gates are rebuilt by
//! replaying the stored events, so a restart keeps what was already proven.

use crate::error::{require_actor, GovernanceError, GovernanceResult};
use crate::storage::GraduationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;
use warden_types::{
    ConsoleViewEvent, GateEvidence, GraduationEvent, GraduationStatus, IncidentId,
    PreventionEvent, RegretEvent, TenantId,
};

/// Tenant recorded on simulated evidence
pub const SIMULATION_TENANT: &str = "system:simulation";

/// Evidence lines kept per gate for the status view
const MAX_EVIDENCE_LINES: usize = 100;

/// Evidence kinds accepted by the simulate entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SimulationKind {
    Prevention,
    Regret,
    TimelineView,
}

impl std::str::FromStr for SimulationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prevention" => Ok(SimulationKind::Prevention),
            "regret" => Ok(SimulationKind::Regret),
            "timeline-view" => Ok(SimulationKind::TimelineView),
            other => Err(format!("unknown simulation kind '{}'", other)),
        }
    }
}

#[derive(Debug, Default)]
struct GateState {
    prevention: Gate,
    rollback: Gate,
    console_view: Gate,
    /// Only tracked until the console gate passes
    prevented_incidents: HashSet<IncidentId>,
    viewed_incidents: HashSet<IncidentId>,
    latest_prevention: Option<(IncidentId, TenantId)>,
}

impl GateState {
    fn apply(&mut self, event: &GraduationEvent) {
        match event {
            GraduationEvent::Prevention(event) => self.apply_prevention(event),
            GraduationEvent::Regret(event) => self.apply_regret(event),
            GraduationEvent::ConsoleView(event) => self.apply_console_view(event),
        }
    }

    fn apply_prevention(&mut self, event: &PreventionEvent) {
        self.prevention.note(format!(
            "{} prevention for {}: {}",
            if event.verified { "verified" } else { "unverified" },
            event.incident_id,
            event.description
        ));
        if !event.verified {
            return;
        }

        self.prevention.pass(event.recorded_at);
        self.latest_prevention = Some((event.incident_id, event.tenant_id.clone()));
        if self.console_view.passed() {
            return;
        }
        // A view may have arrived before its prevention was verified
        if self.viewed_incidents.contains(&event.incident_id) {
            self.pass_console_view(event.recorded_at);
        } else {
            self.prevented_incidents.insert(event.incident_id);
        }
    }

    fn apply_regret(&mut self, event: &RegretEvent) {
        self.rollback.note(format!(
            "regret on {} ({}): {}",
            event.incident_id,
            if event.rolled_back {
                "rolled back automatically"
            } else {
                "not rolled back"
            },
            event.reason
        ));
        if event.rolled_back {
            self.rollback.pass(event.recorded_at);
        }
    }

    fn apply_console_view(&mut self, event: &ConsoleViewEvent) {
        self.console_view.note(format!(
            "{} viewed timeline of {}",
            event.viewer, event.incident_id
        ));
        if self.console_view.passed() {
            return;
        }
        if self.prevented_incidents.contains(&event.incident_id) {
            self.pass_console_view(event.recorded_at);
        } else {
            self.viewed_incidents.insert(event.incident_id);
        }
    }

    fn pass_console_view(&mut self, at: DateTime<Utc>) {
        self.console_view.pass(at);
        self.prevented_incidents = HashSet::new();
        self.viewed_incidents = HashSet::new();
    }

    fn snapshot(&self) -> GraduationStatus {
        GraduationStatus::from_gates(
            self.prevention.evidence(),
            self.rollback.evidence(),
            self.console_view.evidence(),
        )
    }
}

#[derive(Debug, Clone, Default)]
struct Gate {
    passed_at: Option<DateTime<Utc>>,
    evidence: VecDeque<String>,
    total: usize,
}

impl Gate {
    fn note(&mut self, line: String) {
        if self.evidence.len() == MAX_EVIDENCE_LINES {
            self.evidence.pop_front();
        }
        self.evidence.push_back(line);
        self.total += 1;
    }

    fn pass(&mut self, at: DateTime<Utc>) {
        if self.passed_at.is_none() {
            self.passed_at = Some(at);
        }
    }

    fn passed(&self) -> bool {
        self.passed_at.is_some()
    }

    fn evidence(&self) -> GateEvidence {
        GateEvidence {
            passed: self.passed(),
            evidence: self.evidence.iter().cloned().collect(),
            evidence_total: self.total,
            passed_at: self.passed_at,
        }
    }
}

/// Accumulates loop outcomes into promotion evidence
pub struct GraduationEvaluator {
    store: Arc<dyn GraduationStore>,
    state: OnceCell<RwLock<GateState>>,
}

impl GraduationEvaluator {
    /// Evidence is read from `store` on first use, or by [`load`](Self::load)
    pub fn new(store: Arc<dyn GraduationStore>) -> Self {
        Self {
            store,
            state: OnceCell::new(),
        }
    }

    async fn gates(&self) -> GovernanceResult<&RwLock<GateState>> {
        self.state
            .get_or_try_init(|| async {
                let events = self.store.list_graduation_events().await?;
                let mut state = GateState::default();
                for event in &events {
                    state.apply(event);
                }
                info!(
                    events = events.len(),
                    graduated = state.snapshot().is_graduated,
                    "Graduation evidence loaded"
                );
                Ok::<_, GovernanceError>(RwLock::new(state))
            })
            .await
    }

    /// Read persisted evidence now instead of on first use
    pub async fn load(&self) -> GovernanceResult<GraduationStatus> {
        self.status().await
    }

    /// Persist, then apply. The write lock keeps store order and gate order equal.
    async fn record(&self, event: GraduationEvent) -> GovernanceResult<GraduationStatus> {
        let mut state = self.gates().await?.write().await;
        self.store.append_graduation_event(event.clone()).await?;
        state.apply(&event);
        Ok(state.snapshot())
    }

    /// Gate 1 passes on the first verified prevention
    pub async fn record_prevention(
        &self,
        event: PreventionEvent,
    ) -> GovernanceResult<GraduationStatus> {
        let (incident_id, verified) = (event.incident_id, event.verified);
        let status = self.record(GraduationEvent::Prevention(event)).await?;
        info!(incident_id = %incident_id, verified, "Prevention recorded");
        Ok(status)
    }

    /// Gate 2 passes once a regret was answered by an automatic rollback.
    ///
    /// Only the loop controller decides `rolled_back`, after running the
    /// rollback itself.
    pub(crate) async fn record_regret(
        &self,
        event: RegretEvent,
    ) -> GovernanceResult<GraduationStatus> {
        let (incident_id, rolled_back) = (event.incident_id, event.rolled_back);
        let status = self.record(GraduationEvent::Regret(event)).await?;
        info!(incident_id = %incident_id, rolled_back, "Regret recorded");
        Ok(status)
    }

    /// Gate 3 passes once a human viewed the timeline of a prevented incident
    pub async fn record_console_view(
        &self,
        event: ConsoleViewEvent,
    ) -> GovernanceResult<GraduationStatus> {
        self.record(GraduationEvent::ConsoleView(event)).await
    }

    pub async fn status(&self) -> GovernanceResult<GraduationStatus> {
        Ok(self.gates().await?.read().await.snapshot())
    }

    /// Fast-track evidence for demos and tests. Callers gate this on
    /// configuration; it must stay disabled in production.
    pub async fn simulate(
        &self,
        kind: SimulationKind,
        actor: &str,
    ) -> GovernanceResult<GraduationStatus> {
        require_actor(actor)?;
        let now = Utc::now();
        match kind {
            SimulationKind::Prevention => {
                self.record_prevention(PreventionEvent {
                    incident_id: IncidentId::generate(),
                    tenant_id: TenantId::new(SIMULATION_TENANT),
                    description: format!("simulated by {}", actor),
                    verified: true,
                    recorded_at: now,
                })
                .await
            }
            SimulationKind::Regret => {
                self.record_regret(RegretEvent {
                    incident_id: IncidentId::generate(),
                    tenant_id: TenantId::new(SIMULATION_TENANT),
                    reason: format!("simulated by {}", actor),
                    rolled_back: true,
                    recorded_at: now,
                })
                .await
            }
            SimulationKind::TimelineView => {
                let (incident_id, tenant_id) = self
                    .gates()
                    .await?
                    .read()
                    .await
                    .latest_prevention
                    .clone()
                    .ok_or_else(|| {
                        GovernanceError::conflict(
                            "no prevented incident to view; record a prevention first",
                        )
                    })?;
                self.record_console_view(ConsoleViewEvent {
                    incident_id,
                    tenant_id,
                    viewer: actor.to_string(),
                    recorded_at: now,
                })
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn evaluator() -> GraduationEvaluator {
        GraduationEvaluator::new(Arc::new(InMemoryStorage::new()))
    }

    fn prevention(incident_id: IncidentId, verified: bool) -> PreventionEvent {
        PreventionEvent {
            incident_id,
            tenant_id: TenantId::new("t1"),
            description: "budget policy blocked repeat".to_string(),
            verified,
            recorded_at: Utc::now(),
        }
    }

    fn regret(reason: &str, rolled_back: bool) -> RegretEvent {
        RegretEvent {
            incident_id: IncidentId::generate(),
            tenant_id: TenantId::new("t1"),
            reason: reason.to_string(),
            rolled_back,
            recorded_at: Utc::now(),
        }
    }

    fn view(incident_id: IncidentId) -> ConsoleViewEvent {
        ConsoleViewEvent {
            incident_id,
            tenant_id: TenantId::new("t1"),
            viewer: "alice".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_all_gates_required() {
        let evaluator = evaluator();
        let incident = IncidentId::generate();

        let status = evaluator.record_prevention(prevention(incident, true)).await.unwrap();
        assert!(status.prevention.passed);
        assert!(!status.is_graduated);

        let status = evaluator.record_console_view(view(incident)).await.unwrap();
        assert!(status.console_view.passed);
        assert!(!status.is_graduated);

        let status = evaluator.record_regret(regret("bad routing", true)).await.unwrap();
        assert!(status.rollback.passed);
        assert!(status.is_graduated);
    }

    #[tokio::test]
    async fn test_unverified_prevention_does_not_pass() {
        let evaluator = evaluator();
        let status = evaluator
            .record_prevention(prevention(IncidentId::generate(), false))
            .await
            .unwrap();
        assert!(!status.prevention.passed);
        assert_eq!(status.prevention.evidence.len(), 1);
    }

    #[tokio::test]
    async fn test_regret_without_rollback_does_not_pass() {
        let evaluator = evaluator();
        let status = evaluator.record_regret(regret("noisy", false)).await.unwrap();
        assert!(!status.rollback.passed);
    }

    #[tokio::test]
    async fn test_view_of_unprevented_incident_counts_once_prevented() {
        let evaluator = evaluator();
        let incident = IncidentId::generate();

        let status = evaluator.record_console_view(view(incident)).await.unwrap();
        assert!(!status.console_view.passed);

        let status = evaluator.record_prevention(prevention(incident, true)).await.unwrap();
        assert!(status.console_view.passed);
    }

    #[tokio::test]
    async fn test_gates_are_monotonic() {
        let evaluator = evaluator();
        let status = evaluator.record_regret(regret("first", true)).await.unwrap();
        let passed_at = status.rollback.passed_at;

        let status = evaluator
            .record_regret(regret("rollback failed", false))
            .await
            .unwrap();
        assert!(status.rollback.passed);
        assert_eq!(status.rollback.passed_at, passed_at);
        assert_eq!(status.rollback.evidence.len(), 2);
    }

    #[tokio::test]
    async fn test_evidence_survives_restart() {
        let storage = Arc::new(InMemoryStorage::new());
        let incident = IncidentId::generate();
        let before = {
            let evaluator = GraduationEvaluator::new(storage.clone());
            evaluator.record_prevention(prevention(incident, true)).await.unwrap();
            evaluator.record_regret(regret("bad routing", true)).await.unwrap();
            evaluator.record_console_view(view(incident)).await.unwrap()
        };
        assert!(before.is_graduated);

        let restarted = GraduationEvaluator::new(storage);
        let after = restarted.load().await.unwrap();
        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_evidence_lines_are_bounded() {
        let evaluator = evaluator();
        for i in 0..(MAX_EVIDENCE_LINES + 5) {
            evaluator
                .record_regret(regret(&format!("regret {}", i), false))
                .await
                .unwrap();
        }
        let status = evaluator.status().await.unwrap();
        assert_eq!(status.rollback.evidence.len(), MAX_EVIDENCE_LINES);
        assert_eq!(status.rollback.evidence_total, MAX_EVIDENCE_LINES + 5);
        assert!(status.rollback.evidence[0].ends_with("regret 5"));
    }

    #[tokio::test]
    async fn test_simulated_view_needs_prevention() {
        let evaluator = evaluator();
        assert!(matches!(
            evaluator.simulate(SimulationKind::TimelineView, "demo").await,
            Err(GovernanceError::Conflict(_))
        ));

        evaluator
            .simulate(SimulationKind::Prevention, "demo")
            .await
            .unwrap();
        evaluator.simulate(SimulationKind::Regret, "demo").await.unwrap();
        let status = evaluator
            .simulate(SimulationKind::TimelineView, "demo")
            .await
            .unwrap();
        assert!(status.is_graduated);
        assert_eq!("timeline-view".parse::<SimulationKind>().unwrap(), SimulationKind::TimelineView);
    }
}
