//! Warden Types - core types for AI workload governance
//!
//! Warden records every policy-evaluated decision made when a tenant's agent
//! calls an external model, groups related decisions into incidents, enforces
//! a cascading kill-switch, replays evidence, and drives a staged
//! self-healing loop gated by human checkpoints.
//!
//! ## Key Concepts
//!
//! - **DecisionRecord**: Immutable audit entry for one policy-evaluated call
//! - **Incident**: Aggregation of decision records sharing a trigger within a window
//! - **FreezeState**: Kill-switch state for a tenant or an API key
//! - **ReplayItem**: Read-only projection of ledger evidence for an incident
//! - **LoopInstance**: Per-incident automation pipeline state
//! - **HumanCheckpoint**: Operator gate blocking loop progression
//! - **GraduationStatus**: Evidence for promoting automation out of shadow mode

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod checkpoint;
pub mod decision;
pub mod events;
pub mod graduation;
pub mod ids;
pub mod incident;
pub mod integration;
pub mod killswitch;
pub mod replay;

pub use checkpoint::{CheckpointResolution, CheckpointType, HumanCheckpoint};
pub use decision::{DecisionRecord, PolicyEvaluation, PolicyResult};
pub use events::{LoopEvent, LoopEventEnvelope};
pub use graduation::{
    ConsoleViewEvent, GateEvidence, GraduationEvent, GraduationStatus, PreventionEvent,
    RegretEvent,
};
pub use ids::{CheckpointId, DecisionId, IdParseError, IncidentId, KeyId, TenantId};
pub use incident::{Incident, IncidentLifecycle, IncidentStatus, Severity};
pub use integration::{
    ConfidenceBand, FailureState, LoopInstance, LoopNarrative, LoopStage, StageStatus,
    StageTransition, TransitionKind,
};
pub use killswitch::{AdmissionDecision, EntityRef, EntityType, FreezeState, RejectionReason};
pub use replay::{
    ReplayCategory, ReplayExplanation, ReplayItem, ReplaySliceResponse, ReplaySummary,
};
