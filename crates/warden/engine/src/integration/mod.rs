//! Integration loop: per-incident staged automation gated by human checkpoints

mod bus;
mod controller;
mod defaults;
mod handlers;
mod narrative;

pub use bus::LoopEventBus;
pub use controller::{
    LoopController, LoopStats, LoopSubscription, RegretOutcome, LOOP_ACTOR, REGRET_ACTOR,
};
pub use defaults::{
    CatalogPatternMatcher, PlaybookRecoveryEngine, RecordingRoutingAdjuster,
    TemplatePolicyGenerator,
};
pub use handlers::{
    HandlerError, HandlerResult, LoopContext, PatternMatcher, PolicyGenerator, RecoveryEngine,
    RoutingAdjuster, StageHandler, StageHandlers, StageOutcome,
};
pub use narrative::narrate;
