//! Storage layer for the governance engine

mod memory;
mod model;
#[cfg(feature = "postgres")]
mod postgres;
mod traits;

pub use memory::InMemoryStorage;
pub use model::{CheckpointQuery, DecisionQuery, IncidentQuery, InsertOutcome, StoredDecision};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;
pub use traits::*;
