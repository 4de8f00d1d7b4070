//! REST API over the governance engine

pub mod handlers;
pub mod router;
pub mod state;
