//! Warden daemon library
//!
//! This module provides the components of the `wardend` service:
//! - REST API over the governance engine
//! - Live integration-loop streams (SSE)
//! - Background incident sweeping
//! - Server lifecycle management

pub mod api;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod server;

pub use api::rest::state::AppState;
pub use api::create_router;
pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError, DaemonResult};
pub use scheduler::Sweeper;
pub use server::Server;
