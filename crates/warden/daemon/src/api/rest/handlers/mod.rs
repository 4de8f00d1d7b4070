//! API request handlers

mod checkpoints;
mod decisions;
mod graduation;
mod incidents;
mod killswitch;
mod loops;
mod replay;
mod system;

pub use checkpoints::*;
pub use decisions::*;
pub use graduation::*;
pub use incidents::*;
pub use killswitch::*;
pub use loops::*;
pub use replay::*;
pub use system::*;

use crate::error::{ApiError, ApiResult};
use warden_types::{CheckpointId, IncidentId};

fn parse_incident_id(id: &str) -> ApiResult<IncidentId> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid incident ID: {}", id)))
}

fn parse_checkpoint_id(id: &str) -> ApiResult<CheckpointId> {
    id.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid checkpoint ID: {}", id)))
}

/// Parse an optional query value through `FromStr`
fn parse_opt<T>(field: &str, value: Option<&str>) -> ApiResult<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .map(|raw| {
            raw.parse()
                .map_err(|e: String| ApiError::BadRequest(format!("{}: {}", field, e)))
        })
        .transpose()
}
