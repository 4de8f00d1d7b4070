//! Strongly-typed identifiers for Warden entities
//!
//! Incidents and checkpoints are UUID-based; tenants, keys and decisions are
//! caller-assigned strings. All are wrapped in newtypes for type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Error returned when an identifier cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {kind} id: {value}")]
pub struct IdParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Unique identifier for an incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentId(Uuid);

impl IncidentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for IncidentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "incident:{}", self.0)
    }
}

impl FromStr for IncidentId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("incident:").unwrap_or(s);
        Uuid::parse_str(raw).map(Self).map_err(|_| IdParseError {
            kind: "incident",
            value: s.to_string(),
        })
    }
}

/// Unique identifier for a human checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checkpoint:{}", self.0)
    }
}

impl FromStr for CheckpointId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("checkpoint:").unwrap_or(s);
        Uuid::parse_str(raw).map(Self).map_err(|_| IdParseError {
            kind: "checkpoint",
            value: s.to_string(),
        })
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Tenant owning governed AI workloads
    TenantId
);
string_id!(
    /// API key issued to a tenant
    KeyId
);
string_id!(
    /// Caller-assigned id of a decision record, stable across retries of the same call
    DecisionId
);
