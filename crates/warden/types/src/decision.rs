//! Decision records written to the ledger at call-completion time

use crate::ids::{DecisionId, KeyId, TenantId};
use crate::incident::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of evaluating one policy against a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyResult {
    Pass,
    Fail,
    Warn,
    Blocked,
}

impl PolicyResult {
    /// Whether this result counts toward incident aggregation
    pub fn is_violation(&self) -> bool {
        !matches!(self, PolicyResult::Pass)
    }

    /// Severity implied by the result when the policy does not state one
    pub fn implied_severity(&self) -> Severity {
        match self {
            PolicyResult::Blocked => Severity::Critical,
            PolicyResult::Fail => Severity::High,
            PolicyResult::Warn => Severity::Medium,
            PolicyResult::Pass => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyResult::Pass => "PASS",
            PolicyResult::Fail => "FAIL",
            PolicyResult::Warn => "WARN",
            PolicyResult::Blocked => "BLOCKED",
        }
    }
}

/// One policy evaluation within a decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub policy_id: String,
    pub result: PolicyResult,
    pub reason: String,

    /// Trigger family this policy reports under (e.g. `cost_threshold`).
    /// Falls back to `policy_id` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<String>,

    /// Explicit severity assigned by the policy author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl PolicyEvaluation {
    pub fn new(policy_id: impl Into<String>, result: PolicyResult, reason: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into(),
            result,
            reason: reason.into(),
            trigger_type: None,
            severity: None,
        }
    }

    pub fn with_trigger(mut self, trigger_type: impl Into<String>) -> Self {
        self.trigger_type = Some(trigger_type.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn trigger(&self) -> &str {
        self.trigger_type.as_deref().unwrap_or(&self.policy_id)
    }

    pub fn effective_severity(&self) -> Severity {
        self.severity
            .unwrap_or_else(|| self.result.implied_severity())
    }
}

/// Immutable audit entry for one policy-evaluated AI call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: DecisionId,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<KeyId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub evaluations: Vec<PolicyEvaluation>,
    pub model: String,
    pub input_hash: String,
    pub output_hash: String,
    pub cost_cents: i64,
    pub latency_ms: u64,
}

impl DecisionRecord {
    /// Evaluations that did not pass, in evaluation order
    pub fn violations(&self) -> impl Iterator<Item = &PolicyEvaluation> {
        self.evaluations.iter().filter(|e| e.result.is_violation())
    }

    pub fn is_violation(&self) -> bool {
        self.violations().next().is_some()
    }

    pub fn is_blocked(&self) -> bool {
        self.evaluations
            .iter()
            .any(|e| e.result == PolicyResult::Blocked)
    }

    /// Highest-severity violation; the first one wins ties
    pub fn primary_violation(&self) -> Option<&PolicyEvaluation> {
        self.violations().fold(None, |best, eval| match best {
            Some(current) if current.effective_severity() >= eval.effective_severity() => {
                Some(current)
            }
            _ => Some(eval),
        })
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.violations().map(|e| e.effective_severity()).max()
    }
}
