//! Engine tuning knobs
//!
//! The daemon deserializes these straight out of its layered configuration,
//! so every field carries a serde default.

use serde::{Deserialize, Serialize};
use warden_types::Severity;

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub killswitch: KillSwitchConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub automation: AutomationConfig,

    #[serde(default)]
    pub graduation: GraduationConfig,
}

/// Incident aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Sliding window per tenant and trigger type
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Maximum incidents a tenant may open per rolling hour
    #[serde(default = "default_hourly_cap")]
    pub hourly_incident_cap: usize,

    /// How often the sweeper auto-resolves expired incidents
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl AggregationConfig {
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs as i64)
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            hourly_incident_cap: default_hourly_cap(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Kill-switch automation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchConfig {
    #[serde(default = "default_true")]
    pub auto_freeze_enabled: bool,

    /// Incidents at or above this severity freeze the offending entity
    #[serde(default = "default_auto_freeze_severity")]
    pub auto_freeze_min_severity: Severity,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            auto_freeze_enabled: true,
            auto_freeze_min_severity: default_auto_freeze_severity(),
        }
    }
}

/// Replay limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_window_secs")]
    pub default_window_secs: u64,

    #[serde(default = "default_max_window")]
    pub max_window_secs: u64,

    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    #[serde(default = "default_max_timeline")]
    pub max_timeline_limit: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            default_window_secs: default_window_secs(),
            max_window_secs: default_max_window(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            max_timeline_limit: default_max_timeline(),
        }
    }
}

/// Integration loop spawning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Incidents below this severity get no loop
    #[serde(default = "default_automation_severity")]
    pub min_severity: Severity,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: default_automation_severity(),
        }
    }
}

/// Graduation evaluator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraduationConfig {
    /// Enables the simulate endpoints. Keep off in production.
    #[serde(default)]
    pub allow_simulation: bool,
}

fn default_true() -> bool {
    true
}

fn default_window_secs() -> u64 {
    300
}

fn default_hourly_cap() -> usize {
    20
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_auto_freeze_severity() -> Severity {
    Severity::Critical
}

fn default_max_window() -> u64 {
    86_400
}

fn default_page_size() -> usize {
    50
}

fn default_max_page_size() -> usize {
    500
}

fn default_max_timeline() -> usize {
    5_000
}

fn default_automation_severity() -> Severity {
    Severity::Medium
}
