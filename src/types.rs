//! Core plugin types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type of plugin unit.
///
/// Ordering matters: core units always load before system units, which
/// load before tools when dependencies leave the choice open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    /// Hard-registered by the host, never discovered from disk.
    Core,
    /// First-party system extension.
    System,
    /// Third-party tool extension.
    Tool,
}

impl UnitType {
    /// Get the display name for this unit type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Core => "Core",
            Self::System => "System",
            Self::Tool => "Tool",
        }
    }

    /// Parse from the manifest spelling.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "core" => Some(Self::Core),
            "system" => Some(Self::System),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for UnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Lifecycle state of a plugin record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Found and parsed, not yet loaded.
    Discovered,
    /// Init entrypoint in progress.
    Loading,
    /// Initialized and serving.
    Ready,
    /// Failed validation, dependencies, or init.
    Error,
    /// Turned off by governance or an operator.
    Disabled,
}

impl PluginState {
    /// Whether `self -> next` is a legal edge of the lifecycle graph.
    ///
    /// `Ready -> Loading` and `Error -> Loading` are only taken by an
    /// explicit reload or restart.
    pub fn can_transition_to(self, next: Self) -> bool {
        use PluginState::{Disabled, Discovered, Error, Loading, Ready};
        matches!(
            (self, next),
            (Discovered, Loading | Error | Disabled)
                | (Loading, Ready | Error)
                | (Ready, Disabled | Loading)
                | (Disabled, Loading)
                | (Error, Loading)
        )
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of a unit as reported by its `health` entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Snapshot of the last health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Snapshot for a unit that was never checked.
    pub fn unknown() -> Self {
        Self { status: HealthStatus::Unknown, message: None, checked_at: Utc::now() }
    }

    /// Snapshot with the given status and message.
    pub fn new(status: HealthStatus, message: Option<String>) -> Self {
        Self { status, message, checked_at: Utc::now() }
    }
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Host version that `jupiter_version` requirements are checked against.
pub const HOST_VERSION: &str = "1.4.0";

/// Manifest file names, in lookup order.
pub const MANIFEST_FILE: &str = "plugin.toml";
pub const MANIFEST_JSON_FILE: &str = "plugin.json";

/// Default signature file name.
pub const SIGNATURE_FILE: &str = "plugin.sig";

/// Standard event topics.
pub mod topics {
    pub const PLUGIN_LOADED: &str = "plugin.loaded";
    pub const PLUGIN_ERROR: &str = "plugin.error";
    pub const PLUGIN_DISABLED: &str = "plugin.disabled";
    pub const PLUGIN_RELOADED: &str = "plugin.reloaded";
    pub const PLUGIN_RELOAD_FAILED: &str = "plugin.reload_failed";
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_PROGRESS: &str = "job.progress";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const JOB_CANCELLED: &str = "job.cancelled";
    pub const CONFIG_CHANGED: &str = "config.changed";
}
