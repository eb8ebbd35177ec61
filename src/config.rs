//! Bridge configuration.
//!
//! Loaded from TOML. Every section has defaults, so an empty file (or no
//! file) is a valid configuration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::events::EventBusConfig;
use crate::jobs::{JobManagerConfig, QueuePolicy};
use crate::monitoring::{RateLimitConfig, RateLimiter, TimeoutPolicy, UnitTimeouts};
use crate::trust::{TrustLevel, TrustPolicy};

/// Bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// General settings
    pub general: GeneralConfig,

    /// Job manager settings
    pub jobs: JobsConfig,

    /// Circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,

    /// Operation time budgets
    pub timeouts: TimeoutsConfig,

    /// Per-unit rate limiting
    pub rate_limit: RateLimitSection,

    /// Event bus sizing
    pub events: EventBusConfig,

    /// Install-time trust requirements
    pub trust: TrustConfig,

    /// Governance policy location
    pub governance: GovernanceSection,

    /// Audit log settings
    pub audit: AuditConfig,

    /// Development-mode reload settings
    pub hot_reload: HotReloadConfig,

    /// Per-unit configuration tables, keyed by unit id
    pub plugins: BTreeMap<String, toml::Table>,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enables hot reload and relaxes trust confirmation
    pub dev_mode: bool,

    /// Directory holding one sub-directory per installed unit
    pub plugins_dir: PathBuf,

    /// Directory for the audit log, trust store and governance file
    pub data_dir: Option<PathBuf>,

    /// Overrides the built-in host version
    pub host_version: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            dev_mode: false,
            plugins_dir: PathBuf::from(".jupiter").join("plugins"),
            data_dir: None,
            host_version: None,
        }
    }
}

/// Job manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub max_concurrent: usize,
    pub max_history: usize,
    pub queue_policy: QueuePolicy,
    pub cancel_grace_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self { max_concurrent: 4, max_history: 200, queue_policy: QueuePolicy::Queue, cancel_grace_ms: 2_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { threshold: 5, cooldown_secs: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub load_secs: u64,
    pub unload_secs: u64,
    pub health_secs: u64,
    pub job_secs: u64,
    pub overrides: HashMap<String, UnitTimeouts>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self { load_secs: 30, unload_secs: 10, health_secs: 5, job_secs: 600, overrides: HashMap::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub enabled: bool,
    pub requests: u32,
    pub window_secs: u64,
    pub burst: u32,
    pub overrides: HashMap<String, RateLimitConfig>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            enabled: true,
            requests: defaults.requests,
            window_secs: defaults.window_secs,
            burst: defaults.burst,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub min_level: TrustLevel,
    pub require_confirmation: bool,
    /// Trust store JSON; in-memory only when unset
    pub store_path: Option<PathBuf>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        let policy = TrustPolicy::default();
        Self { min_level: policy.min_level, require_confirmation: policy.require_confirmation, store_path: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceSection {
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON Lines sink; in-memory only when unset
    pub log_path: Option<PathBuf>,
    pub max_entries: usize,
    /// Alert thresholds JSON; built-in defaults when unset
    pub alerts_path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { log_path: None, max_entries: 10_000, alerts_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Units that may never be hot reloaded
    pub protected: BTreeSet<String>,
    pub history_size: usize,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self { protected: BTreeSet::new(), history_size: 50 }
    }
}

impl BridgeConfig {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.jupiter/bridge.toml` in current directory
    /// 2. `~/.config/jupiter/bridge.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from(".jupiter").join("bridge.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("bridge.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as TOML.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("jupiter"))
    }

    /// Data directory: `[general] data_dir`, else the platform data dir.
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.general.data_dir.clone().or_else(|| dirs::data_dir().map(|d| d.join("jupiter")))
    }

    pub fn validate(&self) -> BridgeResult<()> {
        let invalid = |msg: &str| Err(BridgeError::Validation(msg.to_string()));

        if self.jobs.max_concurrent == 0 {
            return invalid("jobs.max_concurrent must be at least 1");
        }
        if self.circuit_breaker.threshold == 0 {
            return invalid("circuit_breaker.threshold must be at least 1");
        }
        if self.timeouts.load_secs == 0
            || self.timeouts.unload_secs == 0
            || self.timeouts.health_secs == 0
            || self.timeouts.job_secs == 0
        {
            return invalid("timeouts must be greater than zero");
        }
        if self.rate_limit.enabled && (self.rate_limit.window_secs == 0 || self.rate_limit.burst == 0) {
            return invalid("rate_limit.window_secs and rate_limit.burst must be greater than zero");
        }
        if self.events.subscriber_queue == 0 {
            return invalid("events.subscriber_queue must be at least 1");
        }
        if self.audit.max_entries == 0 {
            return invalid("audit.max_entries must be at least 1");
        }
        if let Some(raw) = &self.general.host_version {
            Version::parse(raw)
                .map_err(|e| BridgeError::Validation(format!("general.host_version '{raw}': {e}")))?;
        }
        Ok(())
    }

    /// Host version in force: the override, else the built-in one.
    pub fn host_version(&self) -> Version {
        self.general
            .host_version
            .as_deref()
            .and_then(|raw| Version::parse(raw).ok())
            .unwrap_or_else(crate::host_version)
    }

    pub fn job_manager_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            max_concurrent: self.jobs.max_concurrent,
            max_history: self.jobs.max_history,
            queue_policy: self.jobs.queue_policy,
            cancel_grace: Duration::from_millis(self.jobs.cancel_grace_ms),
            breaker_threshold: self.circuit_breaker.threshold,
            breaker_cooldown: Duration::from_secs(self.circuit_breaker.cooldown_secs),
        }
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            load: Duration::from_secs(self.timeouts.load_secs),
            unload: Duration::from_secs(self.timeouts.unload_secs),
            health: Duration::from_secs(self.timeouts.health_secs),
            job: Duration::from_secs(self.timeouts.job_secs),
            overrides: self.timeouts.overrides.clone(),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        if !self.rate_limit.enabled {
            return RateLimiter::disabled();
        }
        RateLimiter::new(
            RateLimitConfig {
                requests: self.rate_limit.requests,
                window_secs: self.rate_limit.window_secs,
                burst: self.rate_limit.burst,
            },
            self.rate_limit.overrides.clone(),
        )
    }

    pub fn trust_policy(&self) -> TrustPolicy {
        TrustPolicy { min_level: self.trust.min_level, require_confirmation: self.trust.require_confirmation }
    }

    /// A unit's effective configuration: manifest defaults overlaid with
    /// its `[plugins.<id>]` table.
    pub fn unit_config(
        &self,
        unit_id: &str,
        defaults: &serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut merged = defaults.clone();
        if let Some(table) = self.plugins.get(unit_id) {
            match serde_json::to_value(table) {
                Ok(serde_json::Value::Object(overrides)) => merged.extend(overrides),
                Ok(_) => {}
                Err(e) => tracing::warn!(unit = %unit_id, error = %e, "Ignoring unit config table"),
            }
        }
        merged
    }
}
