//! Governance: which units may load, and which features are switched on.
//!
//! The policy is a TOML document with a mode, allow and deny lists, a
//! `protected` set that is never denied, and global or per-unit feature
//! flags. Units are checked before they enter `Loading`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// How the allow and deny lists are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernanceMode {
    /// Everything is allowed.
    #[default]
    Disabled,
    /// Deny by default, allow what is listed.
    Whitelist,
    /// Allow by default, deny what is listed.
    Blacklist,
}

impl GovernanceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Whitelist => "whitelist",
            Self::Blacklist => "blacklist",
        }
    }
}

/// A named switch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlag {
    pub enabled: bool,
    /// Only honoured while development mode is active.
    pub requires_dev_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FeatureFlag {
    pub fn on() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn off() -> Self {
        Self::default()
    }

    pub fn dev_only(mut self) -> Self {
        self.requires_dev_mode = true;
        self
    }
}

/// Persisted governance policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub mode: GovernanceMode,
    pub whitelist: BTreeSet<String>,
    pub blacklist: BTreeSet<String>,
    /// Units that are never denied, in any mode.
    pub protected: BTreeSet<String>,
    /// Flags that apply to every unit unless overridden.
    pub features: BTreeMap<String, FeatureFlag>,
    /// Per-unit overrides, keyed by unit id then feature name.
    pub unit_features: BTreeMap<String, BTreeMap<String, FeatureFlag>>,
}

/// A refused unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceViolation {
    pub unit_id: String,
    pub mode: GovernanceMode,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Invoked whenever `check_unit_allowed` refuses a unit.
pub type ViolationCallback = Arc<dyn Fn(&GovernanceViolation) + Send + Sync>;

/// Applies a [`GovernanceConfig`] at runtime.
pub struct GovernanceManager {
    config: RwLock<GovernanceConfig>,
    path: Option<PathBuf>,
    dev_mode: RwLock<bool>,
    callbacks: Mutex<Vec<ViolationCallback>>,
}

impl std::fmt::Debug for GovernanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceManager")
            .field("mode", &self.mode())
            .field("path", &self.path)
            .field("dev_mode", &self.dev_mode())
            .finish()
    }
}

impl Default for GovernanceManager {
    fn default() -> Self {
        Self::new(GovernanceConfig::default(), false)
    }
}

impl GovernanceManager {
    pub fn new(config: GovernanceConfig, dev_mode: bool) -> Self {
        Self {
            config: RwLock::new(config),
            path: None,
            dev_mode: RwLock::new(dev_mode),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Load the policy from a TOML file. A missing file gives the default
    /// policy, still bound to `path` for later saves.
    pub fn load(path: &Path, dev_mode: bool) -> BridgeResult<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<GovernanceConfig>(&content)?
        } else {
            GovernanceConfig::default()
        };
        tracing::debug!(path = %path.display(), mode = config.mode.as_str(), "Loaded governance policy");
        Ok(Self { path: Some(path.to_path_buf()), ..Self::new(config, dev_mode) })
    }

    /// Write the policy back to the file it was loaded from.
    pub fn save(&self) -> BridgeResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(&*self.config.read())?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn config(&self) -> GovernanceConfig {
        self.config.read().clone()
    }

    pub fn mode(&self) -> GovernanceMode {
        self.config.read().mode
    }

    pub fn set_mode(&self, mode: GovernanceMode) {
        self.config.write().mode = mode;
    }

    pub fn dev_mode(&self) -> bool {
        *self.dev_mode.read()
    }

    pub fn set_dev_mode(&self, enabled: bool) {
        *self.dev_mode.write() = enabled;
    }

    pub fn allow(&self, unit_id: &str) {
        let mut config = self.config.write();
        config.whitelist.insert(unit_id.to_string());
        config.blacklist.remove(unit_id);
    }

    pub fn deny(&self, unit_id: &str) {
        let mut config = self.config.write();
        config.blacklist.insert(unit_id.to_string());
        config.whitelist.remove(unit_id);
    }

    /// Remove a unit from both lists.
    pub fn forget(&self, unit_id: &str) {
        let mut config = self.config.write();
        config.whitelist.remove(unit_id);
        config.blacklist.remove(unit_id);
    }

    pub fn protect(&self, unit_id: &str) {
        self.config.write().protected.insert(unit_id.to_string());
    }

    pub fn unprotect(&self, unit_id: &str) -> bool {
        self.config.write().protected.remove(unit_id)
    }

    pub fn is_protected(&self, unit_id: &str) -> bool {
        self.config.read().protected.contains(unit_id)
    }

    /// Listed on the deny list, regardless of mode.
    pub fn is_blacklisted(&self, unit_id: &str) -> bool {
        self.config.read().blacklist.contains(unit_id)
    }

    pub fn is_unit_allowed(&self, unit_id: &str) -> bool {
        self.denial_reason(unit_id).is_none()
    }

    /// Like [`is_unit_allowed`](Self::is_unit_allowed), but a refusal is an
    /// error and is reported to every violation callback.
    pub fn check_unit_allowed(&self, unit_id: &str) -> BridgeResult<()> {
        let Some(reason) = self.denial_reason(unit_id) else {
            return Ok(());
        };

        let violation = GovernanceViolation {
            unit_id: unit_id.to_string(),
            mode: self.mode(),
            reason: reason.clone(),
            at: Utc::now(),
        };
        tracing::warn!(unit = %unit_id, mode = violation.mode.as_str(), %reason, "Governance violation");

        let callbacks = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(&violation);
        }

        Err(BridgeError::Governance { unit: unit_id.to_string(), reason })
    }

    /// Register a callback for refused units.
    pub fn on_violation(&self, callback: ViolationCallback) {
        self.callbacks.lock().push(callback);
    }

    pub fn set_feature(&self, name: &str, flag: FeatureFlag) {
        self.config.write().features.insert(name.to_string(), flag);
    }

    pub fn set_unit_feature(&self, unit_id: &str, name: &str, flag: FeatureFlag) {
        self.config
            .write()
            .unit_features
            .entry(unit_id.to_string())
            .or_default()
            .insert(name.to_string(), flag);
    }

    /// Whether a feature is on, for a unit or globally. A per-unit flag
    /// overrides the global one; unknown features are off.
    pub fn is_feature_enabled(&self, name: &str, unit_id: Option<&str>) -> bool {
        let config = self.config.read();
        let flag = unit_id
            .and_then(|unit| config.unit_features.get(unit))
            .and_then(|flags| flags.get(name))
            .or_else(|| config.features.get(name));

        flag.is_some_and(|flag| flag.enabled && (!flag.requires_dev_mode || self.dev_mode()))
    }

    fn denial_reason(&self, unit_id: &str) -> Option<String> {
        let config = self.config.read();
        if config.protected.contains(unit_id) {
            return None;
        }
        match config.mode {
            GovernanceMode::Disabled => None,
            GovernanceMode::Whitelist => {
                (!config.whitelist.contains(unit_id)).then(|| "not on the whitelist".to_string())
            }
            GovernanceMode::Blacklist => {
                config.blacklist.contains(unit_id).then(|| "on the blacklist".to_string())
            }
        }
    }
}
