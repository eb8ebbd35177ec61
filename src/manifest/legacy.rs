//! Adapter for units that ship no manifest file.
//!
//! Such units describe themselves through a [`LegacyProbe`] (name, version and
//! the hooks they implement). The adapter turns a probe into a minimal
//! tool-type [`Manifest`] so the rest of the runtime only ever deals with
//! validated manifests.

use std::collections::BTreeSet;

use semver::Version;
use serde::{Deserialize, Serialize};

use super::{Manifest, RawManifest};
use crate::error::{BridgeError, BridgeResult};
use crate::permissions::Permission;

/// Hooks a legacy unit can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacyHook {
    Init,
    Shutdown,
    Health,
    Metrics,
}

impl LegacyHook {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Shutdown => "shutdown",
            Self::Health => "health",
            Self::Metrics => "metrics",
        }
    }
}

/// What a manifest-less unit reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyProbe {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hooks: BTreeSet<LegacyHook>,
}

impl LegacyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn hook(mut self, hook: LegacyHook) -> Self {
        self.hooks.insert(hook);
        self
    }
}

/// A manifest synthesized from a probe, plus the hooks that were found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyManifest {
    pub manifest: Manifest,
    pub hooks: BTreeSet<LegacyHook>,
}

/// Either a manifest read from disk or one synthesized for a legacy unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UnitManifest {
    Standard(Manifest),
    Legacy(LegacyManifest),
}

impl UnitManifest {
    pub fn manifest(&self) -> &Manifest {
        match self {
            Self::Standard(manifest) => manifest,
            Self::Legacy(legacy) => &legacy.manifest,
        }
    }

    pub fn into_manifest(self) -> Manifest {
        match self {
            Self::Standard(manifest) => manifest,
            Self::Legacy(legacy) => legacy.manifest,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

/// Synthesizes manifests for legacy units.
#[derive(Debug, Clone)]
pub struct LegacyAdapter {
    default_permissions: Vec<Permission>,
}

impl Default for LegacyAdapter {
    fn default() -> Self {
        Self { default_permissions: vec![Permission::WriteLog] }
    }
}

impl LegacyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant these permissions to every adapted unit instead of `log.write`.
    pub fn with_default_permissions(mut self, permissions: Vec<Permission>) -> Self {
        self.default_permissions = permissions;
        self
    }

    /// Build a tool-type manifest from a probe. Only hooks the probe reports
    /// become entrypoints.
    pub fn adapt(
        &self,
        unit_id: &str,
        probe: &LegacyProbe,
        host_version: &Version,
    ) -> BridgeResult<LegacyManifest> {
        let mut raw = RawManifest {
            id: unit_id.to_string(),
            name: probe.name.clone(),
            version: probe.version.clone().unwrap_or_else(|| "0.0.0".to_string()),
            unit_type: "tool".to_string(),
            description: probe.description.clone(),
            permissions: self.default_permissions.iter().map(|p| p.as_str().to_string()).collect(),
            ..RawManifest::default()
        };
        for hook in &probe.hooks {
            let slot = match hook {
                LegacyHook::Init => &mut raw.entrypoints.init,
                LegacyHook::Shutdown => &mut raw.entrypoints.shutdown,
                LegacyHook::Health => &mut raw.entrypoints.health,
                LegacyHook::Metrics => &mut raw.entrypoints.metrics,
            };
            *slot = Some(hook.as_str().to_string());
        }

        let manifest = raw.validate(host_version).map_err(|e| match e {
            BridgeError::Manifest { unit, reason } => {
                BridgeError::Manifest { unit, reason: format!("legacy unit: {reason}") }
            }
            other => other,
        })?;

        tracing::debug!(unit = %unit_id, hooks = probe.hooks.len(), "Adapted legacy unit");
        Ok(LegacyManifest { manifest, hooks: probe.hooks.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnitType;

    fn host() -> Version {
        Version::parse("1.4.0").unwrap()
    }

    #[test]
    fn test_adapt_probe() {
        let probe = LegacyProbe::new().version("2.1.0").hook(LegacyHook::Init).hook(LegacyHook::Health);
        let legacy = LegacyAdapter::new().adapt("old.linter", &probe, &host()).unwrap();

        let manifest = &legacy.manifest;
        assert_eq!(manifest.unit_type, UnitType::Tool);
        assert_eq!(manifest.version, Version::new(2, 1, 0));
        assert_eq!(manifest.entrypoints.init.as_deref(), Some("init"));
        assert_eq!(manifest.entrypoints.health.as_deref(), Some("health"));
        assert!(manifest.entrypoints.shutdown.is_none());
        assert!(manifest.has_permission(Permission::WriteLog));
        assert_eq!(manifest.permissions.len(), 1);
    }

    #[test]
    fn test_missing_version_defaults() {
        let legacy = LegacyAdapter::new().adapt("old.plain", &LegacyProbe::new(), &host()).unwrap();
        assert_eq!(legacy.manifest.version, Version::new(0, 0, 0));
        assert_eq!(legacy.manifest.name, "old.plain");
        assert!(legacy.hooks.is_empty());
    }

    #[test]
    fn test_invalid_probe_is_manifest_error() {
        let probe = LegacyProbe::new().version("not-semver");
        let err = LegacyAdapter::new().adapt("old.bad", &probe, &host()).unwrap_err();
        assert!(err.to_string().contains("legacy unit"));
    }

    #[test]
    fn test_unit_manifest_variant() {
        let legacy = LegacyAdapter::new().adapt("old.x", &LegacyProbe::new(), &host()).unwrap();
        let unit = UnitManifest::Legacy(legacy);
        assert!(unit.is_legacy());
        assert_eq!(unit.manifest().id, "old.x");
    }
}
