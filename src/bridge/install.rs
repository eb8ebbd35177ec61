//! Installing units into the plugins directory and removing them again.

use std::path::Path;

use serde_json::json;
use walkdir::WalkDir;

use super::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::monitoring::AuditEventType;
use crate::registry::{PluginRecord, RecordFilter};
use crate::trust::verify_unit;
use crate::types::{PluginState, UnitType};

impl Bridge {
    /// Verify a unit directory and copy it into the plugins directory as
    /// `<plugins_dir>/<unit_id>`. The new record is `Discovered`; call
    /// [`Bridge::load_unit`] to start it.
    ///
    /// Outside dev mode the unit must meet the minimum trust level, and an
    /// unsigned unit needs `confirmed`.
    pub fn install(&self, source_dir: &Path, confirmed: bool) -> BridgeResult<PluginRecord> {
        let ctx = &self.inner.ctx;
        if !source_dir.is_dir() {
            return Err(BridgeError::SourceNotFound(source_dir.to_path_buf()));
        }

        let manifest = self.inner.loader.load_dir(source_dir)?;
        let id = manifest.id.clone();
        if manifest.unit_type == UnitType::Core {
            return Err(BridgeError::Validation(format!("core unit '{id}' cannot be installed")));
        }
        if ctx.registry.contains(&id) {
            return Err(BridgeError::AlreadyExists(id));
        }
        ctx.governance.check_unit_allowed(&id)?;

        let trust = match verify_unit(source_dir, &manifest, &ctx.trust_store.read()) {
            Ok(trust) => trust,
            Err(e) => {
                ctx.audit.record(AuditEventType::SignatureFailed, Some(&id), false, json!({ "error": e.to_string() }));
                return Err(e);
            }
        };
        ctx.trust_policy.check_install(&id, &trust, ctx.dev_mode(), confirmed)?;

        let dest = ctx.config.general.plugins_dir.join(&id);
        if dest.exists() {
            return Err(BridgeError::AlreadyExists(dest.display().to_string()));
        }
        copy_dir(source_dir, &dest)?;

        let record = PluginRecord::new(manifest).with_source(dest.clone()).with_trust(trust);
        ctx.registry.insert(record.clone())?;
        ctx.audit.record(
            AuditEventType::PluginInstalled,
            Some(&id),
            true,
            json!({
                "source": source_dir.display().to_string(),
                "level": record.trust.trust_level,
                "confirmed": confirmed,
            }),
        );
        tracing::info!(unit = %id, dest = %dest.display(), level = %record.trust.trust_level, "Unit installed");
        Ok(record)
    }

    /// Stop and forget a unit and delete its directory when it lives in the
    /// plugins directory. Refused for core units and for units a ready unit
    /// depends on.
    pub async fn uninstall(&self, unit_id: &str) -> BridgeResult<()> {
        let ctx = &self.inner.ctx;
        let lock = self.unit_lock(unit_id);
        let guard = lock.lock().await;

        let record = ctx.registry.require(unit_id)?;
        if record.unit_type() == UnitType::Core {
            return Err(BridgeError::lifecycle(unit_id, "core units cannot be uninstalled"));
        }
        let dependents: Vec<String> = ctx
            .registry
            .list(&RecordFilter::state(PluginState::Ready))
            .into_iter()
            .filter(|r| r.manifest.dependencies.contains_key(unit_id))
            .map(|r| r.id().to_string())
            .collect();
        if !dependents.is_empty() {
            return Err(BridgeError::lifecycle(unit_id, format!("required by {}", dependents.join(", "))));
        }

        if record.is_ready() {
            if let Err(e) = self.unload_instance(unit_id).await {
                tracing::warn!(unit = %unit_id, error = %e, "Shutdown failed during uninstall, instance dropped");
            }
        }
        ctx.jobs.remove_unit(unit_id);
        ctx.rate_limiter.reset(unit_id);
        ctx.registry.remove(unit_id);

        let mut removed_dir = false;
        if let Some(dir) = &record.source_dir {
            if dir.starts_with(&ctx.config.general.plugins_dir) && dir.is_dir() {
                std::fs::remove_dir_all(dir)?;
                removed_dir = true;
            }
        }

        ctx.audit.record(AuditEventType::PluginUninstalled, Some(unit_id), true, json!({ "removed_dir": removed_dir }));
        tracing::info!(unit = %unit_id, removed_dir, "Unit uninstalled");
        drop(guard);
        self.forget_lock(unit_id);
        Ok(())
    }
}

fn copy_dir(source: &Path, dest: &Path) -> BridgeResult<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| BridgeError::Io(e.into()))?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::plugin::Plugin;
    use crate::trust::{sign_unit, SigningIdentity, TrustLevel};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {}

    fn write_unit(root: &Path, id: &str, deps: &str) -> PathBuf {
        let dir = root.join(format!("src-{id}"));
        std::fs::create_dir_all(dir.join("assets")).unwrap();
        std::fs::write(
            dir.join("plugin.toml"),
            format!("id = \"{id}\"\nversion = \"1.2.0\"\ntype = \"tool\"\n\n[dependencies]\n{deps}\n"),
        )
        .unwrap();
        std::fs::write(dir.join("assets/readme.txt"), "hello").unwrap();
        dir
    }

    fn bridge(plugins_dir: &Path, dev_mode: bool) -> Bridge {
        let mut config = BridgeConfig::default();
        config.general.plugins_dir = plugins_dir.to_path_buf();
        config.general.dev_mode = dev_mode;
        Bridge::from_config(config).unwrap()
    }

    #[test]
    fn test_unsigned_install_needs_confirmation() {
        let tmp = TempDir::new().unwrap();
        let source = write_unit(tmp.path(), "acme.fmt", "");
        let bridge = bridge(&tmp.path().join("plugins"), false);

        let err = bridge.install(&source, false).unwrap_err();
        assert!(matches!(err, BridgeError::Signature { .. }));
        assert!(!bridge.context().registry.contains("acme.fmt"));

        let record = bridge.install(&source, true).unwrap();
        assert_eq!(record.state, PluginState::Discovered);
        assert!(tmp.path().join("plugins/acme.fmt/assets/readme.txt").is_file());
        assert!(matches!(bridge.install(&source, true), Err(BridgeError::AlreadyExists(_))));
    }

    #[test]
    fn test_dev_mode_skips_confirmation() {
        let tmp = TempDir::new().unwrap();
        let source = write_unit(tmp.path(), "acme.fmt", "");
        let bridge = bridge(&tmp.path().join("plugins"), true);
        assert!(bridge.install(&source, false).is_ok());
    }

    #[test]
    fn test_signed_install_records_trust() {
        let tmp = TempDir::new().unwrap();
        let source = write_unit(tmp.path(), "acme.fmt", "");
        let bridge = bridge(&tmp.path().join("plugins"), false);

        let identity = SigningIdentity::generate("acme");
        bridge
            .context()
            .trust_store
            .write()
            .add_signer("acme", &identity.public_key_base64(), TrustLevel::Verified)
            .unwrap();
        let manifest = bridge.inner.loader.load_dir(&source).unwrap();
        sign_unit(&source, &manifest, &identity, TrustLevel::Verified, None).unwrap();

        let record = bridge.install(&source, false).unwrap();
        assert!(record.trust.verified);
        assert_eq!(record.trust.trust_level, TrustLevel::Verified);
    }

    #[tokio::test]
    async fn test_uninstall_refuses_required_units() {
        let tmp = TempDir::new().unwrap();
        let plugins = tmp.path().join("plugins");
        let bridge = bridge(&plugins, true);
        bridge.context().catalog.register_fn("acme.base", || Noop).unwrap();
        bridge.context().catalog.register_fn("acme.ext", || Noop).unwrap();

        bridge.install(&write_unit(tmp.path(), "acme.base", ""), false).unwrap();
        bridge.install(&write_unit(tmp.path(), "acme.ext", "\"acme.base\" = \"^1.0\""), false).unwrap();
        let report = bridge.start().await.unwrap();
        assert_eq!(report.batches, vec![vec!["acme.base".to_string()], vec!["acme.ext".to_string()]]);

        let err = bridge.uninstall("acme.base").await.unwrap_err();
        assert!(matches!(err, BridgeError::Lifecycle { .. }));

        bridge.uninstall("acme.ext").await.unwrap();
        bridge.uninstall("acme.base").await.unwrap();
        assert!(bridge.context().registry.is_empty());
        assert!(!plugins.join("acme.base").exists());
    }
}
