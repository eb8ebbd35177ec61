//! Development-time hot reload.
//!
//! A reload tears the unit down completely and builds a fresh instance from
//! its factory, after re-reading the manifest from disk. Nothing the old
//! instance held in memory survives.

use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::monitoring::AuditEventType;
use crate::types::{topics, UnitType};

/// One reload attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadRecord {
    pub unit_id: String,
    pub at: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reloads units on request while the host runs in dev mode.
#[derive(Debug)]
pub struct HotReloadController {
    bridge: Bridge,
    protected: RwLock<BTreeSet<String>>,
    history: Mutex<VecDeque<ReloadRecord>>,
    history_size: usize,
}

impl HotReloadController {
    /// Controller using the bridge's `[hot_reload]` settings.
    pub fn new(bridge: Bridge) -> Self {
        let section = bridge.context().config.hot_reload.clone();
        Self {
            bridge,
            protected: RwLock::new(section.protected),
            history: Mutex::new(VecDeque::new()),
            history_size: section.history_size,
        }
    }

    pub fn protect(&self, unit_id: &str) {
        self.protected.write().insert(unit_id.to_string());
    }

    pub fn unprotect(&self, unit_id: &str) -> bool {
        self.protected.write().remove(unit_id)
    }

    pub fn is_protected(&self, unit_id: &str) -> bool {
        self.protected.read().contains(unit_id)
    }

    /// Whether `reload` would be attempted for this unit.
    pub fn can_reload(&self, unit_id: &str) -> bool {
        self.check(unit_id).is_ok()
    }

    /// Reload a unit.
    ///
    /// Fails with `DevModeRequired` outside dev mode, `Governance` for
    /// blacklisted units and `Lifecycle` for core or protected units. Refused
    /// requests leave no history entry; attempted ones always do.
    pub async fn reload(&self, unit_id: &str) -> BridgeResult<ReloadRecord> {
        self.check(unit_id)?;

        let ctx = self.bridge.context();
        let started = Instant::now();
        let result = self.bridge.reload_unit(unit_id).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let entry = ReloadRecord {
            unit_id: unit_id.to_string(),
            at: Utc::now(),
            success: result.is_ok(),
            duration_ms,
            error: result.as_ref().err().map(ToString::to_string),
        };
        self.remember(entry.clone());

        match result {
            Ok(record) => {
                ctx.events.emit(
                    topics::PLUGIN_RELOADED,
                    json!({
                        "id": unit_id,
                        "version": record.manifest.version.to_string(),
                        "reload_count": record.reload_count,
                        "duration_ms": duration_ms,
                    }),
                    None,
                );
                ctx.audit.record(
                    AuditEventType::PluginReloaded,
                    Some(unit_id),
                    true,
                    json!({ "reload_count": record.reload_count, "duration_ms": duration_ms }),
                );
                tracing::info!(unit = %unit_id, duration_ms, "Unit reloaded");
                Ok(entry)
            }
            Err(e) => {
                ctx.events.emit(
                    topics::PLUGIN_RELOAD_FAILED,
                    json!({ "id": unit_id, "kind": e.kind(), "error": e.to_string() }),
                    None,
                );
                ctx.audit.record(AuditEventType::PluginReloaded, Some(unit_id), false, json!({ "error": e.to_string() }));
                tracing::warn!(unit = %unit_id, error = %e, "Reload failed");
                Err(e)
            }
        }
    }

    /// Most recent attempts, newest first.
    pub fn history(&self, limit: usize) -> Vec<ReloadRecord> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    fn check(&self, unit_id: &str) -> BridgeResult<()> {
        let ctx = self.bridge.context();
        if !ctx.dev_mode() {
            return Err(BridgeError::DevModeRequired("hot reload".to_string()));
        }
        let record = ctx.registry.require(unit_id)?;
        if ctx.governance.is_blacklisted(unit_id) {
            return Err(BridgeError::Governance { unit: unit_id.to_string(), reason: "unit is blacklisted".to_string() });
        }
        if record.unit_type() == UnitType::Core {
            return Err(BridgeError::lifecycle(unit_id, "core units cannot be hot reloaded"));
        }
        if self.is_protected(unit_id) {
            return Err(BridgeError::lifecycle(unit_id, "unit is protected from hot reload"));
        }
        Ok(())
    }

    fn remember(&self, entry: ReloadRecord) {
        let mut history = self.history.lock();
        history.push_back(entry);
        while history.len() > self.history_size {
            history.pop_front();
        }
    }
}
