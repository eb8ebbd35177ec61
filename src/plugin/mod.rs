//! The in-process unit interface and the catalog of unit implementations.
//!
//! Units are Rust types implementing [`Plugin`]. The host registers a
//! factory for each unit id in a [`PluginCatalog`]; the lifecycle controller
//! pairs manifests found on disk with factories by id and constructs a
//! fresh instance on every load, restart or reload.
//!
//! Hooks run only when the manifest's `entrypoints` declares them. A unit
//! that implements `health` but does not list it is never health-checked.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{BridgeError, BridgeResult};
use crate::locator::ServiceLocator;
use crate::manifest::LegacyProbe;
use crate::types::{HealthSnapshot, HealthStatus};

/// A unit's executable side.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once per instance with the unit's scoped services.
    async fn init(&self, _locator: ServiceLocator) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources. The instance is dropped afterwards.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health(&self) -> anyhow::Result<HealthSnapshot> {
        Ok(HealthSnapshot::new(HealthStatus::Healthy, None))
    }

    async fn metrics(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Object(serde_json::Map::new()))
    }

    /// Run a named handler: a CLI command, an API route or an extra
    /// entrypoint from the manifest.
    async fn invoke(&self, handler: &str, _payload: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("no handler named '{handler}'")
    }

    /// Self-description for units that ship without a manifest.
    fn legacy_probe(&self) -> Option<LegacyProbe> {
        None
    }
}

/// Builds a fresh unit instance.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn Plugin> + Send + Sync>;

/// Unit implementations known to the host, by unit id.
#[derive(Default)]
pub struct PluginCatalog {
    factories: RwLock<BTreeMap<String, PluginFactory>>,
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog").field("ids", &self.ids()).finish()
    }
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. Ids are unique.
    pub fn register(&self, unit_id: &str, factory: PluginFactory) -> BridgeResult<()> {
        let mut factories = self.factories.write();
        if factories.contains_key(unit_id) {
            return Err(BridgeError::AlreadyExists(unit_id.to_string()));
        }
        factories.insert(unit_id.to_string(), factory);
        Ok(())
    }

    /// Register a closure as a factory.
    pub fn register_fn<F, P>(&self, unit_id: &str, build: F) -> BridgeResult<()>
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin + 'static,
    {
        self.register(unit_id, Arc::new(move || Arc::new(build()) as Arc<dyn Plugin>))
    }

    pub fn unregister(&self, unit_id: &str) -> bool {
        self.factories.write().remove(unit_id).is_some()
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.factories.read().contains_key(unit_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    pub fn factory(&self, unit_id: &str) -> Option<PluginFactory> {
        self.factories.read().get(unit_id).cloned()
    }

    /// Construct a new instance of a unit.
    pub fn instantiate(&self, unit_id: &str) -> BridgeResult<Arc<dyn Plugin>> {
        let factory = self
            .factory(unit_id)
            .ok_or_else(|| BridgeError::NotFound(format!("implementation for '{unit_id}'")))?;
        Ok(factory())
    }
}
