//! The lifecycle controller.
//!
//! [`Bridge`] owns the live unit instances and drives every record through
//! the lifecycle graph: discovery, trust and governance checks, dependency
//! resolution, batched loading, health checks, dispatch, restart, reload
//! and shutdown. A failing unit ends up in `Error` with the captured
//! message; it never takes the host down.
//!
//! Lifecycle operations on one unit are serialized by a per-unit async
//! mutex. Dispatch does not take that lock, so handlers of one unit may
//! run concurrently.

mod install;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::BridgeConfig;
use crate::context::BridgeContext;
use crate::contributions::DispatchTarget;
use crate::error::{BridgeError, BridgeResult};
use crate::jobs::panic_message;
use crate::locator::{ServiceLocator, UnitLease};
use crate::manifest::{config_defaults, validate_unit_config, LegacyAdapter, Manifest, ManifestLoader};
use crate::monitoring::{AuditEventType, OperationClass};
use crate::plugin::{Plugin, PluginFactory};
use crate::registry::{PluginRecord, RecordFilter, RegistrySummary};
use crate::resolver::{DependencyFailure, DependencyResolver};
use crate::trust::{verify_unit, TrustRecord};
use crate::types::{topics, HealthSnapshot, HealthStatus, PluginState, UnitType};

/// Who asked for a restart. Only operators are bound by `restartable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartOrigin {
    Operator,
    Host,
}

impl RestartOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Host => "host",
        }
    }
}

/// A directory or catalog entry that could not become a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryIssue {
    pub source: String,
    pub reason: String,
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub discovered: Vec<String>,
    pub legacy: Vec<String>,
    pub invalid: Vec<DiscoveryIssue>,
}

/// Outcome of [`Bridge::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub loaded: Vec<String>,
    /// Unit id to failure message.
    pub failed: BTreeMap<String, String>,
    pub disabled: Vec<String>,
    pub invalid: Vec<DiscoveryIssue>,
    pub batches: Vec<Vec<String>>,
    pub duration_ms: u64,
}

/// Outcome of [`Bridge::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    /// Units whose shutdown hook failed or timed out; their instances were
    /// dropped anyway.
    pub forced: Vec<String>,
}

/// Reason recorded on units stopped by [`Bridge::shutdown`].
pub const SHUTDOWN_REASON: &str = "host shutdown";

/// Reason recorded on units whose shutdown hook failed or timed out during
/// [`Bridge::shutdown`].
pub const FORCED_SHUTDOWN_REASON: &str = "host shutdown (forced)";

/// Reason recorded on units unloaded by [`Bridge::apply_governance`].
pub const GOVERNANCE_REASON: &str = "governance";

/// Handle to the lifecycle controller. Cheap to clone.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<BridgeContext>,
    instances: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    leases: Mutex<HashMap<String, UnitLease>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    loader: ManifestLoader,
    legacy: LegacyAdapter,
    next_order: AtomicUsize,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("ctx", &self.inner.ctx)
            .field("live", &self.inner.instances.read().len())
            .finish()
    }
}

impl Bridge {
    pub fn new(ctx: BridgeContext) -> Self {
        Self::with_legacy_adapter(ctx, LegacyAdapter::default())
    }

    /// Use a custom adapter for units that ship without a manifest.
    pub fn with_legacy_adapter(ctx: BridgeContext, legacy: LegacyAdapter) -> Self {
        let loader = ManifestLoader::new(ctx.host_version.clone());
        Self {
            inner: Arc::new(Inner {
                ctx: Arc::new(ctx),
                instances: RwLock::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                loader,
                legacy,
                next_order: AtomicUsize::new(0),
            }),
        }
    }

    pub fn from_config(config: BridgeConfig) -> BridgeResult<Self> {
        Ok(Self::new(BridgeContext::from_config(config)?))
    }

    pub fn context(&self) -> &BridgeContext {
        &self.inner.ctx
    }

    /// Hard-register a core unit with its implementation.
    pub fn register_core(&self, manifest: Manifest, factory: PluginFactory) -> BridgeResult<()> {
        let ctx = &self.inner.ctx;
        if manifest.unit_type != UnitType::Core {
            return Err(BridgeError::Validation(format!(
                "'{}' is a {} unit; only core units can be hard-registered",
                manifest.id, manifest.unit_type
            )));
        }
        let id = manifest.id.clone();
        ctx.catalog.register(&id, factory)?;
        if let Err(e) = ctx.registry.insert(PluginRecord::new(manifest).with_trust(TrustRecord::builtin())) {
            ctx.catalog.unregister(&id);
            return Err(e);
        }
        tracing::debug!(unit = %id, "Registered core unit");
        Ok(())
    }

    /// Scan `dir` for unit directories and probe catalog entries that have
    /// no record for legacy units. Re-discovering a known directory is a
    /// no-op.
    pub fn discover(&self, dir: &Path) -> BridgeResult<DiscoveryReport> {
        let mut report = DiscoveryReport::default();

        if dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(dir)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            entries.sort();

            for path in entries {
                if ManifestLoader::manifest_path(&path).is_none() {
                    tracing::debug!(path = %path.display(), "Skipping directory without manifest");
                    continue;
                }
                match self.discover_dir(&path) {
                    Ok(Some(id)) => report.discovered.push(id),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Invalid unit");
                        report
                            .invalid
                            .push(DiscoveryIssue { source: path.display().to_string(), reason: e.to_string() });
                    }
                }
            }
        } else {
            tracing::debug!(dir = %dir.display(), "Plugins directory does not exist");
        }

        self.discover_legacy(&mut report);
        tracing::info!(
            discovered = report.discovered.len(),
            legacy = report.legacy.len(),
            invalid = report.invalid.len(),
            "Discovery finished"
        );
        Ok(report)
    }

    fn discover_dir(&self, path: &Path) -> BridgeResult<Option<String>> {
        let ctx = &self.inner.ctx;
        let manifest = self.inner.loader.load_dir(path)?;
        let id = manifest.id.clone();

        if manifest.unit_type == UnitType::Core {
            return Err(BridgeError::manifest(&id, "core units are registered by the host, not discovered"));
        }
        if let Some(existing) = ctx.registry.get(&id) {
            if existing.source_dir.as_deref() == Some(path) {
                return Ok(None);
            }
            return Err(BridgeError::AlreadyExists(id));
        }

        let verification = verify_unit(path, &manifest, &ctx.trust_store.read());
        let record = PluginRecord::new(manifest).with_source(path.to_path_buf());
        match verification {
            Ok(trust) => {
                if trust.verified {
                    ctx.audit.record(
                        AuditEventType::SignatureVerified,
                        Some(&id),
                        true,
                        json!({ "signer": trust.signer, "level": trust.trust_level }),
                    );
                }
                ctx.registry.insert(record.with_trust(trust))?;
                ctx.audit.record(
                    AuditEventType::PluginDiscovered,
                    Some(&id),
                    true,
                    json!({ "source": path.display().to_string() }),
                );
            }
            Err(e) => {
                ctx.audit.record(AuditEventType::SignatureFailed, Some(&id), false, json!({ "error": e.to_string() }));
                ctx.registry.insert(record)?;
                self.fail(&id, &e);
            }
        }
        Ok(Some(id))
    }

    fn discover_legacy(&self, report: &mut DiscoveryReport) {
        let ctx = &self.inner.ctx;
        for id in ctx.catalog.ids() {
            if ctx.registry.contains(&id) {
                continue;
            }
            let Some(probe) = ctx.catalog.instantiate(&id).ok().and_then(|unit| unit.legacy_probe()) else {
                continue;
            };
            let inserted = self
                .inner
                .legacy
                .adapt(&id, &probe, &ctx.host_version)
                .and_then(|adapted| ctx.registry.insert(PluginRecord::new(adapted.manifest).legacy()));
            match inserted {
                Ok(()) => {
                    ctx.audit.record(
                        AuditEventType::PluginDiscovered,
                        Some(&id),
                        true,
                        json!({ "source": "legacy", "hooks": probe.hooks.len() }),
                    );
                    report.legacy.push(id);
                }
                Err(e) => {
                    tracing::warn!(unit = %id, error = %e, "Legacy unit rejected");
                    report.invalid.push(DiscoveryIssue { source: id, reason: e.to_string() });
                }
            }
        }
    }

    /// Discover the configured plugins directory, apply governance, resolve
    /// dependencies and load every eligible unit batch by batch. Units in
    /// one batch load concurrently.
    ///
    /// Per-unit failures land in the report; only a registry or resolver
    /// failure fails the call.
    pub async fn start(&self) -> BridgeResult<StartupReport> {
        let ctx = &self.inner.ctx;
        let started = Instant::now();
        let mut report = StartupReport::default();

        let discovery = self.discover(&ctx.config.general.plugins_dir)?;
        report.invalid = discovery.invalid;
        for record in ctx.registry.list(&RecordFilter::state(PluginState::Error)) {
            if let Some(error) = &record.error {
                report.failed.insert(record.id().to_string(), error.message.clone());
            }
        }

        let mut eligible = Vec::new();
        for record in ctx.registry.list(&RecordFilter::state(PluginState::Discovered)) {
            if record.unit_type() != UnitType::Core {
                if let Err(e) = ctx.governance.check_unit_allowed(record.id()) {
                    self.mark_disabled(record.id(), &e.to_string())?;
                    report.disabled.push(record.id().to_string());
                    continue;
                }
            }
            eligible.push(record.manifest);
        }

        let resolver = ctx
            .registry
            .list(&RecordFilter::state(PluginState::Ready))
            .into_iter()
            .fold(DependencyResolver::new(), |resolver, record| {
                resolver.with_available(record.id(), record.manifest.version.clone())
            });
        let plan = resolver.resolve(eligible.iter())?;

        for (id, failure) in &plan.failures {
            let error = failure.to_error(id);
            self.fail(id, &error);
            report.failed.insert(id.clone(), error.to_string());
        }

        for batch in &plan.batches {
            let results = join_all(batch.iter().map(|id| self.load_unit(id))).await;
            for (id, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => report.loaded.push(id.clone()),
                    Err(e) => {
                        report.failed.insert(id.clone(), e.to_string());
                    }
                }
            }
        }

        report.batches = plan.batches;
        report.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            disabled = report.disabled.len(),
            duration_ms = report.duration_ms,
            "Bridge started"
        );
        Ok(report)
    }

    /// Load one unit: build its locator, run `init` under the load timeout
    /// and register its contributions.
    pub async fn load_unit(&self, unit_id: &str) -> BridgeResult<()> {
        let lock = self.unit_lock(unit_id);
        let _guard = lock.lock().await;

        let record = self.inner.ctx.registry.require(unit_id)?;
        if record.is_ready() {
            return Err(BridgeError::lifecycle(unit_id, "already loaded"));
        }
        self.activate(record).await
    }

    /// Governance check, then `Loading`, then init. Any failure after the
    /// transition leaves the unit in `Error`.
    async fn activate(&self, record: PluginRecord) -> BridgeResult<()> {
        let ctx = &self.inner.ctx;
        let id = record.id().to_string();

        if record.unit_type() != UnitType::Core {
            if let Err(e) = ctx.governance.check_unit_allowed(&id) {
                if record.state.can_transition_to(PluginState::Disabled) {
                    self.mark_disabled(&id, &e.to_string())?;
                } else if record.state == PluginState::Loading {
                    self.fail(&id, &e);
                }
                return Err(e);
            }
        }

        if record.state != PluginState::Loading {
            ctx.registry.transition(&id, PluginState::Loading)?;
        }
        if let Err(e) = self.init_instance(&record).await {
            self.fail(&id, &e);
            return Err(e);
        }
        Ok(())
    }

    async fn init_instance(&self, record: &PluginRecord) -> BridgeResult<()> {
        let ctx = &self.inner.ctx;
        let id = record.id();
        let manifest = &record.manifest;

        self.check_dependencies(manifest)?;
        let config = ctx.config.unit_config(id, &config_defaults(&manifest.config_schema));
        validate_unit_config(id, &manifest.config_schema, &config)?;
        let instance = ctx.catalog.instantiate(id)?;

        ctx.permissions.register(id, manifest.permissions.iter().copied());
        if let Some(max) = manifest.max_concurrent_jobs() {
            ctx.jobs.set_unit_limit(id, max);
        }
        let lease = UnitLease::new();
        self.inner.leases.lock().insert(id.to_string(), lease.clone());
        let locator = ServiceLocator::new(id, ctx.services(), config).with_lease(lease);

        if manifest.entrypoints.init.is_some() {
            if let Err(e) = self.run_hook(id, OperationClass::Load, instance.init(locator)).await {
                self.release(id);
                return Err(e);
            }
        }

        if let Err(e) = ctx.contributions.register_manifest(manifest) {
            if manifest.entrypoints.shutdown.is_some() {
                if let Err(stop) = self.run_hook(id, OperationClass::Unload, instance.shutdown()).await {
                    tracing::warn!(unit = %id, error = %stop, "Shutdown after failed registration failed");
                }
            }
            self.release(id);
            return Err(e);
        }

        self.inner.instances.write().insert(id.to_string(), instance);
        let order = self.inner.next_order.fetch_add(1, Ordering::SeqCst);
        ctx.registry.transition(id, PluginState::Ready)?;
        ctx.registry.update(id, |r| {
            r.load_order = Some(order);
            r.health = HealthSnapshot::unknown();
        })?;

        ctx.audit.record(
            AuditEventType::PluginLoaded,
            Some(id),
            true,
            json!({ "version": manifest.version.to_string(), "load_order": order, "legacy": record.legacy }),
        );
        ctx.events.emit(
            topics::PLUGIN_LOADED,
            json!({
                "id": id,
                "version": manifest.version.to_string(),
                "type": manifest.unit_type,
                "load_order": order,
            }),
            None,
        );
        tracing::info!(unit = %id, version = %manifest.version, order, "Unit ready");
        Ok(())
    }

    fn check_dependencies(&self, manifest: &Manifest) -> BridgeResult<()> {
        let registry = &self.inner.ctx.registry;
        for (dependency, required) in &manifest.dependencies {
            let failure = match registry.get(dependency) {
                None => Some(DependencyFailure::Missing { dependency: dependency.clone() }),
                Some(dep) if manifest.unit_type == UnitType::Core && dep.unit_type() != UnitType::Core => {
                    Some(DependencyFailure::NonCoreDependency {
                        dependency: dependency.clone(),
                        unit_type: dep.unit_type(),
                    })
                }
                Some(dep) if !dep.is_ready() => {
                    Some(DependencyFailure::FailedDependency { dependency: dependency.clone() })
                }
                Some(dep) if !required.matches(&dep.manifest.version) => Some(DependencyFailure::VersionMismatch {
                    dependency: dependency.clone(),
                    required: required.to_string(),
                    found: dep.manifest.version.to_string(),
                }),
                Some(_) => None,
            };
            if let Some(failure) = failure {
                return Err(failure.to_error(&manifest.id));
            }
        }
        Ok(())
    }

    /// Turn a unit off. Ready units are unloaded first; a failing shutdown
    /// hook is logged and the instance dropped regardless.
    pub async fn disable(&self, unit_id: &str, reason: &str) -> BridgeResult<()> {
        let lock = self.unit_lock(unit_id);
        let _guard = lock.lock().await;

        let record = self.inner.ctx.registry.require(unit_id)?;
        if record.unit_type() == UnitType::Core {
            return Err(BridgeError::lifecycle(unit_id, "core units cannot be disabled"));
        }
        match record.state {
            PluginState::Disabled => return Ok(()),
            PluginState::Ready => {
                if let Err(e) = self.unload_instance(unit_id).await {
                    tracing::warn!(unit = %unit_id, error = %e, "Shutdown failed while disabling, instance dropped");
                }
            }
            _ => {}
        }
        self.mark_disabled(unit_id, reason)
    }

    /// Turn a disabled unit back on and load it.
    pub async fn enable(&self, unit_id: &str) -> BridgeResult<()> {
        let lock = self.unit_lock(unit_id);
        let _guard = lock.lock().await;

        let record = self.inner.ctx.registry.require(unit_id)?;
        match record.state {
            PluginState::Ready => Ok(()),
            PluginState::Disabled | PluginState::Discovered => {
                self.inner.ctx.audit.record(AuditEventType::PluginEnabled, Some(unit_id), true, json!({}));
                self.activate(record).await
            }
            other => Err(BridgeError::lifecycle(unit_id, format!("cannot enable a unit in state {other}"))),
        }
    }

    /// Re-check every ready non-core unit against the current governance
    /// policy. Units the policy now refuses are unloaded and disabled with
    /// [`GOVERNANCE_REASON`]; each refusal is reported as a violation.
    /// Emits `config.changed` and returns the disabled ids.
    pub async fn apply_governance(&self) -> Vec<String> {
        let ctx = &self.inner.ctx;
        let mut disabled = Vec::new();

        for record in ctx.registry.list(&RecordFilter::state(PluginState::Ready)) {
            let id = record.id();
            if record.unit_type() == UnitType::Core || ctx.governance.is_unit_allowed(id) {
                continue;
            }
            let lock = self.unit_lock(id);
            let _guard = lock.lock().await;
            if ctx.registry.state(id) != Some(PluginState::Ready) || ctx.governance.check_unit_allowed(id).is_ok() {
                continue;
            }

            if let Err(e) = self.unload_instance(id).await {
                tracing::warn!(unit = %id, error = %e, "Shutdown failed under governance, instance dropped");
            }
            match self.mark_disabled(id, GOVERNANCE_REASON) {
                Ok(()) => disabled.push(id.to_string()),
                Err(e) => tracing::warn!(unit = %id, error = %e, "Could not disable refused unit"),
            }
        }

        ctx.events.emit(
            topics::CONFIG_CHANGED,
            json!({ "section": "governance", "mode": ctx.governance.mode().as_str(), "disabled": disabled }),
            None,
        );
        tracing::info!(disabled = disabled.len(), mode = ctx.governance.mode().as_str(), "Governance applied");
        disabled
    }

    /// Unload and load a unit again with a fresh instance. Operators cannot
    /// restart units whose manifest sets `restartable = false`.
    pub async fn restart(&self, unit_id: &str, origin: RestartOrigin) -> BridgeResult<()> {
        let ctx = &self.inner.ctx;
        let lock = self.unit_lock(unit_id);
        let _guard = lock.lock().await;

        let record = ctx.registry.require(unit_id)?;
        if !record.restartable && origin == RestartOrigin::Operator {
            return Err(BridgeError::lifecycle(unit_id, "unit is not restartable"));
        }
        match record.state {
            PluginState::Ready => {
                if let Err(e) = self.unload_instance(unit_id).await {
                    tracing::warn!(unit = %unit_id, error = %e, "Shutdown failed during restart, instance dropped");
                }
            }
            PluginState::Error => {}
            other => {
                return Err(BridgeError::lifecycle(unit_id, format!("cannot restart a unit in state {other}")));
            }
        }

        let result = self.activate(ctx.registry.require(unit_id)?).await;
        ctx.audit.record(
            AuditEventType::PluginRestarted,
            Some(unit_id),
            result.is_ok(),
            json!({ "origin": origin.as_str() }),
        );
        tracing::info!(unit = %unit_id, origin = origin.as_str(), ok = result.is_ok(), "Unit restarted");
        result
    }

    /// Unload, re-read the manifest from the unit's source directory, verify
    /// it again and load a fresh instance. In-memory unit state is lost.
    pub(crate) async fn reload_unit(&self, unit_id: &str) -> BridgeResult<PluginRecord> {
        let ctx = &self.inner.ctx;
        let lock = self.unit_lock(unit_id);
        let _guard = lock.lock().await;

        let record = ctx.registry.require(unit_id)?;
        match record.state {
            PluginState::Ready => {
                if let Err(e) = self.unload_instance(unit_id).await {
                    tracing::warn!(unit = %unit_id, error = %e, "Shutdown failed during reload, instance dropped");
                }
            }
            PluginState::Error => {}
            other => {
                return Err(BridgeError::lifecycle(unit_id, format!("cannot reload a unit in state {other}")));
            }
        }
        ctx.registry.transition(unit_id, PluginState::Loading)?;

        if let Some(dir) = record.source_dir.as_deref() {
            let refreshed = self
                .inner
                .loader
                .load_dir(dir)
                .and_then(|manifest| {
                    if manifest.id == unit_id {
                        Ok(manifest)
                    } else {
                        Err(BridgeError::manifest(unit_id, format!("manifest id changed to '{}'", manifest.id)))
                    }
                })
                .and_then(|manifest| {
                    let trust = verify_unit(dir, &manifest, &ctx.trust_store.read())?;
                    Ok((manifest, trust))
                });
            match refreshed {
                Ok((manifest, trust)) => ctx.registry.update(unit_id, |r| {
                    r.restartable = manifest.restartable;
                    r.manifest = manifest;
                    r.trust = trust;
                })?,
                Err(e) => {
                    self.fail(unit_id, &e);
                    return Err(e);
                }
            }
        }

        ctx.registry.update(unit_id, |r| r.reload_count += 1)?;
        self.activate(ctx.registry.require(unit_id)?).await?;
        ctx.registry.require(unit_id)
    }

    /// Run the unit's `health` hook under the health timeout and store the
    /// snapshot. A failing hook yields an `Unhealthy` snapshot. Units that do
    /// not declare the hook keep their last snapshot.
    pub async fn health_check(&self, unit_id: &str) -> BridgeResult<HealthSnapshot> {
        let ctx = &self.inner.ctx;
        let lock = self.unit_lock(unit_id);
        let _guard = lock.lock().await;

        let record = ctx.registry.require(unit_id)?;
        if !record.is_ready() {
            return Err(BridgeError::lifecycle(unit_id, format!("cannot check health in state {}", record.state)));
        }
        if record.manifest.entrypoints.health.is_none() {
            return Ok(record.health);
        }

        let instance = self.instance(unit_id)?;
        let snapshot = match self.run_hook(unit_id, OperationClass::HealthCheck, instance.health()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(unit = %unit_id, error = %e, "Health check failed");
                HealthSnapshot::new(HealthStatus::Unhealthy, Some(e.to_string()))
            }
        };
        ctx.registry.update(unit_id, |r| r.health = snapshot.clone())?;
        Ok(snapshot)
    }

    /// Health-check every ready unit concurrently.
    pub async fn health_check_all(&self) -> BTreeMap<String, HealthSnapshot> {
        let ids: Vec<String> = self
            .inner
            .ctx
            .registry
            .list(&RecordFilter::state(PluginState::Ready))
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        let results = join_all(ids.iter().map(|id| self.health_check(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.ok().map(|snapshot| (id, snapshot)))
            .collect()
    }

    /// Invoke a contributed command (`unit:command`) or route
    /// (`METHOD /plugins/unit/path`) on its ready owner.
    pub async fn dispatch(&self, target: &str, payload: serde_json::Value) -> BridgeResult<serde_json::Value> {
        let target = DispatchTarget::parse(target)?;
        let (owner, handler) = self.inner.ctx.contributions.resolve(&target)?;
        self.call_handler(&owner, &handler, payload).await
    }

    /// Invoke one of the extra entrypoints a manifest declares.
    pub async fn invoke(
        &self,
        unit_id: &str,
        entrypoint: &str,
        payload: serde_json::Value,
    ) -> BridgeResult<serde_json::Value> {
        let record = self.inner.ctx.registry.require(unit_id)?;
        let handler = record
            .manifest
            .entrypoints
            .extra
            .get(entrypoint)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("entrypoint '{entrypoint}' of '{unit_id}'")))?;
        self.call_handler(unit_id, &handler, payload).await
    }

    async fn call_handler(
        &self,
        unit_id: &str,
        handler: &str,
        payload: serde_json::Value,
    ) -> BridgeResult<serde_json::Value> {
        let ctx = &self.inner.ctx;
        let record = ctx.registry.require(unit_id)?;
        if !record.is_ready() {
            return Err(BridgeError::lifecycle(unit_id, format!("unit is {}", record.state)));
        }
        if let Err(e) = ctx.rate_limiter.acquire(unit_id) {
            ctx.audit.record(AuditEventType::RateLimited, Some(unit_id), false, json!({ "handler": handler }));
            return Err(e);
        }

        let instance = self.instance(unit_id)?;
        let result = self.run_hook(unit_id, OperationClass::Job, instance.invoke(handler, payload)).await;
        let details = match &result {
            Ok(_) => json!({ "handler": handler }),
            Err(e) => json!({ "handler": handler, "error": e.to_string() }),
        };
        ctx.audit.record(AuditEventType::ContributionInvoked, Some(unit_id), result.is_ok(), details);
        result
    }

    /// Collect metrics from a ready unit. Units without a `metrics`
    /// entrypoint report an empty object.
    pub async fn metrics(&self, unit_id: &str) -> BridgeResult<serde_json::Value> {
        let record = self.inner.ctx.registry.require(unit_id)?;
        if !record.is_ready() {
            return Err(BridgeError::lifecycle(unit_id, format!("unit is {}", record.state)));
        }
        if record.manifest.entrypoints.metrics.is_none() {
            return Ok(json!({}));
        }
        let instance = self.instance(unit_id)?;
        self.run_hook(unit_id, OperationClass::HealthCheck, instance.metrics()).await
    }

    /// Stop every ready unit in reverse load order, each under the unload
    /// timeout. Units are left `Disabled` with [`SHUTDOWN_REASON`], or with
    /// [`FORCED_SHUTDOWN_REASON`] when their shutdown hook failed.
    pub async fn shutdown(&self) -> ShutdownReport {
        let ctx = &self.inner.ctx;
        let mut report = ShutdownReport::default();

        let mut ready = ctx.registry.list(&RecordFilter::state(PluginState::Ready));
        ready.sort_by_key(|r| std::cmp::Reverse(r.load_order));

        for record in ready {
            let id = record.id();
            let lock = self.unit_lock(id);
            let _guard = lock.lock().await;
            if ctx.registry.state(id) != Some(PluginState::Ready) {
                continue;
            }

            let reason = match self.unload_instance(id).await {
                Ok(()) => {
                    report.stopped.push(id.to_string());
                    SHUTDOWN_REASON
                }
                Err(e) => {
                    tracing::warn!(unit = %id, error = %e, "Unit failed to stop, instance dropped");
                    report.forced.push(id.to_string());
                    FORCED_SHUTDOWN_REASON
                }
            };
            if let Err(e) = self.set_disabled(id, reason) {
                tracing::debug!(unit = %id, error = %e, "Could not mark unit stopped");
            }
        }

        if !ctx.events.flush(Duration::from_secs(1)).await {
            tracing::debug!("Event queues not drained at shutdown");
        }
        tracing::info!(stopped = report.stopped.len(), forced = report.forced.len(), "Bridge shut down");
        report
    }

    pub fn list(&self, filter: &RecordFilter) -> Vec<PluginRecord> {
        self.inner.ctx.registry.list(filter)
    }

    pub fn get(&self, unit_id: &str) -> Option<PluginRecord> {
        self.inner.ctx.registry.get(unit_id)
    }

    pub fn summary(&self) -> RegistrySummary {
        self.inner.ctx.registry.summary()
    }

    /// Whether the unit has a live instance.
    pub fn is_live(&self, unit_id: &str) -> bool {
        self.inner.instances.read().contains_key(unit_id)
    }

    /// Tear down everything a live unit holds, in order: jobs,
    /// contributions, subscriptions, the lease behind its service handles,
    /// the `shutdown` hook, the instance and finally its permission grants. Returns the hook's result.
    async fn unload_instance(&self, unit_id: &str) -> BridgeResult<()> {
        let ctx = &self.inner.ctx;
        let has_shutdown = ctx.registry.get(unit_id).is_some_and(|r| r.manifest.entrypoints.shutdown.is_some());

        let jobs = ctx.jobs.cancel_unit(unit_id);
        let contributions = ctx.contributions.unregister_owner(unit_id);
        let subscriptions = ctx.events.unsubscribe_owner(unit_id);

        self.revoke_lease(unit_id);
        let instance = self.inner.instances.write().remove(unit_id);
        let result = match instance {
            Some(instance) if has_shutdown => {
                self.run_hook(unit_id, OperationClass::Unload, instance.shutdown()).await
            }
            _ => Ok(()),
        };
        ctx.permissions.unregister(unit_id);

        ctx.audit.record(
            AuditEventType::PluginUnloaded,
            Some(unit_id),
            result.is_ok(),
            json!({ "jobs_cancelled": jobs, "contributions": contributions, "subscriptions": subscriptions }),
        );
        tracing::debug!(unit = %unit_id, jobs, contributions, subscriptions, "Unit unloaded");
        result
    }

    /// Undo a partial load.
    fn release(&self, unit_id: &str) {
        let ctx = &self.inner.ctx;
        self.revoke_lease(unit_id);
        ctx.jobs.cancel_unit(unit_id);
        ctx.contributions.unregister_owner(unit_id);
        ctx.events.unsubscribe_owner(unit_id);
        ctx.permissions.unregister(unit_id);
    }

    fn revoke_lease(&self, unit_id: &str) {
        if let Some(lease) = self.inner.leases.lock().remove(unit_id) {
            lease.revoke();
        }
    }

    fn instance(&self, unit_id: &str) -> BridgeResult<Arc<dyn Plugin>> {
        self.inner
            .instances
            .read()
            .get(unit_id)
            .cloned()
            .ok_or_else(|| BridgeError::lifecycle(unit_id, "no live instance"))
    }

    fn unit_lock(&self, unit_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.inner.locks.lock().entry(unit_id.to_string()).or_default())
    }

    fn forget_lock(&self, unit_id: &str) {
        self.inner.locks.lock().remove(unit_id);
    }

    /// Run a unit hook under the class timeout, turning errors and panics
    /// into `PluginFailure`.
    async fn run_hook<T>(
        &self,
        unit_id: &str,
        class: OperationClass,
        hook: impl Future<Output = anyhow::Result<T>>,
    ) -> BridgeResult<T> {
        let guarded = AssertUnwindSafe(hook).catch_unwind();
        match self.inner.ctx.timeouts.run(class, unit_id, guarded).await? {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(BridgeError::PluginFailure { unit: unit_id.to_string(), message: format!("{e:#}") }),
            Err(panic) => Err(BridgeError::PluginFailure {
                unit: unit_id.to_string(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        }
    }

    /// Record a unit failure: `Error` state, audit entry, `plugin.error`.
    fn fail(&self, unit_id: &str, error: &BridgeError) {
        let ctx = &self.inner.ctx;
        if let Err(e) = ctx.registry.mark_error(unit_id, error) {
            tracing::debug!(unit = %unit_id, error = %e, "Could not record failure on unit");
        }
        ctx.audit.record(
            AuditEventType::PluginLoadFailed,
            Some(unit_id),
            false,
            json!({ "kind": error.kind(), "error": error.to_string() }),
        );
        ctx.events.emit(
            topics::PLUGIN_ERROR,
            json!({ "id": unit_id, "kind": error.kind(), "error": error.to_string() }),
            None,
        );
        tracing::warn!(unit = %unit_id, kind = error.kind(), error = %error, "Unit failed");
    }

    fn set_disabled(&self, unit_id: &str, reason: &str) -> BridgeResult<()> {
        let registry = &self.inner.ctx.registry;
        registry.transition(unit_id, PluginState::Disabled)?;
        registry.update(unit_id, |r| r.disabled_reason = Some(reason.to_string()))
    }

    fn mark_disabled(&self, unit_id: &str, reason: &str) -> BridgeResult<()> {
        let ctx = &self.inner.ctx;
        self.set_disabled(unit_id, reason)?;
        ctx.audit.record(AuditEventType::PluginDisabled, Some(unit_id), true, json!({ "reason": reason }));
        ctx.events.emit(topics::PLUGIN_DISABLED, json!({ "id": unit_id, "reason": reason }), None);
        tracing::info!(unit = %unit_id, reason = %reason, "Unit disabled");
        Ok(())
    }
}
