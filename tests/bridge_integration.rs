//! Bridge Integration Tests
//!
//! Drives the runtime through its public API only: units on disk, a
//! catalog of implementations, and a bridge built from configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use jupiter_bridge::governance::GovernanceConfig;
use jupiter_bridge::jobs::{CircuitState, JobManagerConfig};
use jupiter_bridge::locator::ScopedEventBus;
use jupiter_bridge::monitoring::{AuditEventType, AuditFilter, AuditLog, UnitTimeouts};
use jupiter_bridge::trust::{sign_unit, SigningIdentity};
use jupiter_bridge::{
    Bridge, BridgeConfig, BridgeContext, BridgeError, EventBus, GovernanceManager, GovernanceMode, JobManager, JobStatus,
    Manifest, ManifestLoader, Plugin, PluginState, RestartOrigin, ServiceLocator, TrustLevel, UnitType,
    FORCED_SHUTDOWN_REASON, GOVERNANCE_REASON, SHUTDOWN_REASON,
};

// ============================================================================
// Fixtures
// ============================================================================

struct Noop;

#[async_trait]
impl Plugin for Noop {}

/// Appends its name to a shared log when stopped.
struct Recorder {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Plugin for Recorder {
    async fn shutdown(&self) -> anyhow::Result<()> {
        self.log.lock().push(self.name.clone());
        Ok(())
    }
}

/// Refuses to stop cleanly.
struct Stubborn;

#[async_trait]
impl Plugin for Stubborn {
    async fn shutdown(&self) -> anyhow::Result<()> {
        anyhow::bail!("still busy")
    }
}

struct Sleepy;

#[async_trait]
impl Plugin for Sleepy {
    async fn init(&self, _locator: ServiceLocator) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

struct Panicky;

#[async_trait]
impl Plugin for Panicky {
    async fn init(&self, _locator: ServiceLocator) -> anyhow::Result<()> {
        panic!("bad state");
    }
}

/// Reaches for the command runner without having asked for it.
struct Sneaky;

#[async_trait]
impl Plugin for Sneaky {
    async fn init(&self, locator: ServiceLocator) -> anyhow::Result<()> {
        locator.get_runner()?;
        Ok(())
    }
}

/// Stashes the event bus handle it was given where the test can reach it.
struct Keeper {
    slot: Arc<Mutex<Option<ScopedEventBus>>>,
}

#[async_trait]
impl Plugin for Keeper {
    async fn init(&self, locator: ServiceLocator) -> anyhow::Result<()> {
        *self.slot.lock() = Some(locator.get_event_bus()?);
        Ok(())
    }
}

/// Write `<plugins>/<id>/plugin.toml` with the given extra TOML appended.
fn write_unit(plugins: &Path, id: &str, extra: &str) -> PathBuf {
    write_unit_in(plugins, id, id, extra)
}

fn write_unit_in(plugins: &Path, dir_name: &str, id: &str, extra: &str) -> PathBuf {
    let dir = plugins.join(dir_name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.toml"), format!("id = \"{id}\"\nversion = \"1.0.0\"\ntype = \"tool\"\n{extra}"))
        .unwrap();
    dir
}

fn config_for(plugins: &Path) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.general.plugins_dir = plugins.to_path_buf();
    config
}

fn noop(bridge: &Bridge, ids: &[&str]) {
    for id in ids {
        bridge.context().catalog.register_fn(id, || Noop).unwrap();
    }
}

fn error_kind(bridge: &Bridge, id: &str) -> String {
    bridge.get(id).and_then(|r| r.error).map(|e| e.kind).unwrap_or_default()
}

// ============================================================================
// Discovery and Resolution
// ============================================================================

mod resolution {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_id_is_reported_invalid() {
        let tmp = TempDir::new().unwrap();
        write_unit_in(tmp.path(), "first", "acme.dup", "");
        write_unit_in(tmp.path(), "second", "acme.dup", "");

        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        let report = bridge.discover(tmp.path()).unwrap();

        assert_eq!(report.discovered, vec!["acme.dup".to_string()]);
        assert_eq!(report.invalid.len(), 1);
        assert!(report.invalid[0].source.ends_with("second"));
        assert_eq!(bridge.context().registry.len(), 1);
    }

    #[tokio::test]
    async fn test_core_units_load_first() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.view", "");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        noop(&bridge, &["acme.view"]);

        let core = Manifest::builder("core.store", "1.0.0", UnitType::Core).build().unwrap();
        bridge.register_core(core, Arc::new(|| Arc::new(Noop) as Arc<dyn Plugin>)).unwrap();

        let report = bridge.start().await.unwrap();
        assert_eq!(report.batches[0], vec!["core.store".to_string()]);
        assert_eq!(report.loaded.len(), 2);

        let core_order = bridge.get("core.store").unwrap().load_order;
        let tool_order = bridge.get("acme.view").unwrap().load_order;
        assert!(core_order < tool_order);
    }

    #[tokio::test]
    async fn test_core_unit_depending_on_tool_is_rejected() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.helper", "");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        noop(&bridge, &["acme.helper"]);

        let core = Manifest::builder("core.reports", "1.0.0", UnitType::Core)
            .dependency("acme.helper", "^1")
            .build()
            .unwrap();
        bridge.register_core(core, Arc::new(|| Arc::new(Noop) as Arc<dyn Plugin>)).unwrap();

        let report = bridge.start().await.unwrap();
        assert_eq!(report.loaded, vec!["acme.helper".to_string()]);
        assert_eq!(error_kind(&bridge, "core.reports"), "dependency_error");
        assert!(report.failed["core.reports"].contains("only depend on core units"));

        let err = bridge.restart("core.reports", RestartOrigin::Host).await.unwrap_err();
        assert!(err.to_string().contains("'acme.helper' is a Tool unit"));
        assert_eq!(bridge.get("core.reports").unwrap().state, PluginState::Error);
    }

    #[tokio::test]
    async fn test_cycle_is_excluded_without_blocking_others() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.a", "\n[dependencies]\n\"acme.b\" = \"^1\"\n");
        write_unit(tmp.path(), "acme.b", "\n[dependencies]\n\"acme.a\" = \"^1\"\n");
        write_unit(tmp.path(), "acme.c", "");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        noop(&bridge, &["acme.a", "acme.b", "acme.c"]);

        let report = bridge.start().await.unwrap();
        assert_eq!(report.loaded, vec!["acme.c".to_string()]);
        assert!(report.failed.contains_key("acme.a"));
        assert!(report.failed.contains_key("acme.b"));
        assert_eq!(error_kind(&bridge, "acme.a"), "circular_dependency_error");
        assert_eq!(bridge.get("acme.b").unwrap().state, PluginState::Error);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails_dependents_only() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.needy", "\n[dependencies]\n\"acme.ghost\" = \"^1\"\n");
        write_unit(tmp.path(), "acme.top", "\n[dependencies]\n\"acme.needy\" = \"^1\"\n");
        write_unit(tmp.path(), "acme.solo", "");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        noop(&bridge, &["acme.needy", "acme.top", "acme.solo"]);

        let report = bridge.start().await.unwrap();
        assert_eq!(report.loaded, vec!["acme.solo".to_string()]);
        assert_eq!(error_kind(&bridge, "acme.needy"), "dependency_error");
        assert!(report.failed["acme.needy"].contains("acme.ghost"));
        assert_eq!(error_kind(&bridge, "acme.top"), "dependency_error");
        assert!(report.failed["acme.top"].contains("acme.needy"));
    }

    #[test]
    fn test_version_mismatch_is_reported() {
        let tmp = TempDir::new().unwrap();
        let base = write_unit(tmp.path(), "acme.base", "");
        let ext = write_unit(tmp.path(), "acme.ext", "\n[dependencies]\n\"acme.base\" = \"^2\"\n");

        let loader = ManifestLoader::new(jupiter_bridge::host_version());
        let manifests = vec![loader.load_dir(&base).unwrap(), loader.load_dir(&ext).unwrap()];
        let plan = jupiter_bridge::DependencyResolver::new().resolve(manifests.iter()).unwrap();

        assert_eq!(plan.order(), vec!["acme.base".to_string()]);
        let err = plan.failures["acme.ext"].to_error("acme.ext");
        assert!(err.to_string().contains("^2"));
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_init_timeout_is_isolated() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.slow", "\n[entrypoints]\ninit = \"init\"\n");
        write_unit(tmp.path(), "acme.fast", "");

        let mut config = config_for(tmp.path());
        config
            .timeouts
            .overrides
            .insert("acme.slow".to_string(), UnitTimeouts { load_ms: Some(50), ..Default::default() });
        let bridge = Bridge::from_config(config).unwrap();
        bridge.context().catalog.register_fn("acme.slow", || Sleepy).unwrap();
        noop(&bridge, &["acme.fast"]);

        let report = bridge.start().await.unwrap();
        assert_eq!(report.loaded, vec!["acme.fast".to_string()]);
        assert_eq!(error_kind(&bridge, "acme.slow"), "timeout");
        assert!(!bridge.is_live("acme.slow"));

        let errors = bridge.context().events.history(Some("plugin.error"), 10);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["id"], "acme.slow");
    }

    #[tokio::test]
    async fn test_panicking_init_marks_error() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.panic", "\n[entrypoints]\ninit = \"init\"\n");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        bridge.context().catalog.register_fn("acme.panic", || Panicky).unwrap();

        let report = bridge.start().await.unwrap();
        assert!(report.loaded.is_empty());
        assert!(report.failed["acme.panic"].contains("bad state"));
        assert_eq!(error_kind(&bridge, "acme.panic"), "plugin_failure");
    }

    #[tokio::test]
    async fn test_shutdown_runs_in_reverse_load_order() {
        let tmp = TempDir::new().unwrap();
        let hooks = "\n[entrypoints]\nshutdown = \"shutdown\"\n";
        write_unit(tmp.path(), "acme.base", hooks);
        write_unit(tmp.path(), "acme.mid", &format!("{hooks}\n[dependencies]\n\"acme.base\" = \"^1\"\n"));
        write_unit(tmp.path(), "acme.top", &format!("{hooks}\n[dependencies]\n\"acme.mid\" = \"^1\"\n"));

        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in ["acme.base", "acme.mid", "acme.top"] {
            let log = Arc::clone(&log);
            bridge
                .context()
                .catalog
                .register_fn(id, move || Recorder { name: id.to_string(), log: Arc::clone(&log) })
                .unwrap();
        }

        let report = bridge.start().await.unwrap();
        assert_eq!(report.batches.len(), 3);

        let shutdown = bridge.shutdown().await;
        assert!(shutdown.forced.is_empty());
        assert_eq!(*log.lock(), vec!["acme.top".to_string(), "acme.mid".to_string(), "acme.base".to_string()]);
        assert!(bridge.list(&Default::default()).iter().all(|r| r.state == PluginState::Disabled));
    }

    #[tokio::test]
    async fn test_unit_config_is_checked_against_its_schema() {
        let tmp = TempDir::new().unwrap();
        let typed = "\n[config_schema]\nthreshold = { type = \"integer\", minimum = 1, default = 15 }\n";
        write_unit(tmp.path(), "acme.strict", typed);
        write_unit(tmp.path(), "acme.lenient", typed);
        write_unit(tmp.path(), "acme.broken", "\n[config_schema]\nname = { type = \"string\", pattern = \"(unclosed\" }\n");

        let mut config = config_for(tmp.path());
        let mut overrides = toml::Table::new();
        overrides.insert("threshold".to_string(), toml::Value::Integer(0));
        config.plugins.insert("acme.strict".to_string(), overrides);
        let bridge = Bridge::from_config(config).unwrap();
        noop(&bridge, &["acme.strict", "acme.lenient", "acme.broken"]);

        let report = bridge.start().await.unwrap();
        assert_eq!(report.loaded, vec!["acme.lenient".to_string()]);
        assert_eq!(error_kind(&bridge, "acme.strict"), "validation_error");
        assert!(!bridge.is_live("acme.strict"));
        assert_eq!(report.invalid.len(), 1);
        assert!(report.invalid[0].reason.contains("config_schema"));
    }

    #[tokio::test]
    async fn test_forced_shutdown_is_recorded_apart_from_clean_stops() {
        let tmp = TempDir::new().unwrap();
        let hooks = "\n[entrypoints]\nshutdown = \"shutdown\"\n";
        write_unit(tmp.path(), "acme.clean", hooks);
        write_unit(tmp.path(), "acme.stuck", hooks);
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        noop(&bridge, &["acme.clean"]);
        bridge.context().catalog.register_fn("acme.stuck", || Stubborn).unwrap();
        bridge.start().await.unwrap();

        let report = bridge.shutdown().await;
        assert_eq!(report.stopped, vec!["acme.clean".to_string()]);
        assert_eq!(report.forced, vec!["acme.stuck".to_string()]);

        let clean = bridge.get("acme.clean").unwrap();
        assert_eq!(clean.disabled_reason.as_deref(), Some(SHUTDOWN_REASON));
        let stuck = bridge.get("acme.stuck").unwrap();
        assert_eq!(stuck.state, PluginState::Disabled);
        assert_eq!(stuck.disabled_reason.as_deref(), Some(FORCED_SHUTDOWN_REASON));
        assert!(!bridge.is_live("acme.stuck"));
    }

    #[tokio::test]
    async fn test_operator_restart_of_non_restartable_unit_is_refused() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.pinned", "restartable = false\n");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        noop(&bridge, &["acme.pinned"]);
        bridge.start().await.unwrap();

        let err = bridge.restart("acme.pinned", RestartOrigin::Operator).await.unwrap_err();
        assert!(matches!(err, BridgeError::Lifecycle { .. }));
        assert_eq!(bridge.get("acme.pinned").unwrap().state, PluginState::Ready);

        bridge.restart("acme.pinned", RestartOrigin::Host).await.unwrap();
        assert_eq!(bridge.get("acme.pinned").unwrap().state, PluginState::Ready);
    }

    #[tokio::test]
    async fn test_errored_unit_can_be_restarted_after_fix() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.flaky", "\n[entrypoints]\ninit = \"init\"\n");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        bridge.context().catalog.register_fn("acme.flaky", || Panicky).unwrap();
        bridge.start().await.unwrap();
        assert_eq!(bridge.get("acme.flaky").unwrap().state, PluginState::Error);

        bridge.context().catalog.unregister("acme.flaky");
        noop(&bridge, &["acme.flaky"]);
        bridge.restart("acme.flaky", RestartOrigin::Operator).await.unwrap();

        let record = bridge.get("acme.flaky").unwrap();
        assert_eq!(record.state, PluginState::Ready);
        assert!(record.error.is_none());
    }
}

// ============================================================================
// Events
// ============================================================================

mod events {
    use super::*;

    #[tokio::test]
    async fn test_unsubscribe_owner_is_idempotent() {
        let bridge = Bridge::from_config(BridgeConfig::default()).unwrap();
        let events = &bridge.context().events;

        events.subscribe("scan.*", |_| {}, Some("acme.a")).unwrap();
        events.subscribe("scan.done", |_| {}, Some("acme.a")).unwrap();
        events.subscribe("scan.*", |_| {}, Some("acme.b")).unwrap();

        assert_eq!(events.unsubscribe_owner("acme.a"), 2);
        assert_eq!(events.unsubscribe_owner("acme.a"), 0);
        assert_eq!(events.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_history_keeps_emission_order() {
        let bridge = Bridge::from_config(BridgeConfig::default()).unwrap();
        let events = &bridge.context().events;
        for n in 0..3 {
            events.emit("scan.progress", json!({ "n": n }), Some("acme.scan"));
        }

        let history = events.history(Some("scan.progress"), 10);
        let seen: Vec<i64> = history.iter().filter_map(|e| e.payload["n"].as_i64()).collect();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(events.history(Some("scan.progress"), 1)[0].payload["n"], 2);
    }
}

// ============================================================================
// Jobs
// ============================================================================

mod jobs {
    use super::*;

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let mut config = BridgeConfig::default();
        config.circuit_breaker.threshold = 3;
        let ctx = BridgeContext::from_config(config).unwrap();

        for _ in 0..3 {
            let id = ctx
                .jobs
                .submit(Some("acme.flaky"), |_ctx| async { Err("boom".to_string()) }, json!({}))
                .unwrap();
            assert_eq!(ctx.jobs.wait(&id).await.unwrap().status, JobStatus::Failed);
        }

        let refused = ctx.jobs.submit(Some("acme.flaky"), |_ctx| async { Ok(json!(null)) }, json!({}));
        assert!(matches!(refused, Err(BridgeError::CircuitOpen { .. })));

        let stats = ctx.jobs.get_stats(Some("acme.flaky"));
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.open_circuits, vec!["acme.flaky".to_string()]);
        let opened = ctx.audit.query(&AuditFilter {
            event_type: Some(AuditEventType::CircuitOpened),
            ..Default::default()
        });
        assert_eq!(opened.len(), 1);
    }

    #[tokio::test]
    async fn test_breaker_recovers_through_a_single_trial_job() {
        let config = JobManagerConfig {
            breaker_threshold: 1,
            breaker_cooldown: Duration::from_millis(50),
            ..Default::default()
        };
        let jobs = JobManager::new(config, Arc::new(EventBus::default()), Arc::new(AuditLog::in_memory(100)));

        let failed = jobs.submit(Some("acme.flaky"), |_ctx| async { Err("boom".to_string()) }, json!({})).unwrap();
        jobs.wait(&failed).await.unwrap();
        assert!(matches!(
            jobs.submit(Some("acme.flaky"), |_ctx| async { Ok(json!(null)) }, json!({})),
            Err(BridgeError::CircuitOpen { .. })
        ));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(jobs.breakers().state("acme.flaky"), CircuitState::HalfOpen);

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let trial = jobs
            .submit(
                Some("acme.flaky"),
                |_ctx| async move { gate.await.map(|()| json!("recovered")).map_err(|e| e.to_string()) },
                json!({}),
            )
            .unwrap();
        assert!(matches!(
            jobs.submit(Some("acme.flaky"), |_ctx| async { Ok(json!(null)) }, json!({})),
            Err(BridgeError::CircuitOpen { .. })
        ));

        release.send(()).unwrap();
        assert_eq!(jobs.wait(&trial).await.unwrap().status, JobStatus::Completed);

        let stats = jobs.breakers().stats("acme.flaky").unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.rejections, 2);
        assert!(jobs.submit(Some("acme.flaky"), |_ctx| async { Ok(json!(null)) }, json!({})).is_ok());
    }

    #[tokio::test]
    async fn test_cooperative_cancellation_is_not_a_failure() {
        let ctx = BridgeContext::from_config(BridgeConfig::default()).unwrap();
        let id = ctx
            .jobs
            .submit(
                Some("acme.scan"),
                |job| async move {
                    while !job.is_cancelled() {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok(json!(null))
                },
                json!({}),
            )
            .unwrap();

        while ctx.jobs.get(&id).map(|j| j.status) != Some(JobStatus::Running) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ctx.jobs.cancel(&id).unwrap());

        let job = ctx.jobs.wait(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);

        let stats = ctx.jobs.get_stats(Some("acme.scan"));
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.failed, 0);
        assert!(stats.open_circuits.is_empty());
        assert!(!ctx.jobs.cancel(&id).unwrap());
    }
}

// ============================================================================
// Permissions and Governance
// ============================================================================

mod access {
    use super::*;

    #[tokio::test]
    async fn test_undeclared_service_fails_init_and_is_audited() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.sneaky", "permissions = [\"log.write\"]\n\n[entrypoints]\ninit = \"init\"\n");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        bridge.context().catalog.register_fn("acme.sneaky", || Sneaky).unwrap();

        let report = bridge.start().await.unwrap();
        assert!(report.failed["acme.sneaky"].contains("commands.run"));
        assert_eq!(error_kind(&bridge, "acme.sneaky"), "plugin_failure");

        let denied = bridge.context().audit.query(&AuditFilter {
            event_type: Some(AuditEventType::PermissionDenied),
            unit_id: Some("acme.sneaky".to_string()),
            ..Default::default()
        });
        assert_eq!(denied.len(), 1);
        assert!(!denied[0].success);
    }

    #[tokio::test]
    async fn test_empty_whitelist_blocks_tools_but_not_core() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.tool", "");

        let governance = GovernanceManager::new(
            GovernanceConfig { mode: GovernanceMode::Whitelist, ..Default::default() },
            false,
        );
        let ctx = BridgeContext::builder(config_for(tmp.path())).governance(governance).build().unwrap();
        let bridge = Bridge::new(ctx);
        noop(&bridge, &["acme.tool"]);
        let core = Manifest::builder("core.settings", "1.0.0", UnitType::Core).build().unwrap();
        bridge.register_core(core, Arc::new(|| Arc::new(Noop) as Arc<dyn Plugin>)).unwrap();

        let report = bridge.start().await.unwrap();
        assert_eq!(report.loaded, vec!["core.settings".to_string()]);
        assert_eq!(report.disabled, vec!["acme.tool".to_string()]);
        assert_eq!(bridge.get("acme.tool").unwrap().state, PluginState::Disabled);

        let violations = bridge.context().audit.query(&AuditFilter {
            event_type: Some(AuditEventType::GovernanceViolation),
            ..Default::default()
        });
        assert_eq!(violations.len(), 1);
    }

    #[tokio::test]
    async fn test_denying_a_ready_tool_unloads_it() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.kept", "");
        write_unit(tmp.path(), "acme.banned", "");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        noop(&bridge, &["acme.kept", "acme.banned"]);
        let core = Manifest::builder("core.settings", "1.0.0", UnitType::Core).build().unwrap();
        bridge.register_core(core, Arc::new(|| Arc::new(Noop) as Arc<dyn Plugin>)).unwrap();
        bridge.start().await.unwrap();

        let governance = &bridge.context().governance;
        governance.set_mode(GovernanceMode::Blacklist);
        governance.deny("acme.banned");
        assert_eq!(bridge.apply_governance().await, vec!["acme.banned".to_string()]);

        let banned = bridge.get("acme.banned").unwrap();
        assert_eq!(banned.state, PluginState::Disabled);
        assert_eq!(banned.disabled_reason.as_deref(), Some(GOVERNANCE_REASON));
        assert!(!bridge.is_live("acme.banned"));
        assert!(bridge.is_live("acme.kept"));
        assert!(bridge.is_live("core.settings"));

        let changed = bridge.context().events.history(Some("config.changed"), 10);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].payload["section"], "governance");
        assert_eq!(changed[0].payload["disabled"], json!(["acme.banned"]));
        let violations = bridge.context().audit.query(&AuditFilter {
            event_type: Some(AuditEventType::GovernanceViolation),
            unit_id: Some("acme.banned".to_string()),
            ..Default::default()
        });
        assert_eq!(violations.len(), 1);

        assert!(bridge.apply_governance().await.is_empty());
        assert!(matches!(bridge.enable("acme.banned").await, Err(BridgeError::Governance { .. })));
    }

    #[tokio::test]
    async fn test_kept_event_bus_dies_with_its_instance() {
        let tmp = TempDir::new().unwrap();
        write_unit(tmp.path(), "acme.keeper", "permissions = [\"events.emit\"]\n\n[entrypoints]\ninit = \"init\"\n");
        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        let slot = Arc::new(Mutex::new(None));
        let kept = Arc::clone(&slot);
        bridge.context().catalog.register_fn("acme.keeper", move || Keeper { slot: Arc::clone(&kept) }).unwrap();

        bridge.start().await.unwrap();
        let stale = slot.lock().take().unwrap();
        bridge.disable("acme.keeper", "operator").await.unwrap();

        assert!(matches!(stale.subscribe("scan.*", |_| {}), Err(BridgeError::Lifecycle { .. })));
        assert!(matches!(stale.emit("scan.done", json!({})), Err(BridgeError::Lifecycle { .. })));
        assert!(bridge.context().events.subscriptions().is_empty());

        bridge.enable("acme.keeper").await.unwrap();
        assert!(stale.emit("scan.done", json!({})).is_err());
        let fresh = slot.lock().take().unwrap();
        let event = fresh.emit("scan.done", json!({})).unwrap();
        assert_eq!(event.source.as_deref(), Some("acme.keeper"));
    }
}

// ============================================================================
// Trust
// ============================================================================

mod trust {
    use super::*;

    fn signed_unit(tmp: &TempDir) -> (Bridge, PathBuf) {
        let dir = write_unit(tmp.path(), "acme.signed", "");
        std::fs::write(dir.join("main.txt"), "payload").unwrap();

        let bridge = Bridge::from_config(config_for(tmp.path())).unwrap();
        noop(&bridge, &["acme.signed"]);

        let identity = SigningIdentity::generate("jupiter");
        bridge
            .context()
            .trust_store
            .write()
            .add_signer("jupiter", &identity.public_key_base64(), TrustLevel::Official)
            .unwrap();
        let manifest = ManifestLoader::new(jupiter_bridge::host_version()).load_dir(&dir).unwrap();
        sign_unit(&dir, &manifest, &identity, TrustLevel::Official, None).unwrap();
        (bridge, dir)
    }

    #[tokio::test]
    async fn test_signed_unit_loads_with_its_trust_level() {
        let tmp = TempDir::new().unwrap();
        let (bridge, _dir) = signed_unit(&tmp);

        let report = bridge.start().await.unwrap();
        assert_eq!(report.loaded, vec!["acme.signed".to_string()]);
        let record = bridge.get("acme.signed").unwrap();
        assert!(record.trust.verified);
        assert_eq!(record.trust.trust_level, TrustLevel::Official);
    }

    #[tokio::test]
    async fn test_tampered_unit_is_refused() {
        let tmp = TempDir::new().unwrap();
        let (bridge, dir) = signed_unit(&tmp);
        std::fs::write(dir.join("main.txt"), "paylaod").unwrap();

        let report = bridge.start().await.unwrap();
        assert!(report.loaded.is_empty());
        assert!(report.failed.contains_key("acme.signed"));
        assert_eq!(error_kind(&bridge, "acme.signed"), "signature_error");
        assert!(!bridge.is_live("acme.signed"));
    }
}
