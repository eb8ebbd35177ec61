//! The runtime context: every bridge component, built once at startup.

use std::sync::Arc;

use parking_lot::RwLock;
use semver::Version;
use serde_json::json;

use crate::config::BridgeConfig;
use crate::contributions::ContributionRegistry;
use crate::error::BridgeResult;
use crate::events::EventBus;
use crate::governance::{GovernanceManager, GovernanceViolation};
use crate::jobs::JobManager;
use crate::locator::{CommandRunner, HistoryProvider, HostServices, NullHistory, ProcessRunner};
use crate::monitoring::{Alert, AlertThresholds, AuditEventType, AuditLog, RateLimiter, TimeoutPolicy};
use crate::permissions::PermissionChecker;
use crate::plugin::PluginCatalog;
use crate::registry::PluginRegistry;
use crate::trust::{TrustPolicy, TrustStore};

/// Shared components of one bridge instance.
pub struct BridgeContext {
    pub config: BridgeConfig,
    pub host_version: Version,
    pub audit: Arc<AuditLog>,
    pub events: Arc<EventBus>,
    pub permissions: Arc<PermissionChecker>,
    pub governance: Arc<GovernanceManager>,
    pub trust_store: Arc<RwLock<TrustStore>>,
    pub trust_policy: TrustPolicy,
    pub rate_limiter: Arc<RateLimiter>,
    pub timeouts: Arc<TimeoutPolicy>,
    pub jobs: JobManager,
    pub registry: Arc<PluginRegistry>,
    pub contributions: Arc<ContributionRegistry>,
    pub catalog: Arc<PluginCatalog>,
    pub runner: Arc<dyn CommandRunner>,
    pub history: Arc<dyn HistoryProvider>,
    pub alerts: AlertThresholds,
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("host_version", &self.host_version)
            .field("registry", &self.registry.len())
            .field("dev_mode", &self.dev_mode())
            .finish_non_exhaustive()
    }
}

impl BridgeContext {
    /// Build a context from configuration, with file-backed stores wherever
    /// the configuration names a path.
    pub fn from_config(config: BridgeConfig) -> BridgeResult<Self> {
        BridgeContextBuilder::new(config).build()
    }

    pub fn builder(config: BridgeConfig) -> BridgeContextBuilder {
        BridgeContextBuilder::new(config)
    }

    pub fn dev_mode(&self) -> bool {
        self.governance.dev_mode()
    }

    /// Services handed to each unit's locator.
    pub fn services(&self) -> HostServices {
        HostServices {
            events: Arc::clone(&self.events),
            jobs: self.jobs.clone(),
            runner: Arc::clone(&self.runner),
            history: Arc::clone(&self.history),
            audit: Arc::clone(&self.audit),
            permissions: Arc::clone(&self.permissions),
        }
    }

    /// Evaluate alert thresholds against current audit and job statistics.
    pub fn evaluate_alerts(&self) -> Vec<Alert> {
        self.alerts.evaluate(&self.audit.stats(), &self.jobs.get_stats(None))
    }
}

/// Builder for [`BridgeContext`] with replaceable host collaborators.
pub struct BridgeContextBuilder {
    config: BridgeConfig,
    runner: Option<Arc<dyn CommandRunner>>,
    history: Option<Arc<dyn HistoryProvider>>,
    trust_store: Option<TrustStore>,
    governance: Option<GovernanceManager>,
    catalog: Option<Arc<PluginCatalog>>,
}

impl BridgeContextBuilder {
    fn new(config: BridgeConfig) -> Self {
        Self { config, runner: None, history: None, trust_store: None, governance: None, catalog: None }
    }

    #[must_use]
    pub fn runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    #[must_use]
    pub fn history(mut self, history: Arc<dyn HistoryProvider>) -> Self {
        self.history = Some(history);
        self
    }

    #[must_use]
    pub fn trust_store(mut self, store: TrustStore) -> Self {
        self.trust_store = Some(store);
        self
    }

    #[must_use]
    pub fn governance(mut self, governance: GovernanceManager) -> Self {
        self.governance = Some(governance);
        self
    }

    #[must_use]
    pub fn catalog(mut self, catalog: Arc<PluginCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(self) -> BridgeResult<BridgeContext> {
        let config = self.config;
        config.validate()?;
        let dev_mode = config.general.dev_mode;

        let audit = Arc::new(match &config.audit.log_path {
            Some(path) => AuditLog::open(path, config.audit.max_entries)?,
            None => AuditLog::in_memory(config.audit.max_entries),
        });

        let governance = match self.governance {
            Some(governance) => {
                governance.set_dev_mode(dev_mode);
                governance
            }
            None => match &config.governance.config_path {
                Some(path) => GovernanceManager::load(path, dev_mode)?,
                None => GovernanceManager::new(Default::default(), dev_mode),
            },
        };
        let violation_audit = Arc::clone(&audit);
        governance.on_violation(Arc::new(move |violation: &GovernanceViolation| {
            violation_audit.record(
                AuditEventType::GovernanceViolation,
                Some(&violation.unit_id),
                false,
                json!({ "mode": violation.mode.as_str(), "reason": violation.reason }),
            );
        }));

        let trust_store = match self.trust_store {
            Some(store) => store,
            None => match &config.trust.store_path {
                Some(path) => TrustStore::load(path)
                    .map_err(|e| crate::error::BridgeError::Validation(format!("trust store: {e:#}")))?,
                None => TrustStore::default(),
            },
        };

        let alerts = match &config.audit.alerts_path {
            Some(path) => AlertThresholds::load(path)?,
            None => AlertThresholds::default(),
        };

        let events = Arc::new(EventBus::new(config.events));
        let rate_limiter = Arc::new(config.rate_limiter());
        let timeouts = Arc::new(config.timeout_policy());
        let jobs = JobManager::with_parts(
            config.job_manager_config(),
            Arc::clone(&events),
            Arc::clone(&audit),
            Arc::clone(&rate_limiter),
            Arc::clone(&timeouts),
        );

        tracing::debug!(dev_mode, plugins_dir = %config.general.plugins_dir.display(), "Bridge context built");
        Ok(BridgeContext {
            host_version: config.host_version(),
            trust_policy: config.trust_policy(),
            permissions: Arc::new(PermissionChecker::new(Arc::clone(&audit))),
            governance: Arc::new(governance),
            trust_store: Arc::new(RwLock::new(trust_store)),
            registry: Arc::new(PluginRegistry::new()),
            contributions: Arc::new(ContributionRegistry::new()),
            catalog: self.catalog.unwrap_or_default(),
            runner: self.runner.unwrap_or_else(|| Arc::new(ProcessRunner::default())),
            history: self.history.unwrap_or_else(|| Arc::new(NullHistory)),
            config,
            audit,
            events,
            rate_limiter,
            timeouts,
            jobs,
            alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::{GovernanceConfig, GovernanceMode};
    use crate::monitoring::AuditFilter;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_in_memory() {
        let ctx = BridgeContext::from_config(BridgeConfig::default()).unwrap();
        assert!(ctx.audit.path().is_none());
        assert!(ctx.trust_store.read().path().is_none());
        assert!(!ctx.dev_mode());
        assert!(ctx.evaluate_alerts().is_empty());
    }

    #[test]
    fn test_file_backed_stores() {
        let dir = TempDir::new().unwrap();
        let mut config = BridgeConfig::default();
        config.audit.log_path = Some(dir.path().join("audit.jsonl"));
        config.trust.store_path = Some(dir.path().join("trust.json"));
        config.governance.config_path = Some(dir.path().join("governance.toml"));
        config.general.dev_mode = true;

        let ctx = BridgeContext::from_config(config).unwrap();
        assert!(ctx.audit.path().is_some());
        assert_eq!(ctx.trust_store.read().path(), Some(dir.path().join("trust.json").as_path()));
        assert_eq!(ctx.governance.path(), Some(dir.path().join("governance.toml").as_path()));
        assert!(ctx.dev_mode());
    }

    #[test]
    fn test_governance_violations_are_audited() {
        let governance = GovernanceManager::new(
            GovernanceConfig { mode: GovernanceMode::Whitelist, ..Default::default() },
            false,
        );
        let ctx = BridgeContext::builder(BridgeConfig::default()).governance(governance).build().unwrap();

        assert!(ctx.governance.check_unit_allowed("acme.x").is_err());
        let entries = ctx.audit.query(&AuditFilter {
            event_type: Some(AuditEventType::GovernanceViolation),
            ..Default::default()
        });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].unit_id.as_deref(), Some("acme.x"));
    }
}
