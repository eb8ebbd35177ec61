//! Capability-scoped service access for units.
//!
//! A [`ServiceLocator`] is built once per unit when it loads and handed to
//! its `init` hook. Each accessor checks the matching permission first and
//! fails with `PermissionDenied` when the manifest did not declare it.

mod host;
mod scoped;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use host::{CommandOutput, CommandRequest, CommandRunner, HistoryProvider, HistorySnapshot, NullHistory, ProcessRunner};
pub use scoped::{LogLevel, ScopedConfig, ScopedEventBus, ScopedHistory, ScopedJobs, ScopedRunner, UnitLogger};

use crate::error::{BridgeError, BridgeResult};
use crate::events::EventBus;
use crate::jobs::JobManager;
use crate::monitoring::AuditLog;
use crate::permissions::{Permission, PermissionChecker};

/// Host services shared by every locator.
#[derive(Clone)]
pub struct HostServices {
    pub events: Arc<EventBus>,
    pub jobs: JobManager,
    pub runner: Arc<dyn CommandRunner>,
    pub history: Arc<dyn HistoryProvider>,
    pub audit: Arc<AuditLog>,
    pub permissions: Arc<PermissionChecker>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices").field("events", &self.events).field("jobs", &self.jobs).finish()
    }
}

/// Liveness flag shared by one unit instance and every handle it was
/// given. Revoked when the instance unloads; handles holding a revoked
/// lease refuse to act, even if the unit later loads again.
#[derive(Debug, Clone)]
pub struct UnitLease(Arc<AtomicBool>);

impl UnitLease {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub(crate) fn check(&self, unit_id: &str) -> BridgeResult<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(BridgeError::lifecycle(unit_id, "instance has been unloaded"))
        }
    }
}

impl Default for UnitLease {
    fn default() -> Self {
        Self::new()
    }
}

/// Service names understood by [`ServiceLocator::check_service`].
pub const SERVICES: [(&str, Permission); 6] = [
    ("logger", Permission::WriteLog),
    ("config", Permission::ReadConfig),
    ("runner", Permission::RunCommands),
    ("event_bus", Permission::EmitEvents),
    ("history", Permission::ReadHistory),
    ("jobs", Permission::SubmitJobs),
];

/// Per-unit facade over [`HostServices`].
#[derive(Debug, Clone)]
pub struct ServiceLocator {
    unit_id: String,
    services: HostServices,
    config: Arc<serde_json::Map<String, serde_json::Value>>,
    lease: UnitLease,
}

impl ServiceLocator {
    pub fn new(
        unit_id: &str,
        services: HostServices,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self { unit_id: unit_id.to_string(), services, config: Arc::new(config), lease: UnitLease::new() }
    }

    /// Tie this locator and its handles to an instance's lease.
    pub fn with_lease(mut self, lease: UnitLease) -> Self {
        self.lease = lease;
        self
    }

    pub fn lease(&self) -> &UnitLease {
        &self.lease
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.services.permissions.has_permission(&self.unit_id, permission)
    }

    pub fn get_logger(&self) -> BridgeResult<UnitLogger> {
        self.require(Permission::WriteLog)?;
        Ok(UnitLogger::new(&self.unit_id))
    }

    pub fn get_config(&self) -> BridgeResult<ScopedConfig> {
        self.require(Permission::ReadConfig)?;
        Ok(ScopedConfig::new(&self.unit_id, Arc::clone(&self.config)))
    }

    pub fn get_runner(&self) -> BridgeResult<ScopedRunner> {
        self.require(Permission::RunCommands)?;
        Ok(ScopedRunner::new(
            &self.unit_id,
            Arc::clone(&self.services.runner),
            Arc::clone(&self.services.audit),
            self.lease.clone(),
        ))
    }

    pub fn get_event_bus(&self) -> BridgeResult<ScopedEventBus> {
        self.require(Permission::EmitEvents)?;
        Ok(ScopedEventBus::new(&self.unit_id, Arc::clone(&self.services.events), self.lease.clone()))
    }

    pub fn get_history(&self) -> BridgeResult<ScopedHistory> {
        self.require(Permission::ReadHistory)?;
        Ok(ScopedHistory::new(Arc::clone(&self.services.history)))
    }

    pub fn get_jobs(&self) -> BridgeResult<ScopedJobs> {
        self.require(Permission::SubmitJobs)?;
        Ok(ScopedJobs::new(&self.unit_id, self.services.jobs.clone(), self.lease.clone()))
    }

    /// Check access to a service by name, for units that look services up
    /// dynamically. Unknown names fail with `ServiceNotFound`.
    pub fn check_service(&self, name: &str) -> BridgeResult<()> {
        let permission = SERVICES
            .iter()
            .find(|(service, _)| *service == name)
            .map(|(_, permission)| *permission)
            .ok_or_else(|| BridgeError::ServiceNotFound(name.to_string()))?;
        self.require(permission)
    }

    fn require(&self, permission: Permission) -> BridgeResult<()> {
        self.lease.check(&self.unit_id)?;
        self.services.permissions.require_permission(&self.unit_id, permission)
    }
}
