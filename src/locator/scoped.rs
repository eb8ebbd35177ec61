//! Per-unit handles returned by the service locator.
//!
//! Every handle carries the owning unit id and stamps it on what it does:
//! log records, event sources, subscription owners and job owners.
//! Handles that act on shared services also carry the instance's
//! [`UnitLease`] and stop working once it is revoked.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;

use super::host::{CommandOutput, CommandRequest, CommandRunner, HistoryProvider, HistorySnapshot};
use super::UnitLease;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{is_valid_topic, Event, EventBus, SubscriptionId};
use crate::jobs::{Job, JobContext, JobFilter, JobManager, JobStats};
use crate::monitoring::{AuditEventType, AuditLog};

/// Log level for unit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogLevel {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Logger that tags every record with the unit id.
#[derive(Debug, Clone)]
pub struct UnitLogger {
    unit_id: String,
}

impl UnitLogger {
    pub(super) fn new(unit_id: &str) -> Self {
        Self { unit_id: unit_id.to_string() }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let unit = self.unit_id.as_str();
        match level {
            LogLevel::Trace => tracing::trace!(plugin = %unit, "{}", message),
            LogLevel::Debug => tracing::debug!(plugin = %unit, "{}", message),
            LogLevel::Info => tracing::info!(plugin = %unit, "{}", message),
            LogLevel::Warn => tracing::warn!(plugin = %unit, "{}", message),
            LogLevel::Error => tracing::error!(plugin = %unit, "{}", message),
        }
    }

    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }
}

/// Read-only view of a unit's configuration: manifest `config_schema`
/// defaults overlaid with the host's `[plugins.<id>]` table.
#[derive(Debug, Clone)]
pub struct ScopedConfig {
    unit_id: String,
    values: Arc<serde_json::Map<String, serde_json::Value>>,
}

impl ScopedConfig {
    pub(super) fn new(unit_id: &str, values: Arc<serde_json::Map<String, serde_json::Value>>) -> Self {
        Self { unit_id: unit_id.to_string(), values }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Deserialize one key. `Ok(None)` when the key is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> BridgeResult<Option<T>> {
        self.values
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|e| {
                    BridgeError::Validation(format!("config key '{key}' for '{}': {e}", self.unit_id))
                })
            })
            .transpose()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn all(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.values
    }
}

/// Mediated program execution, audited per call.
#[derive(Clone)]
pub struct ScopedRunner {
    unit_id: String,
    runner: Arc<dyn CommandRunner>,
    audit: Arc<AuditLog>,
    lease: UnitLease,
}

impl std::fmt::Debug for ScopedRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedRunner").field("unit_id", &self.unit_id).finish()
    }
}

impl ScopedRunner {
    pub(super) fn new(
        unit_id: &str,
        runner: Arc<dyn CommandRunner>,
        audit: Arc<AuditLog>,
        lease: UnitLease,
    ) -> Self {
        Self { unit_id: unit_id.to_string(), runner, audit, lease }
    }

    pub async fn run(&self, request: CommandRequest) -> BridgeResult<CommandOutput> {
        self.lease.check(&self.unit_id)?;
        let program = request.program.clone();
        let args = request.args.clone();
        tracing::debug!(plugin = %self.unit_id, program = %program, "Running command");

        let result = self.runner.run(request).await;
        let (success, details) = match &result {
            Ok(output) => (
                output.success(),
                json!({ "program": program, "args": args, "exit_code": output.exit_code }),
            ),
            Err(e) => (false, json!({ "program": program, "args": args, "error": e.to_string() })),
        };
        self.audit.record(AuditEventType::CommandExecuted, Some(&self.unit_id), success, details);
        result
    }
}

/// Event bus access that publishes as, and subscribes on behalf of, the unit.
#[derive(Debug, Clone)]
pub struct ScopedEventBus {
    unit_id: String,
    bus: Arc<EventBus>,
    lease: UnitLease,
}

impl ScopedEventBus {
    pub(super) fn new(unit_id: &str, bus: Arc<EventBus>, lease: UnitLease) -> Self {
        Self { unit_id: unit_id.to_string(), bus, lease }
    }

    /// Publish with the unit as source.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) -> BridgeResult<Event> {
        if !is_valid_topic(topic) {
            return Err(BridgeError::Validation(format!("invalid topic '{topic}'")));
        }
        self.lease.check(&self.unit_id)?;
        Ok(self.bus.emit(topic, payload, Some(&self.unit_id)))
    }

    /// Subscribe; the subscription is removed when the unit unloads and
    /// delivers nothing once the lease is revoked.
    pub fn subscribe<F>(&self, filter: &str, callback: F) -> BridgeResult<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.lease.check(&self.unit_id)?;
        let lease = self.lease.clone();
        self.bus.subscribe(
            filter,
            move |event| {
                if lease.is_live() {
                    callback(event);
                }
            },
            Some(&self.unit_id),
        )
    }

    /// Remove one of the unit's own subscriptions.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let owned = self
            .bus
            .subscriptions()
            .iter()
            .any(|s| s.id == id && s.owner.as_deref() == Some(self.unit_id.as_str()));
        owned && self.bus.unsubscribe(id)
    }

    pub fn history(&self, filter: Option<&str>, limit: usize) -> Vec<Event> {
        self.bus.history(filter, limit)
    }
}

/// Read access to analysis history.
#[derive(Clone)]
pub struct ScopedHistory {
    provider: Arc<dyn HistoryProvider>,
}

impl std::fmt::Debug for ScopedHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedHistory").finish_non_exhaustive()
    }
}

impl ScopedHistory {
    pub(super) fn new(provider: Arc<dyn HistoryProvider>) -> Self {
        Self { provider }
    }

    pub fn recent(&self, limit: usize) -> Vec<HistorySnapshot> {
        self.provider.recent(limit)
    }

    pub fn get(&self, snapshot_id: &str) -> Option<HistorySnapshot> {
        self.provider.get(snapshot_id)
    }
}

/// Job submission owned by the unit. Other units' jobs are invisible.
#[derive(Debug, Clone)]
pub struct ScopedJobs {
    unit_id: String,
    jobs: JobManager,
    lease: UnitLease,
}

impl ScopedJobs {
    pub(super) fn new(unit_id: &str, jobs: JobManager, lease: UnitLease) -> Self {
        Self { unit_id: unit_id.to_string(), jobs, lease }
    }

    pub fn submit<F, Fut>(&self, name: &str, handler: F, params: serde_json::Value) -> BridgeResult<String>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        self.lease.check(&self.unit_id)?;
        self.jobs.submit_named(Some(&self.unit_id), name, handler, params)
    }

    pub fn cancel(&self, job_id: &str) -> BridgeResult<bool> {
        self.owned(job_id)?;
        self.jobs.cancel(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).filter(|job| job.unit_id.as_deref() == Some(self.unit_id.as_str()))
    }

    pub fn list(&self, mut filter: JobFilter) -> Vec<Job> {
        filter.unit_id = Some(self.unit_id.clone());
        self.jobs.list(&filter)
    }

    pub fn stats(&self) -> JobStats {
        self.jobs.get_stats(Some(&self.unit_id))
    }

    pub async fn wait(&self, job_id: &str) -> BridgeResult<Job> {
        self.owned(job_id)?;
        self.jobs.wait(job_id).await
    }

    fn owned(&self, job_id: &str) -> BridgeResult<()> {
        self.get(job_id).map(|_| ()).ok_or_else(|| BridgeError::NotFound(format!("job {job_id}")))
    }
}
