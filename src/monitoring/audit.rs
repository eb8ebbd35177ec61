//! Append-only audit trail.
//!
//! Entries are kept in a bounded in-memory window for queries and, when a
//! path is configured, appended to a JSON Lines file that is replayed on
//! startup. Aggregate statistics are cumulative and survive the in-memory
//! window rolling over.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BridgeResult;
use crate::permissions::Permission;

/// Kinds of audited events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    PluginDiscovered,
    PluginLoaded,
    PluginLoadFailed,
    PluginUnloaded,
    PluginEnabled,
    PluginDisabled,
    PluginRestarted,
    PluginReloaded,
    PluginInstalled,
    PluginUninstalled,
    PermissionCheck,
    PermissionDenied,
    GovernanceViolation,
    SignatureVerified,
    SignatureFailed,
    JobSubmitted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    CircuitOpened,
    RateLimited,
    CommandExecuted,
    ContributionInvoked,
}

impl AuditEventType {
    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PluginDiscovered => "plugin_discovered",
            Self::PluginLoaded => "plugin_loaded",
            Self::PluginLoadFailed => "plugin_load_failed",
            Self::PluginUnloaded => "plugin_unloaded",
            Self::PluginEnabled => "plugin_enabled",
            Self::PluginDisabled => "plugin_disabled",
            Self::PluginRestarted => "plugin_restarted",
            Self::PluginReloaded => "plugin_reloaded",
            Self::PluginInstalled => "plugin_installed",
            Self::PluginUninstalled => "plugin_uninstalled",
            Self::PermissionCheck => "permission_check",
            Self::PermissionDenied => "permission_denied",
            Self::GovernanceViolation => "governance_violation",
            Self::SignatureVerified => "signature_verified",
            Self::SignatureFailed => "signature_failed",
            Self::JobSubmitted => "job_submitted",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::CircuitOpened => "circuit_opened",
            Self::RateLimited => "rate_limited",
            Self::CommandExecuted => "command_executed",
            Self::ContributionInvoked => "contribution_invoked",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Query over the audit trail. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub unit_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        self.event_type.map_or(true, |t| t == entry.event_type)
            && self.unit_id.as_deref().map_or(true, |u| entry.unit_id.as_deref() == Some(u))
            && self.since.map_or(true, |since| entry.timestamp >= since)
            && self.until.map_or(true, |until| entry.timestamp <= until)
            && self.success.map_or(true, |s| s == entry.success)
    }
}

/// Cumulative audit statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub by_type: BTreeMap<String, u64>,
    pub failures_by_unit: BTreeMap<String, u64>,
}

impl AuditStats {
    fn count(&mut self, entry: &AuditEntry) {
        self.total += 1;
        if entry.success {
            self.successes += 1;
        } else {
            self.failures += 1;
            if let Some(unit) = &entry.unit_id {
                *self.failures_by_unit.entry(unit.clone()).or_default() += 1;
            }
        }
        *self.by_type.entry(entry.event_type.as_str().to_string()).or_default() += 1;
    }

    /// Number of entries of the given type.
    pub fn count_of(&self, event_type: AuditEventType) -> u64 {
        self.by_type.get(event_type.as_str()).copied().unwrap_or(0)
    }
}

struct AuditInner {
    entries: VecDeque<AuditEntry>,
    stats: AuditStats,
    next_id: u64,
}

/// Append-only audit log.
pub struct AuditLog {
    inner: Mutex<AuditInner>,
    max_entries: usize,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AuditLog")
            .field("entries", &inner.entries.len())
            .field("total", &inner.stats.total)
            .field("path", &self.path)
            .finish()
    }
}

impl AuditLog {
    /// Create a log that only lives in memory.
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(AuditInner {
                entries: VecDeque::new(),
                stats: AuditStats::default(),
                next_id: 1,
            }),
            max_entries: max_entries.max(1),
            path: None,
        }
    }

    /// Open a file-backed log, replaying existing entries.
    pub fn open(path: &Path, max_entries: usize) -> BridgeResult<Self> {
        let log = Self { path: Some(path.to_path_buf()), ..Self::in_memory(max_entries) };

        if path.exists() {
            let reader = BufReader::new(fs::File::open(path)?);
            let mut inner = log.inner.lock();
            for line in reader.lines().map_while(Result::ok) {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(&line) {
                    Ok(entry) => {
                        inner.next_id = inner.next_id.max(entry.id + 1);
                        inner.stats.count(&entry);
                        inner.entries.push_back(entry);
                        if inner.entries.len() > log.max_entries {
                            inner.entries.pop_front();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt audit line");
                    }
                }
            }
        } else if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(log)
    }

    /// Append an entry.
    pub fn record(
        &self,
        event_type: AuditEventType,
        unit_id: Option<&str>,
        success: bool,
        details: serde_json::Value,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let entry = AuditEntry {
            id: inner.next_id,
            timestamp: Utc::now(),
            event_type,
            unit_id: unit_id.map(str::to_string),
            success,
            details,
        };
        inner.next_id += 1;
        inner.stats.count(&entry);

        if let Some(path) = &self.path {
            if let Err(e) = append_line(path, &entry) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist audit entry");
            }
        }

        let id = entry.id;
        inner.entries.push_back(entry);
        if inner.entries.len() > self.max_entries {
            inner.entries.pop_front();
        }
        id
    }

    /// Shorthand for permission checks.
    pub fn record_permission_check(&self, unit_id: &str, permission: Permission, granted: bool) {
        self.record(
            AuditEventType::PermissionCheck,
            Some(unit_id),
            granted,
            serde_json::json!({ "permission": permission.as_str() }),
        );
    }

    /// Query entries, newest last.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let inner = self.inner.lock();
        let mut matches: Vec<AuditEntry> =
            inner.entries.iter().filter(|e| filter.matches(e)).cloned().collect();

        if let Some(limit) = filter.limit {
            let skip = matches.len().saturating_sub(limit);
            matches.drain(..skip);
        }
        matches
    }

    /// Most recent entries.
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.query(&AuditFilter { limit: Some(limit), ..Default::default() })
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> AuditStats {
        self.inner.lock().stats.clone()
    }

    /// Entries currently held in memory.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn append_line(path: &Path, entry: &AuditEntry) -> std::io::Result<()> {
    let line = serde_json::to_string(entry)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
