//! Alert thresholds evaluated against audit and job statistics.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::audit::{AuditEventType, AuditStats};
use crate::error::{BridgeError, BridgeResult};
use crate::jobs::JobStats;

/// Persisted alert thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Permission denials across all units before alerting.
    pub max_permission_denials: u64,
    /// Failed loads across all units before alerting.
    pub max_load_failures: u64,
    /// Audited failures attributed to a single unit before alerting.
    pub max_unit_failures: u64,
    /// Fraction of finished jobs that failed.
    pub max_job_failure_rate: f64,
    /// Finished jobs required before the failure rate is considered.
    pub min_jobs_for_rate: u64,
    /// Open circuit breakers before alerting.
    pub max_open_circuits: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_permission_denials: 50,
            max_load_failures: 3,
            max_unit_failures: 25,
            max_job_failure_rate: 0.5,
            min_jobs_for_rate: 10,
            max_open_circuits: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold that was crossed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: String,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
}

impl AlertThresholds {
    /// Load thresholds from a JSON file, falling back to defaults if absent.
    pub fn load(path: &Path) -> BridgeResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let thresholds: Self = serde_json::from_str(&content)?;
        thresholds.validate()?;
        Ok(thresholds)
    }

    /// Save thresholds as pretty JSON.
    pub fn save(&self, path: &Path) -> BridgeResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if !(0.0..=1.0).contains(&self.max_job_failure_rate) {
            return Err(BridgeError::Validation(
                "max_job_failure_rate must be between 0 and 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Evaluate current statistics.
    pub fn evaluate(&self, audit: &AuditStats, jobs: &JobStats) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let denials = audit.count_of(AuditEventType::PermissionDenied);
        if denials > self.max_permission_denials {
            alerts.push(Alert {
                kind: "permission_denials".to_string(),
                severity: AlertSeverity::Warning,
                message: format!(
                    "{denials} permission denials (threshold {})",
                    self.max_permission_denials
                ),
                unit_id: None,
            });
        }

        let load_failures = audit.count_of(AuditEventType::PluginLoadFailed);
        if load_failures > self.max_load_failures {
            alerts.push(Alert {
                kind: "load_failures".to_string(),
                severity: AlertSeverity::Critical,
                message: format!(
                    "{load_failures} plugin load failures (threshold {})",
                    self.max_load_failures
                ),
                unit_id: None,
            });
        }

        for (unit, failures) in &audit.failures_by_unit {
            if *failures > self.max_unit_failures {
                alerts.push(Alert {
                    kind: "unit_failures".to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!("{failures} audited failures for '{unit}'"),
                    unit_id: Some(unit.clone()),
                });
            }
        }

        let finished = jobs.completed + jobs.failed;
        if finished >= self.min_jobs_for_rate && finished > 0 {
            let rate = jobs.failed as f64 / finished as f64;
            if rate > self.max_job_failure_rate {
                alerts.push(Alert {
                    kind: "job_failure_rate".to_string(),
                    severity: AlertSeverity::Critical,
                    message: format!("{:.0}% of finished jobs failed", rate * 100.0),
                    unit_id: jobs.unit_id.clone(),
                });
            }
        }

        if jobs.open_circuits.len() > self.max_open_circuits {
            for unit in &jobs.open_circuits {
                alerts.push(Alert {
                    kind: "circuit_open".to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!("Circuit breaker open for '{unit}'"),
                    unit_id: Some(unit.clone()),
                });
            }
        }

        alerts
    }
}
