//! Timeout enforcement per operation class, with per-unit overrides.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Operation classes that carry their own time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Load,
    Unload,
    HealthCheck,
    Job,
}

impl OperationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Unload => "unload",
            Self::HealthCheck => "health check",
            Self::Job => "job",
        }
    }
}

/// Per-unit overrides, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitTimeouts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unload_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_ms: Option<u64>,
}

/// Timeout policy applied by the lifecycle controller and job manager.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    pub load: Duration,
    pub unload: Duration,
    pub health: Duration,
    pub job: Duration,
    pub overrides: HashMap<String, UnitTimeouts>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            load: Duration::from_secs(30),
            unload: Duration::from_secs(10),
            health: Duration::from_secs(5),
            job: Duration::from_secs(600),
            overrides: HashMap::new(),
        }
    }
}

impl TimeoutPolicy {
    /// Budget for an operation on a unit.
    pub fn timeout_for(&self, class: OperationClass, unit_id: &str) -> Duration {
        let over = self.overrides.get(unit_id);
        let (default, override_ms) = match class {
            OperationClass::Load => (self.load, over.and_then(|o| o.load_ms)),
            OperationClass::Unload => (self.unload, over.and_then(|o| o.unload_ms)),
            OperationClass::HealthCheck => (self.health, over.and_then(|o| o.health_ms)),
            OperationClass::Job => (self.job, over.and_then(|o| o.job_ms)),
        };
        override_ms.map_or(default, Duration::from_millis)
    }

    /// Run a future under the unit's budget for `class`.
    pub async fn run<F, T>(&self, class: OperationClass, unit_id: &str, fut: F) -> BridgeResult<T>
    where
        F: Future<Output = T>,
    {
        let budget = self.timeout_for(class, unit_id);
        tokio::time::timeout(budget, fut).await.map_err(|_| {
            tracing::warn!(unit = %unit_id, operation = class.as_str(), ?budget, "Operation timed out");
            BridgeError::Timeout {
                operation: class.as_str().to_string(),
                unit: unit_id.to_string(),
                after_ms: budget.as_millis() as u64,
            }
        })
    }
}
