//! Bridge error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors that can occur while managing plugin units.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Manifest missing, malformed, or violating the schema.
    #[error("Invalid manifest for '{unit}': {reason}")]
    Manifest { unit: String, reason: String },

    /// A dependency is missing, incompatible, or failed itself.
    #[error("Dependency error for '{unit}': {reason}")]
    Dependency { unit: String, reason: String },

    /// The unit takes part in (or depends on) a dependency cycle.
    #[error("Circular dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// The unit did not declare the permission it needs.
    #[error("Plugin '{unit}' requires permission '{permission}' which is not granted")]
    PermissionDenied { unit: String, permission: String },

    /// Illegal lifecycle state transition or lifecycle request.
    #[error("Lifecycle error for '{unit}': {reason}")]
    Lifecycle { unit: String, reason: String },

    /// An operation exceeded its time budget.
    #[error("{operation} for '{unit}' timed out after {after_ms}ms")]
    Timeout { operation: String, unit: String, after_ms: u64 },

    /// Signature missing, invalid, revoked, or content mismatch.
    #[error("Signature verification failed for '{unit}': {reason}")]
    Signature { unit: String, reason: String },

    /// Configuration validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The unit's circuit breaker is refusing work.
    #[error("Circuit open for '{unit}', retry in {retry_after_ms}ms")]
    CircuitOpen { unit: String, retry_after_ms: u64 },

    /// A host service was requested that is not wired in.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Unit, job, or contribution not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Unit or contribution already registered.
    #[error("'{0}' is already registered")]
    AlreadyExists(String),

    /// Governance policy refused the unit.
    #[error("Plugin '{unit}' blocked by governance: {reason}")]
    Governance { unit: String, reason: String },

    /// The unit's trust level is below the configured minimum.
    #[error("Plugin '{unit}' has trust level {actual}, but {required} is required")]
    InsufficientTrust { unit: String, actual: String, required: String },

    /// The unit exceeded its rate limit.
    #[error("Rate limit exceeded for '{0}'")]
    RateLimited(String),

    /// The unit already runs its maximum number of jobs.
    #[error("Plugin '{unit}' already runs {max} concurrent jobs")]
    ConcurrencyLimit { unit: String, max: usize },

    /// Unit code reported a failure.
    #[error("Plugin '{unit}' failed: {message}")]
    PluginFailure { unit: String, message: String },

    /// Operation only allowed in development mode.
    #[error("{0} requires development mode")]
    DevModeRequired(String),

    /// Path does not hold a unit.
    #[error("Plugin source not found: {0}")]
    SourceNotFound(PathBuf),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl BridgeError {
    /// Stable error code used in audit entries and plugin records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Manifest { .. } => "manifest_error",
            Self::Dependency { .. } => "dependency_error",
            Self::CircularDependency { .. } => "circular_dependency_error",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Lifecycle { .. } => "lifecycle_error",
            Self::Timeout { .. } => "timeout",
            Self::Signature { .. } => "signature_error",
            Self::Validation(_) => "validation_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::Governance { .. } => "governance_denied",
            Self::InsufficientTrust { .. } => "insufficient_trust",
            Self::RateLimited(_) => "rate_limited",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::PluginFailure { .. } => "plugin_failure",
            Self::DevModeRequired(_) => "dev_mode_required",
            Self::SourceNotFound(_) => "source_not_found",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Toml(_) | Self::TomlSer(_) => "toml_error",
        }
    }

    /// Whether this error is one of the dependency failures.
    pub fn is_dependency_error(&self) -> bool {
        matches!(self, Self::Dependency { .. } | Self::CircularDependency { .. })
    }

    pub(crate) fn manifest(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Manifest { unit: unit.into(), reason: reason.into() }
    }

    pub(crate) fn lifecycle(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lifecycle { unit: unit.into(), reason: reason.into() }
    }

    pub(crate) fn dependency(unit: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dependency { unit: unit.into(), reason: reason.into() }
    }
}
