//! Cross-cutting monitoring: audit trail, rate limiting, timeouts, alerts.

mod alerts;
mod audit;
mod rate_limit;
mod timeouts;

pub use alerts::{Alert, AlertSeverity, AlertThresholds};
pub use audit::{AuditEntry, AuditEventType, AuditFilter, AuditLog, AuditStats};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use timeouts::{OperationClass, TimeoutPolicy, UnitTimeouts};
