//! Scoped capability names and the permission checker.
//!
//! A unit may only use what its manifest declares. Every check, granted
//! or not, lands in the audit log.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::monitoring::{AuditEventType, AuditLog};

/// A scoped capability a unit may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "fs.read")]
    FsRead,
    #[serde(rename = "fs.write")]
    FsWrite,
    #[serde(rename = "commands.run")]
    RunCommands,
    #[serde(rename = "network.outbound")]
    NetworkOutbound,
    #[serde(rename = "events.emit")]
    EmitEvents,
    #[serde(rename = "config.read")]
    ReadConfig,
    #[serde(rename = "history.read")]
    ReadHistory,
    #[serde(rename = "log.write")]
    WriteLog,
    #[serde(rename = "api.register")]
    RegisterApi,
    #[serde(rename = "cli.register")]
    RegisterCli,
    #[serde(rename = "ui.register")]
    RegisterUi,
    #[serde(rename = "jobs.submit")]
    SubmitJobs,
}

impl Permission {
    /// Every known permission.
    pub const ALL: [Self; 12] = [
        Self::FsRead,
        Self::FsWrite,
        Self::RunCommands,
        Self::NetworkOutbound,
        Self::EmitEvents,
        Self::ReadConfig,
        Self::ReadHistory,
        Self::WriteLog,
        Self::RegisterApi,
        Self::RegisterCli,
        Self::RegisterUi,
        Self::SubmitJobs,
    ];

    /// Scoped name as written in manifests.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FsRead => "fs.read",
            Self::FsWrite => "fs.write",
            Self::RunCommands => "commands.run",
            Self::NetworkOutbound => "network.outbound",
            Self::EmitEvents => "events.emit",
            Self::ReadConfig => "config.read",
            Self::ReadHistory => "history.read",
            Self::WriteLog => "log.write",
            Self::RegisterApi => "api.register",
            Self::RegisterCli => "cli.register",
            Self::RegisterUi => "ui.register",
            Self::SubmitJobs => "jobs.submit",
        }
    }

    /// Parse a scoped name.
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == raw.trim())
    }

    /// Whether granting this permission lets unit code touch the outside world.
    pub fn is_sensitive(self) -> bool {
        matches!(self, Self::FsWrite | Self::RunCommands | Self::NetworkOutbound)
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves permission checks against registered unit grants.
#[derive(Debug)]
pub struct PermissionChecker {
    grants: RwLock<HashMap<String, BTreeSet<Permission>>>,
    audit: Arc<AuditLog>,
}

impl PermissionChecker {
    /// Create a checker writing to the given audit log.
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { grants: RwLock::new(HashMap::new()), audit }
    }

    /// Record the permissions declared by a unit's manifest.
    pub fn register(&self, unit_id: &str, permissions: impl IntoIterator<Item = Permission>) {
        self.grants.write().insert(unit_id.to_string(), permissions.into_iter().collect());
    }

    /// Forget a unit's grants.
    pub fn unregister(&self, unit_id: &str) {
        self.grants.write().remove(unit_id);
    }

    /// Granted permissions for a unit.
    pub fn granted(&self, unit_id: &str) -> BTreeSet<Permission> {
        self.grants.read().get(unit_id).cloned().unwrap_or_default()
    }

    /// Check a permission without failing.
    pub fn has_permission(&self, unit_id: &str, permission: Permission) -> bool {
        let granted =
            self.grants.read().get(unit_id).is_some_and(|grants| grants.contains(&permission));

        self.audit.record_permission_check(unit_id, permission, granted);
        if !granted {
            tracing::debug!(unit = %unit_id, permission = %permission, "Permission not granted");
        }
        granted
    }

    /// Check a permission, failing with `PermissionDenied`.
    pub fn require_permission(&self, unit_id: &str, permission: Permission) -> BridgeResult<()> {
        if self.has_permission(unit_id, permission) {
            Ok(())
        } else {
            tracing::warn!(unit = %unit_id, permission = %permission, "Permission denied");
            self.audit.record(
                AuditEventType::PermissionDenied,
                Some(unit_id),
                false,
                serde_json::json!({ "permission": permission.as_str() }),
            );
            Err(BridgeError::PermissionDenied {
                unit: unit_id.to_string(),
                permission: permission.as_str().to_string(),
            })
        }
    }

    /// Require every permission in the set.
    pub fn require_all(
        &self,
        unit_id: &str,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> BridgeResult<()> {
        for permission in permissions {
            self.require_permission(unit_id, permission)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> PermissionChecker {
        PermissionChecker::new(Arc::new(AuditLog::in_memory(100)))
    }

    #[test]
    fn test_parse_round_trip() {
        for permission in Permission::ALL {
            assert_eq!(Permission::parse(permission.as_str()), Some(permission));
        }
        assert_eq!(Permission::parse("root.access"), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Permission::RunCommands).unwrap();
        assert_eq!(json, "\"commands.run\"");
        let parsed: Permission = serde_json::from_str("\"events.emit\"").unwrap();
        assert_eq!(parsed, Permission::EmitEvents);
    }

    #[test]
    fn test_require_permission() {
        let checker = checker();
        checker.register("acme.lint", [Permission::WriteLog, Permission::ReadConfig]);

        assert!(checker.has_permission("acme.lint", Permission::WriteLog));
        assert!(checker.require_permission("acme.lint", Permission::ReadConfig).is_ok());

        let err = checker.require_permission("acme.lint", Permission::RunCommands).unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied { .. }));
    }

    #[test]
    fn test_unknown_unit_has_nothing() {
        let checker = checker();
        assert!(!checker.has_permission("ghost", Permission::WriteLog));
        assert!(checker.granted("ghost").is_empty());
    }

    #[test]
    fn test_checks_are_audited() {
        let audit = Arc::new(AuditLog::in_memory(100));
        let checker = PermissionChecker::new(Arc::clone(&audit));
        checker.register("acme.lint", [Permission::WriteLog]);

        checker.has_permission("acme.lint", Permission::WriteLog);
        let _ = checker.require_permission("acme.lint", Permission::FsWrite);

        let stats = audit.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failures, 2);
    }
}
