//! Registries for what units contribute to the host surfaces: CLI commands,
//! HTTP routes and UI panels.
//!
//! Contributions are registered from a unit's manifest when it becomes
//! `Ready` and removed as a group when it leaves that state.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::manifest::{Manifest, PanelLocation};

/// Prefix every unit route is mounted under.
pub const ROUTE_PREFIX: &str = "/plugins";

/// A CLI command, addressed as `<unit_id>:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContribution {
    pub full_name: String,
    pub name: String,
    pub owner_unit: String,
    pub handler_ref: String,
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An HTTP route mounted under `/plugins/<unit_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteContribution {
    pub method: String,
    pub path: String,
    pub owner_unit: String,
    pub auth_required: bool,
    pub handler_ref: String,
}

/// A dashboard panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiContribution {
    pub mount_point: String,
    pub route: String,
    pub title_key: String,
    pub location: PanelLocation,
    pub owner_unit: String,
}

/// Counts of what one registration added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionCounts {
    pub commands: usize,
    pub routes: usize,
    pub panels: usize,
}

impl ContributionCounts {
    pub fn total(&self) -> usize {
        self.commands + self.routes + self.panels
    }
}

/// Where a dispatch request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTarget {
    /// `unit:command`
    Command(String),
    /// `METHOD /plugins/unit/path`
    Route { method: String, path: String },
}

impl DispatchTarget {
    pub fn parse(raw: &str) -> BridgeResult<Self> {
        let raw = raw.trim();
        if let Some((method, path)) = raw.split_once(' ') {
            let path = path.trim();
            if path.starts_with('/') {
                return Ok(Self::Route { method: method.to_ascii_uppercase(), path: path.to_string() });
            }
        }
        match raw.split_once(':') {
            Some((unit, name)) if !unit.is_empty() && !name.is_empty() => Ok(Self::Command(raw.to_string())),
            _ => Err(BridgeError::Validation(format!(
                "dispatch target '{raw}' is neither '<unit>:<command>' nor '<METHOD> <path>'"
            ))),
        }
    }
}

/// Route key: method plus full path.
type RouteKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    commands: BTreeMap<String, CommandContribution>,
    routes: BTreeMap<RouteKey, RouteContribution>,
    panels: BTreeMap<String, UiContribution>,
}

/// Command, route and panel tables shared by the host surfaces.
#[derive(Debug, Default)]
pub struct ContributionRegistry {
    tables: RwLock<Tables>,
}

impl ContributionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every contribution a manifest declares. Either all of them
    /// are registered or, on a conflict, none are.
    pub fn register_manifest(&self, manifest: &Manifest) -> BridgeResult<ContributionCounts> {
        let unit = manifest.id.as_str();
        let caps = &manifest.capabilities;

        let commands: Vec<CommandContribution> = caps
            .cli
            .commands
            .iter()
            .map(|c| CommandContribution {
                full_name: format!("{unit}:{}", c.name),
                name: c.name.clone(),
                owner_unit: unit.to_string(),
                handler_ref: c.handler.clone(),
                hidden: c.hidden,
                description: c.description.clone(),
            })
            .collect();
        let routes: Vec<RouteContribution> = caps
            .api
            .routes
            .iter()
            .map(|r| RouteContribution {
                method: r.method.to_ascii_uppercase(),
                path: route_path(unit, &r.path),
                owner_unit: unit.to_string(),
                auth_required: r.auth_required,
                handler_ref: r.handler.clone(),
            })
            .collect();
        let panels: Vec<UiContribution> = caps
            .ui
            .panels
            .iter()
            .map(|p| UiContribution {
                mount_point: format!("{unit}:{}", p.id),
                route: p.route.clone(),
                title_key: p.title_key.clone(),
                location: p.location,
                owner_unit: unit.to_string(),
            })
            .collect();

        let mut tables = self.tables.write();
        if let Some(c) = commands.iter().find(|c| tables.commands.contains_key(&c.full_name)) {
            return Err(BridgeError::AlreadyExists(format!("command {}", c.full_name)));
        }
        if let Some(r) = routes.iter().find(|r| tables.routes.contains_key(&(r.method.clone(), r.path.clone()))) {
            return Err(BridgeError::AlreadyExists(format!("route {} {}", r.method, r.path)));
        }
        if let Some(p) = panels.iter().find(|p| tables.panels.contains_key(&p.mount_point)) {
            return Err(BridgeError::AlreadyExists(format!("panel {}", p.mount_point)));
        }

        let counts = ContributionCounts { commands: commands.len(), routes: routes.len(), panels: panels.len() };
        for command in commands {
            tables.commands.insert(command.full_name.clone(), command);
        }
        for route in routes {
            tables.routes.insert((route.method.clone(), route.path.clone()), route);
        }
        for panel in panels {
            tables.panels.insert(panel.mount_point.clone(), panel);
        }

        if counts.total() > 0 {
            tracing::debug!(
                unit = %unit,
                commands = counts.commands,
                routes = counts.routes,
                panels = counts.panels,
                "Registered contributions"
            );
        }
        Ok(counts)
    }

    /// Remove everything a unit registered. Idempotent.
    pub fn unregister_owner(&self, unit_id: &str) -> usize {
        let mut tables = self.tables.write();
        let before = tables.commands.len() + tables.routes.len() + tables.panels.len();
        tables.commands.retain(|_, c| c.owner_unit != unit_id);
        tables.routes.retain(|_, r| r.owner_unit != unit_id);
        tables.panels.retain(|_, p| p.owner_unit != unit_id);
        before - (tables.commands.len() + tables.routes.len() + tables.panels.len())
    }

    pub fn command(&self, full_name: &str) -> Option<CommandContribution> {
        self.tables.read().commands.get(full_name).cloned()
    }

    pub fn route(&self, method: &str, path: &str) -> Option<RouteContribution> {
        self.tables.read().routes.get(&(method.to_ascii_uppercase(), path.to_string())).cloned()
    }

    /// All commands. Hidden ones are included only when asked for.
    pub fn commands(&self, include_hidden: bool) -> Vec<CommandContribution> {
        self.tables.read().commands.values().filter(|c| include_hidden || !c.hidden).cloned().collect()
    }

    pub fn routes(&self) -> Vec<RouteContribution> {
        self.tables.read().routes.values().cloned().collect()
    }

    pub fn panels(&self, location: Option<PanelLocation>) -> Vec<UiContribution> {
        self.tables
            .read()
            .panels
            .values()
            .filter(|p| location.map_or(true, |l| p.location == l))
            .cloned()
            .collect()
    }

    /// Resolve a dispatch target to its owning unit and handler reference.
    pub fn resolve(&self, target: &DispatchTarget) -> BridgeResult<(String, String)> {
        match target {
            DispatchTarget::Command(full_name) => self
                .command(full_name)
                .map(|c| (c.owner_unit, c.handler_ref))
                .ok_or_else(|| BridgeError::NotFound(format!("command '{full_name}'"))),
            DispatchTarget::Route { method, path } => self
                .route(method, path)
                .map(|r| (r.owner_unit, r.handler_ref))
                .ok_or_else(|| BridgeError::NotFound(format!("route {method} {path}"))),
        }
    }

    pub fn counts_for(&self, unit_id: &str) -> ContributionCounts {
        let tables = self.tables.read();
        ContributionCounts {
            commands: tables.commands.values().filter(|c| c.owner_unit == unit_id).count(),
            routes: tables.routes.values().filter(|r| r.owner_unit == unit_id).count(),
            panels: tables.panels.values().filter(|p| p.owner_unit == unit_id).count(),
        }
    }
}

fn route_path(unit_id: &str, path: &str) -> String {
    let path = path.trim_end_matches('/');
    format!("{ROUTE_PREFIX}/{unit_id}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Permission;
    use crate::types::UnitType;

    fn manifest(id: &str) -> Manifest {
        Manifest::builder(id, "1.0.0", UnitType::Tool)
            .permissions([Permission::RegisterCli, Permission::RegisterApi, Permission::RegisterUi])
            .command("report", "handle_report")
            .route("get", "/summary", "handle_summary")
            .panel("overview", "/overview", "acme.overview.title", PanelLocation::Dashboard)
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ContributionRegistry::new();
        let counts = registry.register_manifest(&manifest("acme.lint")).unwrap();
        assert_eq!(counts.total(), 3);

        let command = registry.command("acme.lint:report").unwrap();
        assert_eq!(command.owner_unit, "acme.lint");
        let route = registry.route("GET", "/plugins/acme.lint/summary").unwrap();
        assert_eq!(route.handler_ref, "handle_summary");
        assert!(route.auth_required);
        assert_eq!(registry.panels(Some(PanelLocation::Dashboard))[0].mount_point, "acme.lint:overview");

        let target = DispatchTarget::parse("acme.lint:report").unwrap();
        assert_eq!(registry.resolve(&target).unwrap(), ("acme.lint".to_string(), "handle_report".to_string()));
        let target = DispatchTarget::parse("get /plugins/acme.lint/summary").unwrap();
        assert_eq!(registry.resolve(&target).unwrap().1, "handle_summary");
    }

    #[test]
    fn test_conflicts_register_nothing() {
        let registry = ContributionRegistry::new();
        registry.register_manifest(&manifest("acme.lint")).unwrap();
        let err = registry.register_manifest(&manifest("acme.lint")).unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyExists(_)));
        assert_eq!(registry.counts_for("acme.lint").total(), 3);
    }

    #[test]
    fn test_unregister_owner_is_idempotent() {
        let registry = ContributionRegistry::new();
        registry.register_manifest(&manifest("acme.a")).unwrap();
        registry.register_manifest(&manifest("acme.b")).unwrap();

        assert_eq!(registry.unregister_owner("acme.a"), 3);
        assert_eq!(registry.unregister_owner("acme.a"), 0);
        assert!(registry.command("acme.a:report").is_none());
        assert!(registry.command("acme.b:report").is_some());
    }

    #[test]
    fn test_bad_dispatch_target() {
        assert!(DispatchTarget::parse("no-separator").is_err());
        assert!(DispatchTarget::parse(":missing").is_err());
    }
}
