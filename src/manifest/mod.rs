//! Unit manifest parsing and validation.
//!
//! A manifest is a TOML (`plugin.toml`) or JSON (`plugin.json`) document
//! describing a unit's identity, permissions, dependencies, contributions
//! and entrypoints. Parsing happens in two steps: serde into a loosely
//! typed [`RawManifest`], then [`RawManifest::validate`] into a [`Manifest`]
//! whose fields are fully typed. Validation never runs unit code.

mod legacy;
mod settings;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

pub use legacy::{LegacyAdapter, LegacyHook, LegacyManifest, LegacyProbe, UnitManifest};
pub use settings::{config_defaults, is_property_schema, validate_unit_config};

use crate::error::{BridgeError, BridgeResult};
use crate::permissions::Permission;
use crate::types::{UnitType, MANIFEST_FILE, MANIFEST_JSON_FILE, SIGNATURE_FILE};

static UNIT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*(\.[a-z][a-z0-9_-]*)*$").expect("valid regex"));

static COMMAND_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("valid regex"));

const HTTP_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Check a unit id against the namespaced pattern.
pub fn is_valid_unit_id(id: &str) -> bool {
    (2..=64).contains(&id.len()) && UNIT_ID.is_match(id)
}

/// Manifest as written on disk, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawManifest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub version: String,
    #[serde(rename = "type")]
    pub unit_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub jupiter_version: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub entrypoints: Entrypoints,
    #[serde(default)]
    pub config_schema: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub trust: Option<TrustReference>,
    #[serde(default)]
    pub restartable: Option<bool>,
}

/// Validated, immutable unit manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: Version,
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub jupiter_version: VersionReq,
    pub permissions: BTreeSet<Permission>,
    pub dependencies: BTreeMap<String, VersionReq>,
    pub capabilities: Capabilities,
    pub entrypoints: Entrypoints,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config_schema: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<TrustReference>,
    pub restartable: bool,
}

/// Declared contributions and runtime capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub jobs: JobsCapability,
    pub metrics: MetricsCapability,
    pub ui: UiCapability,
    pub api: ApiCapability,
    pub cli: CliCapability,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsCapability {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsCapability {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiCapability {
    pub panels: Vec<PanelDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiCapability {
    pub routes: Vec<RouteDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliCapability {
    pub commands: Vec<CommandDecl>,
}

/// A CLI command contributed by a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDecl {
    pub name: String,
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// An HTTP route contributed by a unit, relative to its prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecl {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    pub handler: String,
    #[serde(default = "default_true")]
    pub auth_required: bool,
}

/// A UI panel contributed by a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelDecl {
    pub id: String,
    pub route: String,
    pub title_key: String,
    #[serde(default)]
    pub location: PanelLocation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelLocation {
    #[default]
    Sidebar,
    Main,
    Settings,
    Dashboard,
}

/// Named hook references. Only hooks listed here are ever called.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// Where a unit's signature lives, relative to its directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustReference {
    #[serde(default = "default_signature_file")]
    pub signature: String,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

fn default_signature_file() -> String {
    SIGNATURE_FILE.to_string()
}

impl RawManifest {
    /// Parse from a TOML string.
    pub fn from_toml(content: &str) -> BridgeResult<Self> {
        toml::from_str(content).map_err(|e| BridgeError::manifest("<unknown>", e.to_string()))
    }

    /// Parse from a JSON string.
    pub fn from_json(content: &str) -> BridgeResult<Self> {
        serde_json::from_str(content).map_err(|e| BridgeError::manifest("<unknown>", e.to_string()))
    }

    /// Validate against the schema and the host version.
    pub fn validate(self, host_version: &Version) -> BridgeResult<Manifest> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(BridgeError::manifest("<unknown>", "missing required field 'id'"));
        }
        if !is_valid_unit_id(&id) {
            return Err(BridgeError::manifest(
                &id,
                "id must be 2-64 chars of dot-separated lowercase segments ([a-z][a-z0-9_-]*)",
            ));
        }
        let fail = |reason: String| BridgeError::manifest(&id, reason);

        if self.version.trim().is_empty() {
            return Err(fail("missing required field 'version'".to_string()));
        }
        let version = Version::parse(self.version.trim())
            .map_err(|e| fail(format!("malformed version '{}': {e}", self.version)))?;

        let unit_type = UnitType::parse(&self.unit_type)
            .ok_or_else(|| fail(format!("unknown type '{}'", self.unit_type)))?;

        let jupiter_version = match self.jupiter_version.as_deref().map(str::trim) {
            None | Some("") => VersionReq::STAR,
            Some(raw) => VersionReq::parse(raw)
                .map_err(|e| fail(format!("malformed jupiter_version '{raw}': {e}")))?,
        };
        if !jupiter_version.matches(host_version) {
            return Err(fail(format!(
                "requires jupiter {jupiter_version}, host is {host_version}"
            )));
        }

        let mut permissions = BTreeSet::new();
        for raw in &self.permissions {
            let permission =
                Permission::parse(raw).ok_or_else(|| fail(format!("unknown permission '{raw}'")))?;
            permissions.insert(permission);
        }

        let mut dependencies = BTreeMap::new();
        for (dep, range) in &self.dependencies {
            if dep == &id {
                return Err(fail("a unit cannot depend on itself".to_string()));
            }
            if !is_valid_unit_id(dep) {
                return Err(fail(format!("invalid dependency id '{dep}'")));
            }
            let req = VersionReq::parse(range.trim())
                .map_err(|e| fail(format!("malformed range '{range}' for '{dep}': {e}")))?;
            dependencies.insert(dep.clone(), req);
        }

        validate_capabilities(&self.capabilities, &permissions).map_err(fail)?;
        settings::check_schema(&self.config_schema).map_err(fail)?;

        Ok(Manifest {
            name: self.name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| id.clone()),
            id,
            version,
            unit_type,
            description: self.description,
            author: self.author,
            jupiter_version,
            permissions,
            dependencies,
            capabilities: self.capabilities,
            entrypoints: self.entrypoints,
            config_schema: self.config_schema,
            trust: self.trust,
            restartable: self.restartable.unwrap_or(true),
        })
    }
}

fn validate_capabilities(
    caps: &Capabilities,
    permissions: &BTreeSet<Permission>,
) -> Result<(), String> {
    let require = |permission: Permission, what: &str| {
        if permissions.contains(&permission) {
            Ok(())
        } else {
            Err(format!("declares {what} but not permission '{permission}'"))
        }
    };

    if caps.jobs.enabled {
        require(Permission::SubmitJobs, "jobs")?;
        if caps.jobs.max_concurrent == Some(0) {
            return Err("capabilities.jobs.max_concurrent must be at least 1".to_string());
        }
    }

    if !caps.cli.commands.is_empty() {
        require(Permission::RegisterCli, "cli commands")?;
    }
    let mut names = HashSet::new();
    for command in &caps.cli.commands {
        if !COMMAND_NAME.is_match(&command.name) {
            return Err(format!("invalid command name '{}'", command.name));
        }
        if command.handler.trim().is_empty() {
            return Err(format!("command '{}' has no handler", command.name));
        }
        if !names.insert(command.name.as_str()) {
            return Err(format!("duplicate command '{}'", command.name));
        }
    }

    if !caps.api.routes.is_empty() {
        require(Permission::RegisterApi, "api routes")?;
    }
    let mut routes = HashSet::new();
    for route in &caps.api.routes {
        let method = route.method.to_ascii_uppercase();
        if !HTTP_METHODS.contains(&method.as_str()) {
            return Err(format!("unsupported HTTP method '{}'", route.method));
        }
        if !route.path.starts_with('/') {
            return Err(format!("route path '{}' must start with '/'", route.path));
        }
        if route.handler.trim().is_empty() {
            return Err(format!("route '{} {}' has no handler", method, route.path));
        }
        if !routes.insert((method, route.path.as_str())) {
            return Err(format!("duplicate route '{}'", route.path));
        }
    }

    if !caps.ui.panels.is_empty() {
        require(Permission::RegisterUi, "ui panels")?;
    }
    for panel in &caps.ui.panels {
        if panel.id.trim().is_empty() || panel.title_key.trim().is_empty() {
            return Err("ui panels need an id and a title_key".to_string());
        }
    }

    Ok(())
}

impl Manifest {
    /// Start building a manifest in code, e.g. for hard-registered core units.
    pub fn builder(id: &str, version: &str, unit_type: UnitType) -> ManifestBuilder {
        ManifestBuilder::new(id, version, unit_type)
    }

    /// Whether the manifest grants a permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Signature file name for this unit.
    pub fn signature_file(&self) -> &str {
        self.trust.as_ref().map_or(SIGNATURE_FILE, |t| t.signature.as_str())
    }

    /// Per-unit job concurrency, if the manifest sets one.
    pub fn max_concurrent_jobs(&self) -> Option<usize> {
        self.capabilities.jobs.max_concurrent
    }
}

/// Programmatic manifest construction; `build` applies the same validation
/// as files on disk.
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    raw: RawManifest,
    host_version: Version,
}

impl ManifestBuilder {
    fn new(id: &str, version: &str, unit_type: UnitType) -> Self {
        Self {
            raw: RawManifest {
                id: id.to_string(),
                version: version.to_string(),
                unit_type: unit_type.display_name().to_ascii_lowercase(),
                ..RawManifest::default()
            },
            host_version: crate::host_version(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.raw.name = Some(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.raw.description = Some(description.into());
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.raw.permissions.push(permission.as_str().to_string());
        self
    }

    pub fn permissions(mut self, permissions: impl IntoIterator<Item = Permission>) -> Self {
        self.raw.permissions.extend(permissions.into_iter().map(|p| p.as_str().to_string()));
        self
    }

    pub fn dependency(mut self, id: &str, range: &str) -> Self {
        self.raw.dependencies.insert(id.to_string(), range.to_string());
        self
    }

    pub fn jupiter_version(mut self, range: &str) -> Self {
        self.raw.jupiter_version = Some(range.to_string());
        self
    }

    pub fn init(mut self, hook: &str) -> Self {
        self.raw.entrypoints.init = Some(hook.to_string());
        self
    }

    pub fn shutdown(mut self, hook: &str) -> Self {
        self.raw.entrypoints.shutdown = Some(hook.to_string());
        self
    }

    pub fn health(mut self, hook: &str) -> Self {
        self.raw.entrypoints.health = Some(hook.to_string());
        self
    }

    /// Declare `init`, `shutdown` and `health` with their conventional names.
    pub fn standard_hooks(self) -> Self {
        self.init("init").shutdown("shutdown").health("health")
    }

    pub fn command(mut self, name: &str, handler: &str) -> Self {
        self.raw.capabilities.cli.commands.push(CommandDecl {
            name: name.to_string(),
            handler: handler.to_string(),
            description: None,
            hidden: false,
        });
        self
    }

    pub fn route(mut self, method: &str, path: &str, handler: &str) -> Self {
        self.raw.capabilities.api.routes.push(RouteDecl {
            method: method.to_string(),
            path: path.to_string(),
            handler: handler.to_string(),
            auth_required: true,
        });
        self
    }

    pub fn panel(mut self, id: &str, route: &str, title_key: &str, location: PanelLocation) -> Self {
        self.raw.capabilities.ui.panels.push(PanelDecl {
            id: id.to_string(),
            route: route.to_string(),
            title_key: title_key.to_string(),
            location,
        });
        self
    }

    pub fn jobs(mut self, max_concurrent: usize) -> Self {
        self.raw.capabilities.jobs.enabled = true;
        self.raw.capabilities.jobs.max_concurrent = Some(max_concurrent);
        self
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.raw.restartable = Some(restartable);
        self
    }

    pub fn host_version(mut self, version: Version) -> Self {
        self.host_version = version;
        self
    }

    pub fn build(self) -> BridgeResult<Manifest> {
        self.raw.validate(&self.host_version)
    }
}

/// Reads and validates manifests from unit directories.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    host_version: Version,
}

impl ManifestLoader {
    pub fn new(host_version: Version) -> Self {
        Self { host_version }
    }

    /// Path of the manifest inside a unit directory, if any.
    pub fn manifest_path(dir: &Path) -> Option<PathBuf> {
        [MANIFEST_FILE, MANIFEST_JSON_FILE].iter().map(|name| dir.join(name)).find(|p| p.is_file())
    }

    /// Load and validate the manifest of a unit directory.
    pub fn load_dir(&self, dir: &Path) -> BridgeResult<Manifest> {
        let path = Self::manifest_path(dir).ok_or_else(|| {
            BridgeError::manifest(
                dir_label(dir),
                format!("no {MANIFEST_FILE} or {MANIFEST_JSON_FILE} found"),
            )
        })?;
        self.load_file(&path)
    }

    /// Load and validate a manifest file.
    pub fn load_file(&self, path: &Path) -> BridgeResult<Manifest> {
        let content = std::fs::read_to_string(path)?;
        let label = path.parent().map_or_else(|| "<unknown>".to_string(), dir_label);
        let is_json = path.extension().is_some_and(|ext| ext == "json");

        let raw = if is_json { RawManifest::from_json(&content) } else { RawManifest::from_toml(&content) }
            .map_err(|e| match e {
                BridgeError::Manifest { reason, .. } => BridgeError::manifest(&label, reason),
                other => other,
            })?;

        raw.validate(&self.host_version)
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }
}

fn dir_label(dir: &Path) -> String {
    dir.file_name().and_then(|n| n.to_str()).unwrap_or("<unknown>").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE_MANIFEST: &str = r#"
id = "acme.complexity"
name = "Complexity Report"
version = "1.2.0"
type = "tool"
author = "acme"
jupiter_version = ">=1.0, <2.0"
permissions = ["log.write", "config.read", "cli.register", "api.register", "ui.register", "jobs.submit"]

[dependencies]
"acme.core" = ">=1.0"

[capabilities.jobs]
enabled = true
max_concurrent = 2

[[capabilities.cli.commands]]
name = "report"
handler = "handle_report"
description = "Print the complexity report"

[[capabilities.api.routes]]
method = "GET"
path = "/summary"
handler = "handle_summary"

[[capabilities.ui.panels]]
id = "complexity"
route = "/complexity"
title_key = "acme.complexity.title"
location = "dashboard"

[entrypoints]
init = "init"
shutdown = "shutdown"
health = "health"
export = "export_csv"

[config_schema]
threshold = 15
"#;

    fn host() -> Version {
        Version::parse("1.4.0").unwrap()
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = RawManifest::from_toml(SAMPLE_MANIFEST).unwrap().validate(&host()).unwrap();

        assert_eq!(manifest.id, "acme.complexity");
        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert_eq!(manifest.unit_type, UnitType::Tool);
        assert!(manifest.has_permission(Permission::RegisterCli));
        assert_eq!(manifest.dependencies.len(), 1);
        assert_eq!(manifest.max_concurrent_jobs(), Some(2));
        assert_eq!(manifest.entrypoints.extra.get("export").map(String::as_str), Some("export_csv"));
        assert_eq!(manifest.capabilities.ui.panels[0].location, PanelLocation::Dashboard);
        assert_eq!(manifest.config_schema["threshold"], 15);
        assert!(manifest.restartable);
        assert_eq!(manifest.signature_file(), "plugin.sig");
    }

    #[test]
    fn test_missing_required_field() {
        let err = RawManifest::from_toml("version = \"1.0.0\"\ntype = \"tool\"").unwrap_err();
        assert!(matches!(err, BridgeError::Manifest { .. }));
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn test_malformed_version() {
        let raw = RawManifest::from_toml("id = \"acme.x\"\nversion = \"one\"\ntype = \"tool\"").unwrap();
        let err = raw.validate(&host()).unwrap_err();
        assert!(err.to_string().contains("malformed version"));
    }

    #[test]
    fn test_unknown_permission() {
        let raw = RawManifest::from_toml(
            "id = \"acme.x\"\nversion = \"1.0.0\"\ntype = \"tool\"\npermissions = [\"root.everything\"]",
        )
        .unwrap();
        let err = raw.validate(&host()).unwrap_err();
        assert!(err.to_string().contains("unknown permission 'root.everything'"));
    }

    #[test]
    fn test_invalid_ids() {
        assert!(is_valid_unit_id("acme.lint"));
        assert!(is_valid_unit_id("ai_helper"));
        assert!(!is_valid_unit_id("Acme.Lint"));
        assert!(!is_valid_unit_id("acme..lint"));
        assert!(!is_valid_unit_id("1acme"));
        assert!(!is_valid_unit_id("a"));
    }

    #[test]
    fn test_contributions_require_permissions() {
        let err = Manifest::builder("acme.cli", "1.0.0", UnitType::Tool)
            .command("scan", "handle_scan")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("cli.register"));

        let ok = Manifest::builder("acme.cli", "1.0.0", UnitType::Tool)
            .permission(Permission::RegisterCli)
            .command("scan", "handle_scan")
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_route_validation() {
        let err = Manifest::builder("acme.api", "1.0.0", UnitType::Tool)
            .permission(Permission::RegisterApi)
            .route("GET", "no-slash", "h")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must start with '/'"));

        let err = Manifest::builder("acme.api", "1.0.0", UnitType::Tool)
            .permission(Permission::RegisterApi)
            .route("BREW", "/coffee", "h")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("unsupported HTTP method"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = Manifest::builder("acme.loop", "1.0.0", UnitType::Tool)
            .dependency("acme.loop", "*")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[test]
    fn test_host_version_compatibility() {
        let err = Manifest::builder("acme.future", "1.0.0", UnitType::Tool)
            .jupiter_version(">=2.0")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("requires jupiter"));
    }

    #[test]
    fn test_load_dir_toml_and_json() {
        let dir = TempDir::new().unwrap();
        let loader = ManifestLoader::new(host());

        let toml_dir = dir.path().join("complexity");
        std::fs::create_dir_all(&toml_dir).unwrap();
        std::fs::write(toml_dir.join("plugin.toml"), SAMPLE_MANIFEST).unwrap();
        assert_eq!(loader.load_dir(&toml_dir).unwrap().id, "acme.complexity");

        let json_dir = dir.path().join("json");
        std::fs::create_dir_all(&json_dir).unwrap();
        std::fs::write(
            json_dir.join("plugin.json"),
            r#"{"id": "acme.json", "version": "0.3.1", "type": "system", "permissions": ["log.write"]}"#,
        )
        .unwrap();
        let manifest = loader.load_dir(&json_dir).unwrap();
        assert_eq!(manifest.unit_type, UnitType::System);

        let empty = dir.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();
        let err = loader.load_dir(&empty).unwrap_err();
        assert!(matches!(err, BridgeError::Manifest { ref unit, .. } if unit == "empty"));
    }
}
