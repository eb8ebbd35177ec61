//! Dependency resolution and load ordering.
//!
//! Builds the dependency graph across validated manifests, fails units with
//! missing or incompatible dependencies and every member of a cycle, then
//! propagates those failures to dependents. What remains is ordered with
//! Kahn's algorithm into batches; units in one batch do not depend on each
//! other and may load concurrently. Core units always fill the leading
//! batches, so a core unit may only depend on other core units.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::manifest::Manifest;
use crate::types::UnitType;

/// Why a unit was excluded from the load plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencyFailure {
    /// A declared dependency is not known.
    Missing { dependency: String },
    /// A dependency exists but its version is outside the required range.
    VersionMismatch { dependency: String, required: String, found: String },
    /// The unit takes part in a cycle.
    Cycle { cycle: Vec<String> },
    /// A dependency was itself excluded.
    FailedDependency { dependency: String },
    /// A core unit depends on a unit that is not core.
    NonCoreDependency { dependency: String, unit_type: UnitType },
}

impl DependencyFailure {
    /// The dependency this failure refers to, if any.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            Self::Missing { dependency }
            | Self::VersionMismatch { dependency, .. }
            | Self::FailedDependency { dependency }
            | Self::NonCoreDependency { dependency, .. } => Some(dependency),
            Self::Cycle { .. } => None,
        }
    }

    pub fn to_error(&self, unit_id: &str) -> BridgeError {
        match self {
            Self::Missing { dependency } => {
                BridgeError::dependency(unit_id, format!("missing dependency '{dependency}'"))
            }
            Self::VersionMismatch { dependency, required, found } => BridgeError::dependency(
                unit_id,
                format!("'{dependency}' {found} does not satisfy {required}"),
            ),
            Self::Cycle { cycle } => BridgeError::CircularDependency { cycle: cycle.clone() },
            Self::FailedDependency { dependency } => {
                BridgeError::dependency(unit_id, format!("dependency '{dependency}' failed"))
            }
            Self::NonCoreDependency { dependency, unit_type } => BridgeError::dependency(
                unit_id,
                format!("core units may only depend on core units; '{dependency}' is a {unit_type} unit"),
            ),
        }
    }
}

/// Result of resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlan {
    /// Load batches in order.
    pub batches: Vec<Vec<String>>,
    /// Units that must not be loaded.
    pub failures: BTreeMap<String, DependencyFailure>,
}

impl LoadPlan {
    /// Flattened load order.
    pub fn order(&self) -> Vec<String> {
        self.batches.iter().flatten().cloned().collect()
    }

    /// Index of a unit in the flattened order.
    pub fn position(&self, unit_id: &str) -> Option<usize> {
        self.batches.iter().flatten().position(|id| id == unit_id)
    }

    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(Vec::is_empty)
    }

    pub fn unit_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Resolves a set of manifests into a [`LoadPlan`].
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    /// Units outside the set being resolved that already satisfy dependencies.
    available: HashMap<String, Version>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat an already loaded unit as satisfying dependencies on it.
    pub fn with_available(mut self, unit_id: &str, version: Version) -> Self {
        self.available.insert(unit_id.to_string(), version);
        self
    }

    /// Resolve the manifests. Per-unit problems end up in
    /// [`LoadPlan::failures`]; only duplicate ids or an impossible topology
    /// fail the whole call.
    pub fn resolve<'a>(&self, manifests: impl IntoIterator<Item = &'a Manifest>) -> BridgeResult<LoadPlan> {
        let mut nodes: BTreeMap<&str, &Manifest> = BTreeMap::new();
        for manifest in manifests {
            if nodes.insert(manifest.id.as_str(), manifest).is_some() {
                return Err(BridgeError::AlreadyExists(manifest.id.clone()));
            }
        }

        let mut failures: BTreeMap<String, DependencyFailure> = BTreeMap::new();

        // Missing and incompatible dependencies.
        for (id, manifest) in &nodes {
            for (dep, req) in &manifest.dependencies {
                let found = nodes.get(dep.as_str()).map(|m| &m.version).or_else(|| self.available.get(dep));
                let failure = match found {
                    None => Some(DependencyFailure::Missing { dependency: dep.clone() }),
                    Some(version) if !req.matches(version) => Some(DependencyFailure::VersionMismatch {
                        dependency: dep.clone(),
                        required: req.to_string(),
                        found: version.to_string(),
                    }),
                    Some(_) => None,
                };
                if let Some(failure) = failure {
                    failures.entry((*id).to_string()).or_insert(failure);
                }
            }
        }

        // Core units load before everything else.
        for (id, manifest) in nodes.iter().filter(|(_, m)| m.unit_type == UnitType::Core) {
            let non_core = manifest
                .dependencies
                .keys()
                .filter_map(|dep| nodes.get(dep.as_str()))
                .find(|dep| dep.unit_type != UnitType::Core);
            if let Some(dep) = non_core {
                failures.entry((*id).to_string()).or_insert_with(|| DependencyFailure::NonCoreDependency {
                    dependency: dep.id.clone(),
                    unit_type: dep.unit_type,
                });
            }
        }

        // Edges between units in this set.
        let edges: BTreeMap<&str, Vec<&str>> = nodes
            .iter()
            .map(|(id, m)| {
                let deps = m
                    .dependencies
                    .keys()
                    .map(String::as_str)
                    .filter(|d| nodes.contains_key(d))
                    .collect();
                (*id, deps)
            })
            .collect();

        for cycle in find_cycles(&edges) {
            tracing::warn!(cycle = %cycle.join(" -> "), "Dependency cycle detected");
            for member in &cycle[..cycle.len() - 1] {
                failures
                    .entry((*member).to_string())
                    .or_insert_with(|| DependencyFailure::Cycle { cycle: cycle.clone() });
            }
        }

        // Everything depending on a failed unit fails too.
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, deps) in &edges {
            for dep in deps {
                dependents.entry(*dep).or_default().push(*id);
            }
        }
        let mut queue: VecDeque<String> = failures.keys().cloned().collect();
        while let Some(failed) = queue.pop_front() {
            for dependent in dependents.get(failed.as_str()).into_iter().flatten() {
                if !failures.contains_key(*dependent) {
                    failures.insert(
                        (*dependent).to_string(),
                        DependencyFailure::FailedDependency { dependency: failed.clone() },
                    );
                    queue.push_back((*dependent).to_string());
                }
            }
        }

        let remaining: BTreeMap<&str, &Manifest> = nodes
            .iter()
            .filter(|(id, _)| !failures.contains_key(**id))
            .map(|(id, m)| (*id, *m))
            .collect();

        let (core, rest): (Vec<&str>, Vec<&str>) =
            remaining.keys().copied().partition(|id| remaining[*id].unit_type == UnitType::Core);

        let mut batches = kahn_batches(&core, &edges, &remaining)?;
        batches.extend(kahn_batches(&rest, &edges, &remaining)?);

        Ok(LoadPlan { batches, failures })
    }
}

/// Kahn's algorithm over `subset`. Edges leaving the subset count as satisfied.
fn kahn_batches(
    subset: &[&str],
    edges: &BTreeMap<&str, Vec<&str>>,
    remaining: &BTreeMap<&str, &Manifest>,
) -> BridgeResult<Vec<Vec<String>>> {
    let members: BTreeSet<&str> = subset.iter().copied().collect();
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for id in &members {
        let deps: Vec<&str> = edges
            .get(id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|d| members.contains(d))
            .collect();
        for dep in &deps {
            dependents.entry(*dep).or_default().push(*id);
        }
        in_degree.insert(*id, deps.len());
    }

    let mut batches = Vec::new();
    let mut ready: Vec<&str> =
        in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
    let mut placed = 0;

    while !ready.is_empty() {
        ready.sort_by(|a, b| {
            remaining[a].unit_type.cmp(&remaining[b].unit_type).then_with(|| a.cmp(b))
        });
        let mut next = Vec::new();
        for id in &ready {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.push(*dependent);
                    }
                }
            }
        }
        placed += ready.len();
        batches.push(ready.iter().map(|id| (*id).to_string()).collect());
        ready = next;
    }

    if placed != members.len() {
        let stuck: Vec<&str> =
            in_degree.iter().filter(|(_, d)| **d > 0).map(|(id, _)| *id).collect();
        return Err(BridgeError::dependency(
            stuck.first().copied().unwrap_or("<unknown>"),
            format!("could not order units: {}", stuck.join(", ")),
        ));
    }
    Ok(batches)
}

/// DFS three-colour cycle detection. Each cycle is returned closed,
/// e.g. `[a, b, a]`.
fn find_cycles<'a>(edges: &BTreeMap<&'a str, Vec<&'a str>>) -> Vec<Vec<String>> {
    let mut color: HashMap<&str, Color> = edges.keys().map(|id| (*id, Color::White)).collect();
    let mut cycles = Vec::new();

    for start in edges.keys() {
        if color[start] != Color::White {
            continue;
        }
        // Iterative DFS: (node, index of next edge to follow).
        let mut stack: Vec<(&str, usize)> = vec![(*start, 0)];
        color.insert(*start, Color::Gray);

        while let Some((node, next)) = stack.last().copied() {
            let deps = &edges[node];
            if next < deps.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let dep = deps[next];
                match color[dep] {
                    Color::White => {
                        color.insert(dep, Color::Gray);
                        stack.push((dep, 0));
                    }
                    Color::Gray => {
                        let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[from..].iter().map(|(n, _)| (*n).to_string()).collect();
                        cycle.push(dep.to_string());
                        cycles.push(cycle);
                    }
                    Color::Black => {}
                }
            } else {
                color.insert(node, Color::Black);
                stack.pop();
            }
        }
    }
    cycles
}
