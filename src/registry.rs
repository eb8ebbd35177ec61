//! Plugin registry: the runtime record of every known unit.
//!
//! Readers take snapshots; every mutation goes through one write lock, so a
//! reader never observes a half-updated record.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::manifest::Manifest;
use crate::trust::TrustRecord;
use crate::types::{HealthSnapshot, PluginState, UnitType};

/// Last error recorded on a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    /// Stable error code, see [`BridgeError::kind`].
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl RecordError {
    pub fn from_error(error: &BridgeError) -> Self {
        Self { kind: error.kind().to_string(), message: error.to_string(), at: Utc::now() }
    }
}

/// Runtime record of one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub manifest: Manifest,
    pub state: PluginState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_order: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
    pub health: HealthSnapshot,
    pub restartable: bool,
    /// Built from a capability probe rather than a manifest file.
    pub legacy: bool,
    pub trust: TrustRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_at: Option<DateTime<Utc>>,
    pub reload_count: u32,
}

impl PluginRecord {
    pub fn new(manifest: Manifest) -> Self {
        let restartable = manifest.restartable;
        Self {
            manifest,
            state: PluginState::Discovered,
            load_order: None,
            error: None,
            health: HealthSnapshot::unknown(),
            restartable,
            legacy: false,
            trust: TrustRecord::unsigned(),
            source_dir: None,
            disabled_reason: None,
            discovered_at: Utc::now(),
            loaded_at: None,
            reload_count: 0,
        }
    }

    pub fn with_source(mut self, dir: PathBuf) -> Self {
        self.source_dir = Some(dir);
        self
    }

    pub fn with_trust(mut self, trust: TrustRecord) -> Self {
        self.trust = trust;
        self
    }

    pub fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn unit_type(&self) -> UnitType {
        self.manifest.unit_type
    }

    pub fn is_ready(&self) -> bool {
        self.state == PluginState::Ready
    }
}

/// Filter for listing records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordFilter {
    pub unit_type: Option<UnitType>,
    pub state: Option<PluginState>,
}

impl RecordFilter {
    pub fn state(state: PluginState) -> Self {
        Self { state: Some(state), ..Default::default() }
    }

    pub fn unit_type(unit_type: UnitType) -> Self {
        Self { unit_type: Some(unit_type), ..Default::default() }
    }

    fn matches(&self, record: &PluginRecord) -> bool {
        self.unit_type.map_or(true, |t| record.unit_type() == t)
            && self.state.map_or(true, |s| record.state == s)
    }
}

/// Counts by state and type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub legacy: usize,
}

/// Single-writer, many-reader store of [`PluginRecord`]s.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    records: RwLock<BTreeMap<String, PluginRecord>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. Ids are unique.
    pub fn insert(&self, record: PluginRecord) -> BridgeResult<()> {
        let mut records = self.records.write();
        if records.contains_key(record.id()) {
            return Err(BridgeError::AlreadyExists(record.id().to_string()));
        }
        records.insert(record.id().to_string(), record);
        Ok(())
    }

    pub fn remove(&self, unit_id: &str) -> Option<PluginRecord> {
        self.records.write().remove(unit_id)
    }

    pub fn get(&self, unit_id: &str) -> Option<PluginRecord> {
        self.records.read().get(unit_id).cloned()
    }

    /// Get a record or fail with `NotFound`.
    pub fn require(&self, unit_id: &str) -> BridgeResult<PluginRecord> {
        self.get(unit_id).ok_or_else(|| BridgeError::NotFound(format!("plugin '{unit_id}'")))
    }

    pub fn contains(&self, unit_id: &str) -> bool {
        self.records.read().contains_key(unit_id)
    }

    pub fn state(&self, unit_id: &str) -> Option<PluginState> {
        self.records.read().get(unit_id).map(|r| r.state)
    }

    /// Records matching the filter, in load order (unloaded units last, by id).
    pub fn list(&self, filter: &RecordFilter) -> Vec<PluginRecord> {
        let mut records: Vec<PluginRecord> =
            self.records.read().values().filter(|r| filter.matches(r)).cloned().collect();
        records.sort_by(|a, b| {
            a.load_order
                .unwrap_or(usize::MAX)
                .cmp(&b.load_order.unwrap_or(usize::MAX))
                .then_with(|| a.id().cmp(b.id()))
        });
        records
    }

    pub fn ids(&self) -> Vec<String> {
        self.records.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutate a record under the write lock.
    pub fn update<T>(&self, unit_id: &str, f: impl FnOnce(&mut PluginRecord) -> T) -> BridgeResult<T> {
        let mut records = self.records.write();
        let record = records
            .get_mut(unit_id)
            .ok_or_else(|| BridgeError::NotFound(format!("plugin '{unit_id}'")))?;
        Ok(f(record))
    }

    /// Move a record along a lifecycle edge. Returns the previous state.
    pub fn transition(&self, unit_id: &str, next: PluginState) -> BridgeResult<PluginState> {
        let mut records = self.records.write();
        let record = records
            .get_mut(unit_id)
            .ok_or_else(|| BridgeError::NotFound(format!("plugin '{unit_id}'")))?;
        apply_transition(record, next)
    }

    /// Move a record to `Error`, recording the failure.
    pub fn mark_error(&self, unit_id: &str, error: &BridgeError) -> BridgeResult<PluginState> {
        let mut records = self.records.write();
        let record = records
            .get_mut(unit_id)
            .ok_or_else(|| BridgeError::NotFound(format!("plugin '{unit_id}'")))?;
        let previous = apply_transition(record, PluginState::Error)?;
        record.error = Some(RecordError::from_error(error));
        Ok(previous)
    }

    pub fn summary(&self) -> RegistrySummary {
        let records = self.records.read();
        let mut summary = RegistrySummary { total: records.len(), ..Default::default() };
        for record in records.values() {
            *summary.by_state.entry(record.state.as_str().to_string()).or_default() += 1;
            *summary
                .by_type
                .entry(record.unit_type().display_name().to_ascii_lowercase())
                .or_default() += 1;
            if record.legacy {
                summary.legacy += 1;
            }
        }
        summary
    }
}

fn apply_transition(record: &mut PluginRecord, next: PluginState) -> BridgeResult<PluginState> {
    let previous = record.state;
    if !previous.can_transition_to(next) {
        return Err(BridgeError::lifecycle(
            record.id(),
            format!("illegal transition {previous} -> {next}"),
        ));
    }
    record.state = next;
    match next {
        PluginState::Ready => {
            record.error = None;
            record.disabled_reason = None;
            record.loaded_at = Some(Utc::now());
        }
        PluginState::Loading => {
            record.disabled_reason = None;
        }
        PluginState::Disabled | PluginState::Error | PluginState::Discovered => {}
    }
    tracing::debug!(unit = %record.id(), from = %previous, to = %next, "State transition");
    Ok(previous)
}
