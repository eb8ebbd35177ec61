//! Unit settings declared under `[config_schema]`.
//!
//! Each entry is either a bare default (`threshold = 15`) or a JSON Schema
//! fragment describing the key, recognised by a `type`, `enum` or `const`
//! field:
//!
//! ```toml
//! [config_schema]
//! threshold = { type = "integer", minimum = 1, default = 15 }
//! mode = { enum = ["fast", "full"], default = "fast" }
//! label = "complexity"
//! ```
//!
//! Fragments are compiled when the manifest is validated and the merged
//! configuration is checked against them before the unit's `init` runs.

use jsonschema::validator_for;
use serde_json::{json, Map, Value};

use crate::error::{BridgeError, BridgeResult};

type Settings = Map<String, Value>;

/// Whether a `[config_schema]` value describes its key rather than giving
/// a plain default.
pub fn is_property_schema(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|entry| ["type", "enum", "const"].iter().any(|key| entry.contains_key(*key)))
}

/// Defaults a unit starts from before host overrides apply. Schema entries
/// contribute their `default` when they have one.
pub fn config_defaults(schema: &Settings) -> Settings {
    schema
        .iter()
        .filter_map(|(key, value)| {
            if is_property_schema(value) {
                value.get("default").map(|default| (key.clone(), default.clone()))
            } else {
                Some((key.clone(), value.clone()))
            }
        })
        .collect()
}

/// The object schema assembled from the typed entries, or `None` when every
/// entry is a bare default.
fn object_schema(schema: &Settings) -> Option<Value> {
    let properties: Settings =
        schema.iter().filter(|(_, value)| is_property_schema(value)).map(|(k, v)| (k.clone(), v.clone())).collect();
    (!properties.is_empty()).then(|| json!({ "type": "object", "properties": properties }))
}

/// Fail when a typed entry is not a usable JSON Schema.
pub fn check_schema(schema: &Settings) -> Result<(), String> {
    match object_schema(schema) {
        Some(compiled) => validator_for(&compiled).map(|_| ()).map_err(|e| format!("invalid config_schema: {e}")),
        None => Ok(()),
    }
}

/// Check a unit's merged configuration against its typed entries.
pub fn validate_unit_config(unit_id: &str, schema: &Settings, config: &Settings) -> BridgeResult<()> {
    let Some(compiled) = object_schema(schema) else {
        return Ok(());
    };
    let validator =
        validator_for(&compiled).map_err(|e| BridgeError::manifest(unit_id, format!("invalid config_schema: {e}")))?;

    let instance = Value::Object(config.clone());
    let mut errors = validator.iter_errors(&instance);
    if let Some(first) = errors.next() {
        return Err(BridgeError::Validation(format!("invalid config for '{unit_id}': {first}")));
    }
    Ok(())
}
