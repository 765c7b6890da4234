//! Layered YAML configuration.
//!
//! A config stack is an ordered list of YAML files; later layers win. The
//! merged tree deserializes into [`Settings`], and its canonical (sorted,
//! compact) JSON form is hashed so two deployments can compare what they
//! actually run with. The canonical form is also what the pipeline hashes
//! for parameter fingerprints — JSON in, stable digest out, nothing here
//! knows about media operations.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;

pub mod settings;

pub use settings::Settings;

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The merged tree, layer order applied.
    pub config_json: Value,
    /// Compact JSON with every object's keys sorted.
    pub canonical_json: String,
    /// SHA-256 hex digest of `canonical_json`.
    pub config_hash: String,
}

impl LoadedConfig {
    /// Deserialize the merged tree into typed [`Settings`]. Unknown keys are
    /// ignored; missing keys take their defaults.
    pub fn settings(&self) -> Result<Settings> {
        serde_json::from_value(self.config_json.clone()).context("settings deserialize failed")
    }
}

/// Read and merge a config stack. Each path must parse as YAML; the layers
/// fold left-to-right through [`overlay`].
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for path in paths {
        let text = fs::read_to_string(path).with_context(|| format!("read config: {path}"))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parse yaml: {path}"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("yaml to json failed for {path}"))?;
        merged = overlay(merged, layer);
    }

    let canonical_json = canonical_json(&merged);
    let config_hash = sha256_hex(canonical_json.as_bytes());

    Ok(LoadedConfig {
        config_json: merged,
        canonical_json,
        config_hash,
    })
}

/// Apply one layer over a base value. Objects merge key-wise, recursing into
/// shared keys; arrays and scalars are replaced wholesale.
fn overlay(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut under), Value::Object(over)) => {
            for (key, patch_value) in over {
                let merged = match under.remove(&key) {
                    Some(base_value) => overlay(base_value, patch_value),
                    None => patch_value,
                };
                under.insert(key, merged);
            }
            Value::Object(under)
        }
        (_, replacement) => replacement,
    }
}

/// Render a value as compact JSON with object keys in sorted order, so the
/// same logical tree always yields the same bytes regardless of insertion
/// order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, child)) in ordered.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(child, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        // Scalars already render compactly via Display.
        leaf => out.push_str(&leaf.to_string()),
    }
}

/// SHA-256 hex digest of a value's canonical JSON. The operation pipeline
/// fingerprints normalized parameter records with this.
pub fn canonical_hash<T: Serialize>(v: &T) -> Result<String> {
    let value = serde_json::to_value(v).context("serialize for hashing failed")?;
    Ok(sha256_hex(canonical_json(&value).as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
