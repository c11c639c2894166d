use std::fs;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{guard, ConsumerSettings};

/// Merged configuration plus its identity.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Hex SHA-256 of `canonical_json`.
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

impl LoadedConfig {
    /// Typed view of the merged document, with defaults applied and validated.
    pub fn settings(&self) -> Result<ConsumerSettings> {
        ConsumerSettings::from_config_json(&self.config_json)
    }
}

/// Read and merge YAML files; later paths override earlier ones.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let docs = paths
        .iter()
        .map(|p| fs::read_to_string(p).with_context(|| format!("read config layer: {p}")))
        .collect::<Result<Vec<String>>>()?;

    let refs: Vec<&str> = docs.iter().map(String::as_str).collect();
    load_layered_yaml_from_strings(&refs)
}

pub fn load_layered_yaml_from_strings(layers: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(serde_json::Map::new());

    for (i, raw) in layers.iter().enumerate() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(raw)
            .with_context(|| format!("config layer {i} is not valid yaml"))?;
        let layer = serde_json::to_value(yaml)
            .with_context(|| format!("config layer {i} cannot be represented as json"))?;
        // Empty (or comment-only) layers contribute nothing.
        if !layer.is_null() {
            overlay(&mut merged, layer);
        }
    }

    guard::reject_secret_literals(&merged)?;

    // serde_json maps are key-ordered, so compact output is already canonical.
    let canonical_json = serde_json::to_string(&merged).context("serialize merged config")?;
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));

    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

/// Objects merge key by key; any other value replaces what was there.
fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Object(base_map), Value::Object(top_map)) => {
            for (k, v) in top_map {
                match base_map.get_mut(&k) {
                    Some(slot) => overlay(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}
