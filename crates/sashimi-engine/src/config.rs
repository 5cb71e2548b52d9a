//! Three-level configuration tree: master, project, dataset.
//!
//! Each node holds only the values the operator actually set (plus whatever
//! unrecognized keys the file carried, which pass through untouched).
//! Inheritance is never materialized into a node: resolution is a pure
//! function of a root-to-leaf chain, so saving a node writes exactly its own
//! values back.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigRole {
    Master,
    Project,
    Dataset,
}

/// One configuration node. `values` is the JSON-shaped content of the
/// backing YAML file (or of an upload).
#[derive(Debug, Clone)]
pub struct Config {
    role: ConfigRole,
    values: Map<String, Value>,
}

impl Config {
    pub fn new(role: ConfigRole) -> Self {
        Self {
            role,
            values: Map::new(),
        }
    }

    pub fn from_yaml_str(role: ConfigRole, raw: &str) -> Result<Self, EngineError> {
        let parsed: Value = serde_yaml::from_str(raw)?;
        let values = match parsed {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(EngineError::bad_input(format!(
                    "config must be a YAML mapping, got {}",
                    crate::expr::type_name(&other)
                )))
            }
        };
        Ok(Self { role, values })
    }

    pub fn load(role: ConfigRole, path: &Path) -> Result<Self, EngineError> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(role, &raw)
    }

    /// Loads the node, falling back to an empty one when the file does not
    /// exist yet.
    pub fn load_or_default(role: ConfigRole, path: &Path) -> Result<Self, EngineError> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_yaml_str(role, &raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(role)),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let raw = serde_yaml::to_string(&Value::Object(self.values.clone()))?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn role(&self) -> ConfigRole {
        self.role
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        string_items(self.values.get(key))
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Appends to a list-valued key, creating the list when absent.
    pub fn push_list_item(&mut self, key: &str, item: Value) {
        match self.values.get_mut(key) {
            Some(Value::Array(items)) => items.push(item),
            _ => {
                self.values.insert(key.into(), Value::Array(vec![item]));
            }
        }
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Locates the master config when `SASHIMI_CONFIG` is unset.
    pub fn find_master_path() -> Option<PathBuf> {
        ["sashimi.yml", "/data/etc/sashimi.yml", "/etc/sashimi.yml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Loads the master node from `SASHIMI_CONFIG` (or the search path) and
    /// applies the environment overrides.
    pub fn master_from_env() -> Result<Self, EngineError> {
        let path = std::env::var("SASHIMI_CONFIG")
            .ok()
            .map(PathBuf::from)
            .or_else(Self::find_master_path);
        let mut config = match path {
            Some(path) => Self::load(ConfigRole::Master, &path)?,
            None => Self::new(ConfigRole::Master),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies `SASHIMI_DATASET`, `SASHIMI_TOKEN`, `SASHIMI_TRUSTED_IP` and
    /// `SASHIMI_IP_HEADER` from the given lookup.
    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(spec) = get("SASHIMI_DATASET") {
            for entry in spec.split_whitespace() {
                let Some((name, location)) = entry.split_once(':') else {
                    warn!(entry, "ignoring malformed SASHIMI_DATASET entry");
                    continue;
                };
                let source_key = if location.starts_with("http://") || location.starts_with("https://")
                {
                    "url"
                } else {
                    "file"
                };
                let mut definition = Map::new();
                definition.insert(source_key.into(), Value::from(location));
                let datasets = self
                    .values
                    .entry("datasets")
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(map) = datasets {
                    map.insert(name.into(), Value::Object(definition));
                }
            }
        }

        if let Some(token) = get("SASHIMI_TOKEN") {
            self.push_list_item("tokens", Value::from(token));
        }

        if let Some(ips) = get("SASHIMI_TRUSTED_IP") {
            for ip in ips.split_whitespace() {
                self.push_list_item("trusted_ips", Value::from(ip));
            }
        }

        if let Some(header) = get("SASHIMI_IP_HEADER") {
            self.set("ip_header", Value::from(header));
        }
    }
}

/// Built-in values consulted when no node in the chain defines a key.
fn role_default(role: ConfigRole, key: &str) -> Option<Value> {
    match (role, key) {
        (ConfigRole::Master | ConfigRole::Project, "sandbox") => Some(Value::Bool(false)),
        (ConfigRole::Master | ConfigRole::Project, "sandbox_expire") => {
            Some(Value::from(3600 * 24))
        }
        (ConfigRole::Dataset, "format") => Some(Value::from("json")),
        (ConfigRole::Dataset, "limit") => Some(Value::from(20)),
        _ => None,
    }
}

fn string_items(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

/// A root-to-leaf view over config nodes (`[master]`, `[master, project]`,
/// or `[master, project, dataset]`). Scalars resolve to the leaf-most
/// defined value; list keys concatenate root to leaf.
#[derive(Debug, Clone, Copy)]
pub struct ConfigChain<'a> {
    nodes: &'a [&'a Config],
}

impl<'a> ConfigChain<'a> {
    pub fn new(nodes: &'a [&'a Config]) -> Self {
        Self { nodes }
    }

    pub fn scalar(&self, key: &str) -> Option<Value> {
        for node in self.nodes.iter().rev() {
            if let Some(value) = node.get(key) {
                return Some(value.clone());
            }
        }
        for node in self.nodes.iter().rev() {
            if let Some(value) = role_default(node.role(), key) {
                return Some(value);
            }
        }
        None
    }

    pub fn scalar_str(&self, key: &str) -> Option<String> {
        self.scalar(key).and_then(|v| v.as_str().map(str::to_owned))
    }

    pub fn scalar_u64(&self, key: &str) -> Option<u64> {
        self.scalar(key).and_then(|v| v.as_u64())
    }

    pub fn scalar_bool(&self, key: &str) -> Option<bool> {
        self.scalar(key).and_then(|v| v.as_bool())
    }

    pub fn list(&self, key: &str) -> Vec<Value> {
        let mut merged = Vec::new();
        for node in self.nodes {
            if let Some(Value::Array(items)) = node.get(key) {
                merged.extend(items.iter().cloned());
            }
        }
        merged
    }

    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.list(key)
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    }

    pub fn tokens(&self) -> Vec<String> {
        self.string_list("tokens")
    }

    pub fn trusted_ips(&self) -> Vec<String> {
        self.string_list("trusted_ips")
    }

    pub fn ip_header(&self) -> Option<String> {
        self.scalar_str("ip_header")
    }

    /// The default result cap for searches, `limit` resolved over the chain
    /// (the dataset role contributes a built-in default of 20).
    pub fn limit(&self) -> Option<usize> {
        self.scalar_u64("limit").map(|v| v as usize)
    }
}
