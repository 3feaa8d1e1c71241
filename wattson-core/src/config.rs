//! The ambient configuration store (spec §4.2's `GET_CONFIGURATION` /
//! `SET_CONFIGURATION` / `RESOLVE_CONFIGURATION`).
//!
//! Configuration lives as a single JSON tree addressed by dotted paths
//! (`"network.switch1.bandwidth_mbps"`). `get`/`set` operate on raw values;
//! `resolve` additionally expands `"${other.dotted.path}"` placeholder
//! strings found anywhere in the value, recursively, so one scenario
//! parameter can be defined once and referenced from many places.
//!
//! DESIGN.md Open Question 3: the source system's `ConfigurationExpander`
//! carried pandapower-specific network-node expansion logic that is out of
//! scope here (power-flow numerics are an explicit non-goal); this store
//! implements the documented dotted-path-with-override contract without
//! that file-format-specific behavior.

use dashmap::DashMap;
use serde_json::Value;

const MAX_EXPANSION_DEPTH: u32 = 16;

/// A JSON-tree configuration store with a flat override layer on top.
#[derive(Debug)]
pub struct ConfigurationStore {
    base: Value,
    overrides: DashMap<String, Value>,
}

impl ConfigurationStore {
    pub fn new(base: Value) -> Self {
        Self {
            base,
            overrides: DashMap::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }

    /// Raw read: an override if one was set for `path`, else a walk of the
    /// base tree. Returns `None` if neither has a value there.
    pub fn get(&self, path: &str) -> Option<Value> {
        if let Some(value) = self.overrides.get(path) {
            return Some(value.clone());
        }
        Self::navigate(&self.base, path)
    }

    /// Sets an override for `path`, shadowing the base tree without
    /// mutating it.
    pub fn set(&self, path: &str, value: Value) {
        self.overrides.insert(path.to_string(), value);
    }

    /// Like [`ConfigurationStore::get`], but recursively expands any
    /// `"${dotted.path}"` placeholder strings within the result, up to
    /// [`MAX_EXPANSION_DEPTH`] levels. A placeholder that cannot be
    /// resolved is left untouched. Cycles are cut off by the depth limit
    /// rather than detected explicitly, matching the conservative "leave
    /// it as-is" failure behavior of the rest of this store.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let value = self.get(path)?;
        Some(self.expand(value, 0))
    }

    fn expand(&self, value: Value, depth: u32) -> Value {
        if depth >= MAX_EXPANSION_DEPTH {
            return value;
        }
        match value {
            Value::String(s) => {
                if let Some(inner) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
                    match self.get(inner) {
                        Some(resolved) => self.expand(resolved, depth + 1),
                        None => Value::String(s),
                    }
                } else {
                    Value::String(s)
                }
            }
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.expand(v, depth + 1)).collect()),
            Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, self.expand(v, depth + 1))).collect())
            }
            other => other,
        }
    }

    fn navigate(root: &Value, path: &str) -> Option<Value> {
        let mut current = root;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }
}

impl Default for ConfigurationStore {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_walks_dotted_path_into_base_tree() {
        let store = ConfigurationStore::new(json!({"network": {"switch1": {"bandwidth_mbps": 100}}}));
        assert_eq!(store.get("network.switch1.bandwidth_mbps"), Some(json!(100)));
        assert_eq!(store.get("network.switch1.missing"), None);
    }

    #[test]
    fn set_shadows_base_without_mutating_it() {
        let store = ConfigurationStore::new(json!({"a": 1}));
        store.set("a", json!(2));
        assert_eq!(store.get("a"), Some(json!(2)));
    }

    #[test]
    fn resolve_expands_placeholder_references() {
        let store = ConfigurationStore::new(json!({
            "defaults": {"voltage": 1.0},
            "bus": {"1": {"voltage_setpoint": "${defaults.voltage}"}},
        }));
        assert_eq!(store.resolve("bus.1.voltage_setpoint"), Some(json!(1.0)));
    }

    #[test]
    fn unresolvable_placeholder_is_left_as_is() {
        let store = ConfigurationStore::empty();
        store.set("a", json!("${nowhere.at.all}"));
        assert_eq!(store.resolve("a"), Some(json!("${nowhere.at.all}")));
    }
}
