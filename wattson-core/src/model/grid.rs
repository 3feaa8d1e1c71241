//! Power-grid model types (spec §3.5).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which kind of fact a [`GridValue`] represents about its element.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GridValueContext {
    Property,
    Configuration,
    Measurement,
    Estimation,
    Generic,
}

impl std::fmt::Display for GridValueContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GridValueContext::Property => "PROPERTY",
            GridValueContext::Configuration => "CONFIGURATION",
            GridValueContext::Measurement => "MEASUREMENT",
            GridValueContext::Estimation => "ESTIMATION",
            GridValueContext::Generic => "GENERIC",
        };
        f.write_str(s)
    }
}

/// A single named, typed, context-tagged scalar attached to a grid element,
/// e.g. `bus.0.MEASUREMENT.voltage`.
///
/// Reads observe `frozen_value` while [`GridValue::frozen`] is set; writes
/// are refused while [`GridValue::locked`] is set unless explicitly
/// overridden (spec §3.5, §4.6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridValue {
    pub element_id: String,
    pub context: GridValueContext,
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub frozen_value: Option<Value>,
}

impl GridValue {
    pub fn new(
        element_id: impl Into<String>,
        context: GridValueContext,
        name: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            element_id: element_id.into(),
            context,
            name: name.into(),
            value,
            unit: None,
            scale: None,
            locked: false,
            frozen: false,
            frozen_value: None,
        }
    }

    /// The globally unique identifier `{element_id}.{context}.{name}`.
    pub fn identifier(&self) -> String {
        format!("{}.{}.{}", self.element_id, self.context, self.name)
    }

    /// The value as observed by a reader: `frozen_value` if frozen, else `value`.
    pub fn observed(&self) -> &Value {
        if self.frozen {
            self.frozen_value.as_ref().unwrap_or(&self.value)
        } else {
            &self.value
        }
    }

    /// Attempts to write a new value. Fails with `false` (caller maps to
    /// `WattsonError::locked`) when the value is locked and `override_lock`
    /// is not set. Returns whether the underlying value actually changed
    /// (spec §8, idempotence of `set_grid_value`).
    pub fn try_set(&mut self, new_value: Value, override_lock: bool) -> Result<bool, ()> {
        if self.locked && !override_lock {
            return Err(());
        }
        let changed = self.value != new_value;
        self.value = new_value;
        Ok(changed)
    }

    pub fn freeze(&mut self, frozen_value: Value) {
        self.frozen = true;
        self.frozen_value = Some(frozen_value);
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
        self.frozen_value = None;
    }
}

/// A grid element (bus, line, load, sgen, switch, trafo, ext_grid, storage),
/// identified by `{type}.{index}`. The element itself carries no values;
/// its [`GridValue`]s live in the owning model's store, keyed by the
/// element's identifier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridElement {
    #[serde(rename = "type")]
    pub element_type: String,
    pub index: i64,
}

impl GridElement {
    pub fn new(element_type: impl Into<String>, index: i64) -> Self {
        Self {
            element_type: element_type.into(),
            index,
        }
    }

    /// The globally unique identifier `{type}.{index}`.
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.element_type, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifier_formatting_matches_spec_examples() {
        let element = GridElement::new("bus", 1);
        assert_eq!(element.identifier(), "bus.1");

        let value = GridValue::new(
            element.identifier(),
            GridValueContext::Configuration,
            "voltage_setpoint",
            json!(1.0),
        );
        assert_eq!(value.identifier(), "bus.1.CONFIGURATION.voltage_setpoint");
    }

    #[test]
    fn locked_write_without_override_fails() {
        let mut value = GridValue::new("bus.1", GridValueContext::Configuration, "v", json!(1.0));
        value.locked = true;
        assert!(value.try_set(json!(1.05), false).is_err());
        assert_eq!(value.value, json!(1.0));
        assert!(value.try_set(json!(1.05), true).is_ok());
        assert_eq!(value.value, json!(1.05));
    }

    #[test]
    fn idempotent_write_reports_no_change_on_second_call() {
        let mut value = GridValue::new("bus.1", GridValueContext::Configuration, "v", json!(1.0));
        assert_eq!(value.try_set(json!(1.05), false).unwrap(), true);
        assert_eq!(value.try_set(json!(1.05), false).unwrap(), false);
    }

    #[test]
    fn freeze_isolates_reads_from_underlying_updates() {
        let mut value = GridValue::new("bus.1", GridValueContext::Measurement, "v", json!(1.0));
        value.freeze(json!(42.0));
        assert_eq!(value.observed(), &json!(42.0));
        value.try_set(json!(7.0), false).unwrap();
        assert_eq!(value.observed(), &json!(42.0));
        value.unfreeze();
        assert_eq!(value.observed(), &json!(7.0));
    }
}
