//! The authoritative power-grid value store (spec §3.5).
//!
//! Grounded in `power_grid_simulator.py`'s grid-element bookkeeping and
//! `remote_grid_value.py`'s lock/freeze contract: every [`GridValue`] lives
//! here, keyed by its full `{element_id}.{context}.{name}` identifier, the
//! same identifier `GET_GRID_VALUE`/`SET_GRID_VALUE` address it by. Like
//! [`crate::network::topology::Topology`], this is a plain data store with
//! no notion of the notification bus; [`crate::physical::PhysicalSimulator`]
//! is what turns a changed return value into `GRID_VALUE_CHANGED` /
//! `GRID_VALUES_UPDATED` / `GRID_VALUE_STATE_CHANGED`.

use dashmap::DashMap;
use serde_json::Value;
use wattson_core::error::WattsonError;
use wattson_core::message::Payload;
use wattson_core::model::grid::{GridValue, GridValueContext};

/// The outcome of a single [`GridModel::set_value`] call: whether the
/// observed value actually changed, needed by the caller to decide whether
/// to emit `GRID_VALUE_CHANGED`/queue an iteration (spec §4.6, §8
/// "idempotence of set_grid_value").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteOutcome {
    pub changed: bool,
}

/// The authoritative store of every `GridValue` in the grid model, keyed by
/// its full dotted identifier.
#[derive(Debug, Default)]
pub struct GridModel {
    values: DashMap<String, GridValue>,
}

impl GridModel {
    pub fn new() -> Self {
        Self { values: DashMap::new() }
    }

    fn key(element_id: &str, context: GridValueContext, name: &str) -> String {
        format!("{element_id}.{context}.{name}")
    }

    /// Writes `name` under `context` for `element_id`, creating the value
    /// (as `Value::Null`, immediately overwritten) the first time it is
    /// addressed. Fails with [`ErrorCode::Locked`](wattson_core::error::ErrorCode::Locked)
    /// if the value is locked and `override_lock` is not set.
    pub fn set_value(
        &self,
        element_id: &str,
        context: GridValueContext,
        name: &str,
        value: Value,
        override_lock: bool,
    ) -> Result<WriteOutcome, WattsonError> {
        let key = Self::key(element_id, context, name);
        let mut entry = self
            .values
            .entry(key)
            .or_insert_with(|| GridValue::new(element_id, context, name, Value::Null));
        let identifier = entry.identifier();
        let changed = entry
            .try_set(value, override_lock)
            .map_err(|_| WattsonError::locked(format!("grid value {identifier} is locked")))?;
        Ok(WriteOutcome { changed })
    }

    /// Writes by full dotted identifier rather than its three parts,
    /// matching `SET_GRID_VALUE`'s wire shape (spec §6.2).
    pub fn set_value_by_identifier(&self, identifier: &str, value: Value, override_lock: bool) -> Result<WriteOutcome, WattsonError> {
        let mut entry = self
            .values
            .get_mut(identifier)
            .ok_or_else(|| WattsonError::invalid(format!("no grid value '{identifier}'")))?;
        let changed = entry
            .try_set(value, override_lock)
            .map_err(|_| WattsonError::locked(format!("grid value {identifier} is locked")))?;
        Ok(WriteOutcome { changed })
    }

    pub fn get_value(&self, element_id: &str, context: GridValueContext, name: &str) -> Result<GridValue, WattsonError> {
        let key = Self::key(element_id, context, name);
        self.get_by_identifier(&key)
    }

    pub fn get_by_identifier(&self, identifier: &str) -> Result<GridValue, WattsonError> {
        self.values
            .get(identifier)
            .map(|entry| entry.clone())
            .ok_or_else(|| WattsonError::invalid(format!("no grid value '{identifier}'")))
    }

    pub fn freeze(&self, identifier: &str, frozen_value: Value) -> Result<GridValue, WattsonError> {
        let mut entry = self
            .values
            .get_mut(identifier)
            .ok_or_else(|| WattsonError::invalid(format!("no grid value '{identifier}'")))?;
        entry.freeze(frozen_value);
        Ok(entry.clone())
    }

    pub fn unfreeze(&self, identifier: &str) -> Result<GridValue, WattsonError> {
        let mut entry = self
            .values
            .get_mut(identifier)
            .ok_or_else(|| WattsonError::invalid(format!("no grid value '{identifier}'")))?;
        entry.unfreeze();
        Ok(entry.clone())
    }

    pub fn lock(&self, identifier: &str) -> Result<GridValue, WattsonError> {
        let mut entry = self
            .values
            .get_mut(identifier)
            .ok_or_else(|| WattsonError::invalid(format!("no grid value '{identifier}'")))?;
        entry.locked = true;
        Ok(entry.clone())
    }

    pub fn unlock(&self, identifier: &str) -> Result<GridValue, WattsonError> {
        let mut entry = self
            .values
            .get_mut(identifier)
            .ok_or_else(|| WattsonError::invalid(format!("no grid value '{identifier}'")))?;
        entry.locked = false;
        Ok(entry.clone())
    }

    /// All configuration- and property-context values, used by noise
    /// injection and the solver to iterate the writable surface of the
    /// model without caring which elements exist (spec §4.6 step 1-2).
    pub fn values_in_context(&self, context: GridValueContext) -> Vec<GridValue> {
        self.values.iter().filter(|entry| entry.context == context).map(|entry| entry.clone()).collect()
    }

    pub fn all_values(&self) -> Vec<GridValue> {
        self.values.iter().map(|entry| entry.clone()).collect()
    }

    /// The solver seam's default behaviour (spec DESIGN.md Open Question
    /// 4): mirrors every configuration-context value into its
    /// measurement-context counterpart, overriding any lock on the
    /// measurement side since it is derived, not user-set.
    pub fn mirror_configuration_to_measurement(&self) {
        for config in self.values_in_context(GridValueContext::Configuration) {
            let _ = self.set_value(&config.element_id, GridValueContext::Measurement, &config.name, config.observed().clone(), true);
        }
    }

    /// Builds the nested `{element_type: {element_id: {attributes: {context:
    /// {name: grid_value}}}}}` tree `GET_GRID_REPRESENTATION` returns
    /// (spec §4.6, mirroring `_get_grid_representation`).
    pub fn representation(&self) -> Payload {
        let mut elements = serde_json::Map::new();
        for entry in self.values.iter() {
            let gv = entry.value();
            let element_type = gv.element_id.split('.').next().unwrap_or(gv.element_id.as_str()).to_string();
            let type_map = elements
                .entry(element_type)
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .expect("inserted as object");
            let element_map = type_map
                .entry(gv.element_id.clone())
                .or_insert_with(|| serde_json::json!({"attributes": {}, "data": {}}))
                .as_object_mut()
                .expect("inserted as object");
            let attributes = element_map
                .get_mut("attributes")
                .and_then(Value::as_object_mut)
                .expect("attributes is always an object");
            let context_map = attributes
                .entry(gv.context.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .expect("inserted as object");
            context_map.insert(gv.name.clone(), serde_json::to_value(gv).unwrap_or(Value::Null));
        }
        Payload::from_iter([("grid_elements".to_string(), Value::Object(elements))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_write_reports_changed_even_from_null() {
        let model = GridModel::new();
        let outcome = model.set_value("bus.1", GridValueContext::Configuration, "voltage_setpoint", json!(1.0), false).unwrap();
        assert!(outcome.changed);
    }

    #[test]
    fn repeated_identical_write_reports_no_change() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Configuration, "v", json!(1.05), false).unwrap();
        let second = model.set_value("bus.1", GridValueContext::Configuration, "v", json!(1.05), false).unwrap();
        assert!(!second.changed);
    }

    #[test]
    fn locked_value_refuses_write_without_override() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Configuration, "v", json!(1.0), false).unwrap();
        model.lock("bus.1.CONFIGURATION.v").unwrap();
        let err = model.set_value("bus.1", GridValueContext::Configuration, "v", json!(2.0), false).unwrap_err();
        assert_eq!(err.code, wattson_core::error::ErrorCode::Locked);
        let value = model.get_value("bus.1", GridValueContext::Configuration, "v").unwrap();
        assert_eq!(value.value, json!(1.0));

        model.set_value("bus.1", GridValueContext::Configuration, "v", json!(2.0), true).unwrap();
        let value = model.get_value("bus.1", GridValueContext::Configuration, "v").unwrap();
        assert_eq!(value.value, json!(2.0));
    }

    #[test]
    fn freeze_isolates_observed_value_until_unfrozen() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Measurement, "voltage", json!(1.0), false).unwrap();
        model.freeze("bus.1.MEASUREMENT.voltage", json!(42.0)).unwrap();
        model.set_value("bus.1", GridValueContext::Measurement, "voltage", json!(7.0), false).unwrap();
        let value = model.get_value("bus.1", GridValueContext::Measurement, "voltage").unwrap();
        assert_eq!(value.observed(), &json!(42.0));
        model.unfreeze("bus.1.MEASUREMENT.voltage").unwrap();
        let value = model.get_value("bus.1", GridValueContext::Measurement, "voltage").unwrap();
        assert_eq!(value.observed(), &json!(7.0));
    }

    #[test]
    fn mirror_configuration_to_measurement_overrides_locked_measurement() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Configuration, "voltage_setpoint", json!(1.05), false).unwrap();
        model.set_value("bus.1", GridValueContext::Measurement, "voltage_setpoint", json!(0.0), false).unwrap();
        model.lock("bus.1.MEASUREMENT.voltage_setpoint").unwrap();

        model.mirror_configuration_to_measurement();

        let measured = model.get_value("bus.1", GridValueContext::Measurement, "voltage_setpoint").unwrap();
        assert_eq!(measured.observed(), &json!(1.05));
    }

    #[test]
    fn representation_nests_by_element_type_then_id_then_context() {
        let model = GridModel::new();
        model.set_value("bus.1", GridValueContext::Configuration, "voltage_setpoint", json!(1.0), false).unwrap();
        model.set_value("bus.1", GridValueContext::Measurement, "voltage", json!(0.98), false).unwrap();
        model.set_value("line.0", GridValueContext::Measurement, "loading", json!(55.0), false).unwrap();

        let representation = model.representation();
        let grid_elements = representation.get("grid_elements").unwrap();
        let bus = grid_elements.get("bus").unwrap().get("bus.1").unwrap();
        let attributes = bus.get("attributes").unwrap();
        assert!(attributes.get("CONFIGURATION").unwrap().get("voltage_setpoint").is_some());
        assert!(attributes.get("MEASUREMENT").unwrap().get("voltage").is_some());
        assert!(grid_elements.get("line").unwrap().get("line.0").is_some());
    }
}
