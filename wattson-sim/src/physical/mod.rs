//! The physical (power-grid) simulator (spec §4.6): owns the [`GridModel`]
//! (§3.5) and runs the coalescing simulation loop described there.
//!
//! Grounded in `power_grid_simulator.py`'s `PowerGridSimulator` and its
//! `handle_simulation_control_query` dispatch: this module keeps the same
//! query vocabulary (`GET_GRID_VALUE(_VALUE)`, `SET_GRID_VALUE(_SIMPLE)`,
//! `SET_GRID_VALUE_STATE`, `GET_GRID_REPRESENTATION`) and the same
//! "single-value write → `GRID_VALUE_CHANGED`, configuration write →
//! enqueue an iteration, state toggle → `GRID_VALUE_STATE_CHANGED`" split.

pub mod grid_model;
pub mod loop_;
pub mod noise;
pub mod protection;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use wattson_core::error::{ErrorCode, WattsonError};
use wattson_core::message::{Payload, Request};
use wattson_core::notification::topic;
use wattson_core::router::{Handler, HandlerOutcome};
use wattson_core::simulator::{Simulator, SimulatorContext};

use crate::network::timed_cache::TimedCache;
use crate::solver::{PassthroughSolver, PowerFlowSolver};
use crate::util::{field_str, optional_bool};
use grid_model::GridModel;
use loop_::{LoopConfig, LoopHandle};
use noise::{NoNoise, Noise};
use protection::ProtectionMonitor;

const CLAIMED: &[&str] = &[
    "GET_GRID_VALUE",
    "GET_GRID_VALUE_VALUE",
    "SET_GRID_VALUE",
    "SET_GRID_VALUE_SIMPLE",
    "SET_GRID_VALUE_STATE",
    "GET_GRID_REPRESENTATION",
];

const REPRESENTATION_CACHE_TTL: Duration = Duration::from_secs(30);
/// Stop timeout the physical simulator waits for its worker thread before
/// logging a warning (spec §5: "workers join with a timeout").
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The physical simulator: the grid value store, pluggable solver/noise,
/// optional protection emulation, and the simulation loop's handle.
pub struct PhysicalSimulator {
    model: Arc<GridModel>,
    solver: Arc<dyn PowerFlowSolver>,
    noise: Arc<dyn Noise>,
    protection: Option<Arc<ProtectionMonitor>>,
    loop_config: LoopConfig,
    representation_cache: TimedCache<Payload>,
    ctx: OnceLock<SimulatorContext>,
    loop_handle: OnceLock<LoopHandle>,
}

impl std::fmt::Debug for PhysicalSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalSimulator").finish_non_exhaustive()
    }
}

impl Default for PhysicalSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalSimulator {
    pub fn new() -> Self {
        Self {
            model: Arc::new(GridModel::new()),
            solver: Arc::new(PassthroughSolver),
            noise: Arc::new(NoNoise),
            protection: None,
            loop_config: LoopConfig::default(),
            representation_cache: TimedCache::new(REPRESENTATION_CACHE_TTL),
            ctx: OnceLock::new(),
            loop_handle: OnceLock::new(),
        }
    }

    pub fn with_solver(mut self, solver: Arc<dyn PowerFlowSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_noise(mut self, noise: Arc<dyn Noise>) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_protection(mut self, protection: Arc<ProtectionMonitor>) -> Self {
        self.protection = Some(protection);
        self
    }

    pub fn with_loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = config;
        self
    }

    /// Direct access to the grid model, for a deployment that wants to seed
    /// initial values outside of `load_scenario` (e.g. in tests).
    pub fn grid_model(&self) -> Arc<GridModel> {
        self.model.clone()
    }

    fn ctx(&self) -> Option<&SimulatorContext> {
        self.ctx.get()
    }

    fn now_ms(&self) -> i64 {
        self.ctx().map(|ctx| ctx.now_ms()).unwrap_or(0)
    }

    fn queue_iteration(&self) {
        if let Some(handle) = self.loop_handle.get() {
            handle.queue_iteration();
        }
    }

    fn emit_grid_value_changed(&self, identifier: &str, payload: Payload) {
        if let Some(ctx) = self.ctx() {
            ctx.bus.broadcast(
                topic::GRID_VALUE_CHANGED,
                self.now_ms(),
                Payload::from_iter([("identifier".to_string(), json!(identifier)), ("grid_value".to_string(), json!(payload))]),
            );
        }
    }

    fn emit_state_changed(&self, identifier: &str, payload: Payload) {
        if let Some(ctx) = self.ctx() {
            ctx.bus.broadcast(
                topic::GRID_VALUE_STATE_CHANGED,
                self.now_ms(),
                Payload::from_iter([(
                    "grid_value".to_string(),
                    json!({"identifier": identifier, "representation": payload}),
                )]),
            );
        }
    }

    fn handle_get_grid_value(&self, request: &Request, value_only: bool) -> Result<HandlerOutcome, WattsonError> {
        let identifier = field_str(&request.payload, "grid_value_identifier")?;
        let grid_value = self.model.get_by_identifier(identifier)?;
        let payload = if value_only {
            Payload::from_iter([("value".to_string(), grid_value.value.clone())])
        } else {
            grid_value_payload(&grid_value)
        };
        Ok(HandlerOutcome::payload(payload))
    }

    fn handle_set_grid_value(&self, request: &Request, value_only: bool) -> Result<HandlerOutcome, WattsonError> {
        let identifier = field_str(&request.payload, "grid_value_identifier")?.to_string();
        let value = request
            .payload
            .get("value")
            .cloned()
            .ok_or_else(|| WattsonError::invalid("missing required field 'value'"))?;
        let override_lock = optional_bool(&request.payload, "override").unwrap_or(false);

        let outcome = self.model.set_value_by_identifier(&identifier, value, override_lock)?;
        let grid_value = self.model.get_by_identifier(&identifier)?;

        if outcome.changed {
            let payload = grid_value_payload(&grid_value);
            self.emit_grid_value_changed(&identifier, payload);
            if grid_value.context == wattson_core::model::grid::GridValueContext::Configuration {
                self.queue_iteration();
            }
        }

        let payload = if value_only {
            Payload::from_iter([("value".to_string(), grid_value.value.clone())])
        } else {
            grid_value_payload(&grid_value)
        };
        Ok(HandlerOutcome::payload(payload))
    }

    fn handle_set_grid_value_state(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let identifier = field_str(&request.payload, "grid_value_identifier")?.to_string();
        let state_type = field_str(&request.payload, "state_type")?;
        let state_target = optional_bool(&request.payload, "state_target").unwrap_or(false);

        let grid_value = match state_type {
            "freeze" => {
                if state_target {
                    let frozen_value = request.payload.get("freeze_value").cloned().unwrap_or(serde_json::Value::Null);
                    self.model.freeze(&identifier, frozen_value)?
                } else {
                    self.model.unfreeze(&identifier)?
                }
            }
            "lock" => {
                if state_target {
                    self.model.lock(&identifier)?
                } else {
                    self.model.unlock(&identifier)?
                }
            }
            other => return Err(WattsonError::invalid(format!("invalid state_type '{other}'"))),
        };

        let payload = grid_value_payload(&grid_value);
        self.emit_state_changed(&identifier, payload.clone());
        Ok(HandlerOutcome::payload(payload))
    }

    fn handle_get_grid_representation(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let Some(ctx) = self.ctx() else {
            let payload = self.representation_cache.get_or_refresh(|| self.model.representation());
            return Ok(HandlerOutcome::payload(payload));
        };
        let client_id = request.client_id.clone().unwrap_or_default();
        let payload = crate::util::group_snapshot(ctx, "grid_representation_snapshot", &client_id, request.id, || {
            self.representation_cache.get_or_refresh(|| self.model.representation())
        });
        Ok(HandlerOutcome::payload(payload))
    }
}

fn grid_value_payload(value: &wattson_core::model::grid::GridValue) -> Payload {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => Payload::new(),
    }
}

impl Handler for PhysicalSimulator {
    fn name(&self) -> &str {
        "physical"
    }

    fn claims(&self, query_type: &str) -> bool {
        CLAIMED.contains(&query_type)
    }

    fn handle(&self, request: &Request) -> Result<Option<HandlerOutcome>, WattsonError> {
        let outcome = match request.query_type.as_str() {
            "GET_GRID_VALUE" => self.handle_get_grid_value(request, false)?,
            "GET_GRID_VALUE_VALUE" => self.handle_get_grid_value(request, true)?,
            "SET_GRID_VALUE" => self.handle_set_grid_value(request, false)?,
            "SET_GRID_VALUE_SIMPLE" => self.handle_set_grid_value(request, true)?,
            "SET_GRID_VALUE_STATE" => self.handle_set_grid_value_state(request)?,
            "GET_GRID_REPRESENTATION" => self.handle_get_grid_representation(request)?,
            other => {
                return Err(WattsonError::new(
                    ErrorCode::Unhandled,
                    format!("physical simulator does not recognize query type '{other}'"),
                ))
            }
        };
        Ok(Some(outcome))
    }
}

impl Simulator for PhysicalSimulator {
    fn wire(&self, ctx: SimulatorContext) {
        let _ = self.ctx.set(ctx);
    }

    fn start(&self) -> wattson_core::error::Result<()> {
        if self.loop_handle.get().is_some() {
            return Ok(());
        }
        let ctx = self
            .ctx()
            .cloned()
            .ok_or_else(|| WattsonError::internal("physical simulator started before wire()"))?;
        let handle = loop_::spawn(self.model.clone(), self.solver.clone(), self.noise.clone(), self.protection.clone(), ctx, self.loop_config);
        let _ = self.loop_handle.set(handle);
        Ok(())
    }

    fn stop(&self) -> wattson_core::error::Result<()> {
        if let Some(handle) = self.loop_handle.get() {
            if !handle.stop(STOP_JOIN_TIMEOUT) {
                tracing::warn!("physical simulation loop refused to terminate in time");
            }
        }
        Ok(())
    }

    fn ready(&self) -> bool {
        self.loop_handle.get().map(LoopHandle::is_ready).unwrap_or(false)
    }

    fn load_scenario(&self, path: &std::path::Path) -> wattson_core::error::Result<()> {
        // Parsing `power-grid.yml`/`data-points.yml` is a collaborator
        // concern (spec Non-goals: no YAML scenario parsing here).
        tracing::info!(path = %path.display(), "physical simulator would load its grid scenario from this path");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wattson_core::model::grid::GridValueContext;

    fn request(query_type: &str, fields: &[(&str, serde_json::Value)]) -> Request {
        let mut req = Request::new(1, query_type);
        for (key, value) in fields {
            req.payload.insert(key.to_string(), value.clone());
        }
        req
    }

    #[test]
    fn set_then_get_grid_value_round_trips_without_wiring() {
        let sim = PhysicalSimulator::new();
        sim.model
            .set_value("bus.1", GridValueContext::Configuration, "voltage_setpoint", json!(1.0), false)
            .unwrap();

        sim.handle(&request(
            "SET_GRID_VALUE_SIMPLE",
            &[("grid_value_identifier", json!("bus.1.CONFIGURATION.voltage_setpoint")), ("value", json!(1.05))],
        ))
        .unwrap();

        let outcome = sim
            .handle(&request("GET_GRID_VALUE_VALUE", &[("grid_value_identifier", json!("bus.1.CONFIGURATION.voltage_setpoint"))]))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.payload.get("value").unwrap(), &json!(1.05));
    }

    #[test]
    fn locked_value_rejects_write_without_override() {
        let sim = PhysicalSimulator::new();
        sim.model
            .set_value("bus.1", GridValueContext::Configuration, "v", json!(1.0), false)
            .unwrap();
        sim.model.lock("bus.1.CONFIGURATION.v").unwrap();

        let err = sim
            .handle(&request("SET_GRID_VALUE_SIMPLE", &[("grid_value_identifier", json!("bus.1.CONFIGURATION.v")), ("value", json!(2.0))]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Locked);

        sim.handle(&request(
            "SET_GRID_VALUE_SIMPLE",
            &[("grid_value_identifier", json!("bus.1.CONFIGURATION.v")), ("value", json!(2.0)), ("override", json!(true))],
        ))
        .unwrap();
        let value = sim.model.get_by_identifier("bus.1.CONFIGURATION.v").unwrap();
        assert_eq!(value.value, json!(2.0));
    }

    #[test]
    fn freeze_then_unfreeze_round_trips_through_set_grid_value_state() {
        let sim = PhysicalSimulator::new();
        sim.model
            .set_value("bus.1", GridValueContext::Measurement, "voltage", json!(1.0), false)
            .unwrap();

        sim.handle(&request(
            "SET_GRID_VALUE_STATE",
            &[
                ("grid_value_identifier", json!("bus.1.MEASUREMENT.voltage")),
                ("state_type", json!("freeze")),
                ("state_target", json!(true)),
                ("freeze_value", json!(42.0)),
            ],
        ))
        .unwrap();
        let value = sim.model.get_by_identifier("bus.1.MEASUREMENT.voltage").unwrap();
        assert_eq!(value.observed(), &json!(42.0));

        sim.handle(&request(
            "SET_GRID_VALUE_STATE",
            &[
                ("grid_value_identifier", json!("bus.1.MEASUREMENT.voltage")),
                ("state_type", json!("freeze")),
                ("state_target", json!(false)),
            ],
        ))
        .unwrap();
        let value = sim.model.get_by_identifier("bus.1.MEASUREMENT.voltage").unwrap();
        assert_eq!(value.observed(), &json!(1.0));
    }

    #[test]
    fn get_grid_representation_without_wiring_falls_back_to_direct_cache() {
        let sim = PhysicalSimulator::new();
        sim.model
            .set_value("bus.1", GridValueContext::Configuration, "voltage_setpoint", json!(1.0), false)
            .unwrap();
        let outcome = sim.handle(&request("GET_GRID_REPRESENTATION", &[])).unwrap().unwrap();
        assert!(outcome.payload.get("grid_elements").unwrap().get("bus").is_some());
    }

    #[test]
    fn unknown_query_type_is_unhandled() {
        let sim = PhysicalSimulator::new();
        let err = sim.handle(&request("NONSENSE", &[])).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unhandled);
    }
}
