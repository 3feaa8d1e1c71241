//! Small payload-extraction helpers shared by the simulators in this crate,
//! matching the style of `wattson-core`'s core handler.
//!
//! Also home to [`group_snapshot`], the group-promise collapsing pattern
//! both simulators use for their "expensive read many clients share"
//! queries (`GET_NODES`/`GET_LINKS`, `GET_GRID_REPRESENTATION`) — the same
//! join-or-start-then-multicast shape as
//! `wattson_core::controller::Controller::resolve_group`, inlined here
//! because a simulator only has a [`SimulatorContext`], not a `Controller`
//! handle.

use serde_json::{json, Value};
use wattson_core::error::WattsonError;
use wattson_core::message::Payload;
use wattson_core::notification::topic;
use wattson_core::promise::{reference_map_payload, JoinOutcome};
use wattson_core::simulator::SimulatorContext;

pub fn field<'a>(payload: &'a Payload, key: &str) -> Result<&'a Value, WattsonError> {
    payload
        .get(key)
        .ok_or_else(|| WattsonError::invalid(format!("missing required field '{key}'")))
}

pub fn field_str<'a>(payload: &'a Payload, key: &str) -> Result<&'a str, WattsonError> {
    field(payload, key)?
        .as_str()
        .ok_or_else(|| WattsonError::invalid(format!("field '{key}' must be a string")))
}

pub fn field_f64(payload: &Payload, key: &str) -> Result<f64, WattsonError> {
    field(payload, key)?
        .as_f64()
        .ok_or_else(|| WattsonError::invalid(format!("field '{key}' must be a number")))
}

pub fn field_i64(payload: &Payload, key: &str) -> Result<i64, WattsonError> {
    field(payload, key)?
        .as_i64()
        .ok_or_else(|| WattsonError::invalid(format!("field '{key}' must be an integer")))
}

pub fn field_bool(payload: &Payload, key: &str) -> Result<bool, WattsonError> {
    field(payload, key)?
        .as_bool()
        .ok_or_else(|| WattsonError::invalid(format!("field '{key}' must be a boolean")))
}

pub fn optional_str<'a>(payload: &'a Payload, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

pub fn optional_bool(payload: &Payload, key: &str) -> Option<bool> {
    payload.get(key).and_then(Value::as_bool)
}

pub fn optional_f64(payload: &Payload, key: &str) -> Option<f64> {
    payload.get(key).and_then(Value::as_f64)
}

/// The outcome shape a [`wattson_core::router::Handler`] returns in place of
/// an immediate answer (spec §4.3): a `reference_id` the client's pending-query
/// table keys on, plus the `group_key` if this promise folded into one.
pub fn promise_payload(reference_id: u64, group_key: Option<&str>) -> Payload {
    let mut payload = Payload::from_iter([("reference_id".to_string(), json!(reference_id))]);
    if let Some(group_key) = group_key {
        payload.insert("group_key".to_string(), json!(group_key));
    }
    payload
}

/// Collapses concurrent identical "expensive read" queries into one
/// computation (spec §4.3, §4.6 "group promise"). The first caller to join a
/// fresh group performs `compute` while holding the group's resolve lock and
/// multicasts an `ASYNC_QUERY_RESOLVE` to every member registered by the time
/// it finishes; every caller, including that first one, gets back the same
/// promise-shaped payload synchronously.
pub fn group_snapshot(
    ctx: &SimulatorContext,
    group_key: &str,
    client_id: &str,
    request_id: u64,
    compute: impl FnOnce() -> Payload,
) -> Payload {
    let (reference_id, outcome) = ctx.group_promises.join_or_start(group_key, client_id, request_id);
    if let JoinOutcome::StartFresh = outcome {
        let (response, reference_map) = ctx.group_promises.resolve(group_key, compute);
        if !reference_map.is_empty() {
            let recipients: Vec<String> = reference_map.iter().map(|(c, _, _)| c.clone()).collect();
            let payload = reference_map_payload(&reference_map, response);
            ctx.bus.multicast(topic::ASYNC_QUERY_RESOLVE, ctx.now_ms(), recipients, payload);
        }
    }
    promise_payload(reference_id, Some(group_key))
}
