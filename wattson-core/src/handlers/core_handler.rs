//! The core handler (spec §4.2): registration, named events, time,
//! shutdown, configuration, and notification introspection.
//!
//! Grounded in `wattson_server.py`'s own `_handle_query` branch for these
//! query types — the same set of concerns, re-homed as the first link in
//! the [`crate::router::Router`] chain rather than a giant if/elif ladder.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::watch;

use crate::config::ConfigurationStore;
use crate::error::{ErrorCode, WattsonError};
use crate::message::{Payload, Request};
use crate::notification::{topic, NotificationBus};
use crate::registry::{ClientRegistry, NamedEvents};
use crate::router::{Handler, HandlerOutcome};
use crate::time::CoTime;

const CLAIMED: &[&str] = &[
    "ECHO",
    "REGISTRATION",
    "REQUEST_SHUTDOWN",
    "GET_TIME",
    "SET_TIME",
    "GET_EVENT_STATE",
    "SET_EVENT",
    "CLEAR_EVENT",
    "GET_CONFIGURATION",
    "SET_CONFIGURATION",
    "RESOLVE_CONFIGURATION",
    "SEND_NOTIFICATION",
    "GET_NOTIFICATION_HISTORY",
    "HAS_SIMULATOR",
    "GET_SIMULATORS",
];

fn field<'a>(payload: &'a Payload, key: &str) -> Result<&'a Value, WattsonError> {
    payload
        .get(key)
        .ok_or_else(|| WattsonError::invalid(format!("missing required field '{key}'")))
}

fn field_str<'a>(payload: &'a Payload, key: &str) -> Result<&'a str, WattsonError> {
    field(payload, key)?
        .as_str()
        .ok_or_else(|| WattsonError::invalid(format!("field '{key}' must be a string")))
}

/// The handler owned by the server itself.
pub struct CoreHandler {
    registry: Arc<ClientRegistry>,
    events: Arc<NamedEvents>,
    config: Arc<ConfigurationStore>,
    bus: Arc<NotificationBus>,
    time: Arc<Mutex<CoTime>>,
    simulator_names: Vec<String>,
    shutdown: watch::Sender<bool>,
}

impl CoreHandler {
    pub fn new(
        registry: Arc<ClientRegistry>,
        events: Arc<NamedEvents>,
        config: Arc<ConfigurationStore>,
        bus: Arc<NotificationBus>,
        time: Arc<Mutex<CoTime>>,
        simulator_names: Vec<String>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            registry,
            events,
            config,
            bus,
            time,
            simulator_names,
            shutdown,
        }
    }

    fn now_ms(&self) -> i64 {
        self.time.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).now_ms()
    }

    fn handle_echo(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        Ok(HandlerOutcome::payload(request.payload.clone()))
    }

    fn handle_registration(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let payload = &request.payload;
        let client = if let Some(id) = payload.get("id").and_then(Value::as_str) {
            self.registry
                .confirm(id)
                .ok_or_else(|| WattsonError::invalid(format!("unknown client id '{id}'")))?
        } else {
            let name = field_str(payload, "name")?;
            self.registry.register(name)
        };

        let snapshot: Vec<Value> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|c| json!({"id": c.id, "name": c.name, "registered_at_ms": c.registered_at_ms}))
            .collect();
        self.bus.broadcast(
            topic::REGISTRATION,
            self.now_ms(),
            Payload::from_iter([("clients".to_string(), Value::Array(snapshot))]),
        );

        Ok(HandlerOutcome::payload(Payload::from_iter([
            ("id".to_string(), json!(client.id)),
            ("name".to_string(), json!(client.name)),
            ("registered_at_ms".to_string(), json!(client.registered_at_ms)),
        ])))
    }

    fn handle_shutdown(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let shutdown = self.shutdown.clone();
        Ok(HandlerOutcome::with_post_send(
            request.payload.clone(),
            Box::new(move || {
                // `send` only errors if every receiver was dropped, which
                // means the controller is already gone — nothing to do.
                let _ = shutdown.send(true);
            }),
        ))
    }

    fn handle_get_time(&self) -> Result<HandlerOutcome, WattsonError> {
        let time = self.time.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(HandlerOutcome::payload(Payload::from_iter([
            ("sim_time_ms".to_string(), json!(time.now_ms())),
            ("speed".to_string(), json!(time.speed())),
        ])))
    }

    fn handle_set_time(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        {
            let mut time = self.time.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(value) = request.payload.get("sim_seconds") {
                let seconds = value
                    .as_f64()
                    .ok_or_else(|| WattsonError::invalid("field 'sim_seconds' must be a number"))?;
                time.set_sim_reference(seconds);
            }
            if let Some(value) = request.payload.get("speed") {
                let speed = value.as_f64().ok_or_else(|| WattsonError::invalid("field 'speed' must be a number"))?;
                time.set_speed(speed);
            }
        }
        let outcome = self.handle_get_time()?;
        self.bus.broadcast(topic::WATTSON_TIME, self.now_ms(), outcome.payload.clone());
        Ok(outcome)
    }

    fn handle_get_event_state(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let name = field_str(&request.payload, "event_name")?;
        let occurred = self.events.get_or_create(name);
        Ok(HandlerOutcome::payload(Payload::from_iter([
            ("event_name".to_string(), json!(name)),
            ("event_occurred".to_string(), json!(occurred)),
        ])))
    }

    fn handle_set_event(&self, request: &Request, set: bool) -> Result<HandlerOutcome, WattsonError> {
        let name = field_str(&request.payload, "event_name")?.to_string();
        if set {
            self.events.set(&name);
        } else {
            self.events.clear(&name);
        }
        self.bus.broadcast(
            topic::EVENTS,
            self.now_ms(),
            Payload::from_iter([
                ("action".to_string(), json!(if set { "set" } else { "clear" })),
                ("event_name".to_string(), json!(name)),
            ]),
        );
        Ok(HandlerOutcome::payload(Payload::new()))
    }

    fn handle_get_configuration(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let path = field_str(&request.payload, "path")?;
        let value = self
            .config
            .get(path)
            .ok_or_else(|| WattsonError::invalid(format!("no configuration at path '{path}'")))?;
        Ok(HandlerOutcome::payload(Payload::from_iter([
            ("path".to_string(), json!(path)),
            ("value".to_string(), value),
        ])))
    }

    fn handle_set_configuration(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let path = field_str(&request.payload, "path")?.to_string();
        let value = field(&request.payload, "value")?.clone();
        self.config.set(&path, value);
        Ok(HandlerOutcome::payload(Payload::new()))
    }

    fn handle_resolve_configuration(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let path = field_str(&request.payload, "path")?;
        let value = self
            .config
            .resolve(path)
            .ok_or_else(|| WattsonError::invalid(format!("no configuration at path '{path}'")))?;
        Ok(HandlerOutcome::payload(Payload::from_iter([
            ("path".to_string(), json!(path)),
            ("value".to_string(), value),
        ])))
    }

    fn handle_send_notification(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let topic_name = field_str(&request.payload, "topic")?.to_string();
        let payload = request
            .payload
            .get("payload")
            .and_then(|v| v.as_object())
            .map(|map| map.clone().into_iter().collect::<Payload>())
            .unwrap_or_default();
        let recipients: Vec<String> = request
            .payload
            .get("recipients")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        if recipients.is_empty() {
            self.bus.broadcast(&topic_name, self.now_ms(), payload);
        } else {
            self.bus.multicast(&topic_name, self.now_ms(), recipients, payload);
        }
        Ok(HandlerOutcome::payload(Payload::new()))
    }

    fn handle_get_notification_history(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let topic_name = field_str(&request.payload, "topic")?;
        let limit = request.payload.get("limit").and_then(Value::as_u64).map(|n| n as usize);
        let history = self.bus.history(topic_name, limit);
        let rendered: Vec<Value> = history
            .into_iter()
            .map(|n| {
                json!({
                    "topic": n.topic,
                    "sequence": n.sequence,
                    "timestamp_ms": n.timestamp_ms,
                    "recipients": n.recipients,
                    "payload": Value::Object(n.payload.into_iter().collect()),
                })
            })
            .collect();
        Ok(HandlerOutcome::payload(Payload::from_iter([
            ("topic".to_string(), json!(topic_name)),
            ("notifications".to_string(), Value::Array(rendered)),
        ])))
    }

    fn handle_has_simulator(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let name = field_str(&request.payload, "name")?;
        let present = self.simulator_names.iter().any(|n| n == name);
        Ok(HandlerOutcome::payload(Payload::from_iter([
            ("name".to_string(), json!(name)),
            ("present".to_string(), json!(present)),
        ])))
    }

    fn handle_get_simulators(&self) -> Result<HandlerOutcome, WattsonError> {
        Ok(HandlerOutcome::payload(Payload::from_iter([(
            "simulators".to_string(),
            json!(self.simulator_names),
        )])))
    }
}

impl Handler for CoreHandler {
    fn name(&self) -> &str {
        "core"
    }

    fn claims(&self, query_type: &str) -> bool {
        CLAIMED.contains(&query_type)
    }

    fn handle(&self, request: &Request) -> Result<Option<HandlerOutcome>, WattsonError> {
        let outcome = match request.query_type.as_str() {
            "ECHO" => self.handle_echo(request)?,
            "REGISTRATION" => self.handle_registration(request)?,
            "REQUEST_SHUTDOWN" => self.handle_shutdown(request)?,
            "GET_TIME" => self.handle_get_time()?,
            "SET_TIME" => self.handle_set_time(request)?,
            "GET_EVENT_STATE" => self.handle_get_event_state(request)?,
            "SET_EVENT" => self.handle_set_event(request, true)?,
            "CLEAR_EVENT" => self.handle_set_event(request, false)?,
            "GET_CONFIGURATION" => self.handle_get_configuration(request)?,
            "SET_CONFIGURATION" => self.handle_set_configuration(request)?,
            "RESOLVE_CONFIGURATION" => self.handle_resolve_configuration(request)?,
            "SEND_NOTIFICATION" => self.handle_send_notification(request)?,
            "GET_NOTIFICATION_HISTORY" => self.handle_get_notification_history(request)?,
            "HAS_SIMULATOR" => self.handle_has_simulator(request)?,
            "GET_SIMULATORS" => self.handle_get_simulators()?,
            other => {
                return Err(WattsonError::new(
                    ErrorCode::Unhandled,
                    format!("core handler does not recognize query type '{other}'"),
                ))
            }
        };
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Request;

    fn make_handler() -> (CoreHandler, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (bus, _rx) = NotificationBus::new(None);
        let handler = CoreHandler::new(
            Arc::new(ClientRegistry::new()),
            Arc::new(NamedEvents::new()),
            Arc::new(ConfigurationStore::empty()),
            Arc::new(bus),
            Arc::new(Mutex::new(CoTime::new())),
            vec!["network".to_string(), "physical".to_string()],
            shutdown_tx,
        );
        (handler, shutdown_rx)
    }

    #[test]
    fn echo_returns_payload_unchanged() {
        let (handler, _rx) = make_handler();
        let mut request = Request::new(1, "ECHO");
        request.payload.insert("x".to_string(), json!(1));
        let outcome = handler.handle(&request).unwrap().unwrap();
        assert_eq!(outcome.payload.get("x"), Some(&json!(1)));
    }

    #[test]
    fn registration_assigns_id_and_reregistration_confirms_it() {
        let (handler, _rx) = make_handler();
        let mut register = Request::new(1, "REGISTRATION");
        register.payload.insert("name".to_string(), json!("scada"));
        let outcome = handler.handle(&register).unwrap().unwrap();
        let id = outcome.payload.get("id").unwrap().as_str().unwrap().to_string();
        assert_eq!(id, "scada_0");

        let mut confirm = Request::new(2, "REGISTRATION");
        confirm.payload.insert("id".to_string(), json!(id.clone()));
        let outcome = handler.handle(&confirm).unwrap().unwrap();
        assert_eq!(outcome.payload.get("id").unwrap().as_str().unwrap(), id);
    }

    #[test]
    fn registration_with_unknown_id_fails_invalid() {
        let (handler, _rx) = make_handler();
        let mut confirm = Request::new(1, "REGISTRATION");
        confirm.payload.insert("id".to_string(), json!("ghost_7"));
        let err = handler.handle(&confirm).unwrap_err();
        assert_eq!(err.code, ErrorCode::Invalid);
    }

    #[test]
    fn shutdown_post_send_flips_the_watch_channel() {
        let (handler, rx) = make_handler();
        let outcome = handler.handle(&Request::new(1, "REQUEST_SHUTDOWN")).unwrap().unwrap();
        assert!(!*rx.borrow());
        outcome.post_send.unwrap()();
        assert!(*rx.borrow());
    }

    #[test]
    fn event_lifecycle_defaults_to_cleared_then_converges() {
        let (handler, _rx) = make_handler();
        let mut get = Request::new(1, "GET_EVENT_STATE");
        get.payload.insert("event_name".to_string(), json!("go"));
        let outcome = handler.handle(&get).unwrap().unwrap();
        assert_eq!(outcome.payload.get("event_occurred"), Some(&json!(false)));

        let mut set = Request::new(2, "SET_EVENT");
        set.payload.insert("event_name".to_string(), json!("go"));
        handler.handle(&set).unwrap();

        let outcome = handler.handle(&get).unwrap().unwrap();
        assert_eq!(outcome.payload.get("event_occurred"), Some(&json!(true)));
    }

    #[test]
    fn configuration_round_trips_through_set_and_get() {
        let (handler, _rx) = make_handler();
        let mut set = Request::new(1, "SET_CONFIGURATION");
        set.payload.insert("path".to_string(), json!("bus.1.CONFIGURATION.voltage_setpoint"));
        set.payload.insert("value".to_string(), json!(1.05));
        handler.handle(&set).unwrap();

        let mut get = Request::new(2, "GET_CONFIGURATION");
        get.payload.insert("path".to_string(), json!("bus.1.CONFIGURATION.voltage_setpoint"));
        let outcome = handler.handle(&get).unwrap().unwrap();
        assert_eq!(outcome.payload.get("value"), Some(&json!(1.05)));
    }

    #[test]
    fn has_simulator_reflects_registered_names() {
        let (handler, _rx) = make_handler();
        let mut request = Request::new(1, "HAS_SIMULATOR");
        request.payload.insert("name".to_string(), json!("network"));
        let outcome = handler.handle(&request).unwrap().unwrap();
        assert_eq!(outcome.payload.get("present"), Some(&json!(true)));

        request.payload.insert("name".to_string(), json!("nonexistent"));
        let outcome = handler.handle(&request).unwrap().unwrap();
        assert_eq!(outcome.payload.get("present"), Some(&json!(false)));
    }
}
