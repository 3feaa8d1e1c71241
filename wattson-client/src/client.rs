//! The programmatic client (spec §6.5, C7): connection management,
//! request/reply and deferred-resolution queries, registration, named
//! events, shared time sync, notification subscriptions, and shutdown.
//!
//! Grounded in `wattson_client.py`'s `WattsonClient`: one dedicated task
//! owns the query socket and serializes requests onto it one at a time
//! (the Python original used a single `threading.Thread` draining a
//! `queue.Queue`; here an `mpsc` channel plays the same role), and one
//! dedicated task owns the publish socket, dispatching every notification
//! synchronously to the promise table, the event mirror, the time model,
//! and any user-registered callbacks — exactly `on_receive_notification`'s
//! fan-out, just split by concern instead of one big dispatcher.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use wattson_core::error::{Result as WattsonResult, WattsonError};
use wattson_core::message::{Notification, Payload, Request, Response};
use wattson_core::notification::topic;
use wattson_core::time::CoTime;
use wattson_core::transport::{PublishConnection, QueryConnection};

use crate::events::EventMirror;
use crate::promise::ClientPromiseTable;

/// How often [`WattsonClient::require_connection`] retries an `ECHO` while
/// waiting for the server to come up.
const ECHO_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_QUEUE_LEN: usize = 256;

/// What a caller's query becomes once handed to the query loop: the wire
/// request plus a one-shot channel the loop fills in with the raw reply
/// (still possibly a [`Response::Promise`] the caller hasn't resolved yet).
struct QueryJob {
    request: Request,
    respond_to: oneshot::Sender<WattsonResult<Response>>,
}

/// Connection parameters for a [`WattsonClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub name: String,
    pub query_addr: SocketAddr,
    pub publish_addr: SocketAddr,
    /// Total budget for [`WattsonClient::start`]'s initial connection
    /// handshake (`require_connection`). `None` waits indefinitely.
    pub default_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>, query_addr: SocketAddr, publish_addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            query_addr,
            publish_addr,
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// The result of a query that might have deferred (spec §4.3). Mirrors
/// `WattsonResponsePromise`: a caller that wants the `query()` convenience
/// gets this resolved transparently; a caller that wants `async_query()`
/// semantics holds onto it and resolves it on its own schedule.
pub enum PendingQuery {
    /// The query answered synchronously.
    Ready(Response),
    /// The query deferred; awaiting this resolves once the matching
    /// `ASYNC_QUERY_RESOLVE` notification arrives.
    Deferred(oneshot::Receiver<Response>),
}

impl PendingQuery {
    /// Waits for the final response, however long it takes.
    pub async fn resolve(self) -> WattsonResult<Response> {
        match self {
            PendingQuery::Ready(response) => Ok(response),
            PendingQuery::Deferred(rx) => rx.await.map_err(|_| WattsonError::transport("promise was cancelled before it resolved")),
        }
    }

    /// Waits for the final response, failing with `TIMEOUT` if `timeout`
    /// elapses first (spec §5: "every client blocking call accepts an
    /// optional timeout").
    pub async fn resolve_timeout(self, timeout: Duration) -> WattsonResult<Response> {
        match self {
            PendingQuery::Ready(response) => Ok(response),
            PendingQuery::Deferred(rx) => tokio::time::timeout(timeout, rx)
                .await
                .map_err(|_| WattsonError::timeout("promise did not resolve within the configured timeout"))?
                .map_err(|_| WattsonError::transport("promise was cancelled before it resolved")),
        }
    }
}

/// A connected participant's view of the control plane: the query/publish
/// sockets, the promise and event tables, and the shared time model.
pub struct WattsonClient {
    config: ClientConfig,
    client_id: StdRwLock<Option<String>>,
    next_request_id: AtomicU64,
    request_tx: StdRwLock<Option<mpsc::Sender<QueryJob>>>,
    promises: Arc<ClientPromiseTable>,
    events: Arc<EventMirror>,
    time: StdMutex<CoTime>,
    subscriptions: DashMap<String, Vec<NotificationCallback>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    started: AtomicBool,
    registered: AtomicBool,
}

impl std::fmt::Debug for WattsonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WattsonClient")
            .field("name", &self.config.name)
            .field("client_id", &self.client_id())
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl WattsonClient {
    pub fn new(config: ClientConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            client_id: StdRwLock::new(None),
            next_request_id: AtomicU64::new(0),
            request_tx: StdRwLock::new(None),
            promises: Arc::new(ClientPromiseTable::new()),
            events: Arc::new(EventMirror::new()),
            time: StdMutex::new(CoTime::new()),
            subscriptions: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
            started: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    /// Connects both sockets, spawns the query and subscriber loops, waits
    /// for the server to answer an `ECHO`, and registers under
    /// [`ClientConfig::name`] (spec §6.5, `wattson_client.py::start`).
    pub async fn start(self: &Arc<Self>) -> WattsonResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let query_conn = QueryConnection::connect(self.config.query_addr)
            .await
            .map_err(|err| WattsonError::transport(format!("failed to connect query endpoint: {err}")))?;
        let publish_conn = PublishConnection::connect(self.config.publish_addr)
            .await
            .map_err(|err| WattsonError::transport(format!("failed to connect publish endpoint: {err}")))?;

        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_LEN);
        *self.request_tx.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);

        tokio::spawn(run_query_loop(query_conn, rx, self.shutdown_rx.clone()));

        let client = self.clone();
        tokio::spawn(run_subscriber_loop(client, publish_conn, self.shutdown_rx.clone()));

        self.require_connection(self.config.default_timeout).await?;
        self.register().await?;
        tracing::info!(client_id = ?self.client_id(), "wattson client started");
        Ok(())
    }

    /// Requests shutdown of the client's background tasks and fails every
    /// still-pending promise (spec §4.3, §5: idempotent, never blocks
    /// indefinitely).
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.promises
            .cancel_all(|| Response::from_error(0, &WattsonError::transport("client is shutting down")));
    }

    fn request_sender(&self) -> WattsonResult<mpsc::Sender<QueryJob>> {
        self.request_tx
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| WattsonError::transport("client has not been started"))
    }

    /// Sends `query_type`/`payload` and returns the raw [`Response`],
    /// without resolving a [`Response::Promise`] automatically. Use
    /// [`WattsonClient::query`] for the common "resolve it for me" case.
    pub async fn async_query(&self, query_type: impl Into<String>, payload: Payload) -> WattsonResult<PendingQuery> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut request = Request::with_payload(id, query_type, payload);
        request.client_id = self.client_id();

        let (tx, rx) = oneshot::channel();
        self.request_sender()?
            .send(QueryJob { request, respond_to: tx })
            .await
            .map_err(|_| WattsonError::transport("query loop is not running"))?;
        let response = rx.await.map_err(|_| WattsonError::transport("query loop dropped the response channel"))??;

        Ok(match response {
            Response::Promise(promise) => PendingQuery::Deferred(self.promises.register(promise.reference_id)),
            other => PendingQuery::Ready(other),
        })
    }

    /// Sends `query_type`/`payload` and blocks until the final answer is
    /// available, transparently waiting out a deferred resolution if the
    /// server returned a [`Response::Promise`] (spec §4.3).
    pub async fn query(&self, query_type: impl Into<String>, payload: Payload) -> WattsonResult<Response> {
        self.async_query(query_type, payload).await?.resolve().await
    }

    pub(crate) fn ok_or_err(response: Response) -> WattsonResult<Payload> {
        match response {
            Response::Ok { payload, .. } => Ok(payload),
            Response::Err { code, error, .. } => Err(WattsonError::new(code, error)),
            Response::Promise(_) => Err(WattsonError::internal("response unexpectedly still deferred after resolution")),
        }
    }

    /// Registers (or re-confirms) this client with the server under its
    /// configured name (spec §4.5).
    pub async fn register(&self) -> WattsonResult<()> {
        let mut payload = Payload::new();
        if let Some(id) = self.client_id() {
            payload.insert("id".to_string(), json!(id));
        } else {
            payload.insert("name".to_string(), json!(self.config.name));
        }
        let response = self.query("REGISTRATION", payload).await?;
        let payload = Self::ok_or_err(response)?;
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| WattsonError::invalid("registration response missing 'id'"))?
            .to_string();
        *self.client_id.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id);
        self.registered.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Blocks (subject to `timeout`) until the server answers an `ECHO`,
    /// retrying periodically (spec §5, `wattson_client.py::require_connection`).
    pub async fn require_connection(&self, timeout: Option<Duration>) -> WattsonResult<bool> {
        let start = Instant::now();
        loop {
            if let Ok(Response::Ok { .. }) = self.query("ECHO", Payload::new()).await {
                return Ok(true);
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(WattsonError::timeout(format!(
                        "connection not established after {:.1}s",
                        timeout.as_secs_f64()
                    )));
                }
            }
            let remaining = timeout.map(|t| t.saturating_sub(start.elapsed()));
            let sleep_for = match remaining {
                Some(remaining) => remaining.min(ECHO_RETRY_INTERVAL),
                None => ECHO_RETRY_INTERVAL,
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    // -- Named events (spec §4.5) -----------------------------------------

    async fn ensure_event_known(&self, event_name: &str) -> WattsonResult<()> {
        if self.events.is_known(event_name) {
            return Ok(());
        }
        let mut payload = Payload::new();
        payload.insert("event_name".to_string(), json!(event_name));
        let response = self.query("GET_EVENT_STATE", payload).await?;
        let payload = Self::ok_or_err(response)?;
        let occurred = payload.get("event_occurred").and_then(Value::as_bool).unwrap_or(false);
        self.events.apply(event_name, occurred);
        Ok(())
    }

    /// Blocks until `event_name` is observed set, or `timeout` elapses.
    pub async fn event_wait(&self, event_name: &str, timeout: Option<Duration>) -> WattsonResult<bool> {
        self.ensure_event_known(event_name).await?;
        Ok(self.events.wait(event_name, timeout).await)
    }

    pub fn event_is_known(&self, event_name: &str) -> bool {
        self.events.is_known(event_name)
    }

    pub async fn event_is_set(&self, event_name: &str) -> WattsonResult<bool> {
        self.ensure_event_known(event_name).await?;
        Ok(self.events.is_set(event_name))
    }

    pub async fn event_set(&self, event_name: &str) -> WattsonResult<()> {
        self.events.apply(event_name, true);
        let mut payload = Payload::new();
        payload.insert("event_name".to_string(), json!(event_name));
        let response = self.query("SET_EVENT", payload).await?;
        Self::ok_or_err(response).map(|_| ())
    }

    pub async fn event_clear(&self, event_name: &str) -> WattsonResult<()> {
        self.events.apply(event_name, false);
        let mut payload = Payload::new();
        payload.insert("event_name".to_string(), json!(event_name));
        let response = self.query("CLEAR_EVENT", payload).await?;
        Self::ok_or_err(response).map(|_| ())
    }

    // -- Shared time (spec §9 "Time model") --------------------------------

    /// Fetches the server's current `CoTime` reference and rebases this
    /// client's local clock onto it.
    pub async fn get_wattson_time(&self) -> WattsonResult<CoTime> {
        let response = self.query("GET_TIME", Payload::new()).await?;
        let payload = Self::ok_or_err(response)?;
        self.apply_time_payload(&payload);
        Ok(*self.time.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Corrects the server's clock (`SET_TIME`); `speed` is left unchanged
    /// when `None`.
    pub async fn set_wattson_time(&self, sim_seconds: f64, speed: Option<f64>) -> WattsonResult<()> {
        let mut payload = Payload::new();
        payload.insert("sim_seconds".to_string(), json!(sim_seconds));
        if let Some(speed) = speed {
            payload.insert("speed".to_string(), json!(speed));
        }
        let response = self.query("SET_TIME", payload).await?;
        Self::ok_or_err(response).map(|_| ())
    }

    fn apply_time_payload(&self, payload: &Payload) {
        let sim_ms = payload.get("sim_time_ms").and_then(Value::as_i64).unwrap_or(0);
        let speed = payload.get("speed").and_then(Value::as_f64).unwrap_or(1.0);
        let mut time = self.time.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        time.set_sim_reference(sim_ms as f64 / 1000.0);
        time.set_speed(speed);
    }

    // -- Notifications (spec §4.4) -----------------------------------------

    /// Registers `callback` to run synchronously, on the subscriber task,
    /// for every notification on `topic` (or every notification at all, for
    /// the wildcard topic `"*"`).
    pub fn subscribe(&self, topic: impl Into<String>, callback: impl Fn(&Notification) + Send + Sync + 'static) {
        self.subscriptions.entry(topic.into()).or_default().push(Arc::new(callback));
    }

    pub fn unsubscribe_topic(&self, topic: &str) {
        self.subscriptions.remove(topic);
    }

    pub fn unsubscribe_all(&self) {
        self.subscriptions.clear();
    }

    /// Asks the server to forward a notification to `recipients` (empty ⇒
    /// broadcast, per spec §3.1).
    pub async fn notify(&self, topic: impl Into<String>, payload: Payload, recipients: Vec<String>) -> WattsonResult<()> {
        let mut body = Payload::new();
        body.insert("topic".to_string(), json!(topic.into()));
        body.insert("payload".to_string(), Value::Object(payload.into_iter().collect()));
        body.insert("recipients".to_string(), json!(recipients));
        let response = self.query("SEND_NOTIFICATION", body).await?;
        Self::ok_or_err(response).map(|_| ())
    }

    pub async fn get_notification_history(&self, topic: &str, limit: Option<usize>) -> WattsonResult<Vec<Notification>> {
        let mut payload = Payload::new();
        payload.insert("topic".to_string(), json!(topic));
        if let Some(limit) = limit {
            payload.insert("limit".to_string(), json!(limit));
        }
        let response = self.query("GET_NOTIFICATION_HISTORY", payload).await?;
        let payload = Self::ok_or_err(response)?;
        let items = payload.get("notifications").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(items.into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect())
    }

    /// Dispatches one inbound notification: internal bookkeeping first
    /// (promise resolution, event mirror, time sync), then user callbacks.
    /// Called synchronously on the subscriber task (spec §5: "delivering
    /// notifications to callbacks synchronously on the subscriber thread").
    fn dispatch_notification(&self, notification: Notification) {
        let client_id = self.client_id().unwrap_or_default();
        if !notification.addressed_to(&client_id) {
            return;
        }

        match notification.topic.as_str() {
            topic::ASYNC_QUERY_RESOLVE => self.handle_async_resolve(&notification),
            topic::EVENTS => self.handle_events(&notification),
            topic::WATTSON_TIME => self.apply_time_payload(&notification.payload),
            _ => {}
        }

        if let Some(callbacks) = self.subscriptions.get(&notification.topic) {
            for callback in callbacks.iter() {
                callback(&notification);
            }
        }
        if let Some(callbacks) = self.subscriptions.get("*") {
            for callback in callbacks.iter() {
                callback(&notification);
            }
        }
    }

    fn handle_async_resolve(&self, notification: &Notification) {
        let Some(client_id) = self.client_id() else {
            tracing::warn!("received ASYNC_QUERY_RESOLVE before registration completed");
            return;
        };
        let Some(reference_map) = notification.payload.get("reference_map").and_then(Value::as_object) else {
            return;
        };
        let Some(reference_id) = reference_map.get(&client_id).and_then(Value::as_u64) else {
            return;
        };
        let Some(response_value) = notification.payload.get("response") else {
            return;
        };
        match serde_json::from_value::<Response>(response_value.clone()) {
            Ok(response) => self.promises.resolve(reference_id, response),
            Err(err) => tracing::warn!(error = %err, "failed to decode resolved promise response"),
        }
    }

    fn handle_events(&self, notification: &Notification) {
        let Some(action) = notification.payload.get("action").and_then(Value::as_str) else {
            return;
        };
        let Some(event_name) = notification.payload.get("event_name").and_then(Value::as_str) else {
            return;
        };
        self.events.apply(event_name, action == "set");
    }

    // -- Convenience queries -------------------------------------------------

    pub async fn request_shutdown(&self) -> WattsonResult<()> {
        let response = self.query("REQUEST_SHUTDOWN", Payload::new()).await?;
        Self::ok_or_err(response).map(|_| ())
    }

    pub async fn has_simulator(&self, name: &str) -> WattsonResult<bool> {
        let mut payload = Payload::new();
        payload.insert("name".to_string(), json!(name));
        let response = self.query("HAS_SIMULATOR", payload).await?;
        let payload = Self::ok_or_err(response)?;
        Ok(payload.get("present").and_then(Value::as_bool).unwrap_or(false))
    }

    pub async fn get_simulators(&self) -> WattsonResult<Vec<String>> {
        let response = self.query("GET_SIMULATORS", Payload::new()).await?;
        let payload = Self::ok_or_err(response)?;
        Ok(payload
            .get("simulators")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default())
    }

    pub async fn get_configuration(&self, path: &str) -> WattsonResult<Value> {
        let mut payload = Payload::new();
        payload.insert("path".to_string(), json!(path));
        let response = self.query("GET_CONFIGURATION", payload).await?;
        let payload = Self::ok_or_err(response)?;
        payload.get("value").cloned().ok_or_else(|| WattsonError::invalid("configuration response missing 'value'"))
    }

    pub async fn set_configuration(&self, path: &str, value: Value) -> WattsonResult<()> {
        let mut payload = Payload::new();
        payload.insert("path".to_string(), json!(path));
        payload.insert("value".to_string(), value);
        let response = self.query("SET_CONFIGURATION", payload).await?;
        Self::ok_or_err(response).map(|_| ())
    }

    pub async fn resolve_configuration(&self, path: &str) -> WattsonResult<Value> {
        let mut payload = Payload::new();
        payload.insert("path".to_string(), json!(path));
        let response = self.query("RESOLVE_CONFIGURATION", payload).await?;
        let payload = Self::ok_or_err(response)?;
        payload.get("value").cloned().ok_or_else(|| WattsonError::invalid("configuration response missing 'value'"))
    }

    /// A [`RemoteNetworkEmulator`](crate::network::RemoteNetworkEmulator)
    /// bound to this client (spec §4.7).
    pub fn remote_network_emulator(self: &Arc<Self>) -> crate::network::RemoteNetworkEmulator {
        crate::network::RemoteNetworkEmulator::new(self.clone())
    }

    /// A [`RemoteGridModel`](crate::grid::RemoteGridModel) bound to this
    /// client, subscribed to grid-value notifications on construction
    /// (spec §4.7).
    pub fn remote_grid_model(self: &Arc<Self>) -> crate::grid::RemoteGridModel {
        crate::grid::RemoteGridModel::new(self.clone())
    }
}

async fn run_query_loop(mut conn: QueryConnection, mut jobs: mpsc::Receiver<QueryJob>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("query loop started");
    loop {
        tokio::select! {
            job = jobs.recv() => {
                let Some(job) = job else { break };
                let result = conn.send(job.request).await;
                let _ = job.respond_to.send(result);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("query loop stopped");
}

async fn run_subscriber_loop(client: Arc<WattsonClient>, mut conn: PublishConnection, mut shutdown: watch::Receiver<bool>) {
    tracing::info!("subscriber loop started");
    loop {
        tokio::select! {
            notification = conn.recv() => {
                match notification {
                    Some(Ok(notification)) => client.dispatch_notification(notification),
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "publish connection error; subscriber loop exiting");
                        break;
                    }
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("subscriber loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_query_ready_resolves_immediately_without_awaiting_a_channel() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let pending = PendingQuery::Ready(Response::ok(1, Payload::new()));
            let response = pending.resolve().await.unwrap();
            assert_eq!(response.request_id(), 1);
        });
    }

    #[test]
    fn client_config_builder_sets_timeout() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ClientConfig::new("scada", addr, addr).with_default_timeout(Duration::from_secs(5));
        assert_eq!(config.default_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn fresh_client_has_no_id_and_is_not_started() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let client = WattsonClient::new(ClientConfig::new("scada", addr, addr));
        assert!(client.client_id().is_none());
        assert!(!client.is_started());
        assert!(!client.is_registered());
    }

    #[test]
    fn stop_before_start_does_not_panic() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let client = WattsonClient::new(ClientConfig::new("scada", addr, addr));
        client.stop();
        client.stop();
    }
}
