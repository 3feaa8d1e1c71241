//! Wires the control-plane primitives into a running deployment (spec §2,
//! §4.5 "Required clients", §6.4 working directory).
//!
//! Grounded in `co_simulation_controller.py`'s `start()`/`stop()`/
//! `_wait_for_wattson_clients()`: create a timestamped working directory
//! with `latest`/`previous` symlink rotation, start every registered
//! simulator, block on the required-client wait loop (periodically logging
//! who is still missing, proceeding with a warning past the timeout), then
//! broadcast `SIMULATION_START`. `stop()` is idempotent and joins every
//! simulator's background work.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;

use crate::config::ConfigurationStore;
use crate::error::{Result, WattsonError};
use crate::handlers::CoreHandler;
use crate::message::Payload;
use crate::notification::{topic, NotificationBus, NotificationExporter, NotificationReceiver};
use crate::promise::{GroupPromiseTable, PromiseTable};
use crate::registry::{ClientRegistry, NamedEvents};
use crate::router::Router;
use crate::simulator::Simulator;
use crate::time::CoTime;

/// Default total time the controller waits for every required client to
/// register before proceeding with a warning (spec §4.5).
pub const DEFAULT_REQUIRED_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
/// How often the wait loop logs the set of still-missing clients.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Builds a [`Controller`], registering simulators and tuning timeouts
/// before the working directory and router are materialized.
pub struct ControllerBuilder {
    working_dir_base: PathBuf,
    config: Value,
    required_client_timeout: Duration,
    progress_interval: Duration,
    simulators: Vec<Arc<dyn Simulator>>,
    export_topics: Vec<String>,
}

impl ControllerBuilder {
    pub fn new(working_dir_base: impl Into<PathBuf>) -> Self {
        Self {
            working_dir_base: working_dir_base.into(),
            config: Value::Object(serde_json::Map::new()),
            required_client_timeout: DEFAULT_REQUIRED_CLIENT_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            simulators: Vec::new(),
            export_topics: Vec::new(),
        }
    }

    /// Registers a simulator (spec §4.6, C6). Simulators are added to the
    /// router in registration order, after the core handler.
    pub fn with_simulator(mut self, simulator: Arc<dyn Simulator>) -> Self {
        self.simulators.push(simulator);
        self
    }

    pub fn with_base_configuration(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_required_client_timeout(mut self, timeout: Duration) -> Self {
        self.required_client_timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Allow-lists `topic` for notification export (spec §4.4, §6.4).
    pub fn with_notification_export(mut self, topic: impl Into<String>) -> Self {
        self.export_topics.push(topic.into());
        self
    }

    /// Materializes the timestamped working directory (rotating the
    /// `latest`/`previous` symlinks per spec §6.4), the notification bus,
    /// router and every shared primitive, returning a [`Controller`] ready
    /// for [`Controller::start`].
    pub fn build(self, run_name: &str) -> Result<(Controller, NotificationReceiver)> {
        let registry = Arc::new(ClientRegistry::new());
        let events = Arc::new(NamedEvents::new());
        let config = Arc::new(ConfigurationStore::new(self.config));
        let time = Arc::new(Mutex::new(CoTime::new()));
        let promises = Arc::new(PromiseTable::new());
        let group_promises = Arc::new(GroupPromiseTable::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let simulator_names: Vec<String> = self.simulators.iter().map(|s| s.name().to_string()).collect();

        let working_directory = prepare_working_directory(&self.working_dir_base, run_name)?;

        let exporter = if self.export_topics.is_empty() {
            None
        } else {
            Some(
                NotificationExporter::new(&working_directory, self.export_topics.clone())
                    .map_err(|err| WattsonError::internal(format!("failed to create notification export directory: {err}")))?,
            )
        };
        let (bus, receiver) = NotificationBus::new(exporter);
        let bus = Arc::new(bus);

        let sim_context = crate::simulator::SimulatorContext {
            bus: bus.clone(),
            promises: promises.clone(),
            group_promises: group_promises.clone(),
            registry: registry.clone(),
            events: events.clone(),
            config: config.clone(),
            time: time.clone(),
        };
        for simulator in &self.simulators {
            simulator.wire(sim_context.clone());
        }

        let core_handler = CoreHandler::new(
            registry.clone(),
            events.clone(),
            config.clone(),
            bus.clone(),
            time.clone(),
            simulator_names.clone(),
            shutdown_tx.clone(),
        );

        let mut router = Router::new();
        router.register(Box::new(core_handler));
        for simulator in &self.simulators {
            router.register(simulator_handler(simulator.clone()));
        }

        let controller = Controller {
            working_directory,
            required_client_timeout: self.required_client_timeout,
            progress_interval: self.progress_interval,
            registry,
            events,
            config,
            bus,
            time,
            promises,
            group_promises,
            router: Arc::new(router),
            simulators: self.simulators,
            shutdown_tx,
            shutdown_rx,
        };
        Ok((controller, receiver))
    }
}

/// Adapts an `Arc<dyn Simulator>` to `Box<dyn Handler>` for router
/// registration, without giving up the `Arc` the controller keeps for
/// lifecycle management.
fn simulator_handler(simulator: Arc<dyn Simulator>) -> Box<dyn crate::router::Handler> {
    Box::new(SimulatorHandlerAdapter(simulator))
}

struct SimulatorHandlerAdapter(Arc<dyn Simulator>);

impl crate::router::Handler for SimulatorHandlerAdapter {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn claims(&self, query_type: &str) -> bool {
        self.0.claims(query_type)
    }

    fn handle(&self, request: &crate::message::Request) -> std::result::Result<Option<crate::router::HandlerOutcome>, WattsonError> {
        self.0.handle(request)
    }
}

/// The running control plane: shared state, the handler chain, and the
/// registered simulators' lifecycle.
pub struct Controller {
    working_directory: PathBuf,
    required_client_timeout: Duration,
    progress_interval: Duration,
    registry: Arc<ClientRegistry>,
    events: Arc<NamedEvents>,
    config: Arc<ConfigurationStore>,
    bus: Arc<NotificationBus>,
    time: Arc<Mutex<CoTime>>,
    promises: Arc<PromiseTable>,
    group_promises: Arc<GroupPromiseTable>,
    router: Arc<Router>,
    simulators: Vec<Arc<dyn Simulator>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("simulators", &self.simulators.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("clients", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn bus(&self) -> Arc<NotificationBus> {
        self.bus.clone()
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    pub fn events(&self) -> Arc<NamedEvents> {
        self.events.clone()
    }

    pub fn config(&self) -> Arc<ConfigurationStore> {
        self.config.clone()
    }

    pub fn promises(&self) -> Arc<PromiseTable> {
        self.promises.clone()
    }

    pub fn group_promises(&self) -> Arc<GroupPromiseTable> {
        self.group_promises.clone()
    }

    pub fn now_ms(&self) -> i64 {
        self.time.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).now_ms()
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Publishes an `ASYNC_QUERY_RESOLVE` notification for a completed
    /// promise (spec §4.3).
    pub fn resolve_promise(&self, reference_id: u64, response: Payload) {
        if let Some((client_id, _request_id)) = self.promises.take(reference_id) {
            let payload = crate::promise::reference_map_payload(
                &[(client_id.clone(), 0, reference_id)],
                response,
            );
            self.bus.unicast(topic::ASYNC_QUERY_RESOLVE, self.now_ms(), &client_id, payload);
        }
    }

    /// Publishes the `ASYNC_QUERY_RESOLVE` notification that resolves a
    /// whole group of collapsed promises at once (spec §4.3, group
    /// promises): one notification, `reference_map` carries every member.
    pub fn resolve_group(&self, group_key: &str, compute: impl FnOnce() -> Payload) {
        let (response, reference_map) = self.group_promises.resolve(group_key, compute);
        if reference_map.is_empty() {
            return;
        }
        // All members share the same response; address the notification to
        // every member's client id so each self-filters the notification
        // to its own pending ref_id.
        let recipients: Vec<String> = reference_map.iter().map(|(client_id, _, _)| client_id.clone()).collect();
        let payload = crate::promise::reference_map_payload(&reference_map, response);
        self.bus.multicast(topic::ASYNC_QUERY_RESOLVE, self.now_ms(), recipients, payload);
    }

    /// Starts every registered simulator, waits for required clients, and
    /// broadcasts `SIMULATION_START` (spec §2, §4.5, §4.6).
    pub async fn start(&self) -> Result<()> {
        tracing::info!(path = %self.working_directory.display(), "working directory ready");

        for simulator in &self.simulators {
            tracing::info!(simulator = simulator.name(), "starting simulator");
            simulator.start()?;
        }

        let required: BTreeSet<String> = self
            .simulators
            .iter()
            .flat_map(|s| s.required_clients())
            .collect();
        self.wait_for_required_clients(&required).await;

        self.bus.broadcast(
            topic::SIMULATION_START,
            self.now_ms(),
            Payload::from_iter([(
                "working_directory".to_string(),
                json!(self.working_directory.display().to_string()),
            )]),
        );
        Ok(())
    }

    /// Loads a scenario by forwarding `path` to every simulator's
    /// `load_scenario` (spec §6.3: the on-disk shape is a collaborator
    /// concern; the core only routes the path).
    pub fn load_scenario(&self, path: &Path) -> Result<()> {
        for simulator in &self.simulators {
            simulator.load_scenario(path)?;
        }
        Ok(())
    }

    /// Blocks until every id in `required` has registered, periodically
    /// logging the missing set, and proceeds with a warning once
    /// `required_client_timeout` elapses (spec §4.5).
    async fn wait_for_required_clients(&self, required: &BTreeSet<String>) {
        if required.is_empty() {
            return;
        }
        tracing::info!(count = required.len(), "waiting for required clients to register");
        let deadline = tokio::time::Instant::now() + self.required_client_timeout;
        loop {
            let missing: Vec<&String> = required.iter().filter(|id| !self.registry.contains(id)).collect();
            if missing.is_empty() {
                tracing::info!("all required clients connected");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(missing = ?missing, "required client timeout elapsed; proceeding anyway");
                return;
            }
            tracing::info!(missing = ?missing, "still waiting for required clients");
            tokio::time::sleep(self.progress_interval.min(deadline - tokio::time::Instant::now())).await;
        }
    }

    /// Stops every simulator. Idempotent: a second call after shutdown is
    /// a no-op (spec §7, "The controller's `stop()` is idempotent").
    pub fn stop(&self) {
        if *self.shutdown_rx.borrow() {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        for simulator in &self.simulators {
            if let Err(err) = simulator.stop() {
                tracing::warn!(simulator = simulator.name(), error = %err, "simulator failed to stop cleanly");
            }
        }
        // Every pending promise belongs to a client that will never see its
        // resolution now; fail them out rather than leak the slot.
        for client in self.registry.snapshot() {
            let cancelled = self.promises.cancel_client(&client.id);
            if !cancelled.is_empty() {
                tracing::debug!(client = %client.id, count = cancelled.len(), "cancelled pending promises on shutdown");
            }
        }
    }
}

/// Creates a fresh timestamped run directory under `working_dir_base` and
/// rotates the `latest`/`previous` symlinks to point at it (spec §6.4).
///
/// Tolerates a missing prior `latest` symlink (first run) and an
/// already-existing `previous` (simply replaced).
fn prepare_working_directory(working_dir_base: &Path, run_name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(working_dir_base)
        .map_err(|err| WattsonError::internal(format!("failed to create working directory base: {err}")))?;

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let run_dir = working_dir_base.join(format!("{run_name}_{}_{}", timestamp.as_secs(), timestamp.subsec_nanos()));
    if run_dir.exists() {
        return Err(WattsonError::internal(format!("working directory {} already exists", run_dir.display())));
    }
    std::fs::create_dir_all(&run_dir)
        .map_err(|err| WattsonError::internal(format!("failed to create run directory: {err}")))?;

    let latest = working_dir_base.join("latest");
    let previous = working_dir_base.join("previous");
    let _ = std::fs::remove_file(&previous);
    if latest.exists() || latest.symlink_metadata().is_ok() {
        let _ = std::fs::rename(&latest, &previous);
    }
    symlink_dir(&run_dir, &latest)
        .map_err(|err| WattsonError::internal(format!("failed to create 'latest' symlink: {err}")))?;

    Ok(run_dir)
}

#[cfg(unix)]
fn symlink_dir(original: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink_dir(original: &Path, link: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(link)?;
    let marker = link.join(".wattson-latest-target");
    std::fs::write(marker, original.display().to_string())
}
