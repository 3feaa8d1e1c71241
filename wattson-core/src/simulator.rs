//! The Simulator Interface (spec §4.6, C6): the uniform contract every
//! simulator implements.
//!
//! Concrete simulators — a network emulator and a physical (power-grid)
//! simulator — live in the sibling `wattson-sim` crate and plug into the
//! control plane purely through this trait and [`crate::router::Handler`].

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crate::config::ConfigurationStore;
use crate::error::Result;
use crate::notification::NotificationBus;
use crate::promise::{GroupPromiseTable, PromiseTable};
use crate::registry::{ClientRegistry, NamedEvents};
use crate::time::CoTime;

/// The shared control-plane handles a simulator needs to do anything beyond
/// answer queries: publish notifications, resolve promises it minted, read
/// the ambient configuration, or look at the clock. Handed to every
/// simulator once, right after the controller constructs these primitives
/// (spec §2: "simulator mutates authoritative state → C4 emits
/// notifications"), since a simulator is built before the controller that
/// will own it exists.
#[derive(Clone)]
pub struct SimulatorContext {
    pub bus: Arc<NotificationBus>,
    pub promises: Arc<PromiseTable>,
    pub group_promises: Arc<GroupPromiseTable>,
    pub registry: Arc<ClientRegistry>,
    pub events: Arc<NamedEvents>,
    pub config: Arc<ConfigurationStore>,
    pub time: Arc<Mutex<CoTime>>,
}

impl SimulatorContext {
    pub fn now_ms(&self) -> i64 {
        self.time.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).now_ms()
    }
}

/// A pluggable component claiming a subset of query kinds and owning a
/// subset of authoritative state.
///
/// Every simulator is also a [`crate::router::Handler`]; `Simulator` adds
/// the lifecycle and readiness surface the controller needs on top of
/// query dispatch.
pub trait Simulator: crate::router::Handler {
    /// Receives the shared control-plane handles. Called once by
    /// [`crate::controller::ControllerBuilder::build`], after the bus and
    /// promise tables exist but before the simulator is started. The
    /// default no-op suits simulators that only answer queries
    /// synchronously and never publish on their own.
    fn wire(&self, _ctx: SimulatorContext) {}

    /// The set of client ids the controller should wait for before
    /// considering the scenario "ready" (spec §4.5, "Required clients").
    fn required_clients(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Starts the simulator's background work (e.g. the physical
    /// simulation loop's worker thread).
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Stops background work. Must be idempotent and must not block
    /// indefinitely (spec §5: workers join with a timeout).
    fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the simulator has finished initializing and is ready to
    /// serve queries. The controller polls this (or waits on the
    /// simulator's own readiness signal) before declaring
    /// `SIMULATION_START`.
    fn ready(&self) -> bool {
        true
    }

    /// Loads a scenario from `path`. The scenario's exact on-disk shape is
    /// a collaborator concern (spec §6.3); simulators only need the path.
    fn load_scenario(&self, path: &std::path::Path) -> Result<()> {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WattsonError;
    use crate::message::Request;
    use crate::router::HandlerOutcome;

    struct NoopSimulator;

    impl crate::router::Handler for NoopSimulator {
        fn name(&self) -> &str {
            "noop"
        }
        fn claims(&self, _query_type: &str) -> bool {
            false
        }
        fn handle(&self, _request: &Request) -> std::result::Result<Option<HandlerOutcome>, WattsonError> {
            Ok(None)
        }
    }

    impl Simulator for NoopSimulator {}

    #[test]
    fn default_lifecycle_methods_are_infallible_no_ops() {
        let sim = NoopSimulator;
        assert!(sim.required_clients().is_empty());
        assert!(sim.start().is_ok());
        assert!(sim.ready());
        assert!(sim.stop().is_ok());
    }
}
