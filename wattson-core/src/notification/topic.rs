//! The minimum set of topic identifiers every deployment must support
//! (spec §4.4).

/// A fresh client joined and the full client list changed.
pub const REGISTRATION: &str = "REGISTRATION";
/// A named event was set or cleared.
pub const EVENTS: &str = "EVENTS";
/// A deferred query resolved; unicast to the requesting client(s).
pub const ASYNC_QUERY_RESOLVE: &str = "ASYNC_QUERY_RESOLVE";
/// The co-simulation has started.
pub const SIMULATION_START: &str = "SIMULATION_START";
/// The shared clock was read or corrected.
pub const WATTSON_TIME: &str = "WATTSON_TIME";
/// Network topology structurally changed (node/link/interface add or remove).
pub const TOPOLOGY_CHANGED: &str = "TOPOLOGY_CHANGED";
/// A link's `LinkModel` (bandwidth/delay/jitter/loss) changed.
pub const LINK_PROPERTY_CHANGED: &str = "LINK_PROPERTY_CHANGED";
/// A node-level lifecycle event (start/stop).
pub const NODE_EVENT: &str = "NODE_EVENT";
/// A service-level lifecycle event (start/stop/kill).
pub const SERVICE_EVENT: &str = "SERVICE_EVENT";
/// A single `GridValue` changed.
pub const GRID_VALUE_CHANGED: &str = "GRID_VALUE_CHANGED";
/// A bulk flush of `GridValue` changes from one simulation iteration.
pub const GRID_VALUES_UPDATED: &str = "GRID_VALUES_UPDATED";
/// A `GridValue`'s lock/freeze state changed.
pub const GRID_VALUE_STATE_CHANGED: &str = "GRID_VALUE_STATE_CHANGED";
/// One physical-simulator iteration completed.
pub const SIMULATION_STEP_DONE: &str = "SIMULATION_STEP_DONE";
/// Protection emulation tripped.
pub const PROTECTION_TRIGGERED: &str = "PROTECTION_TRIGGERED";
/// Protection emulation cleared.
pub const PROTECTION_CLEARED: &str = "PROTECTION_CLEARED";

/// The topics that must never silently lose a notification to the
/// overflow policy (DESIGN.md Open Question 1).
pub const LOSS_INTOLERANT: &[&str] = &[ASYNC_QUERY_RESOLVE, EVENTS];

/// All topics a deployment is required to support out of the box.
pub const REQUIRED: &[&str] = &[
    REGISTRATION,
    EVENTS,
    ASYNC_QUERY_RESOLVE,
    SIMULATION_START,
    WATTSON_TIME,
    TOPOLOGY_CHANGED,
    LINK_PROPERTY_CHANGED,
    NODE_EVENT,
    SERVICE_EVENT,
    GRID_VALUE_CHANGED,
    GRID_VALUES_UPDATED,
    GRID_VALUE_STATE_CHANGED,
    SIMULATION_STEP_DONE,
    PROTECTION_TRIGGERED,
    PROTECTION_CLEARED,
];
