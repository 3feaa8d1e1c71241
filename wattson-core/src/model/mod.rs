//! The shared data model (spec §3.4, §3.5): network topology and grid-model
//! types, owned authoritatively by the simulators in `wattson-sim` and
//! mirrored read-only by proxies in `wattson-client`.
//!
//! This module only defines the shapes; it does not own any state itself.
//! `wattson-sim`'s simulators hold the authoritative stores, and
//! `wattson-client`'s proxies hold cached snapshots built from these types.

pub mod grid;
pub mod topology;

pub use grid::{GridElement, GridValue, GridValueContext};
pub use topology::{Interface, Link, LinkModel, Node, NodeKind, Service};
