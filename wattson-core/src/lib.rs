//! The Wattson co-simulation control plane core.
//!
//! This crate is the spine of a cyber-physical co-simulation framework: it
//! orchestrates typed request/reply traffic between participants and
//! simulators ([`router`]), supports deferred resolution for expensive
//! queries ([`promise`]), broadcasts state-change notifications with
//! per-recipient filtering ([`notification`]), tracks connected clients and
//! process-wide named events ([`registry`]), and defines the uniform
//! contract every simulator implements ([`simulator`]).
//!
//! Concrete simulators (a network emulator and a power-grid simulator) live
//! in the sibling `wattson-sim` crate; client-side proxies live in
//! `wattson-client`. This crate only hosts the control-plane primitives, the
//! wire transport, and the shared data model ([`model`]).
//!
//! # Overview
//!
//! A participant's action flows like this: a client issues a
//! [`message::Request`] over the query transport ([`transport`]); the
//! [`router::Router`] walks its ordered handler chain (core handler,
//! controller, then each registered simulator) until one claims and answers
//! it; if the answer cannot be produced synchronously the handler returns a
//! [`message::PromiseResponse`] and the real answer arrives later as a
//! unicast [`message::Notification`] on the `ASYNC_QUERY_RESOLVE` topic
//! (see [`promise`]). Any state change the simulators make is broadcast
//! through the [`notification::NotificationBus`] so that remote proxies on
//! every participant can refresh.
//!
//! # Crate layout
//!
//! * [`transport`] — C1: two framed TCP endpoints (query, publish).
//! * [`router`] — C2: ordered handler dispatch.
//! * [`promise`] — C3: deferred responses and group-promise collapsing.
//! * [`notification`] — C4: topic-tagged broadcast, history, export.
//! * [`registry`] — C5: connected clients and named events.
//! * [`simulator`] — C6: the `Simulator` contract.
//! * [`model`] — §3 shared data model (topology, grid).
//! * [`controller`] — wires the above into a running control plane.
//! * [`config`] — the ambient configuration store.
//! * [`time`] — the shared wall/simulated time model.
//! * [`error`] — the error taxonomy (§7).

#![warn(missing_debug_implementations)]

pub mod config;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod message;
pub mod model;
pub mod notification;
pub mod promise;
pub mod registry;
pub mod router;
pub mod simulator;
pub mod time;
pub mod transport;

pub use error::{ErrorCode, WattsonError};
pub use message::{
    GroupPromiseResponse, MultiRequest, MultiResponse, Notification, PromiseResponse, Request,
    Response,
};
pub use simulator::{Simulator, SimulatorContext};
