//! The programmatic client and C7 Remote Object Layer for the Wattson
//! co-simulation control plane.
//!
//! [`client::WattsonClient`] owns the two socket connections (query,
//! publish) described in `wattson-core`'s [`wattson_core::transport`], a
//! client-side promise table ([`promise`]) mirroring the server's
//! [`wattson_core::promise::PromiseTable`], and a local named-event mirror
//! ([`events`]) kept in sync by `EVENTS` notifications. On top of that,
//! [`proxy`], [`network`], and [`grid`] give application code cached,
//! TTL-refreshed, reactively-invalidated stand-ins for server-owned
//! entities, so touching `node.interfaces()` or `grid_value.value()` reads
//! like local state even though it is a remote snapshot.
//!
//! # Crate layout
//!
//! * [`client`] — connection management, query/async_query, registration,
//!   named events, time sync, notification subscriptions, shutdown.
//! * [`promise`] — the client-side half of C3: pending and pre-resolved
//!   promise tables.
//! * [`events`] — the client-side named-event mirror (§4.5).
//! * [`proxy`] — the shared `{entity_id, state, last_sync, ttl}` proxy
//!   shape (§4.7).
//! * [`network`] — `RemoteNetworkEmulator` and its node/link/interface/
//!   service proxies.
//! * [`grid`] — `RemoteGridModel` and its grid element/value proxies.

pub mod client;
pub mod events;
pub mod grid;
pub mod network;
pub mod promise;
pub mod proxy;

pub use client::{ClientConfig, WattsonClient};
pub use wattson_core::error::{ErrorCode, WattsonError};
