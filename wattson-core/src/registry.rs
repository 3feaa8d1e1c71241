//! Client registry and named events (spec §3.2, §3.3, §4.5, C5).
//!
//! Both maps are server-authoritative: clients only ever mirror what the
//! registry publishes on the `REGISTRATION` and `EVENTS` topics. Lookups are
//! lock-free reads into a [`dashmap::DashMap`], matching the teacher's
//! preference for concurrent maps over a single coarse mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A connected participant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub registered_at_ms: i64,
}

/// Tracks connected clients and assigns process-unique ids.
///
/// Ids follow `"{name}_{n}"` with `n` a strictly increasing per-process
/// counter (spec §8, registration uniqueness) — not per-name, so two clients
/// named `"scada"` get `"scada_0"` and `"scada_1"`, never colliding even
/// after the first disconnects.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<String, Client>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a new client under `name`, returning the assigned id.
    pub fn register(&self, name: &str) -> Client {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("{name}_{n}");
        let registered_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        let client = Client {
            id: id.clone(),
            name: name.to_string(),
            registered_at_ms,
        };
        self.clients.insert(id, client.clone());
        client
    }

    /// Confirms liveness of an already-registered client. Returns `None` if
    /// the id is unknown.
    pub fn confirm(&self, id: &str) -> Option<Client> {
        self.clients.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Client> {
        self.clients.remove(id).map(|(_, client)| client)
    }

    /// A snapshot of every connected client, for the `REGISTRATION`
    /// broadcast payload and for `GET_SIMULATORS`-style enumeration.
    pub fn snapshot(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.clients.iter().map(|entry| entry.clone()).collect();
        clients.sort_by(|a, b| a.registered_at_ms.cmp(&b.registered_at_ms));
        clients
    }

    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// The process-wide set of named boolean events (spec §3.3).
///
/// Unknown events read as `false` without being materialized; the entry is
/// only created by an explicit `SET_EVENT`/`CLEAR_EVENT`, or lazily on the
/// first `GET_EVENT_STATE` if the caller wants it persisted (see
/// [`NamedEvents::get_or_create`]).
#[derive(Debug, Default)]
pub struct NamedEvents {
    events: DashMap<String, bool>,
}

impl NamedEvents {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
        }
    }

    /// Reads current state without creating the entry.
    pub fn get(&self, name: &str) -> bool {
        self.events.get(name).map(|v| *v).unwrap_or(false)
    }

    /// Reads current state, creating the entry as cleared if unknown
    /// (spec §4.5, `GET_EVENT_STATE`).
    pub fn get_or_create(&self, name: &str) -> bool {
        *self.events.entry(name.to_string()).or_insert(false)
    }

    /// Sets the event. Idempotent: setting an already-set event is a no-op
    /// observable change, so callers can always broadcast uniformly after
    /// calling this (spec §3.3: set/clear are idempotent).
    pub fn set(&self, name: &str) {
        self.events.insert(name.to_string(), true);
    }

    pub fn clear(&self, name: &str) {
        self.events.insert(name.to_string(), false);
    }

    /// A snapshot of every event that has ever been touched.
    pub fn snapshot(&self) -> Vec<(String, bool)> {
        self.events
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_ids_are_unique_and_increasing_even_across_names() {
        let registry = ClientRegistry::new();
        let a = registry.register("scada");
        let b = registry.register("scada");
        let c = registry.register("attacker");
        assert_eq!(a.id, "scada_0");
        assert_eq!(b.id, "scada_1");
        assert_eq!(c.id, "attacker_2");
    }

    #[test]
    fn unknown_confirm_returns_none() {
        let registry = ClientRegistry::new();
        assert!(registry.confirm("ghost_0").is_none());
    }

    #[test]
    fn unknown_event_reads_false_without_materializing() {
        let events = NamedEvents::new();
        assert_eq!(events.get("go"), false);
        assert!(events.snapshot().is_empty());
    }

    #[test]
    fn get_or_create_materializes_as_cleared() {
        let events = NamedEvents::new();
        assert_eq!(events.get_or_create("go"), false);
        assert_eq!(events.snapshot(), vec![("go".to_string(), false)]);
    }

    #[test]
    fn set_then_clear_converges() {
        let events = NamedEvents::new();
        events.set("go");
        assert!(events.get("go"));
        events.clear("go");
        assert!(!events.get("go"));
    }
}
