//! The Promise Engine (spec §4.3, C3): deferred responses and
//! group-promise collapsing.
//!
//! A handler that cannot answer synchronously mints a [`PromiseResponse`]
//! through [`PromiseTable::create`] and keeps working in the background.
//! When it finishes, [`PromiseTable::resolve`] looks up who is waiting on
//! that reference id and publishes an `ASYNC_QUERY_RESOLVE` notification
//! unicast to them (the actual publish happens one layer up, in the
//! controller — this module only owns the bookkeeping table).
//!
//! [`GroupPromiseTable`] adds collapsing on top: many clients asking the
//! same expensive question before the answer is ready get folded into one
//! in-flight computation and one eventual resolution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use slab::Slab;

use crate::message::{Payload, PromiseResponse};

/// A single outstanding promise: who asked (by ref_id) and what they get
/// back once resolved.
struct PendingPromise {
    client_id: String,
    request_id: u64,
}

/// Tracks in-flight promises by a monotonically increasing reference id
/// (spec §4.3).
///
/// Reference ids are allocated from a [`Slab`], so a resolved or cancelled
/// entry's storage slot is recycled for the next promise rather than
/// growing the table unbounded — the id itself (the slab key) is still
/// unique for as long as that slot is occupied.
#[derive(Default)]
pub struct PromiseTable {
    slots: Mutex<Slab<PendingPromise>>,
}

impl std::fmt::Debug for PromiseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("PromiseTable").field("pending", &slots.len()).finish()
    }
}

impl PromiseTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slab::new()),
        }
    }

    /// Mints a fresh reference id for `client_id`'s request `request_id` and
    /// records it as pending. Returns the [`PromiseResponse`] to send back
    /// to the client immediately.
    pub fn create(&self, client_id: &str, request_id: u64) -> PromiseResponse {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let reference_id = slots.insert(PendingPromise {
            client_id: client_id.to_string(),
            request_id,
        }) as u64;
        PromiseResponse {
            id: request_id,
            reference_id,
            group_key: None,
        }
    }

    /// Removes and returns the pending entry for `reference_id`, if any.
    /// The caller uses the returned `client_id` to address the resolution
    /// notification.
    pub fn take(&self, reference_id: u64) -> Option<(String, u64)> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = reference_id as usize;
        if slots.contains(key) {
            let pending = slots.remove(key);
            Some((pending.client_id, pending.request_id))
        } else {
            None
        }
    }

    /// Cancels every promise belonging to `client_id` (spec §4.3: "Promise
    /// cancellation on client shutdown"), returning their request ids so
    /// the caller can synthesize failure responses.
    pub fn cancel_client(&self, client_id: &str) -> Vec<u64> {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let stale: Vec<usize> = slots
            .iter()
            .filter(|(_, pending)| pending.client_id == client_id)
            .map(|(key, _)| key)
            .collect();
        stale.into_iter().map(|key| slots.remove(key).request_id).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A group of clients all awaiting the same computation, keyed by a
/// `group_key` describing *what* is being computed (e.g. a cache key for
/// "snapshot the topology").
pub struct PendingGroup {
    reference_map: Vec<(String, u64, u64)>,
}

impl PendingGroup {
    fn new() -> Self {
        Self {
            reference_map: Vec::new(),
        }
    }

    /// The `(client_id, request_id, reference_id)` triples registered so far.
    pub fn reference_map(&self) -> &[(String, u64, u64)] {
        &self.reference_map
    }
}

/// Collapses concurrent identical queries into one computation (spec §4.3,
/// §9 "Group promise locking").
///
/// `join_or_start` uses a non-blocking [`Mutex::try_lock`]: if a group for
/// `group_key` is currently resolving (lock held by the resolver), this
/// call does **not** wait — per DESIGN.md's Open Question 2, it starts a
/// fresh group under a new key generation instead of blocking the caller
/// indefinitely.
#[derive(Default)]
pub struct GroupPromiseTable {
    next_ref_id: AtomicU64,
    groups: DashMap<String, Mutex<PendingGroup>>,
}

impl std::fmt::Debug for GroupPromiseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupPromiseTable")
            .field("groups", &self.groups.len())
            .finish()
    }
}

/// The outcome of [`GroupPromiseTable::join_or_start`].
pub enum JoinOutcome {
    /// This caller is the first to join a brand-new group; it is
    /// responsible for actually performing the computation and calling
    /// [`GroupPromiseTable::resolve`].
    StartFresh,
    /// This caller joined an already-forming group; someone else will
    /// perform the computation and this caller's reference id will appear
    /// in the eventual resolve notification's `reference_map`.
    Joined,
}

impl GroupPromiseTable {
    pub fn new() -> Self {
        Self {
            next_ref_id: AtomicU64::new(0),
            groups: DashMap::new(),
        }
    }

    /// Registers `client_id`'s request under `group_key`, returning the
    /// freshly minted reference id and whether a new computation must be
    /// started.
    pub fn join_or_start(&self, group_key: &str, client_id: &str, request_id: u64) -> (u64, JoinOutcome) {
        let reference_id = self.next_ref_id.fetch_add(1, Ordering::Relaxed);

        // Fast path: an entry already exists and is not being resolved.
        if let Some(entry) = self.groups.get(group_key) {
            if let Ok(mut group) = entry.try_lock() {
                group.reference_map.push((client_id.to_string(), request_id, reference_id));
                return (reference_id, JoinOutcome::Joined);
            }
            // Held by the resolver: fall through to start a fresh group.
        }

        let mut fresh = PendingGroup::new();
        fresh.reference_map.push((client_id.to_string(), request_id, reference_id));
        self.groups.insert(group_key.to_string(), Mutex::new(fresh));
        (reference_id, JoinOutcome::StartFresh)
    }

    /// Called by the caller that received [`JoinOutcome::StartFresh`] once
    /// it is ready to actually compute the result. Holds the group's lock
    /// for the duration of `compute`, which is what makes concurrent
    /// `join_or_start` calls see the group as "resolving" and start a fresh
    /// one instead of silently joining mid-computation.
    ///
    /// Returns the full reference map accumulated while `compute` ran, so
    /// the caller can publish one resolve notification addressed to every
    /// member — including latecomers who joined after `compute` started but
    /// before it returned, since the lock is only released here.
    pub fn resolve<F, T>(&self, group_key: &str, compute: F) -> (T, Vec<(String, u64, u64)>)
    where
        F: FnOnce() -> T,
    {
        let entry = match self.groups.remove(group_key) {
            Some((_, mutex)) => mutex,
            None => Mutex::new(PendingGroup::new()),
        };
        let mut group = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = compute();
        let reference_map = std::mem::take(&mut group.reference_map);
        (result, reference_map)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// A convenience payload shape for `ASYNC_QUERY_RESOLVE` notifications
/// (spec §4.3): maps each addressed client to the reference id they should
/// match their pending query against.
pub fn reference_map_payload(entries: &[(String, u64, u64)], response: Payload) -> Payload {
    let mut payload = Payload::new();
    let reference_map: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|(client_id, _request_id, reference_id)| (client_id.clone(), serde_json::json!(reference_id)))
        .collect();
    payload.insert("reference_map".to_string(), serde_json::Value::Object(reference_map));
    payload.insert("response".to_string(), serde_json::Value::Object(response.into_iter().collect()));
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_take_round_trips_client_and_request_id() {
        let table = PromiseTable::new();
        let promise = table.create("scada_0", 7);
        let (client_id, request_id) = table.take(promise.reference_id).unwrap();
        assert_eq!(client_id, "scada_0");
        assert_eq!(request_id, 7);
        assert!(table.take(promise.reference_id).is_none());
    }

    #[test]
    fn cancel_client_returns_only_that_clients_requests() {
        let table = PromiseTable::new();
        table.create("scada_0", 1);
        let p2 = table.create("scada_0", 2);
        table.create("attacker_0", 3);

        let mut cancelled = table.cancel_client("scada_0");
        cancelled.sort();
        assert_eq!(cancelled, vec![1, 2]);
        assert!(table.take(p2.reference_id).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn concurrent_identical_queries_join_one_group() {
        let table = GroupPromiseTable::new();
        let (ref_a, outcome_a) = table.join_or_start("topology-snapshot", "client_a", 1);
        assert!(matches!(outcome_a, JoinOutcome::StartFresh));

        let (ref_b, outcome_b) = table.join_or_start("topology-snapshot", "client_b", 1);
        assert!(matches!(outcome_b, JoinOutcome::Joined));
        assert_ne!(ref_a, ref_b);

        let (result, reference_map) = table.resolve("topology-snapshot", || "snapshot-payload");
        assert_eq!(result, "snapshot-payload");
        assert_eq!(reference_map.len(), 2);
        let ids: Vec<u64> = reference_map.iter().map(|(_, _, r)| *r).collect();
        assert!(ids.contains(&ref_a));
        assert!(ids.contains(&ref_b));
    }

    #[test]
    fn join_after_resolve_starts_a_fresh_group() {
        let table = GroupPromiseTable::new();
        table.join_or_start("k", "a", 1);
        table.resolve("k", || ());
        assert_eq!(table.group_count(), 0);

        let (_ref, outcome) = table.join_or_start("k", "b", 2);
        assert!(matches!(outcome, JoinOutcome::StartFresh));
    }
}
