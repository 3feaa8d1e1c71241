//! The shared remote-proxy shape (spec §4.7, C7): `{entity_id, state,
//! last_sync, ttl}`, lazily fetched and reactively invalidated.
//!
//! Grounded in `remote_network_entity.py`'s `RemoteNetworkEntity.synchronize`
//! (`last_synchronization`/`_synchronization_interval`, "skip the refetch
//! unless stale or forced") and `remote_grid_value.py`'s push-based refresh
//! from notifications. [`CachedEntity`] factors that shape out so every
//! concrete proxy in [`crate::network`]/[`crate::grid`] wraps one instead of
//! repeating the TTL bookkeeping.
//!
//! The lock guarding the cached state is a plain [`std::sync::RwLock`]
//! rather than `tokio::sync::RwLock`: every critical section here is a
//! cheap, synchronous `Payload` clone, never held across an `.await`, so a
//! std lock is both the idiomatic choice and the thing that lets
//! [`CachedEntity::invalidate`]/[`CachedEntity::apply`] be called directly
//! from the (synchronous) notification dispatch path in `client.rs`.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use wattson_core::error::Result as WattsonResult;
use wattson_core::message::Payload;

/// A cached, TTL-refreshed snapshot of one server-owned entity.
///
/// Reads consult the cached `state`; a [`CachedEntity::get`] call refreshes
/// first only when the cache is stale (`now - last_sync > ttl`), a prior
/// [`CachedEntity::invalidate`] is still pending, or `force` is set. A
/// `GRID_VALUE_CHANGED`/`TOPOLOGY_CHANGED`-style notification can instead
/// push a fresh snapshot directly via [`CachedEntity::apply`], without
/// round-tripping to the server.
pub struct CachedEntity {
    entity_id: String,
    ttl: Duration,
    inner: RwLock<Inner>,
}

struct Inner {
    state: Payload,
    last_sync: Instant,
    force_refresh: bool,
}

impl std::fmt::Debug for CachedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedEntity").field("entity_id", &self.entity_id).field("ttl", &self.ttl).finish()
    }
}

impl CachedEntity {
    /// Builds a proxy that starts out stale, so the first [`CachedEntity::get`]
    /// always performs a real refresh regardless of `ttl`.
    pub fn new(entity_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            entity_id: entity_id.into(),
            ttl,
            inner: RwLock::new(Inner {
                state: Payload::new(),
                last_sync: Instant::now() - ttl - Duration::from_secs(1),
                force_refresh: false,
            }),
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Returns the cached state, refreshing via `refresh` first if the
    /// cache is stale, was marked [`CachedEntity::invalidate`]d, or `force`
    /// is set. On a refresh error, the prior (now-stale) snapshot is
    /// returned rather than surfacing the error — matching `synchronize`'s
    /// "log and keep the old state" behavior — except when there has never
    /// been a successful sync, in which case the error propagates since
    /// there is nothing to fall back to.
    pub async fn get<F, Fut>(&self, force: bool, refresh: F) -> WattsonResult<Payload>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = WattsonResult<Payload>>,
    {
        let never_synced = {
            let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let forced = std::mem::take(&mut inner.force_refresh);
            if !force && !forced && !Self::is_stale(&inner, self.ttl) {
                return Ok(inner.state.clone());
            }
            inner.state.is_empty()
        };

        match refresh().await {
            Ok(fresh) => {
                let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
                inner.state = fresh.clone();
                inner.last_sync = Instant::now();
                inner.force_refresh = false;
                Ok(fresh)
            }
            Err(err) => {
                if never_synced {
                    Err(err)
                } else {
                    Ok(self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner()).state.clone())
                }
            }
        }
    }

    fn is_stale(inner: &Inner, ttl: Duration) -> bool {
        inner.last_sync.elapsed() > ttl
    }

    /// Installs `state` directly, as fresh (e.g. pushed by a reactive
    /// notification rather than fetched by this proxy).
    pub fn apply(&self, state: Payload) {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.state = state;
        inner.last_sync = Instant::now();
        inner.force_refresh = false;
    }

    /// Forces the next [`CachedEntity::get`] to refresh regardless of TTL,
    /// without discarding the last-known state in the meantime (the
    /// `set_outdated` idiom from `wattson_sim::network::timed_cache`).
    pub fn invalidate(&self) {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner()).force_refresh = true;
    }

    /// The currently cached state without triggering a refresh.
    pub fn snapshot(&self) -> Payload {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner()).state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(key: &str, value: serde_json::Value) -> Payload {
        Payload::from_iter([(key.to_string(), value)])
    }

    #[tokio::test]
    async fn first_get_always_refreshes_even_with_a_long_ttl() {
        let entity = CachedEntity::new("node_1", Duration::from_secs(3600));
        let fetched = entity.get(false, || async { Ok(payload("up", json!(true))) }).await.unwrap();
        assert_eq!(fetched.get("up"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn subsequent_get_within_ttl_skips_refresh() {
        let entity = CachedEntity::new("node_1", Duration::from_secs(3600));
        entity.get(false, || async { Ok(payload("n", json!(1))) }).await.unwrap();
        let second = entity
            .get(false, || async { panic!("refresh should not have been called") })
            .await
            .unwrap();
        assert_eq!(second.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn force_bypasses_the_ttl() {
        let entity = CachedEntity::new("node_1", Duration::from_secs(3600));
        entity.get(false, || async { Ok(payload("n", json!(1))) }).await.unwrap();
        let forced = entity.get(true, || async { Ok(payload("n", json!(2))) }).await.unwrap();
        assert_eq!(forced.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn apply_pushes_a_fresh_snapshot_without_a_refresh_call() {
        let entity = CachedEntity::new("node_1", Duration::from_secs(3600));
        entity.get(false, || async { Ok(payload("n", json!(1))) }).await.unwrap();
        entity.apply(payload("n", json!(99)));
        let snapshot = entity.snapshot();
        assert_eq!(snapshot.get("n"), Some(&json!(99)));
    }

    #[tokio::test]
    async fn invalidate_forces_the_next_get_to_refresh() {
        let entity = CachedEntity::new("node_1", Duration::from_secs(3600));
        entity.get(false, || async { Ok(payload("n", json!(1))) }).await.unwrap();
        entity.invalidate();
        let refreshed = entity.get(false, || async { Ok(payload("n", json!(2))) }).await.unwrap();
        assert_eq!(refreshed.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn invalidate_is_callable_synchronously_without_blocking_a_runtime_worker() {
        let entity = CachedEntity::new("node_1", Duration::from_secs(3600));
        entity.get(false, || async { Ok(payload("n", json!(1))) }).await.unwrap();
        // Simulates the notification dispatch path, which is synchronous.
        let invalidate_sync = || entity.invalidate();
        invalidate_sync();
        let refreshed = entity.get(false, || async { Ok(payload("n", json!(2))) }).await.unwrap();
        assert_eq!(refreshed.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn refresh_failure_after_a_successful_sync_falls_back_to_stale_state() {
        let entity = CachedEntity::new("node_1", Duration::from_millis(1));
        entity.get(false, || async { Ok(payload("n", json!(1))) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let fallback = entity
            .get(false, || async { Err(wattson_core::error::WattsonError::transport("down")) })
            .await
            .unwrap();
        assert_eq!(fallback.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn refresh_failure_before_any_sync_propagates() {
        let entity = CachedEntity::new("node_1", Duration::from_secs(3600));
        let err = entity
            .get(false, || async { Err(wattson_core::error::WattsonError::transport("down")) })
            .await
            .unwrap_err();
        assert_eq!(err.code, wattson_core::error::ErrorCode::TransportError);
    }
}
