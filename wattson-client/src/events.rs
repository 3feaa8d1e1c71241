//! The client-side named-event mirror (spec §4.5, SPEC_FULL.md EXPANSION 4
//! item 9).
//!
//! Grounded in `wattson_client.py`'s `_events`/`_event_lock`: rather than
//! querying the server on every check, the client keeps a local
//! `name -> bool` map updated only by `EVENTS` notifications (and, for an
//! event the client has never heard of, one eager `GET_EVENT_STATE` query
//! to seed it). [`EventMirror::wait`] blocks the caller until the event is
//! observed set or a timeout elapses, woken by a `tokio::sync::Notify`
//! signaled on every update rather than polling.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Local, eventually-consistent view of the server's named-event map.
#[derive(Default)]
pub struct EventMirror {
    state: DashMap<String, bool>,
    changed: Notify,
}

impl std::fmt::Debug for EventMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMirror").field("known", &self.state.len()).finish()
    }
}

impl EventMirror {
    pub fn new() -> Self {
        Self {
            state: DashMap::new(),
            changed: Notify::new(),
        }
    }

    /// Applies a server-confirmed state for `name` (from either an `EVENTS`
    /// notification or a `GET_EVENT_STATE` reply), waking anyone blocked in
    /// [`EventMirror::wait`].
    pub fn apply(&self, name: &str, occurred: bool) {
        self.state.insert(name.to_string(), occurred);
        self.changed.notify_waiters();
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.state.contains_key(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.state.get(name).map(|entry| *entry).unwrap_or(false)
    }

    /// Blocks until `name` is observed set, or `timeout` elapses (spec §5:
    /// "every client blocking call accepts an optional timeout"). A `None`
    /// timeout waits indefinitely. Returns whether the event was observed
    /// set before the deadline.
    pub async fn wait(&self, name: &str, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if self.is_set(name) {
                return true;
            }
            let notified = self.changed.notified();
            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return self.is_set(name);
                    }
                    if tokio::time::timeout(remaining, notified).await.is_err() {
                        return self.is_set(name);
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_event_reads_false_without_materializing() {
        let mirror = EventMirror::new();
        assert!(!mirror.is_known("go"));
        assert!(!mirror.is_set("go"));
    }

    #[tokio::test]
    async fn wait_returns_immediately_once_already_set() {
        let mirror = EventMirror::new();
        mirror.apply("go", true);
        assert!(mirror.wait("go", Some(Duration::from_millis(10))).await);
    }

    #[tokio::test]
    async fn wait_times_out_when_never_set() {
        let mirror = EventMirror::new();
        mirror.apply("go", false);
        assert!(!mirror.wait("go", Some(Duration::from_millis(20))).await);
    }

    #[tokio::test]
    async fn wait_wakes_up_once_another_task_sets_it() {
        let mirror = std::sync::Arc::new(EventMirror::new());
        mirror.apply("go", false);
        let setter = mirror.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.apply("go", true);
        });
        assert!(mirror.wait("go", Some(Duration::from_secs(1))).await);
    }
}
