//! A TTL-gated cache around an expensive refresh (`util/performance/timed_cache.py`).
//!
//! The network simulator uses this to back `GET_NODES`/`GET_LINKS`: repeated
//! calls within `ttl` return the last snapshot without rebuilding it; a call
//! past `ttl`, or after [`TimedCache::set_outdated`], rebuilds once.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct State<T> {
    content: Option<T>,
    last_update: Option<Instant>,
}

/// A single cached value, refreshed on demand rather than on a timer.
pub struct TimedCache<T: Clone> {
    ttl: Duration,
    state: Mutex<State<T>>,
}

impl<T: Clone> std::fmt::Debug for TimedCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedCache").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl<T: Clone> TimedCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(State {
                content: None,
                last_update: None,
            }),
        }
    }

    /// Forces the next [`TimedCache::get_or_refresh`] to rebuild, regardless
    /// of `ttl` (used after a structural mutation invalidates the snapshot).
    pub fn set_outdated(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.last_update = None;
    }

    /// Whether the cached content, if any, is still within `ttl`.
    pub fn is_up_to_date(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match state.last_update {
            Some(t) => t.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Returns the cached value, rebuilding it with `refresh` first if it is
    /// missing or stale.
    pub fn get_or_refresh(&self, refresh: impl FnOnce() -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let needs_refresh = match state.last_update {
            None => true,
            Some(t) => t.elapsed() >= self.ttl,
        };
        if needs_refresh {
            let value = refresh();
            state.content = Some(value.clone());
            state.last_update = Some(Instant::now());
            value
        } else {
            state.content.clone().expect("content present whenever last_update is Some")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn refresh_only_runs_once_within_ttl() {
        let cache = TimedCache::new(Duration::from_millis(50));
        let calls = AtomicUsize::new(0);
        let refresh = || {
            calls.fetch_add(1, Ordering::SeqCst);
            42
        };
        assert_eq!(cache.get_or_refresh(refresh), 42);
        assert_eq!(cache.get_or_refresh(refresh), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_outdated_forces_a_rebuild() {
        let cache = TimedCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        let refresh = || {
            calls.fetch_add(1, Ordering::SeqCst);
            calls.load(Ordering::SeqCst)
        };
        assert_eq!(cache.get_or_refresh(refresh), 1);
        cache.set_outdated();
        assert_eq!(cache.get_or_refresh(refresh), 2);
    }

    #[test]
    fn expired_ttl_triggers_rebuild() {
        let cache = TimedCache::new(Duration::from_millis(5));
        cache.get_or_refresh(|| 1);
        std::thread::sleep(Duration::from_millis(15));
        assert!(!cache.is_up_to_date());
        assert_eq!(cache.get_or_refresh(|| 2), 2);
    }
}
