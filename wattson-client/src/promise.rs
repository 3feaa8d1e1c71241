//! The client-side half of the Promise Engine (spec §4.3, C3).
//!
//! Grounded in `wattson_client.py`'s `_async_queries`/`_pre_resolved_queries`
//! pair: when a query resolves to a [`PromiseResponse`], the client records
//! `reference_id -> pending query` so the eventual `ASYNC_QUERY_RESOLVE`
//! notification can fill it in. If that notification arrives first — the
//! server resolved the group before this client finished recording its own
//! reference id — it is instead stashed in a pre-resolved table keyed by
//! `reference_id`, and [`ClientPromiseTable::register`] consults that table
//! before creating a fresh waiter.

use dashmap::DashMap;
use tokio::sync::oneshot;

use wattson_core::message::Response;

/// Tracks promises this client is waiting on, plus notifications that
/// arrived before the corresponding `register` call (the race described in
/// spec §4.3).
#[derive(Default)]
pub struct ClientPromiseTable {
    pending: DashMap<u64, oneshot::Sender<Response>>,
    pre_resolved: DashMap<u64, Response>,
}

impl std::fmt::Debug for ClientPromiseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPromiseTable")
            .field("pending", &self.pending.len())
            .field("pre_resolved", &self.pre_resolved.len())
            .finish()
    }
}

impl ClientPromiseTable {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            pre_resolved: DashMap::new(),
        }
    }

    /// Registers interest in `reference_id`, returning a receiver that
    /// resolves once [`ClientPromiseTable::resolve`] is called for it. If
    /// the resolution already arrived (the pre-resolved race), the receiver
    /// is immediately ready.
    pub fn register(&self, reference_id: u64) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        if let Some((_, response)) = self.pre_resolved.remove(&reference_id) {
            // The sender side is dropped immediately after `send`, which is
            // fine: the corresponding `rx.await` still observes the value.
            let _ = tx.send(response);
            return rx;
        }
        self.pending.insert(reference_id, tx);
        rx
    }

    /// Fills in the response for `reference_id`. If nobody has registered
    /// for it yet, stashes it as pre-resolved for the next `register` call.
    pub fn resolve(&self, reference_id: u64, response: Response) {
        if let Some((_, tx)) = self.pending.remove(&reference_id) {
            let _ = tx.send(response);
        } else {
            self.pre_resolved.insert(reference_id, response);
        }
    }

    /// Cancels every still-pending promise with a synthetic failure
    /// response (spec §4.3, "Promise cancellation on client shutdown").
    /// Dropping the paired `oneshot::Sender` without sending would also
    /// unblock awaiters, but with an opaque `RecvError` instead of a
    /// typed `TRANSPORT_ERROR` response — so every cancellation sends one
    /// explicitly.
    pub fn cancel_all(&self, failure: impl Fn() -> Response) {
        let keys: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.pending.remove(&key) {
                let _ = tx.send(failure());
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wattson_core::message::Payload;

    #[tokio::test]
    async fn register_then_resolve_delivers_the_response() {
        let table = ClientPromiseTable::new();
        let rx = table.register(7);
        table.resolve(7, Response::ok(1, Payload::new()));
        let response = rx.await.unwrap();
        assert_eq!(response.request_id(), 1);
    }

    #[tokio::test]
    async fn resolve_before_register_is_stashed_pre_resolved() {
        let table = ClientPromiseTable::new();
        table.resolve(9, Response::ok(2, Payload::new()));
        let rx = table.register(9);
        let response = rx.await.unwrap();
        assert_eq!(response.request_id(), 2);
    }

    #[tokio::test]
    async fn cancel_all_fails_every_pending_promise() {
        let table = ClientPromiseTable::new();
        let rx_a = table.register(1);
        let rx_b = table.register(2);
        table.cancel_all(|| Response::from_error(0, &wattson_core::error::WattsonError::transport("shutdown")));
        assert!(matches!(rx_a.await.unwrap(), Response::Err { .. }));
        assert!(matches!(rx_b.await.unwrap(), Response::Err { .. }));
        assert_eq!(table.pending_count(), 0);
    }
}
