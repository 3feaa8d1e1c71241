//! The notification bus itself (spec §4.4, C4).
//!
//! **Overflow policy** (documented per spec.md's open question): every
//! topic shares one bounded channel, so there is no per-topic queue to pop
//! the oldest entry from; a full channel instead drops the incoming
//! notification, *except* for the loss-intolerant topics
//! [`topic::LOSS_INTOLERANT`] (`ASYNC_QUERY_RESOLVE`, `EVENTS`), which get a
//! generously sized capacity and, if that's ever not enough, retry via a
//! spawned task rather than drop, logged at `warn!`.
//!
//! Delivery to sockets is not this module's concern: [`NotificationBus`]
//! only accepts, sequences, historizes and (optionally) exports
//! notifications, then hands them to a subscriber task via an internal
//! mpsc channel. [`crate::transport::server`] is what drains that channel
//! and fans each notification out to connected clients.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use super::export::NotificationExporter;
use super::topic::LOSS_INTOLERANT;
use crate::message::{Notification, Payload};

const PRIORITY_CAPACITY: usize = 4096;
const DEFAULT_HISTORY_LEN: usize = 64;

/// The server-side notification bus: sequencing, bounded delivery queue,
/// per-topic history, and optional export.
#[derive(Debug)]
pub struct NotificationBus {
    tx: mpsc::Sender<Notification>,
    sequences: DashMap<String, AtomicU64>,
    history: DashMap<String, Mutex<VecDeque<Notification>>>,
    history_len: usize,
    history_disabled: DashSet<String>,
    exporter: Option<NotificationExporter>,
}

impl NotificationBus {
    /// Builds a bus and its paired [`NotificationReceiver`]. The channel is
    /// sized generously enough to cover the loss-intolerant topics; for
    /// ordinary topics, hitting the bound means dropping the new
    /// notification rather than blocking the publisher (see
    /// [`NotificationBus::publish`]).
    pub fn new(exporter: Option<NotificationExporter>) -> (Self, NotificationReceiver) {
        let (tx, rx) = mpsc::channel(PRIORITY_CAPACITY);
        let bus = Self {
            tx,
            sequences: DashMap::new(),
            history: DashMap::new(),
            history_len: DEFAULT_HISTORY_LEN,
            history_disabled: DashSet::new(),
            exporter,
        };
        (bus, NotificationReceiver { rx })
    }

    /// Disables history recording for a topic (e.g. high-volume measurement
    /// streams a deployment doesn't want retained in memory).
    pub fn disable_history(&self, topic: impl Into<String>) {
        self.history_disabled.insert(topic.into());
    }

    fn next_sequence(&self, topic: &str) -> u64 {
        self.sequences
            .entry(topic.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    fn record_history(&self, notification: &Notification) {
        if self.history_disabled.contains(&notification.topic) {
            return;
        }
        let mut queue = self
            .history
            .entry(notification.topic.clone())
            .or_insert_with(|| Mutex::new(VecDeque::with_capacity(self.history_len)))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if queue.len() == self.history_len {
            queue.pop_front();
        }
        queue.push_back(notification.clone());
    }

    /// Builds, sequences, historizes, exports and enqueues a broadcast
    /// notification; returns the sequenced notification for the caller's
    /// own bookkeeping (e.g. tests asserting on `sequence`).
    pub fn broadcast(&self, topic: &str, timestamp_ms: i64, payload: Payload) -> Notification {
        let sequence = self.next_sequence(topic);
        let notification = Notification::broadcast(topic, sequence, timestamp_ms, payload);
        self.publish(notification.clone());
        notification
    }

    /// Unicasts a notification to a single client (used for promise
    /// resolution, spec §4.3).
    pub fn unicast(&self, topic: &str, timestamp_ms: i64, recipient: &str, payload: Payload) -> Notification {
        let sequence = self.next_sequence(topic);
        let notification = Notification::unicast(topic, sequence, timestamp_ms, recipient, payload);
        self.publish(notification.clone());
        notification
    }

    /// Multicasts a notification to a specific set of clients.
    pub fn multicast(
        &self,
        topic: &str,
        timestamp_ms: i64,
        recipients: Vec<String>,
        payload: Payload,
    ) -> Notification {
        let sequence = self.next_sequence(topic);
        let notification = Notification::multicast(topic, sequence, timestamp_ms, recipients, payload);
        self.publish(notification.clone());
        notification
    }

    fn publish(&self, notification: Notification) {
        self.record_history(&notification);
        if let Some(exporter) = &self.exporter {
            exporter.append(&notification);
        }

        let is_priority = LOSS_INTOLERANT.contains(&notification.topic.as_str());
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notification)) => {
                if is_priority {
                    tracing::warn!(topic = %notification.topic, "loss-intolerant notification queue is full; this notification may be delayed");
                    // Loss-intolerant topics never drop: block the caller
                    // briefly rather than discard. The bounded capacity is
                    // sized generously (see PRIORITY_CAPACITY) so this path
                    // is only hit under sustained overload.
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(notification).await;
                    });
                } else {
                    tracing::debug!(topic = %notification.topic, "notification queue full; dropping this notification");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("notification bus receiver dropped; notification discarded");
            }
        }
    }

    /// Returns up to the last `limit` notifications published on `topic`,
    /// most-recent last, matching publication order (spec §4.4, §8).
    pub fn history(&self, topic: &str, limit: Option<usize>) -> Vec<Notification> {
        let Some(queue) = self.history.get(topic) else {
            return Vec::new();
        };
        let queue = queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let limit = limit.unwrap_or(queue.len()).min(queue.len());
        queue.iter().rev().take(limit).rev().cloned().collect()
    }
}

/// The subscriber side of a [`NotificationBus`]: drained by the transport
/// layer to fan notifications out to connected clients' publish sockets.
#[derive(Debug)]
pub struct NotificationReceiver {
    rx: mpsc::Receiver<Notification>,
}

impl NotificationReceiver {
    /// Awaits the next notification to deliver. Returns `None` once every
    /// [`NotificationBus`] handle has been dropped.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_is_delivered_and_historized() {
        let (bus, mut rx) = NotificationBus::new(None);
        let sent = bus.broadcast("WATTSON_TIME", 0, Payload::new());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.sequence, sent.sequence);

        let history = bus.history("WATTSON_TIME", None);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn history_respects_bound_and_order() {
        let (bus, _rx) = NotificationBus::new(None);
        for i in 0..(DEFAULT_HISTORY_LEN + 10) {
            bus.broadcast("EVENTS", i as i64, Payload::new());
        }
        let history = bus.history("EVENTS", None);
        assert_eq!(history.len(), DEFAULT_HISTORY_LEN);
        // oldest retained entries are the most recent DEFAULT_HISTORY_LEN
        assert_eq!(history.first().unwrap().timestamp_ms, 10);
        assert_eq!(history.last().unwrap().timestamp_ms, (DEFAULT_HISTORY_LEN + 9) as i64);
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_topic() {
        let (bus, _rx) = NotificationBus::new(None);
        let a = bus.broadcast("EVENTS", 0, Payload::new());
        let b = bus.broadcast("EVENTS", 0, Payload::new());
        let c = bus.broadcast("WATTSON_TIME", 0, Payload::new());
        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(c.sequence, 0);
    }
}
