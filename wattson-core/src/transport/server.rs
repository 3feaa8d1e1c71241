//! The server side of C1: two TCP endpoints per control-plane instance.
//!
//! Grounded in the teacher's two-endpoint server shape (`server/run.rs`'s
//! `run()`/`run_local()` pair serving one gRPC service over two listeners),
//! adapted from a single multiplexed gRPC service to the plain query/publish
//! socket pair spec §6.1 calls for.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;

use super::codec::JsonFrameCodec;
use crate::message::{Notification, QueryFrame, ReplyFrame};
use crate::router::Router;

/// The query/reply endpoint (spec §4.1): one request in flight per socket,
/// but any number of sockets may be open concurrently, each served by its
/// own task.
pub struct QueryServer {
    router: Arc<Router>,
}

impl std::fmt::Debug for QueryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryServer").finish_non_exhaustive()
    }
}

impl QueryServer {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// Accepts connections on `addr` until `shutdown` reports `true`.
    pub async fn run(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Like [`Self::run`], but over an already-bound listener — lets a
    /// caller bind to port 0 and read back [`TcpListener::local_addr`]
    /// before handing the listener off, which is how tests discover an
    /// ephemeral port.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        tracing::info!(addr = ?listener.local_addr(), "query endpoint listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    tracing::debug!(%peer, "query connection accepted");
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        Self::serve_connection(router, socket).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn serve_connection(router: Arc<Router>, socket: TcpStream) {
        let mut framed = Framed::new(socket, JsonFrameCodec::<QueryFrame, ReplyFrame>::default());
        while let Some(frame) = framed.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(error = %err, "query frame decode failed; closing connection");
                    break;
                }
            };

            let (reply, callbacks) = match frame {
                QueryFrame::Single(request) => {
                    let routed = router.route(&request);
                    (ReplyFrame::Single(routed.response), routed.post_send.into_iter().collect::<Vec<_>>())
                }
                QueryFrame::Multi(multi) => {
                    let (response, callbacks) = router.route_multi(&multi);
                    (ReplyFrame::Multi(response), callbacks)
                }
            };

            if framed.send(reply).await.is_err() {
                tracing::debug!("query connection closed mid-response");
                break;
            }
            for callback in callbacks {
                callback();
            }
        }
    }
}

/// The publish endpoint (spec §4.1, §4.4): one-to-many push. Every
/// connected subscriber receives every notification and self-filters on
/// [`Notification::addressed_to`]; a subscriber whose outgoing queue is
/// full is dropped from (just) that notification rather than stalling the
/// whole fanout.
pub struct PublishServer {
    subscribers: DashMap<u64, mpsc::Sender<Notification>>,
    next_subscriber_id: AtomicU64,
}

impl std::fmt::Debug for PublishServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishServer")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

const SUBSCRIBER_QUEUE_LEN: usize = 1024;

impl Default for PublishServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishServer {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Accepts subscriber connections on `addr` and, concurrently, drains
    /// `notifications` and fans each one out to every connected subscriber.
    pub async fn run(
        self: Arc<Self>,
        addr: SocketAddr,
        notifications: crate::notification::NotificationReceiver,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, notifications, shutdown).await
    }

    /// Like [`Self::run`], but over an already-bound listener (see
    /// [`QueryServer::serve`]).
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut notifications: crate::notification::NotificationReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        tracing::info!(addr = ?listener.local_addr(), "publish endpoint listening");

        let fanout_bus = self.clone();
        let mut fanout_shutdown = shutdown.clone();
        let fanout_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.recv() => {
                        match notification {
                            Some(notification) => fanout_bus.fanout(notification),
                            None => break,
                        }
                    }
                    _ = fanout_shutdown.changed() => {
                        if *fanout_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    tracing::debug!(%peer, "publish subscriber connected");
                    self.add_subscriber(socket);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        fanout_task.abort();
        Ok(())
    }

    fn add_subscriber(self: &Arc<Self>, socket: TcpStream) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Notification>(SUBSCRIBER_QUEUE_LEN);
        self.subscribers.insert(id, tx);

        let bus = self.clone();
        tokio::spawn(async move {
            let mut framed = Framed::new(socket, JsonFrameCodec::<(), Notification>::default());
            while let Some(notification) = rx.recv().await {
                if framed.send(notification).await.is_err() {
                    break;
                }
            }
            bus.subscribers.remove(&id);
        });
    }

    /// Delivers `notification` to every connected subscriber, best-effort.
    fn fanout(&self, notification: Notification) {
        let targets: Vec<(u64, mpsc::Sender<Notification>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, sender) in targets {
            if sender.try_send(notification.clone()).is_err() {
                tracing::debug!(subscriber = id, "subscriber queue full or closed; notification dropped for it");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
