//! The client side of C1: raw connections to the query and publish
//! endpoints.
//!
//! This module only wires up the sockets and the request/reply framing;
//! it has no notion of promises, registration, or named events. Those live
//! one layer up, in `wattson-client`, which is built on top of
//! [`QueryConnection`]/[`PublishConnection`] the same way the original
//! `wattson_client.py` layered connection management underneath its
//! higher-level query/event API.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use super::codec::{CodecError, JsonFrameCodec};
use crate::error::WattsonError;
use crate::message::{MultiRequest, MultiResponse, Notification, QueryFrame, ReplyFrame, Request, Response};

/// A connection to the query endpoint: one request in flight at a time,
/// responses arrive in the order requests were sent (spec §5).
pub struct QueryConnection {
    framed: Framed<TcpStream, JsonFrameCodec<ReplyFrame, QueryFrame>>,
}

impl std::fmt::Debug for QueryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryConnection").finish_non_exhaustive()
    }
}

impl QueryConnection {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(socket, JsonFrameCodec::default()),
        })
    }

    /// Sends a single request and awaits its matching reply. A
    /// `TRANSPORT_ERROR` is raised if the socket closes, or if the server
    /// replies with the wrong frame shape.
    pub async fn send(&mut self, request: Request) -> Result<Response, WattsonError> {
        self.framed
            .send(QueryFrame::Single(request))
            .await
            .map_err(transport_err)?;
        match self.framed.next().await {
            Some(Ok(ReplyFrame::Single(response))) => Ok(response),
            Some(Ok(ReplyFrame::Multi(_))) => Err(WattsonError::transport("server replied with a multi-response to a single request")),
            Some(Err(err)) => Err(transport_err(err)),
            None => Err(WattsonError::transport("query connection closed before a reply arrived")),
        }
    }

    /// Sends a batch request and awaits the matching batch reply.
    pub async fn send_multi(&mut self, requests: Vec<Request>, id: u64) -> Result<MultiResponse, WattsonError> {
        self.framed
            .send(QueryFrame::Multi(MultiRequest { id, requests }))
            .await
            .map_err(transport_err)?;
        match self.framed.next().await {
            Some(Ok(ReplyFrame::Multi(response))) => Ok(response),
            Some(Ok(ReplyFrame::Single(_))) => Err(WattsonError::transport("server replied with a single response to a multi request")),
            Some(Err(err)) => Err(transport_err(err)),
            None => Err(WattsonError::transport("query connection closed before a reply arrived")),
        }
    }
}

fn transport_err(err: CodecError) -> WattsonError {
    WattsonError::transport(err.to_string())
}

/// A connection to the publish endpoint: receive-only.
pub struct PublishConnection {
    framed: Framed<TcpStream, JsonFrameCodec<Notification, ()>>,
}

impl std::fmt::Debug for PublishConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishConnection").finish_non_exhaustive()
    }
}

impl PublishConnection {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        Ok(Self {
            framed: Framed::new(socket, JsonFrameCodec::default()),
        })
    }

    /// Awaits the next notification. Returns `None` once the server closes
    /// the publish socket.
    pub async fn recv(&mut self) -> Option<Result<Notification, WattsonError>> {
        self.framed.next().await.map(|result| result.map_err(transport_err))
    }
}
