//! The wire-level message model (spec §3.1, §6.2).
//!
//! Every request, response and notification that crosses a socket is one of
//! the types in this module. Payloads are deliberately "stringly typed" maps
//! rather than a closed enum of payload shapes: the query/notification
//! surface is meant to grow without revving the wire format, mirroring the
//! self-describing dict payloads the original control plane passed around.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A self-describing bag of fields. Handlers pull out what they need with
/// [`Payload::get`]/[`Payload::get_str`] and return the same shape back.
pub type Payload = BTreeMap<String, Value>;

/// A request issued by a client over the query transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Monotonically increasing per-connection id, echoed back on the
    /// matching [`Response`] so a client can correlate replies arriving out
    /// of order.
    pub id: u64,
    /// The dispatch key a [`crate::router::Router`] matches handlers against,
    /// e.g. `"GET_TIME"`, `"SET_EVENT"`, `"GET_NODES"`.
    pub query_type: String,
    /// The identity of the connection this request originated on, filled in
    /// by the server on receipt (not sent by the client).
    #[serde(default)]
    pub client_id: Option<String>,
    /// How many handlers have already produced a response for this request.
    /// The router increments this as it walks the chain; a handler never
    /// sets it itself.
    #[serde(default)]
    pub handled_count: u32,
    /// When `true`, the router keeps walking the handler chain after the
    /// first claim instead of stopping at the first responder (spec §3.1:
    /// "at most one handler marks it unless `allow_multi_handling`").
    #[serde(default)]
    pub allow_multi_handling: bool,
    /// The query-specific payload.
    #[serde(default)]
    pub payload: Payload,
}

impl Request {
    /// Builds a request with an empty payload.
    pub fn new(id: u64, query_type: impl Into<String>) -> Self {
        Self {
            id,
            query_type: query_type.into(),
            client_id: None,
            handled_count: 0,
            allow_multi_handling: false,
            payload: Payload::new(),
        }
    }

    /// Builds a request carrying the given payload.
    pub fn with_payload(id: u64, query_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id,
            query_type: query_type.into(),
            client_id: None,
            handled_count: 0,
            allow_multi_handling: false,
            payload,
        }
    }
}

/// A batch of requests sent as one frame (spec §3.1, `MULTI_QUERY`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiRequest {
    pub id: u64,
    pub requests: Vec<Request>,
}

/// The outcome of handling a single [`Request`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// The query was handled synchronously; `payload` carries the result.
    Ok { id: u64, payload: Payload },
    /// The query could not be completed; `error` is a human-readable message
    /// and `code` the coarse [`crate::error::ErrorCode`] it maps from.
    Err {
        id: u64,
        code: crate::error::ErrorCode,
        error: String,
    },
    /// The query was accepted but will resolve later; see [`PromiseResponse`].
    Promise(PromiseResponse),
}

impl Response {
    /// Builds a successful response.
    pub fn ok(id: u64, payload: Payload) -> Self {
        Response::Ok { id, payload }
    }

    /// Builds a response from a [`crate::error::WattsonError`].
    pub fn from_error(id: u64, err: &crate::error::WattsonError) -> Self {
        Response::Err {
            id,
            code: err.code,
            error: err.message.clone(),
        }
    }

    /// The request id this response answers, regardless of variant.
    pub fn request_id(&self) -> u64 {
        match self {
            Response::Ok { id, .. } => *id,
            Response::Err { id, .. } => *id,
            Response::Promise(p) => p.id,
        }
    }
}

/// The reply to a batch [`MultiRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiResponse {
    pub id: u64,
    pub responses: Vec<Response>,
}

/// Sent in place of an immediate [`Response`] when a handler cannot produce
/// an answer synchronously (spec §4.3). The real answer arrives later as a
/// unicast [`Notification`] on the `ASYNC_QUERY_RESOLVE` topic, tagged with
/// the same `reference_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PromiseResponse {
    /// The original request id, so the client's transport layer can still
    /// match this against its pending-request table.
    pub id: u64,
    /// The id the eventual resolution notification will be tagged with.
    pub reference_id: u64,
    /// Which group this promise was folded into, if group-collapsing applied
    /// (spec §4.3, `GroupPromiseResponse`/`WattsonAsyncGroupResponse`).
    #[serde(default)]
    pub group_key: Option<String>,
}

/// A variant of [`PromiseResponse`] describing the state of a group of
/// promises that resolve together (e.g. "step the simulation, then answer
/// everyone who asked a query mid-step").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupPromiseResponse {
    pub group_key: String,
    pub reference_id: u64,
    /// True if this request joined an already-in-flight group rather than
    /// starting a new one.
    pub joined_existing: bool,
}

/// A broadcast (or unicast, for promise resolution) message delivered over
/// the publish transport (spec §4.4, §6.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Notification {
    /// The dispatch tag subscribers filter on, e.g. `"TOPOLOGY_CHANGED"`,
    /// `"GRID_VALUES_UPDATED"`, `"ASYNC_QUERY_RESOLVE"`.
    pub topic: String,
    /// Sequence number, unique and increasing within a topic, used by
    /// [`crate::notification`] history replay and by clients detecting gaps.
    pub sequence: u64,
    /// Simulation-time (or wall-time, for control-plane events) the
    /// notification was raised at, as milliseconds since the co-simulation
    /// epoch.
    pub timestamp_ms: i64,
    /// Which clients should act on this notification. An empty list, or one
    /// containing `"*"`, means everyone (spec §3.1: "empty recipients ≡
    /// `[\"*\"]`"); every other entry is a literal client id.
    #[serde(default)]
    pub recipients: Vec<String>,
    pub payload: Payload,
}

/// The wildcard recipient token meaning "everyone" (spec §3.1).
pub const BROADCAST_RECIPIENT: &str = "*";

impl Notification {
    /// Builds a broadcast notification (delivered to every client).
    pub fn broadcast(topic: impl Into<String>, sequence: u64, timestamp_ms: i64, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            sequence,
            timestamp_ms,
            recipients: Vec::new(),
            payload,
        }
    }

    /// Builds a notification addressed to a single client (promise resolution).
    pub fn unicast(
        topic: impl Into<String>,
        sequence: u64,
        timestamp_ms: i64,
        recipient: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            topic: topic.into(),
            sequence,
            timestamp_ms,
            recipients: vec![recipient.into()],
            payload,
        }
    }

    /// Builds a notification addressed to several named clients.
    pub fn multicast(
        topic: impl Into<String>,
        sequence: u64,
        timestamp_ms: i64,
        recipients: Vec<String>,
        payload: Payload,
    ) -> Self {
        Self {
            topic: topic.into(),
            sequence,
            timestamp_ms,
            recipients,
            payload,
        }
    }

    /// Whether this notification is addressed to everyone.
    pub fn is_broadcast(&self) -> bool {
        self.recipients.is_empty() || self.recipients.iter().any(|r| r == BROADCAST_RECIPIENT)
    }

    /// Whether `client_id` should act on this notification.
    pub fn addressed_to(&self, client_id: &str) -> bool {
        self.is_broadcast() || self.recipients.iter().any(|r| r == client_id)
    }
}

/// What arrives on the query socket: either a single [`Request`] or a
/// [`MultiRequest`] batch (spec §3.1, §4.2 step 1). `serde`'s untagged
/// representation picks the variant whose required fields are all
/// present, so no separate envelope tag is needed on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryFrame {
    Multi(MultiRequest),
    Single(Request),
}

/// What is sent back on the query socket in reply to a [`QueryFrame`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplyFrame {
    Multi(MultiResponse),
    Single(Response),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_request_id_covers_all_variants() {
        let ok = Response::ok(7, Payload::new());
        assert_eq!(ok.request_id(), 7);

        let err = Response::from_error(8, &crate::error::WattsonError::invalid("bad"));
        assert_eq!(err.request_id(), 8);

        let promise = Response::Promise(PromiseResponse {
            id: 9,
            reference_id: 100,
            group_key: None,
        });
        assert_eq!(promise.request_id(), 9);
    }

    #[test]
    fn notification_round_trips_through_json() {
        let mut payload = Payload::new();
        payload.insert("value".into(), serde_json::json!(42));
        let note = Notification::broadcast("WATTSON_TIME", 3, 1_000, payload);

        let wire = serde_json::to_vec(&note).unwrap();
        let back: Notification = serde_json::from_slice(&wire).unwrap();
        assert_eq!(back.topic, "WATTSON_TIME");
        assert_eq!(back.sequence, 3);
        assert!(back.is_broadcast());
    }

    #[test]
    fn addressed_to_respects_wildcard_and_explicit_recipients() {
        let broadcast = Notification::broadcast("EVENTS", 1, 0, Payload::new());
        assert!(broadcast.addressed_to("scada_0"));

        let unicast = Notification::unicast("ASYNC_QUERY_RESOLVE", 2, 0, "scada_0", Payload::new());
        assert!(unicast.addressed_to("scada_0"));
        assert!(!unicast.addressed_to("attacker_1"));
    }

    #[test]
    fn query_frame_distinguishes_single_from_multi_without_a_tag() {
        let single = serde_json::to_string(&Request::new(1, "ECHO")).unwrap();
        let decoded: QueryFrame = serde_json::from_str(&single).unwrap();
        assert!(matches!(decoded, QueryFrame::Single(_)));

        let multi = serde_json::to_string(&MultiRequest {
            id: 1,
            requests: vec![Request::new(1, "ECHO")],
        })
        .unwrap();
        let decoded: QueryFrame = serde_json::from_str(&multi).unwrap();
        assert!(matches!(decoded, QueryFrame::Multi(_)));
    }
}
