//! Remote proxies for the network simulator (spec §4.6, §4.7).
//!
//! Grounded in `network_emulator.py`'s query vocabulary (mirrored exactly
//! in `wattson_sim::network`) and in the `remote_network_node.py`/
//! `remote_network_link.py`/`remote_network_interface.py` family: each
//! proxy here wraps a [`CachedEntity`] and refreshes it with the matching
//! `GET_*` query, while [`RemoteNetworkEmulator`] subscribes once to
//! `TOPOLOGY_CHANGED`/`LINK_PROPERTY_CHANGED`/`NODE_EVENT`/`SERVICE_EVENT`
//! and invalidates whichever cached proxy the notification names, so the
//! next `get()` anywhere in the process re-fetches instead of serving
//! stale state.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};

use wattson_core::error::Result as WattsonResult;
use wattson_core::message::{Notification, Payload};
use wattson_core::model::topology::{Interface, Link, Node, Service};
use wattson_core::notification::topic;

use crate::client::WattsonClient;
use crate::proxy::CachedEntity;

const ENTITY_TTL: Duration = Duration::from_millis(500);

fn extract<T: serde::de::DeserializeOwned>(payload: &Payload, key: &str) -> WattsonResult<T> {
    let value = payload
        .get(key)
        .ok_or_else(|| wattson_core::error::WattsonError::invalid(format!("response missing '{key}'")))?;
    serde_json::from_value(value.clone()).map_err(|err| wattson_core::error::WattsonError::invalid(format!("malformed '{key}': {err}")))
}

/// A cached view of one [`Node`], with the start/stop/configure actions
/// the original `remote_network_node.py` exposed.
pub struct RemoteNetworkNode {
    client: Arc<WattsonClient>,
    cache: CachedEntity,
}

impl std::fmt::Debug for RemoteNetworkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNetworkNode").field("entity_id", &self.cache.entity_id()).finish()
    }
}

impl RemoteNetworkNode {
    fn new(client: Arc<WattsonClient>, entity_id: impl Into<String>) -> Self {
        Self {
            client,
            cache: CachedEntity::new(entity_id, ENTITY_TTL),
        }
    }

    pub fn entity_id(&self) -> &str {
        self.cache.entity_id()
    }

    /// Returns the cached node, refreshing first if stale, invalidated, or
    /// `force` is set.
    pub async fn get(&self, force: bool) -> WattsonResult<Node> {
        let payload = self
            .cache
            .get(force, || async {
                let mut payload = Payload::new();
                payload.insert("entity_id".to_string(), json!(self.entity_id()));
                let response = self.client.query("GET_NODE", payload).await?;
                WattsonClient::ok_or_err(response)
            })
            .await?;
        extract(&payload, "node")
    }

    pub async fn start(&self) -> WattsonResult<Node> {
        self.node_action("start").await
    }

    pub async fn stop(&self) -> WattsonResult<Node> {
        self.node_action("stop").await
    }

    async fn node_action(&self, action: &str) -> WattsonResult<Node> {
        let mut payload = Payload::new();
        payload.insert("node_id".to_string(), json!(self.entity_id()));
        payload.insert("action".to_string(), json!(action));
        let response = self.client.query("NODE_ACTION", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let node: Node = extract(&payload, "node")?;
        self.cache.apply(payload);
        Ok(node)
    }

    /// Merges `config` into the node's configuration (`UPDATE_NODE_CONFIGURATION`).
    pub async fn update_configuration(&self, config: Payload) -> WattsonResult<Node> {
        let mut payload = Payload::new();
        payload.insert("node_id".to_string(), json!(self.entity_id()));
        payload.insert("config".to_string(), Value::Object(config.into_iter().collect()));
        let response = self.client.query("UPDATE_NODE_CONFIGURATION", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let node: Node = extract(&payload, "node")?;
        self.cache.apply(payload);
        Ok(node)
    }
}

/// A cached view of one [`Link`].
pub struct RemoteNetworkLink {
    client: Arc<WattsonClient>,
    cache: CachedEntity,
}

impl std::fmt::Debug for RemoteNetworkLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNetworkLink").field("entity_id", &self.cache.entity_id()).finish()
    }
}

impl RemoteNetworkLink {
    fn new(client: Arc<WattsonClient>, entity_id: impl Into<String>) -> Self {
        Self {
            client,
            cache: CachedEntity::new(entity_id, ENTITY_TTL),
        }
    }

    pub fn entity_id(&self) -> &str {
        self.cache.entity_id()
    }

    pub async fn get(&self, force: bool) -> WattsonResult<Link> {
        let payload = self
            .cache
            .get(force, || async {
                let mut payload = Payload::new();
                payload.insert("entity_id".to_string(), json!(self.entity_id()));
                let response = self.client.query("GET_LINK_STATE", payload).await?;
                WattsonClient::ok_or_err(response)
            })
            .await?;
        extract(&payload, "link")
    }

    pub async fn up(&self) -> WattsonResult<Link> {
        self.set_state(true).await
    }

    pub async fn down(&self) -> WattsonResult<Link> {
        self.set_state(false).await
    }

    async fn set_state(&self, up: bool) -> WattsonResult<Link> {
        let mut payload = Payload::new();
        payload.insert("entity_id".to_string(), json!(self.entity_id()));
        let query_type = if up { "SET_LINK_UP" } else { "SET_LINK_DOWN" };
        let response = self.client.query(query_type, payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let link: Link = extract(&payload, "link")?;
        self.cache.apply(payload);
        Ok(link)
    }

    /// Updates the `LinkModel` (bandwidth/delay/jitter/loss); unset fields
    /// are cleared, matching `SET_LINK_PROPERTY`'s full-replace semantics.
    pub async fn set_property(
        &self,
        bandwidth_mbps: Option<f64>,
        delay_ms: Option<f64>,
        jitter_ms: Option<f64>,
        packet_loss_pct: Option<f64>,
    ) -> WattsonResult<Link> {
        let mut payload = Payload::new();
        payload.insert("entity_id".to_string(), json!(self.entity_id()));
        if let Some(v) = bandwidth_mbps {
            payload.insert("bandwidth_mbps".to_string(), json!(v));
        }
        if let Some(v) = delay_ms {
            payload.insert("delay_ms".to_string(), json!(v));
        }
        if let Some(v) = jitter_ms {
            payload.insert("jitter_ms".to_string(), json!(v));
        }
        if let Some(v) = packet_loss_pct {
            payload.insert("packet_loss_pct".to_string(), json!(v));
        }
        let response = self.client.query("SET_LINK_PROPERTY", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let link: Link = extract(&payload, "link")?;
        self.cache.apply(payload);
        Ok(link)
    }
}

/// A cached view of one [`Interface`].
pub struct RemoteNetworkInterface {
    client: Arc<WattsonClient>,
    cache: CachedEntity,
}

impl std::fmt::Debug for RemoteNetworkInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNetworkInterface").field("entity_id", &self.cache.entity_id()).finish()
    }
}

impl RemoteNetworkInterface {
    fn new(client: Arc<WattsonClient>, entity_id: impl Into<String>) -> Self {
        Self {
            client,
            cache: CachedEntity::new(entity_id, ENTITY_TTL),
        }
    }

    pub fn entity_id(&self) -> &str {
        self.cache.entity_id()
    }

    pub async fn get(&self, force: bool) -> WattsonResult<Interface> {
        let payload = self
            .cache
            .get(force, || async {
                let mut payload = Payload::new();
                payload.insert("entity_id".to_string(), json!(self.entity_id()));
                let response = self.client.query("GET_INTERFACE", payload).await?;
                WattsonClient::ok_or_err(response)
            })
            .await?;
        extract(&payload, "interface")
    }

    pub async fn set_ip(&self, ip: Option<String>, prefix_len: Option<u8>) -> WattsonResult<Interface> {
        let mut payload = Payload::new();
        payload.insert("entity_id".to_string(), json!(self.entity_id()));
        if let Some(ip) = ip {
            payload.insert("ip".to_string(), json!(ip));
        }
        if let Some(prefix_len) = prefix_len {
            payload.insert("prefix_len".to_string(), json!(prefix_len));
        }
        let response = self.client.query("SET_INTERFACE_IP", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let interface: Interface = extract(&payload, "interface")?;
        self.cache.apply(payload);
        Ok(interface)
    }

    pub async fn up(&self) -> WattsonResult<Interface> {
        self.set_state(true).await
    }

    pub async fn down(&self) -> WattsonResult<Interface> {
        self.set_state(false).await
    }

    async fn set_state(&self, up: bool) -> WattsonResult<Interface> {
        let mut payload = Payload::new();
        payload.insert("entity_id".to_string(), json!(self.entity_id()));
        let query_type = if up { "SET_INTERFACE_UP" } else { "SET_INTERFACE_DOWN" };
        let response = self.client.query(query_type, payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let interface: Interface = extract(&payload, "interface")?;
        self.cache.apply(payload);
        Ok(interface)
    }
}

/// A cached view of one [`Service`], keyed by its numeric id.
pub struct RemoteService {
    client: Arc<WattsonClient>,
    id: i64,
    cache: CachedEntity,
}

impl std::fmt::Debug for RemoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteService").field("id", &self.id).finish()
    }
}

impl RemoteService {
    fn new(client: Arc<WattsonClient>, id: i64) -> Self {
        Self {
            client,
            id,
            cache: CachedEntity::new(id.to_string(), ENTITY_TTL),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub async fn get(&self, force: bool) -> WattsonResult<Service> {
        let payload = self
            .cache
            .get(force, || async {
                let mut payload = Payload::new();
                payload.insert("id".to_string(), json!(self.id));
                let response = self.client.query("GET_SERVICE", payload).await?;
                WattsonClient::ok_or_err(response)
            })
            .await?;
        extract(&payload, "service")
    }

    async fn action(&self, action: &str) -> WattsonResult<Service> {
        let mut payload = Payload::new();
        payload.insert("id".to_string(), json!(self.id));
        payload.insert("action".to_string(), json!(action));
        let response = self.client.query("SERVICE_ACTION", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let service: Service = extract(&payload, "service")?;
        self.cache.apply(payload);
        Ok(service)
    }

    pub async fn start(&self) -> WattsonResult<Service> {
        self.action("start").await
    }

    pub async fn stop(&self) -> WattsonResult<Service> {
        self.action("stop").await
    }

    pub async fn kill(&self) -> WattsonResult<Service> {
        self.action("kill").await
    }
}

struct Inner {
    client: Arc<WattsonClient>,
    nodes: DashMap<String, Arc<RemoteNetworkNode>>,
    links: DashMap<String, Arc<RemoteNetworkLink>>,
    interfaces: DashMap<String, Arc<RemoteNetworkInterface>>,
    services: DashMap<i64, Arc<RemoteService>>,
}

/// The entry point into the network simulator's remote object layer (spec
/// §4.7). Cheaply cloneable; every clone shares the same proxy cache and
/// the same installed notification subscriptions.
#[derive(Clone)]
pub struct RemoteNetworkEmulator(Arc<Inner>);

impl std::fmt::Debug for RemoteNetworkEmulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNetworkEmulator").finish_non_exhaustive()
    }
}

impl RemoteNetworkEmulator {
    pub(crate) fn new(client: Arc<WattsonClient>) -> Self {
        let emulator = Self(Arc::new(Inner {
            client,
            nodes: DashMap::new(),
            links: DashMap::new(),
            interfaces: DashMap::new(),
            services: DashMap::new(),
        }));
        emulator.install_subscriptions();
        emulator
    }

    fn install_subscriptions(&self) {
        let on_topology = self.clone();
        self.0.client.subscribe(topic::TOPOLOGY_CHANGED, move |n| on_topology.on_topology_changed(n));
        let on_link_property = self.clone();
        self.0.client.subscribe(topic::LINK_PROPERTY_CHANGED, move |n| on_link_property.on_link_property_changed(n));
        let on_node_event = self.clone();
        self.0.client.subscribe(topic::NODE_EVENT, move |n| on_node_event.on_node_event(n));
        let on_service_event = self.clone();
        self.0.client.subscribe(topic::SERVICE_EVENT, move |n| on_service_event.on_service_event(n));
    }

    fn on_topology_changed(&self, notification: &Notification) {
        let Some(entity_id) = notification.payload.get("entity_id").and_then(Value::as_str) else {
            return;
        };
        if let Some(node) = self.0.nodes.get(entity_id) {
            node.cache.invalidate();
        }
        if let Some(link) = self.0.links.get(entity_id) {
            link.cache.invalidate();
        }
        if let Some(interface) = self.0.interfaces.get(entity_id) {
            interface.cache.invalidate();
        }
    }

    fn on_link_property_changed(&self, notification: &Notification) {
        let Some(entity_id) = notification.payload.get("link").and_then(|v| v.get("entity_id")).and_then(Value::as_str) else {
            return;
        };
        if let Some(link) = self.0.links.get(entity_id) {
            link.cache.invalidate();
        }
    }

    fn on_node_event(&self, notification: &Notification) {
        let Some(entity_id) = notification.payload.get("entity_id").and_then(Value::as_str) else {
            return;
        };
        if let Some(node) = self.0.nodes.get(entity_id) {
            node.cache.invalidate();
        }
    }

    fn on_service_event(&self, notification: &Notification) {
        let Some(id) = notification.payload.get("service").and_then(|v| v.get("id")).and_then(Value::as_i64) else {
            return;
        };
        if let Some(service) = self.0.services.get(&id) {
            service.cache.invalidate();
        }
    }

    /// Returns the (cached) proxy for `entity_id`, creating it on first use.
    pub fn node(&self, entity_id: impl Into<String>) -> Arc<RemoteNetworkNode> {
        let entity_id = entity_id.into();
        self.0
            .nodes
            .entry(entity_id.clone())
            .or_insert_with(|| Arc::new(RemoteNetworkNode::new(self.0.client.clone(), entity_id)))
            .clone()
    }

    pub fn link(&self, entity_id: impl Into<String>) -> Arc<RemoteNetworkLink> {
        let entity_id = entity_id.into();
        self.0
            .links
            .entry(entity_id.clone())
            .or_insert_with(|| Arc::new(RemoteNetworkLink::new(self.0.client.clone(), entity_id)))
            .clone()
    }

    pub fn interface(&self, entity_id: impl Into<String>) -> Arc<RemoteNetworkInterface> {
        let entity_id = entity_id.into();
        self.0
            .interfaces
            .entry(entity_id.clone())
            .or_insert_with(|| Arc::new(RemoteNetworkInterface::new(self.0.client.clone(), entity_id)))
            .clone()
    }

    pub fn service(&self, id: i64) -> Arc<RemoteService> {
        self.0.services.entry(id).or_insert_with(|| Arc::new(RemoteService::new(self.0.client.clone(), id))).clone()
    }

    /// Fetches every node currently in the topology (`GET_NODES`), warming
    /// this emulator's node cache from the batch response.
    pub async fn nodes(&self) -> WattsonResult<Vec<Node>> {
        let response = self.0.client.query("GET_NODES", Payload::new()).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let nodes: Vec<Node> = extract(&payload, "nodes")?;
        for node in &nodes {
            let proxy = self.node(node.entity_id.clone());
            proxy.cache.apply(Payload::from_iter([("node".to_string(), json!(node))]));
        }
        Ok(nodes)
    }

    /// Fetches every link currently in the topology (`GET_LINKS`), warming
    /// this emulator's link cache from the batch response.
    pub async fn links(&self) -> WattsonResult<Vec<Link>> {
        let response = self.0.client.query("GET_LINKS", Payload::new()).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        let links: Vec<Link> = extract(&payload, "links")?;
        for link in &links {
            let proxy = self.link(link.entity_id.clone());
            proxy.cache.apply(Payload::from_iter([("link".to_string(), json!(link))]));
        }
        Ok(links)
    }

    pub async fn services(&self, node_id: Option<&str>) -> WattsonResult<Vec<Service>> {
        let mut payload = Payload::new();
        if let Some(node_id) = node_id {
            payload.insert("node_id".to_string(), json!(node_id));
        }
        let response = self.0.client.query("GET_SERVICES", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        extract(&payload, "services")
    }

    pub async fn add_node(&self, entity_id: impl Into<String>, kind: wattson_core::model::topology::NodeKind) -> WattsonResult<Node> {
        let entity_id = entity_id.into();
        let mut payload = Payload::new();
        payload.insert("entity_id".to_string(), json!(entity_id));
        payload.insert("kind".to_string(), json!(kind));
        let response = self.0.client.query("ADD_NODE", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        extract(&payload, "node")
    }

    pub async fn remove_node(&self, entity_id: &str) -> WattsonResult<Node> {
        let mut payload = Payload::new();
        payload.insert("entity_id".to_string(), json!(entity_id));
        let response = self.0.client.query("REMOVE_NODE", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        self.0.nodes.remove(entity_id);
        extract(&payload, "node")
    }

    pub async fn create_interface(
        &self,
        node_id: &str,
        ip: Option<String>,
        prefix_len: Option<u8>,
        is_management: bool,
    ) -> WattsonResult<Interface> {
        let mut payload = Payload::new();
        payload.insert("node_id".to_string(), json!(node_id));
        if let Some(ip) = ip {
            payload.insert("ip".to_string(), json!(ip));
        }
        if let Some(prefix_len) = prefix_len {
            payload.insert("prefix_len".to_string(), json!(prefix_len));
        }
        payload.insert("is_management".to_string(), json!(is_management));
        let response = self.0.client.query("CREATE_INTERFACE", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        extract(&payload, "interface")
    }

    pub async fn remove_interface(&self, entity_id: &str) -> WattsonResult<Interface> {
        let mut payload = Payload::new();
        payload.insert("entity_id".to_string(), json!(entity_id));
        let response = self.0.client.query("REMOVE_INTERFACE", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        self.0.interfaces.remove(entity_id);
        extract(&payload, "interface")
    }

    pub async fn connect_nodes(&self, interface_a_id: &str, interface_b_id: &str) -> WattsonResult<Link> {
        let mut payload = Payload::new();
        payload.insert("interface_a_id".to_string(), json!(interface_a_id));
        payload.insert("interface_b_id".to_string(), json!(interface_b_id));
        let response = self.0.client.query("CONNECT_NODES", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        extract(&payload, "link")
    }

    pub async fn remove_link(&self, entity_id: &str) -> WattsonResult<Link> {
        let mut payload = Payload::new();
        payload.insert("entity_id".to_string(), json!(entity_id));
        let response = self.0.client.query("REMOVE_LINK", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        self.0.links.remove(entity_id);
        extract(&payload, "link")
    }

    pub async fn add_service(&self, node_id: &str, name: &str, command: Vec<String>, priority: i64) -> WattsonResult<Service> {
        let mut payload = Payload::new();
        payload.insert("node_id".to_string(), json!(node_id));
        payload.insert("name".to_string(), json!(name));
        payload.insert("command".to_string(), json!(command));
        payload.insert("priority".to_string(), json!(priority));
        let response = self.0.client.query("ADD_SERVICE", payload).await?;
        let payload = WattsonClient::ok_or_err(response)?;
        extract(&payload, "service")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_reports_the_missing_key() {
        let payload = Payload::new();
        let err = extract::<Node>(&payload, "node").unwrap_err();
        assert_eq!(err.code, wattson_core::error::ErrorCode::Invalid);
        assert!(err.message.contains("node"));
    }

    #[test]
    fn extract_decodes_a_well_formed_node() {
        let node = Node::new("s1", wattson_core::model::topology::NodeKind::Switch);
        let payload = Payload::from_iter([("node".to_string(), json!(node))]);
        let decoded: Node = extract(&payload, "node").unwrap();
        assert_eq!(decoded.entity_id, "s1");
    }
}
