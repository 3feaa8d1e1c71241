//! The network simulator (spec §4.6): owns the topology graph (§3.4) and a
//! process-local link-property engine.
//!
//! Grounded in `network_emulator.py`'s `WattsonNetworkQueryType` dispatch
//! table: this module keeps the same query vocabulary (`ADD_NODE`,
//! `CONNECT_NODES`, `SET_LINK_PROPERTY`, `NODE_ACTION`, `SERVICE_ACTION`,
//! ...) and the same "structural change → `TOPOLOGY_CHANGED`,
//! link-model change → `LINK_PROPERTY_CHANGED`" notification split.

pub mod timed_cache;
pub mod topology;

use std::sync::OnceLock;
use std::time::Duration;

use serde_json::json;
use wattson_core::error::{ErrorCode, WattsonError};
use wattson_core::message::{Payload, Request};
use wattson_core::model::topology::{Link, LinkModel, Node, NodeKind};
use wattson_core::notification::topic;
use wattson_core::router::{Handler, HandlerOutcome};
use wattson_core::simulator::{Simulator, SimulatorContext};

use crate::util::{field, field_i64, field_str, group_snapshot, optional_bool, optional_f64, optional_str};
use timed_cache::TimedCache;
use topology::Topology;

const CLAIMED: &[&str] = &[
    "GET_NODES",
    "ADD_NODE",
    "REMOVE_NODE",
    "GET_NODE",
    "NODE_ACTION",
    "UPDATE_NODE_CONFIGURATION",
    "CREATE_INTERFACE",
    "REMOVE_INTERFACE",
    "SET_INTERFACE_IP",
    "SET_INTERFACE_UP",
    "SET_INTERFACE_DOWN",
    "GET_INTERFACE",
    "CONNECT_NODES",
    "GET_LINKS",
    "GET_LINK_STATE",
    "SET_LINK_PROPERTY",
    "SET_LINK_UP",
    "SET_LINK_DOWN",
    "REMOVE_LINK",
    "GET_SERVICE",
    "GET_SERVICES",
    "ADD_SERVICE",
    "SERVICE_ACTION",
];

const NODES_CACHE_TTL: Duration = Duration::from_millis(200);
const LINKS_CACHE_TTL: Duration = Duration::from_millis(200);

/// The network simulator: topology mutation, queries, and the
/// `GET_NODES`/`GET_LINKS` group-promise snapshot path.
pub struct NetworkSimulator {
    topology: Topology,
    nodes_cache: TimedCache<Vec<Node>>,
    links_cache: TimedCache<Vec<Link>>,
    ctx: OnceLock<SimulatorContext>,
}

impl std::fmt::Debug for NetworkSimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSimulator").finish_non_exhaustive()
    }
}

impl Default for NetworkSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSimulator {
    pub fn new() -> Self {
        Self {
            topology: Topology::new(),
            nodes_cache: TimedCache::new(NODES_CACHE_TTL),
            links_cache: TimedCache::new(LINKS_CACHE_TTL),
            ctx: OnceLock::new(),
        }
    }

    fn ctx(&self) -> Option<&SimulatorContext> {
        self.ctx.get()
    }

    fn now_ms(&self) -> i64 {
        self.ctx().map(|ctx| ctx.now_ms()).unwrap_or(0)
    }

    fn topology_changed(&self, entity_id: &str, change: &str) {
        if let Some(ctx) = self.ctx() {
            self.nodes_cache.set_outdated();
            self.links_cache.set_outdated();
            ctx.bus.broadcast(
                topic::TOPOLOGY_CHANGED,
                self.now_ms(),
                Payload::from_iter([
                    ("entity_id".to_string(), json!(entity_id)),
                    ("change".to_string(), json!(change)),
                ]),
            );
        }
    }

    fn link_property_changed(&self, link: &Link) {
        if let Some(ctx) = self.ctx() {
            ctx.bus.broadcast(topic::LINK_PROPERTY_CHANGED, self.now_ms(), Payload::from_iter([("link".to_string(), json!(link))]));
        }
    }

    fn node_event(&self, node: &Node) {
        if let Some(ctx) = self.ctx() {
            ctx.bus.broadcast(
                topic::NODE_EVENT,
                self.now_ms(),
                Payload::from_iter([("entity_id".to_string(), json!(node.entity_id)), ("started".to_string(), json!(node.started))]),
            );
        }
    }

    fn service_event(&self, service: &wattson_core::model::topology::Service) {
        if let Some(ctx) = self.ctx() {
            ctx.bus.broadcast(topic::SERVICE_EVENT, self.now_ms(), Payload::from_iter([("service".to_string(), json!(service))]));
        }
    }

    fn handle_get_nodes(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let Some(ctx) = self.ctx() else {
            let nodes = self.nodes_cache.get_or_refresh(|| self.topology.nodes());
            return Ok(HandlerOutcome::payload(Payload::from_iter([("nodes".to_string(), json!(nodes))])));
        };
        let client_id = request.client_id.clone().unwrap_or_default();
        let payload = group_snapshot(ctx, "network_nodes_snapshot", &client_id, request.id, || {
            let nodes = self.nodes_cache.get_or_refresh(|| self.topology.nodes());
            Payload::from_iter([("nodes".to_string(), json!(nodes))])
        });
        Ok(HandlerOutcome::payload(payload))
    }

    fn handle_get_links(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let Some(ctx) = self.ctx() else {
            let links = self.links_cache.get_or_refresh(|| self.topology.links());
            return Ok(HandlerOutcome::payload(Payload::from_iter([("links".to_string(), json!(links))])));
        };
        let client_id = request.client_id.clone().unwrap_or_default();
        let payload = group_snapshot(ctx, "network_links_snapshot", &client_id, request.id, || {
            let links = self.links_cache.get_or_refresh(|| self.topology.links());
            Payload::from_iter([("links".to_string(), json!(links))])
        });
        Ok(HandlerOutcome::payload(payload))
    }

    fn handle_add_node(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?;
        let kind_value = field(&request.payload, "kind")?.clone();
        let kind: NodeKind = serde_json::from_value(kind_value)
            .map_err(|err| WattsonError::invalid(format!("invalid 'kind': {err}")))?;
        let node = self.topology.add_node(entity_id, kind)?;
        self.topology_changed(entity_id, "add_node");
        Ok(HandlerOutcome::payload(Payload::from_iter([("node".to_string(), json!(node))])))
    }

    fn handle_remove_node(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?.to_string();
        let (node, orphaned_links) = self.topology.remove_node(&entity_id)?;
        self.topology_changed(&entity_id, "remove_node");
        for link_id in &orphaned_links {
            self.topology_changed(link_id, "remove_link");
        }
        Ok(HandlerOutcome::payload(Payload::from_iter([("node".to_string(), json!(node))])))
    }

    fn handle_get_node(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?;
        let node = self.topology.get_node(entity_id)?;
        Ok(HandlerOutcome::payload(Payload::from_iter([("node".to_string(), json!(node))])))
    }

    fn handle_node_action(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let node_id = field_str(&request.payload, "node_id")?;
        let action = field_str(&request.payload, "action")?;
        let start = match action {
            "start" => true,
            "stop" => false,
            other => return Err(WattsonError::invalid(format!("unknown node action '{other}'"))),
        };
        let node = self.topology.node_action(node_id, start)?;
        self.node_event(&node);
        Ok(HandlerOutcome::payload(Payload::from_iter([("node".to_string(), json!(node))])))
    }

    fn handle_update_node_configuration(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let node_id = field_str(&request.payload, "node_id")?;
        let config = field(&request.payload, "config")?
            .as_object()
            .ok_or_else(|| WattsonError::invalid("field 'config' must be an object"))?
            .clone();
        let mut node = self.topology.get_node(node_id)?;
        for (key, value) in config {
            node.config.insert(key, value);
        }
        self.topology_changed(node_id, "update_node_configuration");
        Ok(HandlerOutcome::payload(Payload::from_iter([("node".to_string(), json!(node))])))
    }

    fn handle_create_interface(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let node_id = field_str(&request.payload, "node_id")?;
        let ip = optional_str(&request.payload, "ip").map(str::to_string);
        let prefix_len = request.payload.get("prefix_len").and_then(|v| v.as_u64()).map(|v| v as u8);
        let is_management = optional_bool(&request.payload, "is_management").unwrap_or(false);
        let interface = self.topology.create_interface(node_id, ip, prefix_len, is_management)?;
        self.topology_changed(&interface.entity_id, "create_interface");
        Ok(HandlerOutcome::payload(Payload::from_iter([("interface".to_string(), json!(interface))])))
    }

    fn handle_remove_interface(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?.to_string();
        let interface = self.topology.remove_interface(&entity_id)?;
        self.topology_changed(&entity_id, "remove_interface");
        Ok(HandlerOutcome::payload(Payload::from_iter([("interface".to_string(), json!(interface))])))
    }

    fn handle_set_interface_ip(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?;
        let ip = optional_str(&request.payload, "ip").map(str::to_string);
        let prefix_len = request.payload.get("prefix_len").and_then(|v| v.as_u64()).map(|v| v as u8);
        let interface = self.topology.set_interface_ip(entity_id, ip, prefix_len)?;
        self.topology_changed(entity_id, "set_interface_ip");
        Ok(HandlerOutcome::payload(Payload::from_iter([("interface".to_string(), json!(interface))])))
    }

    fn handle_get_interface(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?;
        let interface = self.topology.get_interface(entity_id)?;
        Ok(HandlerOutcome::payload(Payload::from_iter([("interface".to_string(), json!(interface))])))
    }

    fn handle_set_interface_state(&self, request: &Request, up: bool) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?;
        let interface = self.topology.set_interface_state(entity_id, up)?;
        self.topology_changed(entity_id, if up { "interface_up" } else { "interface_down" });
        Ok(HandlerOutcome::payload(Payload::from_iter([("interface".to_string(), json!(interface))])))
    }

    fn handle_connect_nodes(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let interface_a_id = field_str(&request.payload, "interface_a_id")?;
        let interface_b_id = field_str(&request.payload, "interface_b_id")?;
        let link = self.topology.connect_nodes(interface_a_id, interface_b_id)?;
        self.topology_changed(&link.entity_id, "connect_nodes");
        Ok(HandlerOutcome::payload(Payload::from_iter([("link".to_string(), json!(link))])))
    }

    fn handle_remove_link(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?.to_string();
        let link = self.topology.remove_link(&entity_id)?;
        self.topology_changed(&entity_id, "remove_link");
        Ok(HandlerOutcome::payload(Payload::from_iter([("link".to_string(), json!(link))])))
    }

    fn handle_get_link_state(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?;
        let link = self.topology.get_link(entity_id)?;
        Ok(HandlerOutcome::payload(Payload::from_iter([("link".to_string(), json!(link))])))
    }

    fn handle_set_link_property(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?;
        let model = LinkModel {
            bandwidth_mbps: optional_f64(&request.payload, "bandwidth_mbps"),
            delay_ms: optional_f64(&request.payload, "delay_ms"),
            jitter_ms: optional_f64(&request.payload, "jitter_ms"),
            packet_loss_pct: optional_f64(&request.payload, "packet_loss_pct"),
        };
        let link = self.topology.set_link_property(entity_id, model)?;
        self.link_property_changed(&link);
        Ok(HandlerOutcome::payload(Payload::from_iter([("link".to_string(), json!(link))])))
    }

    fn handle_set_link_state(&self, request: &Request, up: bool) -> Result<HandlerOutcome, WattsonError> {
        let entity_id = field_str(&request.payload, "entity_id")?;
        let link = self.topology.set_link_state(entity_id, up)?;
        self.topology_changed(entity_id, if up { "link_up" } else { "link_down" });
        Ok(HandlerOutcome::payload(Payload::from_iter([("link".to_string(), json!(link))])))
    }

    fn handle_add_service(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let node_id = field_str(&request.payload, "node_id")?;
        let name = field_str(&request.payload, "name")?;
        let command: Vec<String> = request
            .payload
            .get("command")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let priority = request.payload.get("priority").and_then(|v| v.as_i64()).unwrap_or(0);
        let service = self.topology.add_service(node_id, name, command, priority)?;
        self.service_event(&service);
        Ok(HandlerOutcome::payload(Payload::from_iter([("service".to_string(), json!(service))])))
    }

    fn handle_get_service(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let id = field_i64(&request.payload, "id")?;
        let service = self.topology.get_service(id)?;
        Ok(HandlerOutcome::payload(Payload::from_iter([("service".to_string(), json!(service))])))
    }

    fn handle_get_services(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let node_id = optional_str(&request.payload, "node_id");
        let services = self.topology.services(node_id);
        Ok(HandlerOutcome::payload(Payload::from_iter([("services".to_string(), json!(services))])))
    }

    fn handle_service_action(&self, request: &Request) -> Result<HandlerOutcome, WattsonError> {
        let id = field_i64(&request.payload, "id")?;
        let action = field_str(&request.payload, "action")?;
        let service = self.topology.service_action(id, action)?;
        self.service_event(&service);
        Ok(HandlerOutcome::payload(Payload::from_iter([("service".to_string(), json!(service))])))
    }
}

impl Handler for NetworkSimulator {
    fn name(&self) -> &str {
        "network"
    }

    fn claims(&self, query_type: &str) -> bool {
        CLAIMED.contains(&query_type)
    }

    fn handle(&self, request: &Request) -> Result<Option<HandlerOutcome>, WattsonError> {
        let outcome = match request.query_type.as_str() {
            "GET_NODES" => self.handle_get_nodes(request)?,
            "ADD_NODE" => self.handle_add_node(request)?,
            "REMOVE_NODE" => self.handle_remove_node(request)?,
            "GET_NODE" => self.handle_get_node(request)?,
            "NODE_ACTION" => self.handle_node_action(request)?,
            "UPDATE_NODE_CONFIGURATION" => self.handle_update_node_configuration(request)?,
            "CREATE_INTERFACE" => self.handle_create_interface(request)?,
            "REMOVE_INTERFACE" => self.handle_remove_interface(request)?,
            "SET_INTERFACE_IP" => self.handle_set_interface_ip(request)?,
            "SET_INTERFACE_UP" => self.handle_set_interface_state(request, true)?,
            "SET_INTERFACE_DOWN" => self.handle_set_interface_state(request, false)?,
            "GET_INTERFACE" => self.handle_get_interface(request)?,
            "CONNECT_NODES" => self.handle_connect_nodes(request)?,
            "GET_LINKS" => self.handle_get_links(request)?,
            "GET_LINK_STATE" => self.handle_get_link_state(request)?,
            "SET_LINK_PROPERTY" => self.handle_set_link_property(request)?,
            "SET_LINK_UP" => self.handle_set_link_state(request, true)?,
            "SET_LINK_DOWN" => self.handle_set_link_state(request, false)?,
            "REMOVE_LINK" => self.handle_remove_link(request)?,
            "GET_SERVICE" => self.handle_get_service(request)?,
            "GET_SERVICES" => self.handle_get_services(request)?,
            "ADD_SERVICE" => self.handle_add_service(request)?,
            "SERVICE_ACTION" => self.handle_service_action(request)?,
            other => {
                return Err(WattsonError::new(
                    ErrorCode::Unhandled,
                    format!("network simulator does not recognize query type '{other}'"),
                ))
            }
        };
        Ok(Some(outcome))
    }
}

impl Simulator for NetworkSimulator {
    fn wire(&self, ctx: SimulatorContext) {
        let _ = self.ctx.set(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make() -> NetworkSimulator {
        NetworkSimulator::new()
    }

    fn request(query_type: &str, fields: &[(&str, serde_json::Value)]) -> Request {
        let mut req = Request::new(1, query_type);
        for (key, value) in fields {
            req.payload.insert(key.to_string(), value.clone());
        }
        req
    }

    #[test]
    fn add_node_then_get_nodes_without_wiring_falls_back_to_direct_cache() {
        let sim = make();
        sim.handle(&request("ADD_NODE", &[("entity_id", json!("s1")), ("kind", json!("switch"))])).unwrap();
        let outcome = sim.handle(&request("GET_NODES", &[])).unwrap().unwrap();
        let nodes = outcome.payload.get("nodes").unwrap().as_array().unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn connect_nodes_end_to_end_through_the_handler() {
        let sim = make();
        sim.handle(&request("ADD_NODE", &[("entity_id", json!("s1")), ("kind", json!("switch"))])).unwrap();
        sim.handle(&request("ADD_NODE", &[("entity_id", json!("s2")), ("kind", json!("switch"))])).unwrap();
        let if_a = sim
            .handle(&request("CREATE_INTERFACE", &[("node_id", json!("s1"))]))
            .unwrap()
            .unwrap();
        let if_b = sim
            .handle(&request("CREATE_INTERFACE", &[("node_id", json!("s2"))]))
            .unwrap()
            .unwrap();
        let if_a_id = if_a.payload.get("interface").unwrap().get("entity_id").unwrap().as_str().unwrap().to_string();
        let if_b_id = if_b.payload.get("interface").unwrap().get("entity_id").unwrap().as_str().unwrap().to_string();

        let link = sim
            .handle(&request("CONNECT_NODES", &[("interface_a_id", json!(if_a_id)), ("interface_b_id", json!(if_b_id))]))
            .unwrap()
            .unwrap();
        assert!(link.payload.get("link").unwrap().get("entity_id").is_some());

        let links = sim.handle(&request("GET_LINKS", &[])).unwrap().unwrap();
        assert_eq!(links.payload.get("links").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn invalid_kind_is_rejected() {
        let sim = make();
        let err = sim
            .handle(&request("ADD_NODE", &[("entity_id", json!("s1")), ("kind", json!("not-a-kind"))]))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Invalid);
    }

    #[test]
    fn unknown_query_type_is_unhandled() {
        let sim = make();
        let err = sim.handle(&request("NONSENSE", &[])).unwrap_err();
        assert_eq!(err.code, ErrorCode::Unhandled);
    }
}
