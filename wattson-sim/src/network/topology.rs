//! The network simulator's authoritative topology store (spec §3.4).
//!
//! Grounded in `network_emulator.py`'s internal `_nodes`/`_links`/`_interfaces`
//! maps and the mutation methods behind its `WattsonNetworkQueryType` dispatch
//! table (`add_node`, `connect_nodes`, `remove_link`, `set_link_property`,
//! `node_action`, `service_action`, ...). This module only owns the data and
//! its invariants (§3.4 a-d); notification emission and query parsing live in
//! [`super::NetworkSimulator`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use wattson_core::error::{Result, WattsonError};
use wattson_core::model::topology::{Interface, Link, LinkModel, Node, NodeKind, Service};

/// The mutable graph of nodes, interfaces, links and services.
///
/// Every map is keyed by `entity_id` (or, for services, the numeric id the
/// store assigns) so that cross-references (`Interface::node_id`,
/// `Link::interface_a_id`, ...) are plain string/integer lookups rather than
/// pointers, matching spec §3.6's "lookup by id in the owning table".
#[derive(Debug, Default)]
pub struct Topology {
    nodes: DashMap<String, Node>,
    interfaces: DashMap<String, Interface>,
    links: DashMap<String, Link>,
    services: DashMap<i64, Service>,
    next_interface_id: AtomicU64,
    next_link_id: AtomicU64,
    next_service_id: AtomicI64,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, entity_id: &str, kind: NodeKind) -> Result<Node> {
        if self.entity_exists(entity_id) {
            return Err(WattsonError::invalid(format!("entity id '{entity_id}' already exists")));
        }
        let node = Node::new(entity_id, kind);
        self.nodes.insert(entity_id.to_string(), node.clone());
        Ok(node)
    }

    /// Removes a node along with its interfaces, unlinking (not removing)
    /// any link that referenced one of them so `Link` invariant (b) is
    /// preserved by the caller being told which links now dangle.
    pub fn remove_node(&self, entity_id: &str) -> Result<(Node, Vec<String>)> {
        let (_, node) = self
            .nodes
            .remove(entity_id)
            .ok_or_else(|| WattsonError::invalid(format!("no node '{entity_id}'")))?;
        let mut orphaned_links = Vec::new();
        for interface_id in &node.interfaces {
            if let Some((_, interface)) = self.interfaces.remove(interface_id) {
                if let Some(link_id) = interface.link_id {
                    self.links.remove(&link_id);
                    orphaned_links.push(link_id);
                }
            }
        }
        Ok((node, orphaned_links))
    }

    pub fn get_node(&self, entity_id: &str) -> Result<Node> {
        self.nodes
            .get(entity_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| WattsonError::invalid(format!("no node '{entity_id}'")))
    }

    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|e| e.clone()).collect();
        nodes.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        nodes
    }

    pub fn node_action(&self, node_id: &str, start: bool) -> Result<Node> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| WattsonError::invalid(format!("no node '{node_id}'")))?;
        node.started = start;
        Ok(node.clone())
    }

    pub fn create_interface(
        &self,
        node_id: &str,
        ip: Option<String>,
        prefix_len: Option<u8>,
        is_management: bool,
    ) -> Result<Interface> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| WattsonError::invalid(format!("no node '{node_id}'")))?;
        let n = self.next_interface_id.fetch_add(1, Ordering::Relaxed);
        let entity_id = format!("{node_id}-eth{n}");
        let mut interface = Interface::new(entity_id.clone(), node_id);
        interface.ip = ip;
        interface.prefix_len = prefix_len;
        interface.is_management = is_management;
        self.interfaces.insert(entity_id.clone(), interface.clone());
        node.interfaces.push(entity_id);
        Ok(interface)
    }

    pub fn remove_interface(&self, entity_id: &str) -> Result<Interface> {
        let (_, interface) = self
            .interfaces
            .remove(entity_id)
            .ok_or_else(|| WattsonError::invalid(format!("no interface '{entity_id}'")))?;
        if let Some(mut node) = self.nodes.get_mut(&interface.node_id) {
            node.interfaces.retain(|id| id != entity_id);
        }
        if let Some(link_id) = &interface.link_id {
            self.links.remove(link_id);
        }
        Ok(interface)
    }

    pub fn set_interface_ip(&self, entity_id: &str, ip: Option<String>, prefix_len: Option<u8>) -> Result<Interface> {
        let mut interface = self
            .interfaces
            .get_mut(entity_id)
            .ok_or_else(|| WattsonError::invalid(format!("no interface '{entity_id}'")))?;
        interface.ip = ip;
        interface.prefix_len = prefix_len;
        Ok(interface.clone())
    }

    pub fn set_interface_state(&self, entity_id: &str, up: bool) -> Result<Interface> {
        let mut interface = self
            .interfaces
            .get_mut(entity_id)
            .ok_or_else(|| WattsonError::invalid(format!("no interface '{entity_id}'")))?;
        interface.up = up;
        Ok(interface.clone())
    }

    pub fn get_interface(&self, entity_id: &str) -> Result<Interface> {
        self.interfaces
            .get(entity_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| WattsonError::invalid(format!("no interface '{entity_id}'")))
    }

    /// Connects two existing, not-yet-linked interfaces (spec §3.4 invariant
    /// b: a link references exactly two interfaces).
    pub fn connect_nodes(&self, interface_a_id: &str, interface_b_id: &str) -> Result<Link> {
        if interface_a_id == interface_b_id {
            return Err(WattsonError::invalid("cannot link an interface to itself"));
        }
        {
            let a = self
                .interfaces
                .get(interface_a_id)
                .ok_or_else(|| WattsonError::invalid(format!("no interface '{interface_a_id}'")))?;
            if a.link_id.is_some() {
                return Err(WattsonError::invalid(format!("interface '{interface_a_id}' is already linked")));
            }
        }
        {
            let b = self
                .interfaces
                .get(interface_b_id)
                .ok_or_else(|| WattsonError::invalid(format!("no interface '{interface_b_id}'")))?;
            if b.link_id.is_some() {
                return Err(WattsonError::invalid(format!("interface '{interface_b_id}' is already linked")));
            }
        }

        let n = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let entity_id = format!("link_{n}");
        let link = Link::new(entity_id.clone(), interface_a_id, interface_b_id);
        self.links.insert(entity_id.clone(), link.clone());
        self.interfaces.get_mut(interface_a_id).unwrap().link_id = Some(entity_id.clone());
        self.interfaces.get_mut(interface_b_id).unwrap().link_id = Some(entity_id.clone());
        Ok(link)
    }

    pub fn remove_link(&self, entity_id: &str) -> Result<Link> {
        let (_, link) = self
            .links
            .remove(entity_id)
            .ok_or_else(|| WattsonError::invalid(format!("no link '{entity_id}'")))?;
        if let Some(mut interface) = self.interfaces.get_mut(&link.interface_a_id) {
            interface.link_id = None;
        }
        if let Some(mut interface) = self.interfaces.get_mut(&link.interface_b_id) {
            interface.link_id = None;
        }
        Ok(link)
    }

    pub fn set_link_property(&self, entity_id: &str, model: LinkModel) -> Result<Link> {
        let mut link = self
            .links
            .get_mut(entity_id)
            .ok_or_else(|| WattsonError::invalid(format!("no link '{entity_id}'")))?;
        if model.bandwidth_mbps.is_some() {
            link.model.bandwidth_mbps = model.bandwidth_mbps;
        }
        if model.delay_ms.is_some() {
            link.model.delay_ms = model.delay_ms;
        }
        if model.jitter_ms.is_some() {
            link.model.jitter_ms = model.jitter_ms;
        }
        if model.packet_loss_pct.is_some() {
            link.model.packet_loss_pct = model.packet_loss_pct;
        }
        Ok(link.clone())
    }

    pub fn set_link_state(&self, entity_id: &str, up: bool) -> Result<Link> {
        let mut link = self
            .links
            .get_mut(entity_id)
            .ok_or_else(|| WattsonError::invalid(format!("no link '{entity_id}'")))?;
        link.up = up;
        Ok(link.clone())
    }

    pub fn get_link(&self, entity_id: &str) -> Result<Link> {
        self.links
            .get(entity_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| WattsonError::invalid(format!("no link '{entity_id}'")))
    }

    pub fn links(&self) -> Vec<Link> {
        let mut links: Vec<Link> = self.links.iter().map(|e| e.clone()).collect();
        links.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        links
    }

    pub fn add_service(&self, node_id: &str, name: &str, command: Vec<String>, priority: i64) -> Result<Service> {
        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| WattsonError::invalid(format!("no node '{node_id}'")))?;
        let id = self.next_service_id.fetch_add(1, Ordering::Relaxed);
        let mut service = Service::new(id, name, node_id);
        service.command = command;
        service.priority = priority;
        self.services.insert(id, service.clone());
        node.services.insert(id, service.clone());
        Ok(service)
    }

    pub fn get_service(&self, id: i64) -> Result<Service> {
        self.services
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or_else(|| WattsonError::invalid(format!("no service '{id}'")))
    }

    pub fn services(&self, node_id: Option<&str>) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .iter()
            .map(|e| e.clone())
            .filter(|s| node_id.map(|n| s.node_id == n).unwrap_or(true))
            .collect();
        services.sort_by_key(|s| s.id);
        services
    }

    /// Applies a lifecycle action (`start`, `stop`, `kill`) to a service.
    pub fn service_action(&self, id: i64, action: &str) -> Result<Service> {
        let mut service = self
            .services
            .get_mut(&id)
            .ok_or_else(|| WattsonError::invalid(format!("no service '{id}'")))?;
        match action {
            "start" => {
                service.running = true;
                service.killed = false;
            }
            "stop" => {
                service.running = false;
            }
            "kill" => {
                service.running = false;
                service.killed = true;
            }
            other => return Err(WattsonError::invalid(format!("unknown service action '{other}'"))),
        }
        let updated = service.clone();
        drop(service);
        if let Some(mut node) = self.nodes.get_mut(&updated.node_id) {
            node.services.insert(id, updated.clone());
        }
        Ok(updated)
    }

    fn entity_exists(&self, entity_id: &str) -> bool {
        self.nodes.contains_key(entity_id) || self.interfaces.contains_key(entity_id) || self.links.contains_key(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_nodes_links_two_free_interfaces() {
        let topology = Topology::new();
        topology.add_node("s1", NodeKind::Switch).unwrap();
        topology.add_node("s2", NodeKind::Switch).unwrap();
        let if_a = topology.create_interface("s1", None, None, false).unwrap();
        let if_b = topology.create_interface("s2", None, None, false).unwrap();

        let link = topology.connect_nodes(&if_a.entity_id, &if_b.entity_id).unwrap();
        assert_eq!(topology.get_interface(&if_a.entity_id).unwrap().link_id, Some(link.entity_id.clone()));

        let err = topology.connect_nodes(&if_a.entity_id, &if_b.entity_id).unwrap_err();
        assert_eq!(err.code, wattson_core::error::ErrorCode::Invalid);
    }

    #[test]
    fn removing_a_node_orphans_its_links() {
        let topology = Topology::new();
        topology.add_node("s1", NodeKind::Switch).unwrap();
        topology.add_node("s2", NodeKind::Switch).unwrap();
        let if_a = topology.create_interface("s1", None, None, false).unwrap();
        let if_b = topology.create_interface("s2", None, None, false).unwrap();
        let link = topology.connect_nodes(&if_a.entity_id, &if_b.entity_id).unwrap();

        let (_, orphaned) = topology.remove_node("s1").unwrap();
        assert_eq!(orphaned, vec![link.entity_id.clone()]);
        assert!(topology.get_link(&link.entity_id).is_err());
    }

    #[test]
    fn service_lifecycle_transitions() {
        let topology = Topology::new();
        topology.add_node("host1", NodeKind::Host).unwrap();
        let service = topology.add_service("host1", "scada-server", vec!["run.sh".to_string()], 0).unwrap();
        assert!(!service.running);

        let started = topology.service_action(service.id, "start").unwrap();
        assert!(started.running);
        let killed = topology.service_action(service.id, "kill").unwrap();
        assert!(killed.killed);
        assert!(!killed.running);
    }

    #[test]
    fn set_link_property_only_overwrites_provided_fields() {
        let topology = Topology::new();
        topology.add_node("s1", NodeKind::Switch).unwrap();
        topology.add_node("s2", NodeKind::Switch).unwrap();
        let if_a = topology.create_interface("s1", None, None, false).unwrap();
        let if_b = topology.create_interface("s2", None, None, false).unwrap();
        let link = topology.connect_nodes(&if_a.entity_id, &if_b.entity_id).unwrap();

        topology
            .set_link_property(&link.entity_id, LinkModel { bandwidth_mbps: Some(100.0), ..Default::default() })
            .unwrap();
        let updated = topology
            .set_link_property(&link.entity_id, LinkModel { delay_ms: Some(5.0), ..Default::default() })
            .unwrap();
        assert_eq!(updated.model.bandwidth_mbps, Some(100.0));
        assert_eq!(updated.model.delay_ms, Some(5.0));
    }
}
