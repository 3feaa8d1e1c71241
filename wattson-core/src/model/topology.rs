//! Network topology types (spec §3.4).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// The kind of a network node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Host,
    Switch,
    Router,
    DockerHost,
    Nat,
}

/// A network node: a host, switch, router, or similar entity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub entity_id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub services: BTreeMap<i64, Service>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub started: bool,
}

impl Node {
    pub fn new(entity_id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            roles: BTreeSet::new(),
            interfaces: Vec::new(),
            services: BTreeMap::new(),
            config: BTreeMap::new(),
            started: false,
        }
    }
}

/// A network interface attached to exactly one node, and optionally joined
/// to a link.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Interface {
    pub entity_id: String,
    pub node_id: String,
    #[serde(default)]
    pub link_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub prefix_len: Option<u8>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub is_management: bool,
    #[serde(default = "default_true")]
    pub up: bool,
}

fn default_true() -> bool {
    true
}

impl Interface {
    pub fn new(entity_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            node_id: node_id.into(),
            link_id: None,
            ip: None,
            prefix_len: None,
            mac: None,
            is_management: false,
            up: true,
        }
    }
}

/// A link between exactly two interfaces, carrying a [`LinkModel`]
/// (bandwidth/delay/jitter/loss).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Link {
    pub entity_id: String,
    pub interface_a_id: String,
    pub interface_b_id: String,
    #[serde(default)]
    pub model: LinkModel,
    #[serde(default = "default_true")]
    pub up: bool,
}

impl Link {
    pub fn new(
        entity_id: impl Into<String>,
        interface_a_id: impl Into<String>,
        interface_b_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            interface_a_id: interface_a_id.into(),
            interface_b_id: interface_b_id.into(),
            model: LinkModel::default(),
            up: true,
        }
    }
}

/// Network-emulation parameters for a [`Link`]. Setting any field fires a
/// `LINK_PROPERTY_CHANGED` notification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkModel {
    #[serde(default)]
    pub bandwidth_mbps: Option<f64>,
    #[serde(default)]
    pub delay_ms: Option<f64>,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub packet_loss_pct: Option<f64>,
}

/// A process running on behalf of a [`Node`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub node_id: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub killed: bool,
    #[serde(default)]
    pub pid: Option<u32>,
}

impl Service {
    pub fn new(id: i64, name: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            node_id: node_id.into(),
            command: Vec::new(),
            priority: 0,
            running: false,
            killed: false,
            pid: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_model_round_trips_through_json() {
        let model = LinkModel {
            bandwidth_mbps: Some(100.0),
            delay_ms: Some(5.0),
            jitter_ms: None,
            packet_loss_pct: Some(0.1),
        };
        let wire = serde_json::to_string(&model).unwrap();
        let back: LinkModel = serde_json::from_str(&wire).unwrap();
        assert_eq!(model, back);
    }
}
