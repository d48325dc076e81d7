//! Wire types for the panel↔node control channel.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::spec::Spec;

/// Role of a node relative to the network boundary. Iran nodes terminate
/// public traffic and run reverse-tunnel servers; foreign nodes originate
/// the control connections as clients.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Iran,
    Foreign,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Iran => "iran",
            NodeRole::Foreign => "foreign",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "iran" => Some(NodeRole::Iran),
            "foreign" => Some(NodeRole::Foreign),
            _ => None,
        }
    }
}

/// `POST /api/agent/tunnels/apply`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunnelApply {
    pub tunnel_id: String,
    pub core: String,
    #[serde(rename = "type")]
    pub tunnel_type: String,
    pub spec: Spec,
}

/// `POST /api/agent/tunnels/remove`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunnelRemove {
    pub tunnel_id: String,
}

/// Spec shipped with `POST /api/agent/mesh/apply`: the rendered `.conf`
/// plus routes for remote LAN subnets and the IPAM-assigned overlay IP.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MeshSpec {
    pub config: String,
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub overlay_ip: Option<String>,
}

/// `POST /api/agent/mesh/apply`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MeshApply {
    pub mesh_id: String,
    pub spec: MeshSpec,
}

/// `POST /api/agent/mesh/remove`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MeshRemove {
    pub mesh_id: String,
}

/// Uniform node reply; every agent endpoint returns one of these, and the
/// panel folds transport failures into the same shape.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentReply {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl AgentReply {
    pub fn success(message: impl Into<String>) -> Self {
        AgentReply {
            status: "success".into(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        AgentReply {
            status: "error".into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// `GET /api/agent/status`
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentStatus {
    pub status: String,
    pub active_tunnels: usize,
    pub tunnels: Vec<String>,
}

/// Per-tunnel status reported by an adapter.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TunnelStatus {
    pub active: bool,
    #[serde(rename = "type", default)]
    pub core: String,
    #[serde(default)]
    pub config_exists: bool,
    #[serde(default)]
    pub process_running: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub log_tail: Option<String>,
}

/// One peer row parsed from `wg show`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WgPeerStatus {
    pub public_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub allowed_ips: Option<String>,
    #[serde(default)]
    pub last_handshake: Option<String>,
    pub connected: bool,
}

/// `GET /api/agent/mesh/{id}/status`
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct MeshStatus {
    pub active: bool,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub overlay_ip: Option<String>,
    #[serde(default)]
    pub peers: Vec<WgPeerStatus>,
}

/// `POST /api/nodes` — node self-announce or manual registration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeRegistration {
    pub name: String,
    pub ip_address: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub fn default_api_port() -> u16 {
    8888
}
