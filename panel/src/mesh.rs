//! Mesh composer: WireGuard keypair and overlay-IP planning, the per-pair
//! FRP tunnel matrix, and per-node interface configs.
//!
//! Every iran relay runs one FRP server per transport, all forwarding to a
//! single shared WireGuard port. Foreign peers get a unique remote port on
//! every iran relay so each of them is a distinct reachable endpoint
//! (enabling foreign↔foreign traffic through the relay); iran↔iran pairs
//! use the shared port directly.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use smite_common::api::{MeshApply, MeshRemove, MeshSpec, NodeRole, TunnelApply, TunnelRemove};
use smite_common::spec::Spec;

use crate::error::ApiError;
use crate::ipam;
use crate::ports;
use crate::state::AppState;
use crate::store::{
    new_id, MeshConfig, MeshNodeConfig, MeshPeerConfig, MeshRow, NodeRow, TunnelRow,
};

#[derive(Debug, Clone, Deserialize)]
pub struct MeshCreate {
    pub name: String,
    pub node_ids: Vec<String>,
    #[serde(default)]
    pub lan_subnets: HashMap<String, String>,
    #[serde(default)]
    pub overlay_subnet: Option<String>,
    #[serde(default = "default_topology")]
    pub topology: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default)]
    pub wireguard_port: Option<u16>,
}

fn default_topology() -> String {
    "full-mesh".to_string()
}

fn default_mtu() -> u16 {
    1280
}

fn default_transport() -> String {
    "both".to_string()
}

/// Generates a base64-encoded WireGuard keypair in-process.
pub fn generate_keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    let private_key = STANDARD.encode(secret.to_bytes());
    let public_key = STANDARD.encode(public.to_bytes());

    (private_key, public_key)
}

struct NodeInput {
    node_id: String,
    name: String,
    lan_subnet: String,
    overlay_ip: String,
}

/// Per-node mesh configs: one keypair each, peers per topology. Full-mesh
/// lists every other node; hub-spoke makes the first node the hub and
/// gives spokes only the hub.
fn build_node_configs(
    inputs: &[NodeInput],
    topology: &str,
    mtu: u16,
) -> HashMap<String, MeshNodeConfig> {
    let mut keys: HashMap<String, (String, String)> = HashMap::new();
    for input in inputs {
        keys.insert(input.node_id.clone(), generate_keypair());
    }

    let peer_of = |input: &NodeInput| MeshPeerConfig {
        node_id: input.node_id.clone(),
        public_key: keys[&input.node_id].1.clone(),
        overlay_ip: input.overlay_ip.clone(),
        lan_subnet: input.lan_subnet.clone(),
    };

    let mut configs = HashMap::new();
    for (index, input) in inputs.iter().enumerate() {
        let peers: Vec<MeshPeerConfig> = match topology {
            "hub-spoke" => {
                if index == 0 {
                    inputs.iter().skip(1).map(peer_of).collect()
                } else {
                    vec![peer_of(&inputs[0])]
                }
            }
            _ => inputs
                .iter()
                .filter(|other| other.node_id != input.node_id)
                .map(peer_of)
                .collect(),
        };

        let (private_key, public_key) = keys[&input.node_id].clone();
        configs.insert(
            input.node_id.clone(),
            MeshNodeConfig {
                node_id: input.node_id.clone(),
                node_name: input.name.clone(),
                private_key,
                public_key,
                overlay_ip: input.overlay_ip.clone(),
                lan_subnet: input.lan_subnet.clone(),
                mtu,
                peers,
            },
        );
    }

    configs
}

/// Render one node's WireGuard config. When both transports carry a peer,
/// UDP wins: duplicate peer blocks with the same public key are invalid,
/// so exactly one `[Peer]` is emitted per peer.
fn render_wireguard_config(
    node_config: &MeshNodeConfig,
    peer_endpoints: &HashMap<String, HashMap<String, String>>,
    listen_port: u16,
) -> String {
    let mut lines = vec![
        "[Interface]".to_string(),
        format!("PrivateKey = {}", node_config.private_key),
        format!("Address = {}/32", node_config.overlay_ip),
        format!("ListenPort = {}", listen_port),
        format!("MTU = {}", node_config.mtu),
        String::new(),
    ];

    let mut peers = node_config.peers.clone();
    peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    for peer in peers {
        let Some(endpoints) = peer_endpoints.get(&peer.node_id) else {
            warn!(peer = %peer.node_id, "no tunnel endpoint for peer, skipping");
            continue;
        };
        let Some(endpoint) = endpoints
            .get("udp")
            .or_else(|| endpoints.get("tcp"))
            .or_else(|| endpoints.values().next())
        else {
            continue;
        };

        let mut allowed_ips = format!("{}/32", peer.overlay_ip);
        if !peer.lan_subnet.is_empty() {
            allowed_ips.push_str(&format!(", {}", peer.lan_subnet));
        }

        lines.push("[Peer]".to_string());
        lines.push(format!("PublicKey = {}", peer.public_key));
        lines.push(format!("AllowedIPs = {}", allowed_ips));
        lines.push(format!("Endpoint = {}", endpoint));
        lines.push("PersistentKeepalive = 25".to_string());
        lines.push(String::new());
    }

    lines.join("\n")
}

fn peer_routes(node_config: &MeshNodeConfig) -> Vec<String> {
    node_config
        .peers
        .iter()
        .filter(|peer| !peer.lan_subnet.is_empty())
        .map(|peer| peer.lan_subnet.clone())
        .collect()
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

pub async fn create_mesh(state: &AppState, req: MeshCreate) -> Result<MeshRow, ApiError> {
    if !matches!(req.topology.as_str(), "full-mesh" | "hub-spoke") {
        return Err(ApiError::BadRequest(
            "topology must be 'full-mesh' or 'hub-spoke'".into(),
        ));
    }
    if !matches!(req.transport.as_str(), "tcp" | "udp" | "both") {
        return Err(ApiError::BadRequest(
            "transport must be 'tcp', 'udp', or 'both'".into(),
        ));
    }
    if req.node_ids.len() < 2 {
        return Err(ApiError::BadRequest(
            "at least 2 nodes are required for a mesh".into(),
        ));
    }
    if req.wireguard_port == Some(0) {
        return Err(ApiError::BadRequest(
            "wireguard_port must be between 1 and 65535".into(),
        ));
    }

    let mut store = state.store.lock().unwrap();

    let pool = store.pool().ok_or_else(|| {
        ApiError::BadRequest(
            "no overlay IP pool configured; create an overlay pool first".into(),
        )
    })?;

    let overlay_subnet = req.overlay_subnet.clone().unwrap_or_else(|| pool.cidr.clone());
    if overlay_subnet != pool.cidr {
        return Err(ApiError::BadRequest(format!(
            "overlay subnet must match the IPAM pool CIDR: {}",
            pool.cidr
        )));
    }

    let mut inputs: Vec<NodeInput> = Vec::with_capacity(req.node_ids.len());
    for node_id in &req.node_ids {
        let node = store
            .node(node_id)
            .ok_or_else(|| ApiError::NotFound(format!("node {} not found", node_id)))?;

        let overlay_ip =
            ipam::allocate_ip(&mut store, node_id, None, "wg0").map_err(|err| {
                ApiError::Internal(format!(
                    "failed to allocate overlay IP for node {}: {}",
                    node.name, err
                ))
            })?;

        inputs.push(NodeInput {
            node_id: node_id.clone(),
            name: node.name,
            lan_subnet: req.lan_subnets.get(node_id).cloned().unwrap_or_default(),
            overlay_ip,
        });
    }

    let nodes = build_node_configs(&inputs, &req.topology, req.mtu);

    let now = Utc::now();
    let mesh = MeshRow {
        id: new_id(),
        name: req.name,
        topology: req.topology,
        overlay_subnet,
        mtu: req.mtu,
        status: "pending".to_string(),
        mesh_config: MeshConfig {
            transport: req.transport,
            wireguard_port: req.wireguard_port,
            nodes,
        },
        created_at: now,
        updated_at: now,
    };

    let mesh = store.insert_mesh(mesh);
    info!(mesh_id = %mesh.id, nodes = mesh.mesh_config.nodes.len(), topology = %mesh.topology, "mesh created");
    Ok(mesh)
}

struct MeshMember {
    node: NodeRow,
    ip_address: String,
}

pub async fn apply_mesh(state: &AppState, mesh_id: &str) -> Result<(), ApiError> {
    let mesh = state
        .store
        .lock()
        .unwrap()
        .mesh(mesh_id)
        .ok_or_else(|| ApiError::NotFound("mesh not found".into()))?;

    if mesh.mesh_config.nodes.is_empty() {
        return Err(ApiError::BadRequest("mesh node configuration not found".into()));
    }

    let transports: Vec<&str> = match mesh.mesh_config.transport.as_str() {
        "both" => vec!["tcp", "udp"],
        "tcp" => vec!["tcp"],
        _ => vec!["udp"],
    };

    // Partition members by role; relays must have a reachable address.
    let (iran_members, foreign_members) = {
        let store = state.store.lock().unwrap();
        let mut iran: Vec<MeshMember> = Vec::new();
        let mut foreign: Vec<MeshMember> = Vec::new();
        for node_id in mesh.mesh_config.nodes.keys() {
            let Some(node) = store.node(node_id) else {
                warn!(node_id, "mesh node no longer registered, skipping");
                continue;
            };
            let ip_address = node.ip_address().unwrap_or_default();
            let member = MeshMember { node, ip_address };
            match member.node.role() {
                NodeRole::Iran => iran.push(member),
                NodeRole::Foreign => foreign.push(member),
            }
        }
        iran.sort_by(|a, b| a.node.id.cmp(&b.node.id));
        foreign.sort_by(|a, b| a.node.id.cmp(&b.node.id));
        (iran, foreign)
    };

    if iran_members.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one iran node is required; iran nodes host the relay servers".into(),
        ));
    }

    info!(
        mesh_id,
        iran = iran_members.len(),
        foreign = foreign_members.len(),
        transport = %mesh.mesh_config.transport,
        "applying mesh"
    );

    cleanup_mesh_tunnels(state, mesh_id).await;

    let shared_wg_port = mesh
        .mesh_config
        .wireguard_port
        .unwrap_or_else(|| ports::mesh_shared_wg_port(mesh_id));
    info!(mesh_id, shared_wg_port, "shared wireguard port for all relays");

    // Step 1: one FRP server per (iran relay, transport).
    let mut iran_endpoints: HashMap<String, HashMap<String, String>> = HashMap::new();
    for member in &iran_members {
        if member.ip_address.is_empty() {
            warn!(node = %member.node.id, "iran node has no IP address, skipping relay");
            continue;
        }

        for transport in &transports {
            let bind_port = ports::mesh_bind_port(mesh_id, &member.node.id, transport);
            let name = format!(
                "wg-mesh-{}-{}-{}-server",
                short(mesh_id),
                short(&member.node.id),
                transport
            );
            let spec: Spec = json!({
                "mode": "server",
                "bind_port": bind_port,
                "remote_port": shared_wg_port,
                "local_port": shared_wg_port,
                "local_ip": "127.0.0.1",
            })
            .as_object()
            .cloned()
            .unwrap();

            match plan_and_apply_tunnel(state, &member.node, &name, transport, spec).await {
                Ok(()) => {
                    let endpoint = format!("{}:{}", member.ip_address, shared_wg_port);
                    iran_endpoints
                        .entry(member.node.id.clone())
                        .or_default()
                        .insert(transport.to_string(), endpoint);
                }
                Err(err) => {
                    error!(mesh_id, node = %member.node.id, transport, error = %err, "relay server setup failed");
                }
            }
        }
    }

    if iran_endpoints.is_empty() {
        return Err(ApiError::Internal(
            "failed to create relay servers on any iran node".into(),
        ));
    }

    // Step 2: foreign clients, each with a unique remote port per relay.
    let mut foreign_remote_ports: HashMap<String, HashMap<String, HashMap<String, u16>>> =
        HashMap::new();
    for foreign in &foreign_members {
        for iran in &iran_members {
            if iran.ip_address.is_empty() || !iran_endpoints.contains_key(&iran.node.id) {
                continue;
            }

            for transport in &transports {
                if !iran_endpoints[&iran.node.id].contains_key(*transport) {
                    continue;
                }

                let bind_port = ports::mesh_bind_port(mesh_id, &iran.node.id, transport);
                let remote_port = ports::mesh_foreign_remote_port(
                    mesh_id,
                    &foreign.node.id,
                    &iran.node.id,
                    transport,
                );
                let name = format!(
                    "wg-mesh-{}-{}-to-{}-{}-client",
                    short(mesh_id),
                    short(&foreign.node.id),
                    short(&iran.node.id),
                    transport
                );
                let spec: Spec = json!({
                    "mode": "client",
                    "server_addr": iran.ip_address,
                    "server_port": bind_port,
                    "type": transport,
                    "local_ip": "127.0.0.1",
                    "local_port": shared_wg_port,
                    "remote_port": remote_port,
                })
                .as_object()
                .cloned()
                .unwrap();

                match plan_and_apply_tunnel(state, &foreign.node, &name, transport, spec).await {
                    Ok(()) => {
                        foreign_remote_ports
                            .entry(foreign.node.id.clone())
                            .or_default()
                            .entry(iran.node.id.clone())
                            .or_default()
                            .insert(transport.to_string(), remote_port);
                    }
                    Err(err) => {
                        error!(mesh_id, foreign = %foreign.node.id, iran = %iran.node.id, transport, error = %err, "foreign client setup failed");
                    }
                }
            }
        }
    }

    // Step 3: iran↔iran clients on the shared port.
    for member in &iran_members {
        for other in &iran_members {
            if member.node.id == other.node.id
                || other.ip_address.is_empty()
                || !iran_endpoints.contains_key(&other.node.id)
            {
                continue;
            }

            for transport in &transports {
                if !iran_endpoints[&other.node.id].contains_key(*transport) {
                    continue;
                }

                let bind_port = ports::mesh_bind_port(mesh_id, &other.node.id, transport);
                let name = format!(
                    "wg-mesh-{}-{}-to-{}-{}-client",
                    short(mesh_id),
                    short(&member.node.id),
                    short(&other.node.id),
                    transport
                );
                let spec: Spec = json!({
                    "mode": "client",
                    "server_addr": other.ip_address,
                    "server_port": bind_port,
                    "type": transport,
                    "local_ip": "127.0.0.1",
                    "local_port": shared_wg_port,
                    "remote_port": shared_wg_port,
                })
                .as_object()
                .cloned()
                .unwrap();

                if let Err(err) =
                    plan_and_apply_tunnel(state, &member.node, &name, transport, spec).await
                {
                    error!(mesh_id, iran = %member.node.id, peer = %other.node.id, transport, error = %err, "iran-to-iran client setup failed");
                }
            }
        }
    }

    // Step 4: peer→endpoint map. Iran peers are reached at their own relay
    // endpoint; foreign peers at any relay's address with the foreign
    // peer's unique remote port.
    let first_relay = iran_members
        .iter()
        .find(|m| !m.ip_address.is_empty() && iran_endpoints.contains_key(&m.node.id));

    let mut endpoint_map: HashMap<String, HashMap<String, HashMap<String, String>>> =
        HashMap::new();
    for node_id in mesh.mesh_config.nodes.keys() {
        let mut per_peer: HashMap<String, HashMap<String, String>> = HashMap::new();

        for peer_id in mesh.mesh_config.nodes.keys() {
            if peer_id == node_id {
                continue;
            }

            if let Some(endpoints) = iran_endpoints.get(peer_id) {
                per_peer.insert(peer_id.clone(), endpoints.clone());
            } else if let (Some(relay), Some(ports_by_relay)) =
                (first_relay, foreign_remote_ports.get(peer_id))
            {
                if let Some(ports_by_transport) = ports_by_relay.get(&relay.node.id) {
                    let mut endpoints = HashMap::new();
                    for (transport, remote_port) in ports_by_transport {
                        endpoints.insert(
                            transport.clone(),
                            format!("{}:{}", relay.ip_address, remote_port),
                        );
                    }
                    per_peer.insert(peer_id.clone(), endpoints);
                }
            }
        }

        endpoint_map.insert(node_id.clone(), per_peer);
    }

    // Step 5: render and ship each node's interface config.
    for (node_id, node_config) in &mesh.mesh_config.nodes {
        let Some(per_peer) = endpoint_map.get(node_id) else {
            continue;
        };
        let node = {
            let store = state.store.lock().unwrap();
            store.node(node_id)
        };
        let Some(node) = node else {
            continue;
        };

        let wg_config = render_wireguard_config(node_config, per_peer, shared_wg_port);
        let routes = peer_routes(node_config);
        let overlay_ip = {
            let store = state.store.lock().unwrap();
            ipam::node_ip(&store, node_id)
        };

        let body = MeshApply {
            mesh_id: mesh_id.to_string(),
            spec: MeshSpec {
                config: wg_config,
                routes,
                overlay_ip,
            },
        };

        info!(mesh_id, node = %node_id, "applying wireguard config to node");
        let reply = state
            .node_client
            .post(&node, "/api/agent/mesh/apply", &body)
            .await;
        if !reply.is_success() {
            error!(mesh_id, node = %node_id, message = %reply.message, "mesh apply failed on node");
            return Err(ApiError::Internal(format!(
                "failed to apply wireguard config to node {}: {}",
                node_id, reply.message
            )));
        }
    }

    state
        .store
        .lock()
        .unwrap()
        .update_mesh(mesh_id, |mesh| mesh.status = "active".to_string());
    info!(mesh_id, "mesh applied to all nodes");
    Ok(())
}

/// Insert a tunnel row and dispatch it to the node. Mesh tunnels carry the
/// mesh-id prefix in their name so deletion can find them.
async fn plan_and_apply_tunnel(
    state: &AppState,
    node: &NodeRow,
    name: &str,
    transport: &str,
    spec: Spec,
) -> Result<(), String> {
    let now = Utc::now();
    let tunnel = TunnelRow {
        id: new_id(),
        name: name.to_string(),
        core: "frp".to_string(),
        tunnel_type: transport.to_string(),
        node_id: node.id.clone(),
        foreign_node_id: None,
        spec: spec.clone(),
        status: "pending".to_string(),
        error_message: None,
        revision: 1,
        used_mb: 0.0,
        quota_mb: 0.0,
        expires_at: None,
        created_at: now,
        updated_at: now,
    };
    let tunnel = state.store.lock().unwrap().insert_tunnel(tunnel);

    let body = TunnelApply {
        tunnel_id: tunnel.id.clone(),
        core: "frp".to_string(),
        tunnel_type: transport.to_string(),
        spec,
    };
    let reply = state
        .node_client
        .post(node, "/api/agent/tunnels/apply", &body)
        .await;

    if reply.is_success() {
        state
            .store
            .lock()
            .unwrap()
            .set_tunnel_status(&tunnel.id, "active", None);
        Ok(())
    } else {
        state
            .store
            .lock()
            .unwrap()
            .set_tunnel_status(&tunnel.id, "error", Some(reply.message.clone()));
        Err(reply.message)
    }
}

/// Tear down every tunnel carrying this mesh's name prefix, on the node
/// and in the store.
async fn cleanup_mesh_tunnels(state: &AppState, mesh_id: &str) {
    let prefix = format!("wg-mesh-{}", short(mesh_id));
    let old_tunnels = state.store.lock().unwrap().tunnels_with_name_prefix(&prefix);

    for tunnel in old_tunnels {
        info!(tunnel_id = %tunnel.id, name = %tunnel.name, "removing old mesh tunnel");
        if !tunnel.node_id.is_empty() {
            let node = state.store.lock().unwrap().node(&tunnel.node_id);
            if let Some(node) = node {
                let reply = state
                    .node_client
                    .post(
                        &node,
                        "/api/agent/tunnels/remove",
                        &TunnelRemove {
                            tunnel_id: tunnel.id.clone(),
                        },
                    )
                    .await;
                if !reply.is_success() {
                    warn!(tunnel_id = %tunnel.id, message = %reply.message, "old mesh tunnel removal failed on node");
                }
            }
        }
        state.store.lock().unwrap().delete_tunnel(&tunnel.id);
    }
}

pub async fn delete_mesh(state: &AppState, mesh_id: &str) -> Result<(), ApiError> {
    let mesh = state
        .store
        .lock()
        .unwrap()
        .mesh(mesh_id)
        .ok_or_else(|| ApiError::NotFound("mesh not found".into()))?;

    for node_id in mesh.mesh_config.nodes.keys() {
        let node = state.store.lock().unwrap().node(node_id);
        if let Some(node) = node {
            let reply = state
                .node_client
                .post(
                    &node,
                    "/api/agent/mesh/remove",
                    &MeshRemove {
                        mesh_id: mesh_id.to_string(),
                    },
                )
                .await;
            if !reply.is_success() {
                warn!(mesh_id, node = %node_id, message = %reply.message, "mesh removal failed on node");
            }
        }
    }

    cleanup_mesh_tunnels(state, mesh_id).await;

    state.store.lock().unwrap().delete_mesh(mesh_id);
    info!(mesh_id, "mesh deleted");
    Ok(())
}

/// Regenerate every keypair on the panel and mark the mesh for re-apply;
/// nodes pick up the new keys on the next apply.
pub async fn rotate_keys(state: &AppState, mesh_id: &str) -> Result<(), ApiError> {
    let mesh = state
        .store
        .lock()
        .unwrap()
        .mesh(mesh_id)
        .ok_or_else(|| ApiError::NotFound("mesh not found".into()))?;

    let mut node_ids: Vec<String> = mesh.mesh_config.nodes.keys().cloned().collect();
    node_ids.sort();
    if mesh.topology == "hub-spoke" && mesh.mesh_config.nodes.len() > 1 {
        // The hub is the node peered with everyone; keep it first so the
        // rebuilt topology matches.
        let expected = mesh.mesh_config.nodes.len() - 1;
        if let Some(hub) = mesh
            .mesh_config
            .nodes
            .values()
            .find(|config| config.peers.len() == expected)
        {
            let hub_id = hub.node_id.clone();
            node_ids.retain(|id| *id != hub_id);
            node_ids.insert(0, hub_id);
        }
    }

    let inputs: Vec<NodeInput> = node_ids
        .iter()
        .filter_map(|node_id| {
            mesh.mesh_config.nodes.get(node_id).map(|config| NodeInput {
                node_id: node_id.clone(),
                name: config.node_name.clone(),
                lan_subnet: config.lan_subnet.clone(),
                overlay_ip: config.overlay_ip.clone(),
            })
        })
        .collect();

    let nodes = build_node_configs(&inputs, &mesh.topology, mesh.mtu);

    state.store.lock().unwrap().update_mesh(mesh_id, |mesh| {
        mesh.mesh_config.nodes = nodes;
        mesh.status = "pending".to_string();
    });

    info!(mesh_id, "mesh keys rotated, re-apply to update nodes");
    Ok(())
}

/// Fan out to every member node for its live interface status.
pub async fn mesh_status(state: &AppState, mesh_id: &str) -> Result<Value, ApiError> {
    let mesh = state
        .store
        .lock()
        .unwrap()
        .mesh(mesh_id)
        .ok_or_else(|| ApiError::NotFound("mesh not found".into()))?;

    let mut node_statuses = serde_json::Map::new();
    for (node_id, node_config) in &mesh.mesh_config.nodes {
        let node = state.store.lock().unwrap().node(node_id);
        let Some(node) = node else {
            node_statuses.insert(node_id.clone(), json!({"error": "node not registered"}));
            continue;
        };

        let endpoint = format!("/api/agent/mesh/{}/status", mesh_id);
        match state.node_client.get(&node, &endpoint).await {
            Ok(body) => {
                let mut data = body
                    .get("data")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                data.insert("node_name".into(), Value::String(node.name.clone()));
                if !node_config.lan_subnet.is_empty() {
                    data.insert(
                        "lan_subnet".into(),
                        Value::String(node_config.lan_subnet.clone()),
                    );
                }
                let overlay_ip = {
                    let store = state.store.lock().unwrap();
                    ipam::node_ip(&store, node_id)
                };
                if let Some(overlay_ip) = overlay_ip {
                    data.insert("overlay_ip".into(), Value::String(overlay_ip));
                }
                node_statuses.insert(node_id.clone(), Value::Object(data));
            }
            Err(err) => {
                error!(mesh_id, node = %node_id, error = %err, "mesh status probe failed");
                node_statuses.insert(node_id.clone(), json!({"error": err}));
            }
        }
    }

    Ok(json!({
        "mesh_id": mesh_id,
        "mesh_name": mesh.name,
        "status": mesh.status,
        "nodes": node_statuses,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(n: usize) -> Vec<NodeInput> {
        (0..n)
            .map(|i| NodeInput {
                node_id: format!("node-{}", i),
                name: format!("node {}", i),
                lan_subnet: if i == 0 {
                    "192.168.10.0/24".to_string()
                } else {
                    String::new()
                },
                overlay_ip: format!("10.250.0.{}", i + 1),
            })
            .collect()
    }

    #[test]
    fn keypairs_are_distinct_base64() {
        let (private_a, public_a) = generate_keypair();
        let (private_b, public_b) = generate_keypair();
        assert_ne!(private_a, private_b);
        assert_ne!(public_a, public_b);
        assert_eq!(STANDARD.decode(&public_a).unwrap().len(), 32);
    }

    #[test]
    fn full_mesh_gives_every_node_all_others_as_peers() {
        let configs = build_node_configs(&inputs(3), "full-mesh", 1280);
        assert_eq!(configs.len(), 3);
        for config in configs.values() {
            assert_eq!(config.peers.len(), 2);
            assert!(config.peers.iter().all(|p| p.node_id != config.node_id));
        }
        // No two peer blocks in one config share a public key.
        for config in configs.values() {
            let mut keys: Vec<&str> =
                config.peers.iter().map(|p| p.public_key.as_str()).collect();
            keys.sort();
            keys.dedup();
            assert_eq!(keys.len(), config.peers.len());
        }
    }

    #[test]
    fn hub_spoke_peers_only_the_hub() {
        let configs = build_node_configs(&inputs(4), "hub-spoke", 1280);
        assert_eq!(configs["node-0"].peers.len(), 3);
        for spoke in ["node-1", "node-2", "node-3"] {
            assert_eq!(configs[spoke].peers.len(), 1);
            assert_eq!(configs[spoke].peers[0].node_id, "node-0");
        }
    }

    #[test]
    fn rendered_config_prefers_udp_and_carries_lan_subnets() {
        let configs = build_node_configs(&inputs(3), "full-mesh", 1280);
        let node_config = &configs["node-1"];

        let mut endpoints = HashMap::new();
        for peer in &node_config.peers {
            let mut per_transport = HashMap::new();
            per_transport.insert("tcp".to_string(), format!("203.0.113.1:1{}", 8000));
            per_transport.insert("udp".to_string(), "203.0.113.1:17342".to_string());
            endpoints.insert(peer.node_id.clone(), per_transport);
        }

        let rendered = render_wireguard_config(node_config, &endpoints, 17342);

        assert!(rendered.contains("Address = 10.250.0.2/32"));
        assert!(rendered.contains("ListenPort = 17342"));
        assert!(rendered.contains("MTU = 1280"));
        assert_eq!(rendered.matches("[Peer]").count(), 2);
        // UDP endpoint only; no duplicate peer blocks for tcp.
        assert_eq!(rendered.matches("Endpoint = 203.0.113.1:17342").count(), 2);
        // node-0's LAN subnet rides along in AllowedIPs.
        assert!(rendered.contains("AllowedIPs = 10.250.0.1/32, 192.168.10.0/24"));
        assert!(rendered.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn peers_without_endpoints_are_skipped() {
        let configs = build_node_configs(&inputs(3), "full-mesh", 1280);
        let node_config = &configs["node-0"];
        let rendered = render_wireguard_config(node_config, &HashMap::new(), 17342);
        assert_eq!(rendered.matches("[Peer]").count(), 0);
    }
}
