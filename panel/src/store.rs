//! Panel entity store: nodes, tunnels, meshes, overlay pool/assignments,
//! and core reset configs, persisted as pretty-printed JSON with an atomic
//! rewrite on every mutation. A corrupt state file is logged and replaced
//! with an empty store rather than taking the panel down.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info};
use uuid::Uuid;

use smite_common::api::{NodeRegistration, NodeRole};
use smite_common::spec::Spec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    pub status: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NodeRow {
    pub fn role(&self) -> NodeRole {
        self.metadata
            .get("role")
            .and_then(Value::as_str)
            .and_then(NodeRole::parse)
            .unwrap_or(NodeRole::Iran)
    }

    pub fn ip_address(&self) -> Option<String> {
        self.metadata
            .get("ip_address")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    }

    pub fn api_port(&self) -> u16 {
        self.metadata
            .get("api_port")
            .and_then(Value::as_u64)
            .and_then(|v| u16::try_from(v).ok())
            .unwrap_or(8888)
    }

    pub fn api_address(&self) -> String {
        if let Some(address) = self
            .metadata
            .get("api_address")
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
        {
            let address = address.trim_end_matches('/');
            if address.starts_with("http") {
                return address.to_string();
            }
            return format!("http://{}", address);
        }

        let host = self
            .ip_address()
            .unwrap_or_else(|| self.fingerprint.clone());
        format!("http://{}:{}", host, self.api_port())
    }

    pub fn panel_address(&self) -> Option<String> {
        self.metadata
            .get("panel_address")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRow {
    pub id: String,
    pub name: String,
    pub core: String,
    #[serde(rename = "type")]
    pub tunnel_type: String,
    pub node_id: String,
    #[serde(default)]
    pub foreign_node_id: Option<String>,
    pub spec: Spec,
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
    pub revision: u32,
    #[serde(default)]
    pub used_mb: f64,
    #[serde(default)]
    pub quota_mb: f64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshPeerConfig {
    pub node_id: String,
    pub public_key: String,
    pub overlay_ip: String,
    #[serde(default)]
    pub lan_subnet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshNodeConfig {
    pub node_id: String,
    pub node_name: String,
    pub private_key: String,
    pub public_key: String,
    pub overlay_ip: String,
    #[serde(default)]
    pub lan_subnet: String,
    pub mtu: u16,
    #[serde(default)]
    pub peers: Vec<MeshPeerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MeshConfig {
    pub transport: String,
    #[serde(default)]
    pub wireguard_port: Option<u16>,
    #[serde(default)]
    pub nodes: HashMap<String, MeshNodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshRow {
    pub id: String,
    pub name: String,
    pub topology: String,
    pub overlay_subnet: String,
    pub mtu: u16,
    pub status: String,
    pub mesh_config: MeshConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayPoolRow {
    pub id: String,
    pub cidr: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayAssignmentRow {
    pub id: String,
    pub node_id: String,
    pub overlay_ip: String,
    pub interface_name: String,
    pub assigned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreResetConfigRow {
    pub id: String,
    pub core: String,
    pub enabled: bool,
    pub interval_minutes: u32,
    #[serde(default)]
    pub last_reset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_reset: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    nodes: HashMap<String, NodeRow>,
    tunnels: HashMap<String, TunnelRow>,
    meshes: HashMap<String, MeshRow>,
    pool: Option<OverlayPoolRow>,
    /// Keyed by node id; overlay_ip uniqueness is enforced on insert.
    assignments: HashMap<String, OverlayAssignmentRow>,
    /// Keyed by core name.
    reset_configs: HashMap<String, CoreResetConfigRow>,
}

pub struct Store {
    path: PathBuf,
    data: StoreData,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Truncated SHA-256 over `ip:api_port`, the node's stable identity.
pub fn node_fingerprint(ip_address: &str, api_port: u16) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", ip_address, api_port).as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

impl Store {
    pub fn load(path: &Path) -> Self {
        let data = match fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => StoreData::default(),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(data) => data,
                Err(err) => {
                    error!(file = %path.display(), error = %err, "state file unparseable, starting empty");
                    StoreData::default()
                }
            },
            Err(_) => {
                info!(file = %path.display(), "no state file yet, starting empty");
                StoreData::default()
            }
        };

        Store {
            path: path.to_path_buf(),
            data,
        }
    }

    pub fn save(&self) {
        if let Err(err) = atomic_write_json(&self.path, &self.data) {
            error!(file = %self.path.display(), error = %err, "failed to persist state");
        }
    }

    // ----- nodes ---------------------------------------------------------

    /// Register or soft-update a node. A fingerprint collision with a
    /// different role is a conflict: roles are immutable after first
    /// registration.
    pub fn upsert_node(&mut self, registration: NodeRegistration) -> Result<NodeRow, String> {
        let fingerprint = node_fingerprint(&registration.ip_address, registration.api_port);

        let incoming_role = registration
            .metadata
            .get("role")
            .and_then(Value::as_str)
            .map(|role| {
                NodeRole::parse(role).ok_or_else(|| {
                    format!("invalid role '{}': must be 'iran' or 'foreign'", role)
                })
            })
            .transpose()?
            .unwrap_or(NodeRole::Iran);

        let mut metadata = registration.metadata.clone();
        metadata.insert(
            "api_address".to_string(),
            Value::String(format!(
                "http://{}:{}",
                registration.ip_address, registration.api_port
            )),
        );
        metadata.insert(
            "ip_address".to_string(),
            Value::String(registration.ip_address.clone()),
        );
        metadata.insert(
            "api_port".to_string(),
            Value::Number(registration.api_port.into()),
        );
        metadata.insert(
            "role".to_string(),
            Value::String(incoming_role.as_str().to_string()),
        );

        let existing_id = self
            .data
            .nodes
            .values()
            .find(|node| node.fingerprint == fingerprint)
            .map(|node| node.id.clone());

        let node = if let Some(id) = existing_id {
            let node = self.data.nodes.get_mut(&id).unwrap();
            let existing_role = node.role();
            if existing_role != incoming_role {
                return Err(format!(
                    "node with this fingerprint already registered with role '{}'; \
                     cannot re-register as '{}'",
                    existing_role.as_str(),
                    incoming_role.as_str()
                ));
            }

            node.last_seen = Utc::now();
            node.status = "active".to_string();
            for (key, value) in metadata {
                node.metadata.insert(key, value);
            }
            node.metadata.insert(
                "role".to_string(),
                Value::String(existing_role.as_str().to_string()),
            );
            node.clone()
        } else {
            let now = Utc::now();
            let node = NodeRow {
                id: new_id(),
                name: registration.name,
                fingerprint,
                status: "active".to_string(),
                registered_at: now,
                last_seen: now,
                metadata,
            };
            self.data.nodes.insert(node.id.clone(), node.clone());
            node
        };

        self.save();
        Ok(node)
    }

    pub fn node(&self, node_id: &str) -> Option<NodeRow> {
        self.data.nodes.get(node_id).cloned()
    }

    pub fn nodes(&self) -> Vec<NodeRow> {
        let mut nodes: Vec<NodeRow> = self.data.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        nodes
    }

    pub fn first_node_with_role(&self, role: NodeRole) -> Option<NodeRow> {
        self.nodes().into_iter().find(|node| node.role() == role)
    }

    pub fn set_node_metadata(&mut self, node_id: &str, key: &str, value: Value) {
        if let Some(node) = self.data.nodes.get_mut(node_id) {
            node.metadata.insert(key.to_string(), value);
            self.save();
        }
    }

    pub fn remove_node_metadata(&mut self, node_id: &str, key: &str) {
        if let Some(node) = self.data.nodes.get_mut(node_id) {
            node.metadata.remove(key);
            self.save();
        }
    }

    /// Deletion cascades to the node's overlay assignment.
    pub fn delete_node(&mut self, node_id: &str) -> bool {
        let removed = self.data.nodes.remove(node_id).is_some();
        if removed {
            self.data.assignments.remove(node_id);
            self.save();
        }
        removed
    }

    // ----- tunnels -------------------------------------------------------

    pub fn insert_tunnel(&mut self, tunnel: TunnelRow) -> TunnelRow {
        self.data.tunnels.insert(tunnel.id.clone(), tunnel.clone());
        self.save();
        tunnel
    }

    pub fn tunnel(&self, tunnel_id: &str) -> Option<TunnelRow> {
        self.data.tunnels.get(tunnel_id).cloned()
    }

    pub fn tunnels(&self) -> Vec<TunnelRow> {
        let mut tunnels: Vec<TunnelRow> = self.data.tunnels.values().cloned().collect();
        tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tunnels
    }

    pub fn active_tunnels_for_core(&self, core: &str) -> Vec<TunnelRow> {
        self.tunnels()
            .into_iter()
            .filter(|t| t.core == core && t.status == "active")
            .collect()
    }

    pub fn tunnels_with_name_prefix(&self, prefix: &str) -> Vec<TunnelRow> {
        self.tunnels()
            .into_iter()
            .filter(|t| t.name.starts_with(prefix))
            .collect()
    }

    /// Every status transition increments the revision.
    pub fn set_tunnel_status(
        &mut self,
        tunnel_id: &str,
        status: &str,
        error_message: Option<String>,
    ) -> Option<TunnelRow> {
        let tunnel = self.data.tunnels.get_mut(tunnel_id)?;
        if tunnel.status != status {
            tunnel.revision += 1;
        }
        tunnel.status = status.to_string();
        tunnel.error_message = error_message;
        tunnel.updated_at = Utc::now();
        let updated = tunnel.clone();
        self.save();
        Some(updated)
    }

    pub fn update_tunnel_spec(
        &mut self,
        tunnel_id: &str,
        name: Option<String>,
        spec: Option<Spec>,
    ) -> Option<TunnelRow> {
        let tunnel = self.data.tunnels.get_mut(tunnel_id)?;
        if let Some(name) = name {
            tunnel.name = name;
        }
        if let Some(spec) = spec {
            tunnel.spec = spec;
        }
        tunnel.revision += 1;
        tunnel.updated_at = Utc::now();
        let updated = tunnel.clone();
        self.save();
        Some(updated)
    }

    pub fn set_tunnel_usage(&mut self, tunnel_id: &str, used_mb: f64) {
        if let Some(tunnel) = self.data.tunnels.get_mut(tunnel_id) {
            tunnel.used_mb = used_mb;
            tunnel.updated_at = Utc::now();
            self.save();
        }
    }

    pub fn delete_tunnel(&mut self, tunnel_id: &str) -> bool {
        let removed = self.data.tunnels.remove(tunnel_id).is_some();
        if removed {
            self.save();
        }
        removed
    }

    // ----- meshes --------------------------------------------------------

    pub fn insert_mesh(&mut self, mesh: MeshRow) -> MeshRow {
        self.data.meshes.insert(mesh.id.clone(), mesh.clone());
        self.save();
        mesh
    }

    pub fn mesh(&self, mesh_id: &str) -> Option<MeshRow> {
        self.data.meshes.get(mesh_id).cloned()
    }

    pub fn meshes(&self) -> Vec<MeshRow> {
        let mut meshes: Vec<MeshRow> = self.data.meshes.values().cloned().collect();
        meshes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        meshes
    }

    pub fn update_mesh<F: FnOnce(&mut MeshRow)>(&mut self, mesh_id: &str, f: F) -> Option<MeshRow> {
        let mesh = self.data.meshes.get_mut(mesh_id)?;
        f(mesh);
        mesh.updated_at = Utc::now();
        let updated = mesh.clone();
        self.save();
        Some(updated)
    }

    pub fn delete_mesh(&mut self, mesh_id: &str) -> bool {
        let removed = self.data.meshes.remove(mesh_id).is_some();
        if removed {
            self.save();
        }
        removed
    }

    // ----- overlay pool and assignments ---------------------------------

    pub fn pool(&self) -> Option<OverlayPoolRow> {
        self.data.pool.clone()
    }

    pub fn set_pool(&mut self, cidr: &str, description: Option<String>) -> OverlayPoolRow {
        let pool = match &mut self.data.pool {
            Some(pool) if pool.cidr == cidr => {
                pool.description = description;
                pool.updated_at = Utc::now();
                pool.clone()
            }
            _ => {
                let now = Utc::now();
                let pool = OverlayPoolRow {
                    id: new_id(),
                    cidr: cidr.to_string(),
                    description,
                    created_at: now,
                    updated_at: now,
                };
                self.data.pool = Some(pool.clone());
                pool
            }
        };
        self.save();
        pool
    }

    /// Deleting the pool drops every assignment and the mirrored metadata.
    pub fn delete_pool(&mut self) -> bool {
        if self.data.pool.take().is_none() {
            return false;
        }
        let node_ids: Vec<String> = self.data.assignments.keys().cloned().collect();
        self.data.assignments.clear();
        for node_id in node_ids {
            if let Some(node) = self.data.nodes.get_mut(&node_id) {
                node.metadata.remove("overlay_ip");
            }
        }
        self.save();
        true
    }

    pub fn assignment(&self, node_id: &str) -> Option<OverlayAssignmentRow> {
        self.data.assignments.get(node_id).cloned()
    }

    pub fn assignments(&self) -> Vec<OverlayAssignmentRow> {
        let mut assignments: Vec<OverlayAssignmentRow> =
            self.data.assignments.values().cloned().collect();
        assignments.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        assignments
    }

    pub fn ip_taken_by_other(&self, overlay_ip: &str, node_id: &str) -> bool {
        self.data
            .assignments
            .values()
            .any(|a| a.overlay_ip == overlay_ip && a.node_id != node_id)
    }

    /// Insert or re-point an assignment and mirror it into node metadata.
    pub fn put_assignment(&mut self, node_id: &str, overlay_ip: &str, interface_name: &str) {
        let now = Utc::now();
        match self.data.assignments.get_mut(node_id) {
            Some(assignment) => {
                assignment.overlay_ip = overlay_ip.to_string();
                assignment.interface_name = interface_name.to_string();
                assignment.updated_at = now;
            }
            None => {
                self.data.assignments.insert(
                    node_id.to_string(),
                    OverlayAssignmentRow {
                        id: new_id(),
                        node_id: node_id.to_string(),
                        overlay_ip: overlay_ip.to_string(),
                        interface_name: interface_name.to_string(),
                        assigned_at: now,
                        updated_at: now,
                    },
                );
            }
        }

        if let Some(node) = self.data.nodes.get_mut(node_id) {
            node.metadata.insert(
                "overlay_ip".to_string(),
                Value::String(overlay_ip.to_string()),
            );
        }
        self.save();
    }

    pub fn remove_assignment(&mut self, node_id: &str) -> Option<OverlayAssignmentRow> {
        let removed = self.data.assignments.remove(node_id);
        if removed.is_some() {
            if let Some(node) = self.data.nodes.get_mut(node_id) {
                node.metadata.remove("overlay_ip");
            }
            self.save();
        }
        removed
    }

    // ----- core reset configs -------------------------------------------

    pub fn reset_config(&mut self, core: &str) -> CoreResetConfigRow {
        if let Some(config) = self.data.reset_configs.get(core) {
            return config.clone();
        }
        let now = Utc::now();
        let config = CoreResetConfigRow {
            id: new_id(),
            core: core.to_string(),
            enabled: false,
            interval_minutes: 10,
            last_reset: None,
            next_reset: None,
            created_at: now,
            updated_at: now,
        };
        self.data
            .reset_configs
            .insert(core.to_string(), config.clone());
        self.save();
        config
    }

    pub fn update_reset_config<F: FnOnce(&mut CoreResetConfigRow)>(
        &mut self,
        core: &str,
        f: F,
    ) -> CoreResetConfigRow {
        self.reset_config(core);
        let config = self.data.reset_configs.get_mut(core).unwrap();
        f(config);
        config.updated_at = Utc::now();
        let updated = config.clone();
        self.save();
        updated
    }

    pub fn reset_configs(&mut self, cores: &[&str]) -> Vec<CoreResetConfigRow> {
        cores.iter().map(|core| self.reset_config(core)).collect()
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(value)?;
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn registration(name: &str, ip: &str, role: &str) -> NodeRegistration {
        NodeRegistration {
            name: name.to_string(),
            ip_address: ip.to_string(),
            api_port: 8888,
            metadata: json!({"role": role}).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn fingerprint_is_sixteen_hex_chars_and_stable() {
        let a = node_fingerprint("203.0.113.7", 8888);
        let b = node_fingerprint("203.0.113.7", 8888);
        let c = node_fingerprint("203.0.113.8", 8888);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn reregistering_with_a_new_role_is_rejected() {
        let dir = tempdir().unwrap();
        let mut store = Store::load(&dir.path().join("state.json"));

        store
            .upsert_node(registration("n1", "203.0.113.7", "iran"))
            .unwrap();
        let err = store
            .upsert_node(registration("n1", "203.0.113.7", "foreign"))
            .unwrap_err();
        assert!(err.contains("role"));
    }

    #[test]
    fn reregistering_soft_updates_last_seen() {
        let dir = tempdir().unwrap();
        let mut store = Store::load(&dir.path().join("state.json"));

        let first = store
            .upsert_node(registration("n1", "203.0.113.7", "foreign"))
            .unwrap();
        let second = store
            .upsert_node(registration("n1-renamed", "203.0.113.7", "foreign"))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(second.role(), NodeRole::Foreign);
    }

    #[test]
    fn status_transition_bumps_revision() {
        let dir = tempdir().unwrap();
        let mut store = Store::load(&dir.path().join("state.json"));

        let now = Utc::now();
        store.insert_tunnel(TunnelRow {
            id: "t1".into(),
            name: "demo".into(),
            core: "frp".into(),
            tunnel_type: "tcp".into(),
            node_id: "n1".into(),
            foreign_node_id: None,
            spec: Spec::new(),
            status: "pending".into(),
            error_message: None,
            revision: 1,
            used_mb: 0.0,
            quota_mb: 0.0,
            expires_at: None,
            created_at: now,
            updated_at: now,
        });

        let active = store.set_tunnel_status("t1", "active", None).unwrap();
        assert_eq!(active.revision, 2);

        // Re-asserting the same status is not a transition.
        let same = store.set_tunnel_status("t1", "active", None).unwrap();
        assert_eq!(same.revision, 2);

        let errored = store
            .set_tunnel_status("t1", "error", Some("boom".into()))
            .unwrap();
        assert_eq!(errored.revision, 3);
        assert_eq!(errored.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let mut store = Store::load(&path);
            store
                .upsert_node(registration("n1", "203.0.113.7", "iran"))
                .unwrap();
            store.set_pool("10.250.0.0/24", Some("overlay".into()));
        }

        let store = Store::load(&path);
        assert_eq!(store.nodes().len(), 1);
        assert_eq!(store.pool().unwrap().cidr, "10.250.0.0/24");
    }

    #[test]
    fn corrupt_state_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{broken").unwrap();
        let store = Store::load(&path);
        assert!(store.nodes().is_empty());
    }

    #[test]
    fn deleting_a_node_cascades_to_its_assignment() {
        let dir = tempdir().unwrap();
        let mut store = Store::load(&dir.path().join("state.json"));

        let node = store
            .upsert_node(registration("n1", "203.0.113.7", "iran"))
            .unwrap();
        store.put_assignment(&node.id, "10.250.0.1", "wg0");
        assert!(store.assignment(&node.id).is_some());

        store.delete_node(&node.id);
        assert!(store.assignment(&node.id).is_none());
    }
}
