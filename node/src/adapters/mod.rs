//! Core adapters and the per-node adapter manager.
//!
//! Each transport core gets one adapter owning its config directory, its
//! child processes, and their log handles. The manager maps tunnel ids to
//! the adapter currently holding them and persists `{tunnel_id → {core,
//! spec}}` to `tunnels.json` so a restarted node can bring every tunnel
//! back without the panel's help.

mod backhaul;
mod chisel;
mod frp;
mod gost;
mod rathole;
pub mod wireguard;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use smite_common::addr::parse_address_port;
use smite_common::api::TunnelStatus;
use smite_common::spec::{Spec, SpecExt};
use thiserror::Error;
use tracing::{error, info, warn};

pub use backhaul::BackhaulAdapter;
pub use chisel::ChiselAdapter;
pub use frp::FrpAdapter;
pub use gost::GostAdapter;
pub use rathole::RatholeAdapter;

use crate::firewall;
use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("unknown tunnel core '{0}'")]
    UnknownCore(String),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Command(String),
}

/// The transport cores a node can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Core {
    Rathole,
    Backhaul,
    Chisel,
    Frp,
    Gost,
}

impl Core {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rathole" => Some(Core::Rathole),
            "backhaul" => Some(Core::Backhaul),
            "chisel" => Some(Core::Chisel),
            "frp" => Some(Core::Frp),
            "gost" => Some(Core::Gost),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Core::Rathole => "rathole",
            Core::Backhaul => "backhaul",
            Core::Chisel => "chisel",
            Core::Frp => "frp",
            Core::Gost => "gost",
        }
    }

    /// Reverse-tunnel cores carry a server/client `mode` in their spec;
    /// gost is a plain single-process forwarder.
    fn is_reverse(&self) -> bool {
        !matches!(self, Core::Gost)
    }
}

/// Persisted record for one tunnel: enough to re-apply after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub core: String,
    pub spec: Spec,
}

pub struct AdapterManager {
    tunnels_file: PathBuf,
    rathole: RatholeAdapter,
    backhaul: BackhaulAdapter,
    chisel: ChiselAdapter,
    frp: FrpAdapter,
    gost: GostAdapter,
    /// tunnel id → adapter currently owning it.
    active: HashMap<String, Core>,
    /// tunnel id → last applied record, mirrored on disk.
    records: HashMap<String, TunnelRecord>,
}

impl AdapterManager {
    pub fn new(state_dir: &Path, config_root: &Path) -> Result<Self, AdapterError> {
        fs::create_dir_all(state_dir)?;
        let tunnels_file = state_dir.join("tunnels.json");
        info!(file = %tunnels_file.display(), "tunnel persistence file");

        Ok(AdapterManager {
            tunnels_file,
            rathole: RatholeAdapter::new(config_root)?,
            backhaul: BackhaulAdapter::new(config_root)?,
            chisel: ChiselAdapter::new(config_root)?,
            frp: FrpAdapter::new(config_root)?,
            gost: GostAdapter::new(config_root)?,
            active: HashMap::new(),
            records: HashMap::new(),
        })
    }

    pub fn active_tunnel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn apply_tunnel(
        &mut self,
        tunnel_id: &str,
        core_name: &str,
        spec: Spec,
    ) -> Result<(), AdapterError> {
        if self.active.contains_key(tunnel_id) {
            info!(tunnel_id, "tunnel already exists, removing it first");
            self.remove_tunnel(tunnel_id)?;
        }

        let core = Core::parse(core_name)
            .ok_or_else(|| AdapterError::UnknownCore(core_name.to_string()))?;

        self.dispatch_apply(core, tunnel_id, &spec)?;
        self.active.insert(tunnel_id.to_string(), core);

        track_traffic(core, tunnel_id, &spec);

        self.records.insert(
            tunnel_id.to_string(),
            TunnelRecord {
                core: core.as_str().to_string(),
                spec,
            },
        );
        self.save_records();

        info!(tunnel_id, core = core.as_str(), "tunnel applied and persisted");
        Ok(())
    }

    pub fn remove_tunnel(&mut self, tunnel_id: &str) -> Result<(), AdapterError> {
        if let Some(core) = self.active.remove(tunnel_id) {
            self.dispatch_remove(core, tunnel_id);
        }

        firewall::untrack(tunnel_id);

        if self.records.remove(tunnel_id).is_some() {
            self.save_records();
        }
        Ok(())
    }

    pub fn tunnel_status(&mut self, tunnel_id: &str) -> TunnelStatus {
        match self.active.get(tunnel_id) {
            Some(&core) => self.dispatch_status(core, tunnel_id),
            None => TunnelStatus::default(),
        }
    }

    pub fn tunnel_traffic_bytes(&self, tunnel_id: &str) -> u64 {
        firewall::total_traffic_bytes(tunnel_id)
    }

    /// Re-apply every persisted tunnel. Called once at startup; per-entry
    /// failures are logged and do not abort the batch.
    pub fn restore_tunnels(&mut self) {
        self.records = load_records(&self.tunnels_file);

        if self.records.is_empty() {
            info!("no persisted tunnels to restore");
            return;
        }

        info!(count = self.records.len(), "restoring persisted tunnels");
        let mut restored = 0usize;
        let mut failed = 0usize;

        let entries: Vec<(String, TunnelRecord)> = self
            .records
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();

        for (tunnel_id, record) in entries {
            let Some(core) = Core::parse(&record.core) else {
                warn!(tunnel_id, core = %record.core, "unknown core in persisted record, skipping");
                failed += 1;
                continue;
            };

            let mut spec = record.spec;
            // Records written before modes were persisted lack `mode`;
            // reverse tunnels default to the client side.
            if core.is_reverse() && spec.str_at(&["mode"]).is_none() {
                warn!(tunnel_id, "persisted reverse tunnel missing mode, defaulting to client");
                spec.set_str("mode", "client");
            }

            match self.dispatch_apply(core, &tunnel_id, &spec) {
                Ok(()) => {
                    self.active.insert(tunnel_id.clone(), core);
                    track_traffic(core, &tunnel_id, &spec);
                    restored += 1;
                    info!(tunnel_id, core = core.as_str(), "restored tunnel");
                }
                Err(err) => {
                    error!(tunnel_id, core = core.as_str(), error = %err, "failed to restore tunnel");
                    failed += 1;
                }
            }
        }

        info!(restored, failed, "tunnel restoration completed");
    }

    /// Stop every running child without touching persistence, so the next
    /// start can restore the same set. Used from the shutdown hook.
    pub fn shutdown(&mut self) {
        let ids: Vec<(String, Core)> = self
            .active
            .drain()
            .collect();
        for (tunnel_id, core) in ids {
            self.dispatch_remove(core, &tunnel_id);
        }
    }

    fn dispatch_apply(&mut self, core: Core, tunnel_id: &str, spec: &Spec) -> Result<(), AdapterError> {
        match core {
            Core::Rathole => self.rathole.apply(tunnel_id, spec),
            Core::Backhaul => self.backhaul.apply(tunnel_id, spec),
            Core::Chisel => self.chisel.apply(tunnel_id, spec),
            Core::Frp => self.frp.apply(tunnel_id, spec),
            Core::Gost => self.gost.apply(tunnel_id, spec),
        }
    }

    fn dispatch_remove(&mut self, core: Core, tunnel_id: &str) {
        match core {
            Core::Rathole => self.rathole.remove(tunnel_id),
            Core::Backhaul => self.backhaul.remove(tunnel_id),
            Core::Chisel => self.chisel.remove(tunnel_id),
            Core::Frp => self.frp.remove(tunnel_id),
            Core::Gost => self.gost.remove(tunnel_id),
        }
    }

    fn dispatch_status(&mut self, core: Core, tunnel_id: &str) -> TunnelStatus {
        match core {
            Core::Rathole => self.rathole.status(tunnel_id),
            Core::Backhaul => self.backhaul.status(tunnel_id),
            Core::Chisel => self.chisel.status(tunnel_id),
            Core::Frp => self.frp.status(tunnel_id),
            Core::Gost => self.gost.status(tunnel_id),
        }
    }

    fn save_records(&self) {
        if let Err(err) = atomic_write_json(&self.tunnels_file, &self.records) {
            error!(file = %self.tunnels_file.display(), error = %err, "failed to save tunnel records");
        }
    }
}

/// Install byte counters for a freshly-applied tunnel. Backhaul clients are
/// counted against the remote relay; everything else against the first
/// meaningful local port. Best-effort: tunnels run fine without counters.
fn track_traffic(core: Core, tunnel_id: &str, spec: &Spec) {
    let mode = spec
        .str_at(&["mode"])
        .unwrap_or_else(|| "client".to_string());

    if core == Core::Backhaul && mode == "client" {
        if let Some(remote) = spec.str_at(&["remote_addr", "control_addr", "bind_addr"]) {
            let parsed = parse_address_port(&remote);
            if let Some(port) = parsed.port {
                firewall::track_remote(tunnel_id, &parsed.host, port, parsed.is_ipv6);
                return;
            }
        }
    }

    let port = spec.port_at(&[
        "proxy_port",
        "remote_port",
        "listen_port",
        "public_port",
        "bind_port",
        "server_port",
        "local_port",
    ]);
    if let Some(port) = port {
        firewall::track_port(tunnel_id, port);
    }
}

fn load_records(tunnels_file: &Path) -> HashMap<String, TunnelRecord> {
    if !tunnels_file.exists() {
        info!(file = %tunnels_file.display(), "no tunnel records on disk (normal for a new node)");
        return HashMap::new();
    }

    match fs::read_to_string(tunnels_file) {
        Ok(content) if content.trim().is_empty() => {
            warn!(file = %tunnels_file.display(), "tunnel records file is empty");
            HashMap::new()
        }
        Ok(content) => match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(err) => {
                // Corrupt persistence must not take the node down; start
                // empty and let the panel reconcile.
                error!(file = %tunnels_file.display(), error = %err, "failed to parse tunnel records, starting empty");
                HashMap::new()
            }
        },
        Err(err) => {
            error!(file = %tunnels_file.display(), error = %err, "failed to read tunnel records, starting empty");
            HashMap::new()
        }
    }
}

/// `tmp + fsync + rename` so a crash mid-write never leaves a torn file.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(value)?;
    {
        let mut file = fs::File::create(&tmp_path)?;
        use std::io::Write;
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

    #[test]
    fn core_parsing_is_case_insensitive() {
        assert_eq!(Core::parse("FRP"), Some(Core::Frp));
        assert_eq!(Core::parse(" gost "), Some(Core::Gost));
        assert_eq!(Core::parse("wireguard"), None);
        assert_eq!(Core::parse("nope"), None);
    }

    #[test]
    fn records_round_trip_through_disk() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tunnels.json");

        let mut records = HashMap::new();
        records.insert(
            "t1".to_string(),
            TunnelRecord {
                core: "frp".to_string(),
                spec: json!({"mode": "client", "server_port": 7100})
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
        );

        atomic_write_json(&file, &records).unwrap();
        let loaded = load_records(&file);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["t1"].core, "frp");
        assert_eq!(loaded["t1"].spec.port_at(&["server_port"]), Some(7100));
    }

    #[test]
    fn corrupt_records_fall_back_to_empty() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("tunnels.json");
        fs::write(&file, b"{not json").unwrap();
        assert!(load_records(&file).is_empty());
    }

    #[test]
    fn unknown_core_is_rejected_before_any_side_effect() {
        let dir = tempdir().unwrap();
        let mut manager =
            AdapterManager::new(&dir.path().join("state"), &dir.path().join("etc")).unwrap();
        let spec = json!({"mode": "server"}).as_object().cloned().unwrap();
        let err = manager.apply_tunnel("t1", "hysteria", spec).unwrap_err();
        assert!(matches!(err, AdapterError::UnknownCore(_)));
        assert!(manager.active_tunnel_ids().is_empty());
    }
}
