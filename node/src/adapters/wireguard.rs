//! Node-side WireGuard mesh adapter.
//!
//! Installs a panel-rendered `.conf`, manages the interface lifecycle via
//! `wg-quick`, and treats the overlay IP as globally scarce: a leftover
//! address on any interface blocks `wg-quick up`, so apply reclaims it from
//! wherever it is still bound before bringing the mesh up. When
//! `wg-obfuscator` is installed, each peer endpoint is re-pointed at a local
//! obfuscator hop that forwards to the real endpoint.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use smite_common::api::{MeshStatus, WgPeerStatus};
use tracing::{debug, info, warn};

use super::AdapterError;
use crate::process::{resolve_binary, stop_child};

pub struct WireGuardAdapter {
    config_dir: PathBuf,
    wg_binary: PathBuf,
    wg_quick_binary: PathBuf,
    obfuscator_binary: Option<PathBuf>,
    /// mesh id → interface name.
    interfaces: HashMap<String, String>,
    /// mesh id → peer public key → obfuscator child.
    obfuscators: HashMap<String, HashMap<String, Child>>,
}

impl WireGuardAdapter {
    pub fn new(config_root: &Path) -> Result<Self, AdapterError> {
        let config_dir = config_root.join("wireguard");
        fs::create_dir_all(&config_dir)?;

        let wg_binary = resolve_binary("wg", "WG_BINARY")?;
        let wg_quick_binary = resolve_binary("wg-quick", "WG_QUICK_BINARY")?;

        let obfuscator_binary = resolve_binary("wg-obfuscator", "WG_OBFUSCATOR_BINARY").ok();
        match &obfuscator_binary {
            Some(path) => info!(binary = %path.display(), "wg-obfuscator found"),
            None => debug!("wg-obfuscator not found, obfuscation disabled"),
        }

        Ok(WireGuardAdapter {
            config_dir,
            wg_binary,
            wg_quick_binary,
            obfuscator_binary,
            interfaces: HashMap::new(),
            obfuscators: HashMap::new(),
        })
    }

    fn interface_name(mesh_id: &str) -> String {
        format!("wg-{}", &mesh_id[..mesh_id.len().min(8)])
    }

    fn config_path(&self, interface: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", interface))
    }

    pub fn apply(
        &mut self,
        mesh_id: &str,
        config: &str,
        routes: &[String],
        overlay_ip: Option<&str>,
    ) -> Result<(), AdapterError> {
        let interface = Self::interface_name(mesh_id);
        let config_path = self.config_path(&interface);

        if config.trim().is_empty() {
            return Err(AdapterError::InvalidSpec(
                "wireguard config is required in spec".into(),
            ));
        }

        self.teardown_existing(&interface, &config_path);

        // Stale routes from a previous incarnation shadow the new ones.
        for allowed in extract_allowed_ips(config) {
            let _ = run("ip", &["route", "del", &allowed]);
        }

        let target_ip = overlay_ip
            .map(str::to_string)
            .or_else(|| extract_interface_address(config));
        if let Some(ip) = &target_ip {
            self.reclaim_overlay_ip(ip, &interface);
        }

        self.stop_obfuscators(mesh_id);

        let final_config = if self.obfuscator_binary.is_some() {
            match self.apply_obfuscation(mesh_id, config) {
                Ok(rewritten) => {
                    info!(mesh_id, "peer endpoints rewritten through wg-obfuscator");
                    rewritten
                }
                Err(err) => {
                    warn!(mesh_id, error = %err, "obfuscation failed, continuing without it");
                    config.to_string()
                }
            }
        } else {
            config.to_string()
        };

        fs::write(&config_path, &final_config)?;
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        let config_arg = config_path.display().to_string();
        let up = run(
            self.wg_quick_binary.to_str().unwrap_or("wg-quick"),
            &["up", &config_arg],
        )?;
        if !up.status.success() {
            let stderr = String::from_utf8_lossy(&up.stderr).trim().to_string();
            return Err(AdapterError::Command(format!(
                "wg-quick up failed: {}",
                stderr
            )));
        }
        info!(mesh_id, %interface, "wireguard interface up");

        self.interfaces
            .insert(mesh_id.to_string(), interface.clone());

        for route in routes {
            self.add_route(&interface, route);
        }

        enable_ip_forwarding();
        Ok(())
    }

    /// Bring down whatever is left of a previous instance of this mesh:
    /// the config (if present), the interface (if present), and finally a
    /// forced link removal when wg-quick leaves debris behind.
    fn teardown_existing(&self, interface: &str, config_path: &Path) {
        if config_path.exists() {
            info!(config = %config_path.display(), "existing wireguard config found, bringing it down");
            let config_arg = config_path.display().to_string();
            let _ = run(
                self.wg_quick_binary.to_str().unwrap_or("wg-quick"),
                &["down", &config_arg],
            );
            std::thread::sleep(Duration::from_millis(300));
        }

        if interface_exists(interface) {
            info!(%interface, "wireguard interface already exists, removing it");
            let _ = run(
                self.wg_quick_binary.to_str().unwrap_or("wg-quick"),
                &["down", interface],
            );
            let _ = run("ip", &["link", "delete", interface]);
            std::thread::sleep(Duration::from_millis(500));

            if interface_exists(interface) {
                warn!(%interface, "interface survived cleanup, forcing removal");
                let _ = run("ip", &["addr", "flush", "dev", interface]);
                let _ = run("ip", &["link", "set", interface, "down"]);
                let _ = run("ip", &["link", "delete", interface]);
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }

    /// Remove the overlay IP from every interface that still carries it, in
    /// every plausible CIDR form, flushing the offender as a last resort.
    fn reclaim_overlay_ip(&self, overlay_ip: &str, target_interface: &str) {
        info!(overlay_ip, "checking for existing overlay IP assignment");

        let mut holders: Vec<String> = Vec::new();
        if let Ok(output) = run("ip", &["-o", "addr", "show"]) {
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines() {
                if line.contains(overlay_ip) && line.contains("inet") {
                    if let Some(iface) = line.split_whitespace().nth(1) {
                        warn!(overlay_ip, iface, "overlay IP found on interface, will remove");
                        holders.push(iface.to_string());
                    }
                }
            }
        }

        holders.push(target_interface.to_string());

        // Leftover wg-* interfaces from crashed meshes are the usual
        // culprits.
        if let Ok(output) = run("ip", &["link", "show"]) {
            let stdout = String::from_utf8_lossy(&output.stdout);
            for line in stdout.lines() {
                if let Some((_, rest)) = line.split_once(": ") {
                    let name = rest.split(['@', ':']).next().unwrap_or("").trim();
                    if name.starts_with("wg") && !name.is_empty() {
                        holders.push(name.to_string());
                    }
                }
            }
        }
        holders.sort();
        holders.dedup();

        for iface in &holders {
            for form in [
                format!("{}/32", overlay_ip),
                format!("{}/128", overlay_ip),
                overlay_ip.to_string(),
            ] {
                if let Ok(output) = run("ip", &["addr", "del", &form, "dev", iface]) {
                    if output.status.success() {
                        info!(overlay_ip, iface, "removed stale overlay IP");
                    }
                }
            }
        }

        if let Ok(output) = run("ip", &["-o", "addr", "show"]) {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains(overlay_ip) {
                for line in stdout.lines() {
                    if line.contains(overlay_ip) && line.contains("inet") {
                        if let Some(iface) = line.split_whitespace().nth(1) {
                            warn!(overlay_ip, iface, "overlay IP still present, flushing interface");
                            let _ = run("ip", &["addr", "flush", "dev", iface]);
                        }
                    }
                }
            }
        }

        std::thread::sleep(Duration::from_millis(500));
    }

    fn add_route(&self, interface: &str, route: &str) {
        if let Ok(existing) = run("ip", &["route", "show", route, "dev", interface]) {
            if existing.status.success() && !existing.stdout.is_empty() {
                info!(route, "route already exists, skipping");
                return;
            }
        }

        match run("ip", &["route", "add", route, "dev", interface]) {
            Ok(output) if output.status.success() => {
                info!(route, interface, "added route");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(route, interface, %stderr, "failed to add route");
            }
            Err(err) => warn!(route, interface, error = %err, "failed to add route"),
        }
    }

    pub fn remove(&mut self, mesh_id: &str) {
        self.stop_obfuscators(mesh_id);

        let Some(interface) = self.interfaces.remove(mesh_id) else {
            return;
        };
        let config_path = self.config_path(&interface);

        if config_path.exists() {
            let config_arg = config_path.display().to_string();
            let _ = run(
                self.wg_quick_binary.to_str().unwrap_or("wg-quick"),
                &["down", &config_arg],
            );
            let _ = fs::remove_file(&config_path);
        }
        info!(mesh_id, %interface, "wireguard interface down");

        // Obfuscator configs share the mesh prefix.
        let prefix = format!("obfuscator-{}-", &mesh_id[..mesh_id.len().min(8)]);
        if let Ok(entries) = fs::read_dir(&self.config_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(&prefix) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    pub fn status(&mut self, mesh_id: &str) -> MeshStatus {
        let Some(interface) = self.interfaces.get(mesh_id).cloned() else {
            return MeshStatus::default();
        };

        let overlay_ip = interface_ipv4(&interface);

        let show = run(
            self.wg_binary.to_str().unwrap_or("wg"),
            &["show", &interface],
        );
        match show {
            Ok(output) if output.status.success() => {
                let peers = parse_wg_show(&String::from_utf8_lossy(&output.stdout));
                MeshStatus {
                    active: true,
                    interface: Some(interface),
                    overlay_ip,
                    peers,
                }
            }
            _ => MeshStatus {
                active: false,
                interface: Some(interface),
                overlay_ip,
                peers: Vec::new(),
            },
        }
    }

    pub fn shutdown(&mut self) {
        let mesh_ids: Vec<String> = self.interfaces.keys().cloned().collect();
        for mesh_id in mesh_ids {
            self.remove(&mesh_id);
        }
    }

    /// Rewrite each `[Peer] Endpoint` to a local obfuscator hop and spawn
    /// one forwarder per peer. A peer that fails to obfuscate keeps its
    /// real endpoint.
    fn apply_obfuscation(&mut self, mesh_id: &str, config: &str) -> Result<String, AdapterError> {
        let Some(obfuscator) = self.obfuscator_binary.clone() else {
            return Ok(config.to_string());
        };

        let mut output_lines: Vec<String> = Vec::new();
        let mut peer_lines: Vec<String> = Vec::new();
        let mut peer_key: Option<String> = None;
        let mut peer_endpoint: Option<String> = None;
        let mut in_peer = false;

        let mut flush_peer = |this: &mut Self,
                              output_lines: &mut Vec<String>,
                              peer_lines: &mut Vec<String>,
                              peer_key: &mut Option<String>,
                              peer_endpoint: &mut Option<String>| {
            if peer_lines.is_empty() {
                return;
            }
            match (peer_key.take(), peer_endpoint.take()) {
                (Some(key), Some(endpoint)) => {
                    let rewritten = this.obfuscate_peer(mesh_id, &obfuscator, &key, &endpoint, peer_lines);
                    output_lines.extend(rewritten);
                }
                _ => output_lines.append(peer_lines),
            }
            peer_lines.clear();
        };

        for line in config.lines() {
            let trimmed = line.trim();
            if trimmed == "[Peer]" {
                flush_peer(
                    self,
                    &mut output_lines,
                    &mut peer_lines,
                    &mut peer_key,
                    &mut peer_endpoint,
                );
                in_peer = true;
                peer_lines.push(line.to_string());
                continue;
            }

            if in_peer {
                peer_lines.push(line.to_string());
                if let Some(value) = trimmed.strip_prefix("PublicKey = ") {
                    peer_key = Some(value.trim().to_string());
                } else if let Some(value) = trimmed.strip_prefix("Endpoint = ") {
                    peer_endpoint = Some(value.trim().to_string());
                }
            } else {
                output_lines.push(line.to_string());
            }
        }
        flush_peer(
            self,
            &mut output_lines,
            &mut peer_lines,
            &mut peer_key,
            &mut peer_endpoint,
        );

        Ok(output_lines.join("\n"))
    }

    fn obfuscate_peer(
        &mut self,
        mesh_id: &str,
        obfuscator: &Path,
        peer_key: &str,
        endpoint: &str,
        peer_lines: &[String],
    ) -> Vec<String> {
        let parsed = smite_common::addr::parse_address_port(endpoint);
        let Some(real_port) = parsed.port else {
            warn!(endpoint, "could not parse peer endpoint, skipping obfuscation");
            return peer_lines.to_vec();
        };

        let local_port = derive_port(
            &format!("{}-{}-{}", mesh_id, peer_key, endpoint),
            19000,
            5000,
        );
        let source_port = derive_port(&format!("{}-{}-source", mesh_id, peer_key), 24000, 1000);

        let key_prefix = &peer_key[..peer_key.len().min(8)];
        let config_path = self.config_dir.join(format!(
            "obfuscator-{}-{}.conf",
            &mesh_id[..mesh_id.len().min(8)],
            key_prefix
        ));
        let obfuscator_config = format!(
            "[client]\nlisten = 127.0.0.1:{}\nserver-endpoint = {}:{}\nsource-lport = {}\n",
            local_port, parsed.host, real_port, source_port
        );

        let spawn = (|| -> Result<Child, AdapterError> {
            fs::write(&config_path, &obfuscator_config)?;
            fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

            let config_arg = config_path.display().to_string();
            let mut child = Command::new(obfuscator)
                .args(["-c", &config_arg])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(AdapterError::Io)?;

            std::thread::sleep(Duration::from_millis(200));
            if let Ok(Some(status)) = child.try_wait() {
                return Err(AdapterError::Command(format!(
                    "wg-obfuscator exited immediately (code {:?})",
                    status.code()
                )));
            }
            Ok(child)
        })();

        match spawn {
            Ok(child) => {
                self.obfuscators
                    .entry(mesh_id.to_string())
                    .or_default()
                    .insert(peer_key.to_string(), child);
                info!(
                    peer = key_prefix,
                    local_port,
                    real = %format!("{}:{}", parsed.host, real_port),
                    "started wg-obfuscator hop"
                );

                peer_lines
                    .iter()
                    .map(|line| {
                        if line.trim().starts_with("Endpoint = ") {
                            format!("Endpoint = 127.0.0.1:{}", local_port)
                        } else {
                            line.clone()
                        }
                    })
                    .collect()
            }
            Err(err) => {
                warn!(peer = key_prefix, error = %err, "failed to start wg-obfuscator, keeping real endpoint");
                peer_lines.to_vec()
            }
        }
    }

    fn stop_obfuscators(&mut self, mesh_id: &str) {
        let Some(children) = self.obfuscators.remove(mesh_id) else {
            return;
        };
        for (peer_key, mut child) in children {
            stop_child("wg-obfuscator", &mut child, Duration::from_secs(2));
            debug!(peer = %&peer_key[..peer_key.len().min(8)], "stopped wg-obfuscator");
        }
    }
}

fn run(binary: &str, args: &[&str]) -> Result<std::process::Output, AdapterError> {
    Command::new(binary)
        .args(args)
        .output()
        .map_err(|err| AdapterError::Command(format!("failed to run {}: {}", binary, err)))
}

fn interface_exists(interface: &str) -> bool {
    run("ip", &["link", "show", interface])
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn enable_ip_forwarding() {
    match fs::write("/proc/sys/net/ipv4/ip_forward", "1") {
        Ok(()) => info!("IPv4 forwarding enabled"),
        Err(err) => warn!(error = %err, "failed to enable IPv4 forwarding"),
    }
}

/// Every AllowedIPs entry across all peers, comma-split and trimmed.
fn extract_allowed_ips(config: &str) -> Vec<String> {
    let mut allowed = Vec::new();
    for line in config.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("AllowedIPs") {
            if let Some((_, value)) = rest.split_once('=') {
                for ip in value.split(',') {
                    let ip = ip.trim();
                    if !ip.is_empty() {
                        allowed.push(ip.to_string());
                    }
                }
            }
        }
    }
    allowed
}

/// The bare IP of the `[Interface] Address =` line, CIDR suffix stripped.
fn extract_interface_address(config: &str) -> Option<String> {
    for line in config.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Address") {
            if let Some((_, value)) = rest.split_once('=') {
                let value = value.trim();
                let ip = value.split('/').next().unwrap_or(value);
                return Some(ip.to_string());
            }
        }
    }
    None
}

fn interface_ipv4(interface: &str) -> Option<String> {
    let output = run("ip", &["addr", "show", interface]).ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("inet ") {
            for part in trimmed.split_whitespace() {
                if part.contains('/') && part.matches('.').count() == 3 {
                    return part.split('/').next().map(str::to_string);
                }
            }
        }
    }
    None
}

/// Parse `wg show <iface>` output into peer rows.
fn parse_wg_show(output: &str) -> Vec<WgPeerStatus> {
    let mut peers: Vec<WgPeerStatus> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = strip_field(trimmed, "peer:") {
            peers.push(WgPeerStatus {
                public_key: value,
                endpoint: None,
                allowed_ips: None,
                last_handshake: None,
                connected: false,
            });
        } else if let Some(current) = peers.last_mut() {
            if let Some(value) = strip_field(trimmed, "endpoint:") {
                current.endpoint = Some(value);
            } else if let Some(value) = strip_field(trimmed, "allowed ips:") {
                current.allowed_ips = Some(value);
            } else if let Some(value) = strip_field(trimmed, "latest handshake:") {
                if !value.is_empty() && value != "(none)" {
                    current.last_handshake = Some(value);
                    current.connected = true;
                }
            }
        }
    }

    peers
}

fn strip_field(line: &str, prefix: &str) -> Option<String> {
    line.strip_prefix(prefix).map(|rest| rest.trim().to_string())
}

/// Stable port derivation: first four bytes of the seed's MD5, mapped into
/// `[base, base + range)`.
fn derive_port(seed: &str, base: u16, range: u32) -> u16 {
    let digest = md5::compute(seed.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    base + (n % range) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = "\
[Interface]
PrivateKey = aaaa
Address = 10.250.0.7/32
MTU = 1280

[Peer]
PublicKey = peer-one-key
AllowedIPs = 10.250.0.1/32, 192.168.10.0/24
Endpoint = 203.0.113.5:17342
PersistentKeepalive = 25

[Peer]
PublicKey = peer-two-key
AllowedIPs = 10.250.0.2/32
Endpoint = 203.0.113.9:18755
PersistentKeepalive = 25
";

    #[test]
    fn extracts_allowed_ips_across_peers() {
        let allowed = extract_allowed_ips(SAMPLE_CONFIG);
        assert_eq!(
            allowed,
            vec!["10.250.0.1/32", "192.168.10.0/24", "10.250.0.2/32"]
        );
    }

    #[test]
    fn extracts_interface_address_without_cidr() {
        assert_eq!(
            extract_interface_address(SAMPLE_CONFIG),
            Some("10.250.0.7".to_string())
        );
    }

    #[test]
    fn parses_wg_show_peers() {
        let output = "\
interface: wg-abc12345
  public key: our-key
  listening port: 17342

peer: peer-one-key
  endpoint: 203.0.113.5:17342
  allowed ips: 10.250.0.1/32
  latest handshake: 42 seconds ago

peer: peer-two-key
  allowed ips: 10.250.0.2/32
  latest handshake: (none)
";
        let peers = parse_wg_show(output);
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_key, "peer-one-key");
        assert_eq!(peers[0].endpoint.as_deref(), Some("203.0.113.5:17342"));
        assert!(peers[0].connected);
        assert_eq!(peers[1].public_key, "peer-two-key");
        assert!(!peers[1].connected);
        assert!(peers[1].last_handshake.is_none());
    }

    #[test]
    fn derived_ports_are_stable_and_in_range() {
        let a = derive_port("mesh-key-endpoint", 19000, 5000);
        let b = derive_port("mesh-key-endpoint", 19000, 5000);
        assert_eq!(a, b);
        assert!((19000..24000).contains(&a));

        let source = derive_port("mesh-key-source", 24000, 1000);
        assert!((24000..25000).contains(&source));
    }

    #[test]
    fn interface_name_truncates_mesh_id() {
        assert_eq!(
            WireGuardAdapter::interface_name("0123456789abcdef"),
            "wg-01234567"
        );
        assert_eq!(WireGuardAdapter::interface_name("abc"), "wg-abc");
    }
}
