//! GOST forwarding adapter: a single-mode `-L=<type>://<listen>/<target>`
//! forwarder, used on iran nodes that relay straight to a foreign service.

use std::collections::HashMap;
use std::fs::{self, File};
use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Duration;

use smite_common::addr::parse_address_port;
use smite_common::api::TunnelStatus;
use smite_common::spec::{Spec, SpecExt};
use tracing::info;

use super::AdapterError;
use crate::process::{
    open_log, pkill_pattern, read_log_tail, resolve_binary, spawn_logged, stop_child,
    verify_startup,
};

pub struct GostAdapter {
    config_dir: PathBuf,
    processes: HashMap<String, Child>,
    log_files: HashMap<String, File>,
}

impl GostAdapter {
    pub fn new(config_root: &Path) -> Result<Self, AdapterError> {
        let config_dir = config_root.join("gost");
        fs::create_dir_all(&config_dir)?;
        Ok(GostAdapter {
            config_dir,
            processes: HashMap::new(),
            log_files: HashMap::new(),
        })
    }

    pub fn apply(&mut self, tunnel_id: &str, spec: &Spec) -> Result<(), AdapterError> {
        if self.processes.contains_key(tunnel_id) {
            info!(tunnel_id, "gost tunnel already exists, removing it first");
            self.remove(tunnel_id);
        }

        let listen_port = spec
            .port_at(&["listen_port", "remote_port"])
            .ok_or_else(|| {
                AdapterError::InvalidSpec("gost requires 'listen_port' or 'remote_port'".into())
            })?;

        let forward_to = spec.str_at(&["forward_to"]).unwrap_or_else(|| {
            let remote_ip = spec
                .str_at(&["remote_ip"])
                .unwrap_or_else(|| "127.0.0.1".to_string());
            let remote_port = spec.port_at(&["remote_port"]).unwrap_or(8080);
            format!("{}:{}", remote_ip, remote_port)
        });

        let tunnel_type = spec
            .str_at(&["type"])
            .unwrap_or_else(|| "tcp".to_string())
            .to_ascii_lowercase();
        let use_ipv6 = spec.bool_at(&["use_ipv6"]);

        let forward = parse_address_port(&forward_to);
        let forward_port = forward.port.unwrap_or(8080);
        let target_addr = if forward.is_ipv6 {
            format!("[{}]:{}", forward.host, forward_port)
        } else {
            format!("{}:{}", forward.host, forward_port)
        };

        let listen_addr = if use_ipv6 {
            format!("[::]:{}", listen_port)
        } else {
            format!("0.0.0.0:{}", listen_port)
        };

        let listen_spec = match tunnel_type.as_str() {
            "tcp" | "udp" | "grpc" | "tcpmux" => {
                format!("-L={}://{}/{}", tunnel_type, listen_addr, target_addr)
            }
            // For ws the listener binds to the default outbound interface
            // so the advertised URL is reachable from outside.
            "ws" => {
                let bind_ip = outbound_bind_ip(use_ipv6);
                format!("-L=ws://{}:{}/tcp://{}", bind_ip, listen_port, target_addr)
            }
            other => {
                return Err(AdapterError::InvalidSpec(format!(
                    "unsupported gost tunnel type '{}'",
                    other
                )))
            }
        };

        let binary = resolve_binary("gost", "GOST_BINARY")?;
        let log_path = self.config_dir.join(format!("{}.log", tunnel_id));
        let log = open_log(
            &log_path,
            &[
                format!("Starting gost forwarding for tunnel {}", tunnel_id),
                format!(
                    "Forwarding: {}://{} -> {}",
                    tunnel_type, listen_addr, target_addr
                ),
            ],
        )?;

        let mut child = spawn_logged("gost", &binary, &[&listen_spec], &self.config_dir, &log)?;
        verify_startup("gost", &mut child, &log_path, Duration::from_millis(1500))?;

        self.processes.insert(tunnel_id.to_string(), child);
        self.log_files.insert(tunnel_id.to_string(), log);
        info!(tunnel_id, %tunnel_type, %listen_addr, %target_addr, "gost forwarding started");
        Ok(())
    }

    pub fn remove(&mut self, tunnel_id: &str) {
        if let Some(mut child) = self.processes.remove(tunnel_id) {
            stop_child("gost", &mut child, Duration::from_secs(5));
        }
        self.log_files.remove(tunnel_id);
        pkill_pattern(&format!("gost.*{}", tunnel_id));
    }

    pub fn status(&mut self, tunnel_id: &str) -> TunnelStatus {
        let (process_running, pid, exit_code) = match self.processes.get_mut(tunnel_id) {
            Some(child) => {
                let pid = child.id();
                match child.try_wait() {
                    Ok(None) => (true, Some(pid), None),
                    Ok(Some(status)) => (false, Some(pid), status.code()),
                    Err(_) => (false, Some(pid), None),
                }
            }
            None => (false, None, None),
        };

        let log_path = self.config_dir.join(format!("{}.log", tunnel_id));
        let log_tail = match read_log_tail(&log_path, 500) {
            tail if tail.is_empty() => None,
            tail => Some(tail),
        };

        TunnelStatus {
            active: process_running,
            core: "gost".to_string(),
            config_exists: false,
            process_running,
            pid,
            exit_code,
            log_tail,
        }
    }
}

/// Address of the default outbound interface, discovered by "connecting" a
/// UDP socket to a public resolver. No packet is sent.
fn outbound_bind_ip(ipv6: bool) -> String {
    let probe = if ipv6 {
        UdpSocket::bind("[::]:0").and_then(|sock| {
            sock.connect("[2001:4860:4860::8888]:80")?;
            sock.local_addr()
        })
    } else {
        UdpSocket::bind("0.0.0.0:0").and_then(|sock| {
            sock.connect("8.8.8.8:80")?;
            sock.local_addr()
        })
    };

    match probe {
        Ok(addr) => addr.ip().to_string(),
        Err(_) if ipv6 => "[::]".to_string(),
        Err(_) => "0.0.0.0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn spec(value: serde_json::Value) -> Spec {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn requires_a_listen_port() {
        let dir = tempdir().unwrap();
        let mut adapter = GostAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply("t1", &spec(json!({"forward_to": "10.0.0.9:8080"})))
            .unwrap_err();
        assert!(err.to_string().contains("listen_port"));
    }

    #[test]
    fn rejects_unknown_type() {
        let dir = tempdir().unwrap();
        let mut adapter = GostAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply(
                "t1",
                &spec(json!({
                    "listen_port": 9200,
                    "forward_to": "10.0.0.9:8080",
                    "type": "quic"
                })),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unsupported gost tunnel type"));
    }
}
