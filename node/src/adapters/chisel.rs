//! Chisel reverse-tunnel adapter.
//!
//! Chisel is configured entirely on the command line; only the log file
//! lives in the config directory.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Duration;

use smite_common::addr::parse_address_port;
use smite_common::api::TunnelStatus;
use smite_common::spec::{Spec, SpecExt};
use tracing::{info, warn};

use super::AdapterError;
use crate::process::{
    open_log, pkill_pattern, read_log_tail, resolve_binary, spawn_logged, stop_child,
    verify_startup,
};

pub struct ChiselAdapter {
    config_dir: PathBuf,
    processes: HashMap<String, Child>,
    log_files: HashMap<String, File>,
}

impl ChiselAdapter {
    pub fn new(config_root: &Path) -> Result<Self, AdapterError> {
        let config_dir = config_root.join("chisel");
        fs::create_dir_all(&config_dir)?;
        Ok(ChiselAdapter {
            config_dir,
            processes: HashMap::new(),
            log_files: HashMap::new(),
        })
    }

    pub fn apply(&mut self, tunnel_id: &str, spec: &Spec) -> Result<(), AdapterError> {
        if self.processes.contains_key(tunnel_id) {
            info!(tunnel_id, "chisel tunnel already exists, removing it first");
            self.remove(tunnel_id);
        }

        let mode = spec
            .str_at(&["mode"])
            .unwrap_or_else(|| "client".to_string());

        let mut args: Vec<String> = Vec::new();

        if mode == "server" {
            let server_port = spec
                .port_at(&["server_port", "control_port", "listen_port"])
                .ok_or_else(|| {
                    AdapterError::InvalidSpec(
                        "chisel server requires 'server_port' or 'control_port'".into(),
                    )
                })?;
            // The reverse port is opened on demand by clients; it is
            // validated here so a bad spec fails before the spawn.
            spec.port_at(&["reverse_port", "remote_port", "listen_port"])
                .ok_or_else(|| {
                    AdapterError::InvalidSpec(
                        "chisel server requires 'reverse_port' or 'remote_port'".into(),
                    )
                })?;

            args.extend([
                "server".to_string(),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                server_port.to_string(),
                "--reverse".to_string(),
            ]);
        } else {
            let server_url = spec.str_at(&["server_url"]).ok_or_else(|| {
                AdapterError::InvalidSpec("chisel client requires 'server_url'".into())
            })?;
            let reverse_port = spec
                .port_at(&["reverse_port", "remote_port", "listen_port", "server_port"])
                .ok_or_else(|| {
                    AdapterError::InvalidSpec(
                        "chisel client requires 'reverse_port', 'remote_port', or 'listen_port'"
                            .into(),
                    )
                })?;

            let local_addr = spec.str_at(&["local_addr"]).unwrap_or_else(|| {
                let fallback = format!("127.0.0.1:{}", reverse_port);
                warn!(tunnel_id, %fallback, "chisel local_addr not specified, using fallback");
                fallback
            });

            let parsed = parse_address_port(&local_addr);
            let local_port = parsed.port.ok_or_else(|| {
                AdapterError::InvalidSpec(format!(
                    "invalid local_addr '{}' (port required)",
                    local_addr
                ))
            })?;

            let reverse_spec = if parsed.is_ipv6 {
                format!("R:{}:[{}]:{}", reverse_port, parsed.host, local_port)
            } else {
                format!("R:{}:{}:{}", reverse_port, parsed.host, local_port)
            };
            info!(tunnel_id, %reverse_spec, %server_url, "chisel reverse spec");

            args.extend(["client".to_string(), server_url, reverse_spec]);
        }

        if let Some(auth) = spec.str_at(&["auth"]) {
            args.extend(["--auth".to_string(), auth]);
        }
        if let Some(fingerprint) = spec.str_at(&["fingerprint"]) {
            args.extend(["--fingerprint".to_string(), fingerprint]);
        }

        let binary = resolve_binary("chisel", "CHISEL_BINARY")?;
        let log_path = self.config_dir.join(format!("{}.log", tunnel_id));
        let log = open_log(
            &log_path,
            &[
                format!("Starting chisel {} for tunnel {}", mode, tunnel_id),
                format!("Command: chisel {}", args.join(" ")),
            ],
        )?;

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut child = spawn_logged("chisel", &binary, &arg_refs, &self.config_dir, &log)?;
        verify_startup("chisel", &mut child, &log_path, Duration::from_secs(1))?;

        self.processes.insert(tunnel_id.to_string(), child);
        self.log_files.insert(tunnel_id.to_string(), log);
        Ok(())
    }

    pub fn remove(&mut self, tunnel_id: &str) {
        if let Some(mut child) = self.processes.remove(tunnel_id) {
            stop_child("chisel", &mut child, Duration::from_secs(5));
        }
        self.log_files.remove(tunnel_id);
        pkill_pattern(&format!("chisel.*{}", tunnel_id));
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
            core: "chisel".to_string(),
            config_exists: false,
            process_running,
            pid,
            exit_code,
            log_tail,
        }
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
    fn server_requires_both_ports() {
        let dir = tempdir().unwrap();
        let mut adapter = ChiselAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply("t1", &spec(json!({"mode": "server", "reverse_port": 9100})))
            .unwrap_err();
        assert!(err.to_string().contains("server_port"));
    }

    #[test]
    fn client_requires_server_url() {
        let dir = tempdir().unwrap();
        let mut adapter = ChiselAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply("t1", &spec(json!({"mode": "client", "reverse_port": 9100})))
            .unwrap_err();
        assert!(err.to_string().contains("server_url"));
    }

    #[test]
    fn client_rejects_local_addr_without_port() {
        let dir = tempdir().unwrap();
        let mut adapter = ChiselAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply(
                "t1",
                &spec(json!({
                    "mode": "client",
                    "server_url": "http://1.2.3.4:8000",
                    "reverse_port": 9100,
                    "local_addr": "127.0.0.1"
                })),
            )
            .unwrap_err();
        assert!(err.to_string().contains("local_addr"));
    }
}
