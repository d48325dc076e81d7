//! FRP reverse-tunnel adapter. Runs `frps` in server mode and `frpc` with a
//! single proxy entry in client mode; both sides take YAML configs.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Duration;

use smite_common::api::TunnelStatus;
use smite_common::spec::{Spec, SpecExt};
use tracing::info;

use super::AdapterError;
use crate::process::{
    open_log, pkill_pattern, read_log_tail, resolve_binary, spawn_logged, stop_child,
    verify_startup,
};

const REJECTED_SERVER_ADDRS: [&str; 4] = ["0.0.0.0", "localhost", "127.0.0.1", "::1"];

pub struct FrpAdapter {
    config_dir: PathBuf,
    processes: HashMap<String, Child>,
    log_files: HashMap<String, File>,
}

impl FrpAdapter {
    pub fn new(config_root: &Path) -> Result<Self, AdapterError> {
        let config_dir = config_root.join("frp");
        fs::create_dir_all(&config_dir)?;
        Ok(FrpAdapter {
            config_dir,
            processes: HashMap::new(),
            log_files: HashMap::new(),
        })
    }

    pub fn apply(&mut self, tunnel_id: &str, spec: &Spec) -> Result<(), AdapterError> {
        if self.processes.contains_key(tunnel_id) {
            info!(tunnel_id, "frp tunnel already exists, removing it first");
            self.remove(tunnel_id);
        }

        let mode = spec
            .str_at(&["mode"])
            .unwrap_or_else(|| "client".to_string());
        let token = spec.str_at(&["token"]);

        let (config_path, binary_name, env_var) = if mode == "server" {
            let bind_port = spec.port_at(&["bind_port"]).unwrap_or(7000);

            let mut config = format!("bindPort: {}\n", bind_port);
            if let Some(token) = &token {
                config.push_str(&format!(
                    "auth:\n  method: token\n  token: \"{}\"\n",
                    token
                ));
            }

            let config_path = self.config_dir.join(format!("frps_{}.yaml", tunnel_id));
            fs::write(&config_path, &config)?;
            info!(tunnel_id, bind_port, token_set = token.is_some(), "frp server config written");
            (config_path, "frps", "FRPS_BINARY")
        } else {
            let mut server_addr = spec.str_at(&["server_addr"]).ok_or_else(|| {
                AdapterError::InvalidSpec("frp client requires 'server_addr'".into())
            })?;
            let server_port = spec.port_at(&["server_port"]).unwrap_or(7000);
            let tunnel_type = spec
                .str_at(&["type"])
                .unwrap_or_else(|| "tcp".to_string())
                .to_ascii_lowercase();
            let local_port = spec.port_at(&["local_port"]).ok_or_else(|| {
                AdapterError::InvalidSpec("frp client requires 'local_port'".into())
            })?;
            let remote_port = spec
                .port_at(&["remote_port", "listen_port"])
                .ok_or_else(|| {
                    AdapterError::InvalidSpec(
                        "frp client requires 'remote_port' or 'listen_port'".into(),
                    )
                })?;
            let local_ip = spec
                .str_at(&["local_ip"])
                .unwrap_or_else(|| "127.0.0.1".to_string());

            if !matches!(tunnel_type.as_str(), "tcp" | "udp") {
                return Err(AdapterError::InvalidSpec(format!(
                    "frp only supports 'tcp' and 'udp' types, got '{}'",
                    tunnel_type
                )));
            }

            if server_addr.starts_with('[') && server_addr.ends_with(']') {
                server_addr = server_addr[1..server_addr.len() - 1].to_string();
            }
            if REJECTED_SERVER_ADDRS.contains(&server_addr.as_str()) {
                return Err(AdapterError::InvalidSpec(format!(
                    "invalid frp server_addr '{}': must be a reachable server address",
                    server_addr
                )));
            }

            let mut config = format!(
                "serverAddr: \"{}\"\nserverPort: {}\n",
                server_addr, server_port
            );
            if let Some(token) = &token {
                config.push_str(&format!(
                    "auth:\n  method: token\n  token: \"{}\"\n",
                    token
                ));
            }
            config.push_str(&format!(
                "\nproxies:\n  - name: {}\n    type: {}\n    localIP: {}\n    localPort: {}\n    remotePort: {}\n",
                tunnel_id, tunnel_type, local_ip, local_port, remote_port
            ));

            let config_path = self.config_dir.join(format!("frpc_{}.yaml", tunnel_id));
            fs::write(&config_path, &config)?;
            info!(
                tunnel_id,
                %tunnel_type,
                local = %format!("{}:{}", local_ip, local_port),
                remote_port,
                server = %format!("{}:{}", server_addr, server_port),
                "frp client config written"
            );
            (config_path, "frpc", "FRPC_BINARY")
        };

        let binary = match resolve_binary(binary_name, env_var) {
            Ok(binary) => binary,
            Err(err) => {
                let _ = fs::remove_file(&config_path);
                return Err(err.into());
            }
        };

        let log_path = self.config_dir.join(format!("{}.log", tunnel_id));
        let log = open_log(
            &log_path,
            &[
                format!("Starting {} for tunnel {}", binary_name, tunnel_id),
                format!("Config path: {}", config_path.display()),
            ],
        )?;

        let config_arg = config_path.display().to_string();
        let mut child = match spawn_logged(
            binary_name,
            &binary,
            &["-c", &config_arg],
            &self.config_dir,
            &log,
        ) {
            Ok(child) => child,
            Err(err) => {
                let _ = fs::remove_file(&config_path);
                return Err(err.into());
            }
        };

        if let Err(err) = verify_startup(binary_name, &mut child, &log_path, Duration::from_secs(1))
        {
            let _ = fs::remove_file(&config_path);
            return Err(err.into());
        }

        self.processes.insert(tunnel_id.to_string(), child);
        self.log_files.insert(tunnel_id.to_string(), log);
        Ok(())
    }

    pub fn remove(&mut self, tunnel_id: &str) {
        if let Some(mut child) = self.processes.remove(tunnel_id) {
            stop_child("frp", &mut child, Duration::from_secs(5));
        }
        self.log_files.remove(tunnel_id);
        pkill_pattern(&format!("frp.*{}", tunnel_id));

        for prefix in ["frpc", "frps"] {
            let config_path = self.config_dir.join(format!("{}_{}.yaml", prefix, tunnel_id));
            if config_path.exists() {
                let _ = fs::remove_file(&config_path);
            }
        }
    }

    pub fn status(&mut self, tunnel_id: &str) -> TunnelStatus {
        let config_exists = ["frpc", "frps"].iter().any(|prefix| {
            self.config_dir
                .join(format!("{}_{}.yaml", prefix, tunnel_id))
                .exists()
        });

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
            core: "frp".to_string(),
            config_exists,
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
    fn client_rejects_loopback_server_addr() {
        let dir = tempdir().unwrap();
        let mut adapter = FrpAdapter::new(dir.path()).unwrap();

        for addr in ["0.0.0.0", "localhost", "127.0.0.1", "::1"] {
            let err = adapter
                .apply(
                    "t1",
                    &spec(json!({
                        "mode": "client",
                        "server_addr": addr,
                        "local_port": 9000,
                        "remote_port": 7100
                    })),
                )
                .unwrap_err();
            assert!(err.to_string().contains("server_addr"), "addr {}", addr);
        }
    }

    #[test]
    fn client_rejects_non_tcp_udp_types() {
        let dir = tempdir().unwrap();
        let mut adapter = FrpAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply(
                "t1",
                &spec(json!({
                    "mode": "client",
                    "server_addr": "198.51.100.7",
                    "type": "ws",
                    "local_port": 9000,
                    "remote_port": 7100
                })),
            )
            .unwrap_err();
        assert!(err.to_string().contains("tcp"));
    }

    #[test]
    fn client_requires_ports() {
        let dir = tempdir().unwrap();
        let mut adapter = FrpAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply(
                "t1",
                &spec(json!({"mode": "client", "server_addr": "198.51.100.7", "local_port": 9000})),
            )
            .unwrap_err();
        assert!(err.to_string().contains("remote_port"));

        let err = adapter
            .apply(
                "t1",
                &spec(json!({"mode": "client", "server_addr": "198.51.100.7", "remote_port": 7100})),
            )
            .unwrap_err();
        assert!(err.to_string().contains("local_port"));
    }

    #[test]
    fn bracketed_loopback_is_still_rejected() {
        let dir = tempdir().unwrap();
        let mut adapter = FrpAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply(
                "t1",
                &spec(json!({
                    "mode": "client",
                    "server_addr": "[::1]",
                    "local_port": 9000,
                    "remote_port": 7100
                })),
            )
            .unwrap_err();
        assert!(err.to_string().contains("server_addr"));
    }
}
