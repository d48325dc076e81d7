//! Rathole reverse-tunnel adapter.

use std::collections::HashMap;
use std::fs::{self, File};
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

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:23333";

pub struct RatholeAdapter {
    config_dir: PathBuf,
    processes: HashMap<String, Child>,
    log_files: HashMap<String, File>,
}

impl RatholeAdapter {
    pub fn new(config_root: &Path) -> Result<Self, AdapterError> {
        let config_dir = config_root.join("rathole");
        fs::create_dir_all(&config_dir)?;
        Ok(RatholeAdapter {
            config_dir,
            processes: HashMap::new(),
            log_files: HashMap::new(),
        })
    }

    pub fn apply(&mut self, tunnel_id: &str, spec: &Spec) -> Result<(), AdapterError> {
        if self.processes.contains_key(tunnel_id) {
            info!(tunnel_id, "rathole tunnel already exists, removing it first");
            self.remove(tunnel_id);
        }

        let mode = spec
            .str_at(&["mode"])
            .unwrap_or_else(|| "client".to_string());

        let transport = spec
            .str_at(&["transport", "type"])
            .unwrap_or_else(|| "tcp".to_string())
            .to_ascii_lowercase();
        let use_websocket = transport == "websocket" || transport == "ws";
        let mut websocket_tls = spec.bool_at(&["websocket_tls", "tls"]);

        let (config, mode_flag) = if mode == "server" {
            let token = spec
                .str_at(&["token"])
                .ok_or_else(|| AdapterError::InvalidSpec("rathole server requires 'token'".into()))?;
            let proxy_port = spec
                .port_at(&["proxy_port", "remote_port", "listen_port"])
                .ok_or_else(|| {
                    AdapterError::InvalidSpec(
                        "rathole server requires 'proxy_port' or 'remote_port'".into(),
                    )
                })?;

            let bind_addr = spec
                .str_at(&["bind_addr"])
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
            let parsed = parse_address_port(&bind_addr);
            let (bind_host, bind_port) = match parsed.port {
                Some(port) => (parsed.host, port),
                None => ("0.0.0.0".to_string(), 23333),
            };

            let mut config = format!(
                "[server]\nbind_addr = \"{}:{}\"\ndefault_token = \"{}\"\n",
                bind_host, bind_port, token
            );
            if use_websocket {
                config.push_str("\n[server.transport]\ntype = \"websocket\"\n\n[server.transport.websocket]\n");
                if websocket_tls {
                    config.push_str("tls = true\n");
                }
            }
            config.push_str(&format!(
                "\n[server.services.{}]\nbind_addr = \"0.0.0.0:{}\"\n",
                tunnel_id, proxy_port
            ));
            (config, "-s")
        } else {
            let mut remote_addr = spec.str_at(&["remote_addr"]).ok_or_else(|| {
                AdapterError::InvalidSpec("rathole client requires 'remote_addr'".into())
            })?;
            let token = spec
                .str_at(&["token"])
                .ok_or_else(|| AdapterError::InvalidSpec("rathole client requires 'token'".into()))?;
            let local_addr = spec
                .str_at(&["local_addr"])
                .unwrap_or_else(|| "127.0.0.1:8080".to_string());

            if let Some(stripped) = remote_addr.strip_prefix("ws://") {
                remote_addr = stripped.to_string();
            } else if let Some(stripped) = remote_addr.strip_prefix("wss://") {
                remote_addr = stripped.to_string();
                websocket_tls = true;
            }

            let mut config = format!(
                "[client]\nremote_addr = \"{}\"\ndefault_token = \"{}\"\n",
                remote_addr, token
            );
            if use_websocket {
                config.push_str("\n[client.transport]\ntype = \"websocket\"\n\n[client.transport.websocket]\n");
                if websocket_tls {
                    config.push_str("tls = true\n");
                }
            }
            config.push_str(&format!(
                "\n[client.services.{}]\nlocal_addr = \"{}\"\n",
                tunnel_id, local_addr
            ));
            (config, "-c")
        };

        let binary = resolve_binary("rathole", "RATHOLE_BINARY")?;

        let config_path = self.config_dir.join(format!("{}.toml", tunnel_id));
        fs::write(&config_path, &config)?;

        let log_path = self.config_dir.join(format!("rathole_{}.log", tunnel_id));
        let log = open_log(
            &log_path,
            &[
                format!("Starting rathole {} for tunnel {}", mode, tunnel_id),
                format!("Config path: {}", config_path.display()),
            ],
        )?;

        let config_arg = config_path.display().to_string();
        let mut child = match spawn_logged(
            "rathole",
            &binary,
            &[mode_flag, &config_arg],
            &self.config_dir,
            &log,
        ) {
            Ok(child) => child,
            Err(err) => {
                let _ = fs::remove_file(&config_path);
                return Err(err.into());
            }
        };

        if let Err(err) = verify_startup("rathole", &mut child, &log_path, Duration::from_secs(1)) {
            let _ = fs::remove_file(&config_path);
            return Err(err.into());
        }

        self.processes.insert(tunnel_id.to_string(), child);
        self.log_files.insert(tunnel_id.to_string(), log);
        Ok(())
    }

    pub fn remove(&mut self, tunnel_id: &str) {
        if let Some(mut child) = self.processes.remove(tunnel_id) {
            stop_child("rathole", &mut child, Duration::from_secs(5));
        }
        self.log_files.remove(tunnel_id);
        pkill_pattern(&format!("rathole.*{}", tunnel_id));

        let config_path = self.config_dir.join(format!("{}.toml", tunnel_id));
        if config_path.exists() {
            let _ = fs::remove_file(&config_path);
        }
    }

    pub fn status(&mut self, tunnel_id: &str) -> TunnelStatus {
        let config_path = self.config_dir.join(format!("{}.toml", tunnel_id));
        let config_exists = config_path.exists();

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

        let log_path = self.config_dir.join(format!("rathole_{}.log", tunnel_id));
        let log_tail = match read_log_tail(&log_path, 500) {
            tail if tail.is_empty() => None,
            tail => Some(tail),
        };

        TunnelStatus {
            active: config_exists && process_running,
            core: "rathole".to_string(),
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
    fn server_spec_requires_token_and_port() {
        let dir = tempdir().unwrap();
        let mut adapter = RatholeAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply("t1", &spec(json!({"mode": "server", "proxy_port": 9000})))
            .unwrap_err();
        assert!(err.to_string().contains("token"));

        let err = adapter
            .apply("t1", &spec(json!({"mode": "server", "token": "s3cret"})))
            .unwrap_err();
        assert!(err.to_string().contains("proxy_port"));
    }

    #[test]
    fn client_spec_requires_remote_addr() {
        let dir = tempdir().unwrap();
        let mut adapter = RatholeAdapter::new(dir.path()).unwrap();

        let err = adapter
            .apply("t1", &spec(json!({"mode": "client", "token": "s3cret"})))
            .unwrap_err();
        assert!(err.to_string().contains("remote_addr"));
    }
}
