//! Backhaul reverse-tunnel adapter.
//!
//! Backhaul takes a single-section TOML config; the option surface differs
//! between server and client, so each side copies only its enumerated keys
//! out of the spec. The TOML is rendered by a small typed serializer that
//! quotes strings, escapes backslashes and quotes, and emits list syntax.

use std::collections::HashMap;
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Duration;

use serde_json::Value;
use smite_common::api::TunnelStatus;
use smite_common::spec::{Spec, SpecExt};
use tracing::info;

use super::AdapterError;
use crate::process::{
    open_log, pkill_pattern, read_log_tail, resolve_binary, spawn_logged, stop_child,
    verify_startup,
};

const TRANSPORTS: [&str; 5] = ["tcp", "udp", "ws", "wsmux", "tcpmux"];

const SERVER_OPTION_KEYS: [&str; 13] = [
    "nodelay",
    "keepalive_period",
    "channel_size",
    "log_level",
    "heartbeat",
    "mux_con",
    "accept_udp",
    "skip_optz",
    "tls_cert",
    "tls_key",
    "sniffer",
    "web_port",
    "proxy_protocol",
];

const CLIENT_OPTION_KEYS: [&str; 22] = [
    "connection_pool",
    "retry_interval",
    "nodelay",
    "keepalive_period",
    "log_level",
    "pprof",
    "mux_session",
    "mux_version",
    "mux_framesize",
    "mux_recievebuffer",
    "mux_streambuffer",
    "sniffer",
    "web_port",
    "sniffer_log",
    "dial_timeout",
    "aggressive_pool",
    "edge_ip",
    "skip_optz",
    "mss",
    "so_rcvbuf",
    "so_sndbuf",
    "accept_udp",
];

/// One TOML value as backhaul understands them.
#[derive(Debug, Clone)]
enum TomlValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
}

impl TomlValue {
    /// Lift a JSON spec value; nulls and empty strings are dropped so the
    /// rendered config never carries `key = ""` placeholders.
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(TomlValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(TomlValue::Int(i))
                } else {
                    n.as_f64().map(TomlValue::Float)
                }
            }
            Value::String(s) if !s.trim().is_empty() => Some(TomlValue::Str(s.clone())),
            Value::Array(items) => {
                let strings: Vec<String> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => None,
                    })
                    .collect();
                Some(TomlValue::List(strings))
            }
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            TomlValue::Bool(b) => b.to_string(),
            TomlValue::Int(i) => i.to_string(),
            TomlValue::Float(f) => f.to_string(),
            TomlValue::Str(s) => format!("\"{}\"", escape(s)),
            TomlValue::List(items) => {
                if items.is_empty() {
                    "[]".to_string()
                } else {
                    let rendered: Vec<String> =
                        items.iter().map(|s| format!("\"{}\"", escape(s))).collect();
                    format!("[\n  {}\n]", rendered.join(",\n  "))
                }
            }
        }
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn render_toml(section: &str, entries: &[(String, TomlValue)]) -> String {
    let mut lines = vec![format!("[{}]", section)];
    for (key, value) in entries {
        lines.push(format!("{} = {}", key, value.render()));
    }
    lines.join("\n") + "\n"
}

pub struct BackhaulAdapter {
    config_dir: PathBuf,
    processes: HashMap<String, Child>,
    log_files: HashMap<String, File>,
}

impl BackhaulAdapter {
    pub fn new(config_root: &Path) -> Result<Self, AdapterError> {
        let config_dir = env::var("SMITE_BACKHAUL_CLIENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_root.join("backhaul"));
        fs::create_dir_all(&config_dir)?;
        Ok(BackhaulAdapter {
            config_dir,
            processes: HashMap::new(),
            log_files: HashMap::new(),
        })
    }

    pub fn apply(&mut self, tunnel_id: &str, spec: &Spec) -> Result<(), AdapterError> {
        if self.processes.contains_key(tunnel_id) {
            info!(tunnel_id, "backhaul tunnel already exists, removing it first");
            self.remove(tunnel_id);
        }

        let mode = spec
            .str_at(&["mode"])
            .unwrap_or_else(|| "client".to_string());

        let transport = spec
            .str_at(&["transport", "type"])
            .unwrap_or_else(|| "tcp".to_string())
            .to_ascii_lowercase();
        if !TRANSPORTS.contains(&transport.as_str()) {
            return Err(AdapterError::InvalidSpec(format!(
                "unsupported backhaul transport '{}'",
                transport
            )));
        }

        let config_content = if mode == "server" {
            self.render_server(spec, &transport)?
        } else {
            self.render_client(spec, &transport)?
        };

        let binary = resolve_binary("backhaul", "BACKHAUL_CLIENT_BINARY")?;

        let config_path = self.config_dir.join(format!("{}.toml", tunnel_id));
        fs::write(&config_path, &config_content)?;
        info!(tunnel_id, config = %config_path.display(), "backhaul config written");

        let log_path = self.config_dir.join(format!("backhaul_{}.log", tunnel_id));
        let log = open_log(
            &log_path,
            &[
                format!("Starting backhaul {} for tunnel {}", mode, tunnel_id),
                format!("Config path: {}", config_path.display()),
                format!("Binary path: {}", binary.display()),
                config_content.clone(),
            ],
        )?;

        let config_arg = config_path.display().to_string();
        let mut child = match spawn_logged(
            "backhaul",
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

        if let Err(err) = verify_startup("backhaul", &mut child, &log_path, Duration::from_secs(1)) {
            let _ = fs::remove_file(&config_path);
            return Err(err.into());
        }

        self.processes.insert(tunnel_id.to_string(), child);
        self.log_files.insert(tunnel_id.to_string(), log);
        info!(tunnel_id, mode, "backhaul tunnel started");
        Ok(())
    }

    fn render_server(&self, spec: &Spec, transport: &str) -> Result<String, AdapterError> {
        let server_options = spec
            .get("server_options")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let bind_addr = spec.str_at(&["bind_addr"]).unwrap_or_else(|| {
            let control_port = spec
                .port_at(&["control_port", "listen_port"])
                .unwrap_or(3080);
            let bind_ip = spec
                .str_at(&["bind_ip"])
                .unwrap_or_else(|| "0.0.0.0".to_string());
            format!("{}:{}", bind_ip, control_port)
        });

        let ports = match spec.get("ports").and_then(|v| TomlValue::from_json(v)) {
            Some(TomlValue::List(list)) if !list.is_empty() => list,
            _ => {
                // Synthesize a single `listen=target` mapping when no
                // explicit list was given.
                let listen_port = spec.port_at(&["public_port", "listen_port"]);
                let target_addr = spec.str_at(&["target_addr"]).or_else(|| {
                    let target_host = spec
                        .str_at(&["target_host"])
                        .unwrap_or_else(|| "127.0.0.1".to_string());
                    spec.port_at(&["target_port"])
                        .or(listen_port)
                        .map(|port| format!("{}:{}", target_host, port))
                });
                match (listen_port, target_addr) {
                    (Some(listen), Some(target)) => vec![format!("{}={}", listen, target)],
                    (Some(listen), None) => vec![listen.to_string()],
                    _ => Vec::new(),
                }
            }
        };

        let mut entries: Vec<(String, TomlValue)> = vec![
            ("bind_addr".into(), TomlValue::Str(bind_addr)),
            ("transport".into(), TomlValue::Str(transport.to_string())),
            ("ports".into(), TomlValue::List(ports)),
        ];

        if let Some(token) = spec.str_at(&["token"]).or_else(|| {
            server_options
                .get("token")
                .and_then(Value::as_str)
                .map(str::to_string)
        }) {
            entries.push(("token".into(), TomlValue::Str(token)));
        }

        for key in SERVER_OPTION_KEYS {
            let value = server_options.get(key).or_else(|| spec.get(key));
            if let Some(toml_value) = value.and_then(TomlValue::from_json) {
                entries.push((key.to_string(), toml_value));
            }
        }

        Ok(render_toml("server", &entries))
    }

    fn render_client(&self, spec: &Spec, transport: &str) -> Result<String, AdapterError> {
        let mut remote_addr = spec
            .str_at(&["remote_addr", "control_addr", "bind_addr"])
            .ok_or_else(|| {
                AdapterError::InvalidSpec("backhaul client requires 'remote_addr'".into())
            })?;
        if let Some(stripped) = remote_addr.strip_prefix("ws://") {
            remote_addr = stripped.to_string();
        } else if let Some(stripped) = remote_addr.strip_prefix("wss://") {
            remote_addr = stripped.to_string();
        }

        let client_options = spec
            .get("client_options")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut entries: Vec<(String, TomlValue)> = vec![
            ("remote_addr".into(), TomlValue::Str(remote_addr)),
            ("transport".into(), TomlValue::Str(transport.to_string())),
        ];

        if let Some(token) = spec.str_at(&["token"]).or_else(|| {
            client_options
                .get("token")
                .and_then(Value::as_str)
                .map(str::to_string)
        }) {
            entries.push(("token".into(), TomlValue::Str(token)));
        }

        let mut seen: Vec<&str> = Vec::new();
        for key in CLIENT_OPTION_KEYS {
            let value = client_options.get(key).or_else(|| spec.get(key));
            if let Some(toml_value) = value.and_then(TomlValue::from_json) {
                entries.push((key.to_string(), toml_value));
                seen.push(key);
            }
        }

        if !seen.contains(&"connection_pool") {
            entries.push(("connection_pool".into(), TomlValue::Int(4)));
        }
        if !seen.contains(&"retry_interval") {
            entries.push(("retry_interval".into(), TomlValue::Int(3)));
        }
        if !seen.contains(&"dial_timeout") {
            entries.push(("dial_timeout".into(), TomlValue::Int(10)));
        }

        // accept_udp only makes sense when a TCP stream carries the UDP
        // frames.
        if spec.bool_at(&["accept_udp"])
            && matches!(transport, "tcp" | "tcpmux")
            && !seen.contains(&"accept_udp")
        {
            entries.push(("accept_udp".into(), TomlValue::Bool(true)));
        }

        Ok(render_toml("client", &entries))
    }

    pub fn remove(&mut self, tunnel_id: &str) {
        if let Some(mut child) = self.processes.remove(tunnel_id) {
            stop_child("backhaul", &mut child, Duration::from_secs(5));
        }
        self.log_files.remove(tunnel_id);
        pkill_pattern(&format!("backhaul.*{}", tunnel_id));

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

        let log_path = self.config_dir.join(format!("backhaul_{}.log", tunnel_id));
        let log_tail = match read_log_tail(&log_path, 500) {
            tail if tail.is_empty() => None,
            tail => Some(tail),
        };

        TunnelStatus {
            active: config_exists && process_running,
            core: "backhaul".to_string(),
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

    fn spec(value: Value) -> Spec {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn toml_renderer_quotes_and_escapes() {
        let entries = vec![
            ("bind_addr".to_string(), TomlValue::Str("0.0.0.0:3080".into())),
            ("token".to_string(), TomlValue::Str("a\"b\\c".into())),
            ("nodelay".to_string(), TomlValue::Bool(true)),
            ("channel_size".to_string(), TomlValue::Int(2048)),
            (
                "ports".to_string(),
                TomlValue::List(vec!["443=127.0.0.1:443".into(), "80=127.0.0.1:80".into()]),
            ),
        ];
        let rendered = render_toml("server", &entries);
        assert!(rendered.starts_with("[server]\n"));
        assert!(rendered.contains("bind_addr = \"0.0.0.0:3080\""));
        assert!(rendered.contains("token = \"a\\\"b\\\\c\""));
        assert!(rendered.contains("nodelay = true"));
        assert!(rendered.contains("channel_size = 2048"));
        assert!(rendered.contains("ports = [\n  \"443=127.0.0.1:443\",\n  \"80=127.0.0.1:80\"\n]"));
    }

    #[test]
    fn server_config_builds_bind_addr_from_parts() {
        let dir = tempdir().unwrap();
        let adapter = BackhaulAdapter::new(dir.path()).unwrap();
        let rendered = adapter
            .render_server(
                &spec(json!({
                    "mode": "server",
                    "control_port": 3090,
                    "listen_port": 443,
                    "target_addr": "127.0.0.1:8443",
                    "token": "tk",
                    "nodelay": true
                })),
                "tcp",
            )
            .unwrap();
        assert!(rendered.contains("bind_addr = \"0.0.0.0:3090\""));
        assert!(rendered.contains("\"443=127.0.0.1:8443\""));
        assert!(rendered.contains("token = \"tk\""));
        assert!(rendered.contains("nodelay = true"));
    }

    #[test]
    fn client_config_gets_defaults_and_strips_scheme() {
        let dir = tempdir().unwrap();
        let adapter = BackhaulAdapter::new(dir.path()).unwrap();
        let rendered = adapter
            .render_client(
                &spec(json!({
                    "mode": "client",
                    "remote_addr": "wss://relay.example.net:3080"
                })),
                "tcp",
            )
            .unwrap();
        assert!(rendered.contains("remote_addr = \"relay.example.net:3080\""));
        assert!(rendered.contains("connection_pool = 4"));
        assert!(rendered.contains("retry_interval = 3"));
        assert!(rendered.contains("dial_timeout = 10"));
    }

    #[test]
    fn accept_udp_only_applies_to_tcp_transports() {
        let dir = tempdir().unwrap();
        let adapter = BackhaulAdapter::new(dir.path()).unwrap();
        let base = json!({"mode": "client", "remote_addr": "1.2.3.4:3080", "accept_udp": true});

        let tcp = adapter.render_client(&spec(base.clone()), "tcp").unwrap();
        assert!(tcp.contains("accept_udp = true"));

        let ws = adapter.render_client(&spec(base), "ws").unwrap();
        assert!(!ws.contains("accept_udp"));
    }

    #[test]
    fn rejects_unknown_transport() {
        let dir = tempdir().unwrap();
        let mut adapter = BackhaulAdapter::new(dir.path()).unwrap();
        let err = adapter
            .apply(
                "t1",
                &spec(json!({"mode": "server", "transport": "quic", "listen_port": 443})),
            )
            .unwrap_err();
        assert!(err.to_string().contains("transport"));
    }
}
