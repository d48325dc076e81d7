//! Panel-local core server managers.
//!
//! When the panel itself is the server endpoint of a tunnel (rathole,
//! backhaul, chisel, frps), one helper process per tunnel runs on the panel
//! host under the same supervision discipline as the node adapters:
//! per-core config directory, log capture, start-and-verify, and
//! terminate-then-kill on stop.

use std::collections::HashMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::net::TcpStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use smite_common::spec::{Spec, SpecExt};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("{name} binary not found; set {env_var} or install it under /usr/local/bin")]
    BinaryNotFound { name: String, env_var: String },
    #[error("failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} exited immediately after start: {log_tail}")]
    EarlyExit { name: String, log_tail: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct PanelServers {
    config_dir: PathBuf,
    processes: HashMap<String, Child>,
    log_files: HashMap<String, File>,
}

fn key(core: &str, tunnel_id: &str) -> String {
    format!("{}:{}", core, tunnel_id)
}

impl PanelServers {
    pub fn new(data_dir: &Path) -> Result<Self, ServerError> {
        let config_dir = data_dir.join("servers");
        fs::create_dir_all(&config_dir)?;
        Ok(PanelServers {
            config_dir,
            processes: HashMap::new(),
            log_files: HashMap::new(),
        })
    }

    /// Start the panel-side server process for a tunnel and return the port
    /// remote clients must dial.
    pub fn start_server(
        &mut self,
        core: &str,
        tunnel_id: &str,
        spec: &Spec,
    ) -> Result<u16, ServerError> {
        if self.processes.contains_key(&key(core, tunnel_id)) {
            warn!(core, tunnel_id, "panel server already exists, stopping it first");
            self.stop_server(core, tunnel_id);
        }

        match core {
            "frp" => self.start_frps(tunnel_id, spec),
            "rathole" => self.start_rathole(tunnel_id, spec),
            "backhaul" => self.start_backhaul(tunnel_id, spec),
            "chisel" => self.start_chisel(tunnel_id, spec),
            other => Err(ServerError::InvalidSpec(format!(
                "no panel-side server for core '{}'",
                other
            ))),
        }
    }

    fn start_frps(&mut self, tunnel_id: &str, spec: &Spec) -> Result<u16, ServerError> {
        let bind_port = spec.port_at(&["bind_port"]).unwrap_or(7000);
        let token = spec.str_at(&["token"]);

        let mut config = format!("bindPort: {}\n", bind_port);
        if let Some(token) = &token {
            config.push_str(&format!("auth:\n  method: token\n  token: \"{}\"\n", token));
        }

        let config_path = self.config_dir.join(format!("frps_{}.yaml", tunnel_id));
        fs::write(&config_path, &config)?;

        let config_arg = config_path.display().to_string();
        self.launch(
            "frp",
            tunnel_id,
            "frps",
            "FRPS_BINARY",
            &["-c", &config_arg],
            Some(bind_port),
        )?;
        Ok(bind_port)
    }

    fn start_rathole(&mut self, tunnel_id: &str, spec: &Spec) -> Result<u16, ServerError> {
        let token = spec.str_at(&["token"]).ok_or_else(|| {
            ServerError::InvalidSpec("rathole server requires 'token'".into())
        })?;
        let proxy_port = spec
            .port_at(&["proxy_port", "remote_port", "listen_port"])
            .ok_or_else(|| {
                ServerError::InvalidSpec("rathole server requires 'proxy_port'".into())
            })?;
        let control_port = spec.port_at(&["control_port", "bind_port"]).unwrap_or(23333);

        let config = format!(
            "[server]\nbind_addr = \"0.0.0.0:{}\"\ndefault_token = \"{}\"\n\n[server.services.{}]\nbind_addr = \"0.0.0.0:{}\"\n",
            control_port, token, tunnel_id, proxy_port
        );
        let config_path = self.config_dir.join(format!("rathole_{}.toml", tunnel_id));
        fs::write(&config_path, &config)?;

        let config_arg = config_path.display().to_string();
        self.launch(
            "rathole",
            tunnel_id,
            "rathole",
            "RATHOLE_BINARY",
            &["-s", &config_arg],
            Some(control_port),
        )?;
        Ok(control_port)
    }

    fn start_backhaul(&mut self, tunnel_id: &str, spec: &Spec) -> Result<u16, ServerError> {
        let transport = spec
            .str_at(&["transport", "type"])
            .unwrap_or_else(|| "tcp".to_string())
            .to_ascii_lowercase();
        let control_port = spec.port_at(&["control_port", "listen_port"]).unwrap_or(3080);
        let bind_addr = spec
            .str_at(&["bind_addr"])
            .unwrap_or_else(|| format!("0.0.0.0:{}", control_port));

        let mut config = format!(
            "[server]\nbind_addr = \"{}\"\ntransport = \"{}\"\nports = []\n",
            bind_addr, transport
        );
        if let Some(token) = spec.str_at(&["token"]) {
            config.push_str(&format!("token = \"{}\"\n", token));
        }

        let backhaul_dir = env::var("SMITE_BACKHAUL_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.config_dir.clone());
        fs::create_dir_all(&backhaul_dir)?;
        let config_path = backhaul_dir.join(format!("backhaul_{}.toml", tunnel_id));
        fs::write(&config_path, &config)?;

        // UDP transports cannot be verified with a TCP connect probe.
        let verify_port = if transport == "udp" {
            None
        } else {
            Some(control_port)
        };

        let config_arg = config_path.display().to_string();
        self.launch(
            "backhaul",
            tunnel_id,
            "backhaul",
            "BACKHAUL_SERVER_BINARY",
            &["-c", &config_arg],
            verify_port,
        )?;
        Ok(control_port)
    }

    fn start_chisel(&mut self, tunnel_id: &str, spec: &Spec) -> Result<u16, ServerError> {
        let server_port = spec
            .port_at(&["server_port", "control_port", "listen_port"])
            .ok_or_else(|| {
                ServerError::InvalidSpec("chisel server requires 'server_port'".into())
            })?;

        let port_arg = server_port.to_string();
        let mut args: Vec<String> = vec![
            "server".into(),
            "--host".into(),
            "0.0.0.0".into(),
            "--port".into(),
            port_arg,
            "--reverse".into(),
        ];
        if let Some(auth) = spec.str_at(&["auth"]) {
            args.push("--auth".into());
            args.push(auth);
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.launch(
            "chisel",
            tunnel_id,
            "chisel",
            "CHISEL_BINARY",
            &arg_refs,
            Some(server_port),
        )?;
        Ok(server_port)
    }

    fn launch(
        &mut self,
        core: &str,
        tunnel_id: &str,
        binary_name: &str,
        env_var: &str,
        args: &[&str],
        verify_port: Option<u16>,
    ) -> Result<(), ServerError> {
        let binary = resolve_binary(binary_name, env_var)?;

        let log_path = self
            .config_dir
            .join(format!("{}_{}.log", binary_name, tunnel_id));
        let mut log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
        writeln!(
            log,
            "Starting {} for tunnel {}\nCommand: {} {}",
            binary_name,
            tunnel_id,
            binary.display(),
            args.join(" ")
        )?;
        log.flush()?;

        let stdout = log.try_clone()?;
        let stderr = log.try_clone()?;
        let mut child = Command::new(&binary)
            .args(args)
            .current_dir(&self.config_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()
            .map_err(|source| ServerError::Spawn {
                name: binary_name.to_string(),
                source,
            })?;

        std::thread::sleep(Duration::from_secs(1));
        if let Ok(Some(_)) = child.try_wait() {
            return Err(ServerError::EarlyExit {
                name: binary_name.to_string(),
                log_tail: log_tail(&log_path, 2000),
            });
        }

        if let Some(port) = verify_port {
            let mut listening = false;
            for _ in 0..3 {
                std::thread::sleep(Duration::from_millis(500));
                if TcpStream::connect_timeout(
                    &format!("127.0.0.1:{}", port).parse().unwrap(),
                    Duration::from_secs(1),
                )
                .is_ok()
                {
                    listening = true;
                    break;
                }
                if let Ok(Some(_)) = child.try_wait() {
                    return Err(ServerError::EarlyExit {
                        name: binary_name.to_string(),
                        log_tail: log_tail(&log_path, 2000),
                    });
                }
            }
            if listening {
                info!(core, tunnel_id, port, "panel server port verified listening");
            } else {
                warn!(core, tunnel_id, port, "panel server port not verified, process still running");
            }
        }

        info!(core, tunnel_id, pid = child.id(), "panel server started");
        self.processes.insert(key(core, tunnel_id), child);
        self.log_files.insert(key(core, tunnel_id), log);
        Ok(())
    }

    pub fn stop_server(&mut self, core: &str, tunnel_id: &str) {
        let map_key = key(core, tunnel_id);
        if let Some(mut child) = self.processes.remove(&map_key) {
            terminate_then_kill(&mut child, Duration::from_secs(5));
            info!(core, tunnel_id, "panel server stopped");
        }
        self.log_files.remove(&map_key);

        for name in ["frps", "rathole", "backhaul", "chisel"] {
            for ext in ["yaml", "toml"] {
                let path = self.config_dir.join(format!("{}_{}.{}", name, tunnel_id, ext));
                if path.exists() {
                    let _ = fs::remove_file(path);
                }
            }
        }
        if let Ok(backhaul_dir) = env::var("SMITE_BACKHAUL_CONFIG_DIR") {
            let path = PathBuf::from(backhaul_dir).join(format!("backhaul_{}.toml", tunnel_id));
            if path.exists() {
                let _ = fs::remove_file(path);
            }
        }
    }

    pub fn is_running(&mut self, core: &str, tunnel_id: &str) -> bool {
        match self.processes.get_mut(&key(core, tunnel_id)) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn cleanup_all(&mut self) {
        let keys: Vec<String> = self.processes.keys().cloned().collect();
        for map_key in keys {
            if let Some((core, tunnel_id)) = map_key.split_once(':') {
                let (core, tunnel_id) = (core.to_string(), tunnel_id.to_string());
                self.stop_server(&core, &tunnel_id);
            }
        }
    }
}

fn resolve_binary(name: &str, env_var: &str) -> Result<PathBuf, ServerError> {
    if let Ok(override_path) = env::var(env_var) {
        let path = PathBuf::from(&override_path);
        if path.is_file() {
            return Ok(path);
        }
    }
    for dir in ["/usr/local/bin", "/usr/bin"] {
        let candidate = Path::new(dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(ServerError::BinaryNotFound {
        name: name.to_string(),
        env_var: env_var.to_string(),
    })
}

fn terminate_then_kill(child: &mut Child, wait: Duration) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn log_tail(path: &Path, max_bytes: usize) -> String {
    match fs::read(path) {
        Ok(bytes) => {
            let start = bytes.len().saturating_sub(max_bytes);
            String::from_utf8_lossy(&bytes[start..]).into_owned()
        }
        Err(_) => String::new(),
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
    fn unknown_core_is_rejected() {
        let dir = tempdir().unwrap();
        let mut servers = PanelServers::new(dir.path()).unwrap();
        let err = servers
            .start_server("gost", "t1", &spec(json!({})))
            .unwrap_err();
        assert!(err.to_string().contains("gost"));
    }

    #[test]
    fn rathole_server_requires_token() {
        let dir = tempdir().unwrap();
        let mut servers = PanelServers::new(dir.path()).unwrap();
        let err = servers
            .start_server("rathole", "t1", &spec(json!({"proxy_port": 9000})))
            .unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn stopping_an_unknown_server_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut servers = PanelServers::new(dir.path()).unwrap();
        servers.stop_server("frp", "nope");
        assert!(!servers.is_running("frp", "nope"));
    }
}
