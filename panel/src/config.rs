//! Panel settings, read once from the environment at startup.

use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Port the panel API listens on. Tunnels must not claim it.
    pub api_port: u16,
    /// Directory holding `state.json` and panel-local core configs.
    pub data_dir: PathBuf,
    /// Public address of the panel host, used as the last resort when
    /// synthesising the server address clients must dial.
    pub public_ip: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        let api_port = env::var("PANEL_API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);

        let data_dir = env::var("PANEL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/smite-panel"));

        let public_ip = env::var("PANEL_PUBLIC_IP")
            .or_else(|_| env::var("PANEL_IP"))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Settings {
            api_port,
            data_dir,
            public_ip,
        }
    }
}
