//! Node agent settings, read once from the environment at startup.

use std::env;
use std::path::PathBuf;

use smite_common::api::NodeRole;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Port the agent API listens on.
    pub api_port: u16,
    /// Node name announced to the panel; defaults to the hostname.
    pub node_name: String,
    /// Role announced to the panel. Immutable after first registration.
    pub role: NodeRole,
    /// Base URL of the panel, e.g. `http://panel.example.net:8000`.
    pub panel_address: Option<String>,
    /// Directory holding `tunnels.json`.
    pub state_dir: PathBuf,
    /// Root of the per-core config trees.
    pub config_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        let api_port = env::var("NODE_API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8888);

        let node_name = env::var("NODE_NAME").unwrap_or_else(|_| {
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "smite-node".to_string())
        });

        let role = env::var("NODE_ROLE")
            .ok()
            .and_then(|v| NodeRole::parse(&v))
            .unwrap_or(NodeRole::Iran);

        let panel_address = env::var("PANEL_ADDRESS")
            .ok()
            .map(|v| v.trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());

        let state_dir = env::var("SMITE_NODE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/var/lib/smite-node"));

        let config_dir = env::var("SMITE_NODE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/etc/smite-node"));

        Settings {
            api_port,
            node_name,
            role,
            panel_address,
            state_dir,
            config_dir,
        }
    }
}
