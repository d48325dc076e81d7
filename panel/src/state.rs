//! Shared panel state handed to every router and background task.

use std::sync::{Arc, Mutex};

use crate::config::Settings;
use crate::forwarder::PortForwarder;
use crate::node_client::NodeClient;
use crate::servers::PanelServers;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<Store>>,
    pub node_client: NodeClient,
    pub servers: Arc<Mutex<PanelServers>>,
    pub forwarder: Arc<tokio::sync::Mutex<PortForwarder>>,
    pub settings: Arc<Settings>,
}
