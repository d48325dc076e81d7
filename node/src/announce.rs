//! Node self-announce: register with the panel at startup so tunnels can be
//! dispatched without manual node creation. Registration failures are never
//! fatal — the panel can still add the node by hand.

use std::net::UdpSocket;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use smite_common::api::NodeRegistration;

use crate::config::Settings;

/// IP of the default outbound interface, discovered by "connecting" a UDP
/// socket to a public resolver. No packet is sent.
pub fn detect_primary_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|sock| {
            sock.connect("8.8.8.8:80")?;
            sock.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

pub async fn register_with_panel(settings: &Settings) {
    let Some(panel_address) = &settings.panel_address else {
        info!("PANEL_ADDRESS not set, skipping self-announce");
        return;
    };

    let ip_address = detect_primary_ip();
    let mut metadata = Map::new();
    metadata.insert(
        "role".to_string(),
        Value::String(settings.role.as_str().to_string()),
    );
    metadata.insert(
        "api_port".to_string(),
        Value::Number(settings.api_port.into()),
    );
    metadata.insert(
        "panel_address".to_string(),
        Value::String(panel_address.clone()),
    );

    let body = NodeRegistration {
        name: settings.node_name.clone(),
        ip_address,
        api_port: settings.api_port,
        metadata,
    };

    let url = format!("{}/api/nodes", panel_address);
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "failed to build panel client, skipping self-announce");
            return;
        }
    };

    for attempt in 1..=3u32 {
        match client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!(panel = %panel_address, name = %body.name, "registered with panel");
                return;
            }
            Ok(response) => {
                warn!(
                    panel = %panel_address,
                    status = %response.status(),
                    attempt,
                    "panel rejected registration"
                );
                // A 409 means the fingerprint exists with another role;
                // retrying will not change the answer.
                if response.status().as_u16() == 409 {
                    return;
                }
            }
            Err(err) => {
                warn!(panel = %panel_address, attempt, error = %err, "panel unreachable");
            }
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    warn!("could not register with panel; continuing, manual registration may be needed");
}
