//! HTTP client for panel→node dispatch.
//!
//! All failures fold into an `AgentReply` with `status = "error"` so the
//! orchestrator can treat transport problems and node-reported problems
//! uniformly. Control calls get 30 s; the lightweight status probe 10 s.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use smite_common::api::AgentReply;

use crate::store::NodeRow;

/// Connection state synthesised from a live probe of the node API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct NodeClient {
    client: reqwest::Client,
    probe_client: reqwest::Client,
}

impl Default for NodeClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        let probe_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        NodeClient {
            client,
            probe_client,
        }
    }

    pub async fn post(&self, node: &NodeRow, endpoint: &str, body: &impl Serialize) -> AgentReply {
        let url = format!("{}{}", node.api_address(), endpoint);
        debug!(node = %node.id, %url, "dispatching to node");

        let response = match self.client.post(&url).json(body).send().await {
            Ok(response) => response,
            Err(err) => return AgentReply::error(format!("network error: {}", err)),
        };

        let status = response.status();
        match response.json::<AgentReply>().await {
            Ok(reply) => reply,
            Err(_) if status.is_success() => AgentReply::success(""),
            Err(_) => AgentReply::error(format!("node error (HTTP {})", status.as_u16())),
        }
    }

    pub async fn get(&self, node: &NodeRow, endpoint: &str) -> Result<Value, String> {
        let url = format!("{}{}", node.api_address(), endpoint);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("network error: {}", err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("node error (HTTP {})", status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| format!("invalid node response: {}", err))
    }

    /// Probe `/api/agent/status` and classify the outcome the way the UI
    /// expects: connect failures read as "connecting", timeouts as
    /// "reconnecting", anything else unhealthy as "failed".
    pub async fn probe(&self, node: &NodeRow) -> ConnectionStatus {
        let url = format!("{}/api/agent/status", node.api_address());

        match self.probe_client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<Value>().await {
                    Ok(body) if body.get("status").and_then(Value::as_str) == Some("ok") => {
                        ConnectionStatus::Connected
                    }
                    _ => ConnectionStatus::Failed,
                }
            }
            Ok(_) => ConnectionStatus::Failed,
            Err(err) if err.is_connect() => ConnectionStatus::Connecting,
            Err(err) if err.is_timeout() => ConnectionStatus::Reconnecting,
            Err(_) => ConnectionStatus::Failed,
        }
    }
}
