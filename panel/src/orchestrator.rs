//! Tunnel orchestrator: node-role resolution, port planning, two-sided
//! dispatch with rollback, panel-hosted helpers, and restart
//! reconciliation.
//!
//! Dispatch order for reverse tunnels is fixed — iran (server) first, then
//! foreign (client) — so a failure at either step has a well-defined
//! rollback target. Validation happens before the skeleton row is
//! persisted; once a row exists, failures land in `status = "error"` with a
//! human-readable message instead of bubbling as 5xx.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info, warn};

use smite_common::addr::{format_address_port, is_ipv6_address, parse_address_port};
use smite_common::api::{NodeRole, TunnelApply, TunnelRemove};
use smite_common::spec::{Spec, SpecExt};

use crate::error::ApiError;
use crate::ports::frp_bind_port;
use crate::state::AppState;
use crate::store::{new_id, NodeRow, TunnelRow};

const KNOWN_CORES: [&str; 5] = ["rathole", "backhaul", "chisel", "frp", "gost"];
/// Cores whose server half runs on the panel host itself.
const PANEL_HOSTED_CORES: [&str; 3] = ["rathole", "backhaul", "chisel"];
const LOCAL_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "::1", "0.0.0.0"];

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelCreate {
    pub name: String,
    pub core: String,
    #[serde(rename = "type")]
    pub tunnel_type: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub foreign_node_id: Option<String>,
    #[serde(default)]
    pub iran_node_id: Option<String>,
    pub spec: Spec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub spec: Option<Spec>,
}

/// Host information of the incoming request, consulted when synthesising
/// the server address clients must dial.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub forwarded_host: Option<String>,
    pub request_host: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn host_part(value: &str) -> String {
    let without_scheme = value.split("://").last().unwrap_or(value);
    parse_address_port(without_scheme).host
}

fn acceptable_host(host: &str) -> bool {
    !host.is_empty() && !LOCAL_HOSTS.contains(&host)
}

/// Derive the host remote clients must reach, in strict order: the node's
/// registered address (when `prefer_node_ip`), node metadata
/// `panel_address`, `spec.panel_host`, `X-Forwarded-Host`, the request
/// host, then `PANEL_PUBLIC_IP`/`PANEL_IP`. Loopback and wildcard values
/// are rejected at every stage.
pub fn synthesize_server_host(
    state: &AppState,
    node: &NodeRow,
    spec: &Spec,
    ctx: &RequestContext,
    prefer_node_ip: bool,
) -> Result<String, ApiError> {
    let mut candidates: Vec<String> = Vec::new();

    if prefer_node_ip {
        if let Some(ip) = node.ip_address() {
            candidates.push(ip);
        }
    }
    if let Some(panel_address) = node.panel_address() {
        candidates.push(host_part(&panel_address));
    }
    if let Some(panel_host) = spec.str_at(&["panel_host"]) {
        candidates.push(host_part(&panel_host));
    }
    if let Some(forwarded) = &ctx.forwarded_host {
        candidates.push(host_part(forwarded));
    }
    if let Some(request_host) = &ctx.request_host {
        candidates.push(host_part(request_host));
    }
    if let Some(public_ip) = &state.settings.public_ip {
        candidates.push(public_ip.clone());
    }

    for candidate in candidates {
        if acceptable_host(&candidate) {
            return Ok(candidate);
        }
    }

    Err(ApiError::BadRequest(format!(
        "cannot determine a reachable server address for node '{}': \
         node metadata panel_address={:?}, spec panel_host={:?}, \
         X-Forwarded-Host={:?}, request host={:?}, PANEL_PUBLIC_IP/PANEL_IP={:?}. \
         Register the node with a public PANEL_ADDRESS or set PANEL_PUBLIC_IP on the panel.",
        node.name,
        node.panel_address(),
        spec.str_at(&["panel_host"]),
        ctx.forwarded_host,
        ctx.request_host,
        state.settings.public_ip,
    )))
}

fn dispatch_body(tunnel: &TunnelRow, spec: Spec) -> TunnelApply {
    TunnelApply {
        tunnel_id: tunnel.id.clone(),
        core: tunnel.core.clone(),
        tunnel_type: tunnel.tunnel_type.clone(),
        spec,
    }
}

/// Compose the server/client spec pair for a reverse FRP tunnel.
fn compose_frp_specs(tunnel: &TunnelRow, server_host: &str) -> (Spec, Spec, u16) {
    let bind_port = tunnel
        .spec
        .port_at(&["bind_port"])
        .unwrap_or_else(|| frp_bind_port(&tunnel.id));

    let mut server_spec = tunnel.spec.clone();
    server_spec.set_str("mode", "server");
    server_spec.set_port("bind_port", bind_port);

    let tunnel_type = match tunnel.tunnel_type.to_ascii_lowercase().as_str() {
        "udp" => "udp",
        _ => "tcp",
    };

    let server_addr = if is_ipv6_address(server_host) {
        format!("[{}]", server_host)
    } else {
        server_host.to_string()
    };

    let mut client_spec = tunnel.spec.clone();
    client_spec.set_str("mode", "client");
    client_spec.set_str("server_addr", &server_addr);
    client_spec.set_port("server_port", bind_port);
    client_spec.set_str("type", tunnel_type);

    let local_ip = client_spec
        .str_at(&["local_ip"])
        .unwrap_or_else(|| server_host.to_string());
    let local_port = client_spec.port_at(&["local_port"]).unwrap_or(bind_port);
    let remote_port = client_spec
        .port_at(&["remote_port", "listen_port"])
        .unwrap_or(bind_port);
    client_spec.set_str("local_ip", &local_ip);
    client_spec.set_port("local_port", local_port);
    client_spec.set_port("remote_port", remote_port);

    (server_spec, client_spec, bind_port)
}

/// Compose the client spec for a tunnel whose server half runs on the
/// panel (rathole, backhaul, chisel).
fn compose_panel_client_spec(tunnel: &TunnelRow, panel_host: &str) -> Result<Spec, ApiError> {
    let mut client_spec = tunnel.spec.clone();
    client_spec.set_str("mode", "client");

    match tunnel.core.as_str() {
        "rathole" => {
            let control_port = tunnel
                .spec
                .port_at(&["control_port", "bind_port"])
                .unwrap_or(23333);
            client_spec.set_str(
                "remote_addr",
                &format_address_port(panel_host, Some(control_port)),
            );
        }
        "backhaul" => {
            let control_port = tunnel
                .spec
                .port_at(&["control_port", "listen_port"])
                .unwrap_or(3080);
            client_spec.set_str(
                "remote_addr",
                &format_address_port(panel_host, Some(control_port)),
            );
        }
        "chisel" => {
            let server_port = tunnel
                .spec
                .port_at(&["server_port", "control_port", "listen_port"])
                .ok_or_else(|| {
                    ApiError::BadRequest("chisel tunnels require 'server_port' in spec".into())
                })?;
            let host = if is_ipv6_address(panel_host) {
                format!("[{}]", panel_host)
            } else {
                panel_host.to_string()
            };
            client_spec.set_str("server_url", &format!("http://{}:{}", host, server_port));
        }
        other => {
            return Err(ApiError::BadRequest(format!(
                "core '{}' has no panel-hosted server mode",
                other
            )))
        }
    }

    Ok(client_spec)
}

/// Resolve the iran/foreign pair for a reverse tunnel request. Any
/// combination of explicit ids is accepted; a missing side is inferred
/// from registered nodes by role.
fn resolve_reverse_nodes(
    state: &AppState,
    req: &TunnelCreate,
) -> Result<(NodeRow, NodeRow), ApiError> {
    let store = state.store.lock().unwrap();

    let mut iran_node: Option<NodeRow> = None;
    let mut foreign_node: Option<NodeRow> = None;

    if let Some(id) = non_empty(req.foreign_node_id.clone()) {
        let node = store
            .node(&id)
            .ok_or_else(|| ApiError::NotFound(format!("foreign node {} not found", id)))?;
        if node.role() != NodeRole::Foreign {
            return Err(ApiError::BadRequest(format!(
                "node {} is not a foreign node",
                id
            )));
        }
        foreign_node = Some(node);
    }

    if let Some(id) = non_empty(req.iran_node_id.clone()) {
        let node = store
            .node(&id)
            .ok_or_else(|| ApiError::NotFound(format!("iran node {} not found", id)))?;
        if node.role() != NodeRole::Iran {
            return Err(ApiError::BadRequest(format!(
                "node {} is not an iran node",
                id
            )));
        }
        iran_node = Some(node);
    }

    if let Some(id) = non_empty(req.node_id.clone()) {
        if iran_node.is_none() || foreign_node.is_none() {
            let node = store
                .node(&id)
                .ok_or_else(|| ApiError::NotFound(format!("node {} not found", id)))?;
            match node.role() {
                NodeRole::Foreign => {
                    foreign_node.get_or_insert(node);
                    if iran_node.is_none() {
                        iran_node = store.first_node_with_role(NodeRole::Iran);
                        if iran_node.is_none() {
                            return Err(ApiError::BadRequest(
                                "no iran node found; specify iran_node_id or register an iran node"
                                    .into(),
                            ));
                        }
                    }
                }
                NodeRole::Iran => {
                    iran_node.get_or_insert(node);
                    if foreign_node.is_none() {
                        foreign_node = store.first_node_with_role(NodeRole::Foreign);
                        if foreign_node.is_none() {
                            return Err(ApiError::BadRequest(
                                "no foreign node found; specify foreign_node_id or register a \
                                 foreign node"
                                    .into(),
                            ));
                        }
                    }
                }
            }
        }
    }

    match (iran_node, foreign_node) {
        (Some(iran), Some(foreign)) => Ok((iran, foreign)),
        _ => Err(ApiError::BadRequest(
            "both iran and foreign nodes are required for reverse tunnels; provide \
             iran_node_id and foreign_node_id, or node_id to infer the counterpart"
                .into(),
        )),
    }
}

pub async fn create_tunnel(
    state: &AppState,
    req: TunnelCreate,
    ctx: &RequestContext,
) -> Result<TunnelRow, ApiError> {
    if !KNOWN_CORES.contains(&req.core.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "unknown core '{}'",
            req.core
        )));
    }

    info!(name = %req.name, core = %req.core, tunnel_type = %req.tunnel_type, "creating tunnel");

    match req.core.as_str() {
        "frp" => create_reverse_tunnel(state, req, ctx).await,
        "gost" => create_gost_tunnel(state, req).await,
        _ => create_panel_hosted_tunnel(state, req, ctx).await,
    }
}

async fn create_reverse_tunnel(
    state: &AppState,
    req: TunnelCreate,
    ctx: &RequestContext,
) -> Result<TunnelRow, ApiError> {
    let (iran_node, foreign_node) = resolve_reverse_nodes(state, &req)?;

    // Validation before persistence: if no reachable server host exists,
    // reject without side effects.
    let server_host = synthesize_server_host(state, &iran_node, &req.spec, ctx, true)?;

    let now = Utc::now();
    let tunnel = TunnelRow {
        id: new_id(),
        name: req.name,
        core: req.core,
        tunnel_type: req.tunnel_type,
        node_id: iran_node.id.clone(),
        foreign_node_id: Some(foreign_node.id.clone()),
        spec: req.spec,
        status: "pending".to_string(),
        error_message: None,
        revision: 1,
        used_mb: 0.0,
        quota_mb: 0.0,
        expires_at: None,
        created_at: now,
        updated_at: now,
    };
    let tunnel = state.store.lock().unwrap().insert_tunnel(tunnel);

    match dispatch_reverse(state, &tunnel, &iran_node, &foreign_node, &server_host).await {
        Ok(()) => {
            let updated = state
                .store
                .lock()
                .unwrap()
                .set_tunnel_status(&tunnel.id, "active", None);
            info!(tunnel_id = %tunnel.id, "tunnel applied to both nodes");
            Ok(updated.unwrap_or(tunnel))
        }
        Err(message) => {
            error!(tunnel_id = %tunnel.id, %message, "tunnel dispatch failed");
            let updated =
                state
                    .store
                    .lock()
                    .unwrap()
                    .set_tunnel_status(&tunnel.id, "error", Some(message));
            Ok(updated.unwrap_or(tunnel))
        }
    }
}

/// Server to iran first; client to foreign second; compensating remove on
/// the iran side when the foreign apply fails.
async fn dispatch_reverse(
    state: &AppState,
    tunnel: &TunnelRow,
    iran_node: &NodeRow,
    foreign_node: &NodeRow,
    server_host: &str,
) -> Result<(), String> {
    let (server_spec, client_spec, bind_port) = compose_frp_specs(tunnel, server_host);
    info!(
        tunnel_id = %tunnel.id,
        bind_port,
        iran = %iran_node.id,
        foreign = %foreign_node.id,
        "dispatching reverse tunnel"
    );

    let server_reply = state
        .node_client
        .post(
            iran_node,
            "/api/agent/tunnels/apply",
            &dispatch_body(tunnel, server_spec),
        )
        .await;
    if !server_reply.is_success() {
        return Err(format!("iran node error: {}", server_reply.message));
    }

    let client_reply = state
        .node_client
        .post(
            foreign_node,
            "/api/agent/tunnels/apply",
            &dispatch_body(tunnel, client_spec),
        )
        .await;
    if !client_reply.is_success() {
        // Best-effort rollback of the half that did apply.
        let rollback = state
            .node_client
            .post(
                iran_node,
                "/api/agent/tunnels/remove",
                &TunnelRemove {
                    tunnel_id: tunnel.id.clone(),
                },
            )
            .await;
        if !rollback.is_success() {
            warn!(tunnel_id = %tunnel.id, message = %rollback.message, "rollback of iran side failed");
        }
        return Err(format!("foreign node error: {}", client_reply.message));
    }

    Ok(())
}

async fn create_gost_tunnel(state: &AppState, req: TunnelCreate) -> Result<TunnelRow, ApiError> {
    let node_id = non_empty(req.node_id.clone()).or_else(|| non_empty(req.iran_node_id.clone()));

    let node = match &node_id {
        Some(id) => Some(
            state
                .store
                .lock()
                .unwrap()
                .node(id)
                .ok_or_else(|| ApiError::NotFound(format!("node {} not found", id)))?,
        ),
        None => None,
    };

    let listen_port = req
        .spec
        .port_at(&["listen_port", "remote_port"])
        .ok_or_else(|| {
            ApiError::BadRequest("gost tunnels require 'listen_port' or 'remote_port'".into())
        })?;

    if node.is_none() && listen_port == state.settings.api_port {
        return Err(ApiError::BadRequest(format!(
            "port {} is reserved for the panel API; choose another listen_port",
            listen_port
        )));
    }

    let now = Utc::now();
    let tunnel = TunnelRow {
        id: new_id(),
        name: req.name,
        core: req.core,
        tunnel_type: req.tunnel_type,
        node_id: node.as_ref().map(|n| n.id.clone()).unwrap_or_default(),
        foreign_node_id: None,
        spec: req.spec,
        status: "pending".to_string(),
        error_message: None,
        revision: 1,
        used_mb: 0.0,
        quota_mb: 0.0,
        expires_at: None,
        created_at: now,
        updated_at: now,
    };
    let tunnel = state.store.lock().unwrap().insert_tunnel(tunnel);

    let outcome = match &node {
        Some(node) => {
            let reply = state
                .node_client
                .post(
                    node,
                    "/api/agent/tunnels/apply",
                    &dispatch_body(&tunnel, tunnel.spec.clone()),
                )
                .await;
            if reply.is_success() {
                Ok(())
            } else {
                Err(format!("node error: {}", reply.message))
            }
        }
        None => start_panel_forward(state, &tunnel, listen_port).await,
    };

    let (status, message) = match outcome {
        Ok(()) => ("active", None),
        Err(message) => ("error", Some(message)),
    };
    let updated = state
        .store
        .lock()
        .unwrap()
        .set_tunnel_status(&tunnel.id, status, message);
    Ok(updated.unwrap_or(tunnel))
}

/// Panel-originated gost path: a pure-code TCP relay instead of a child
/// process.
async fn start_panel_forward(
    state: &AppState,
    tunnel: &TunnelRow,
    listen_port: u16,
) -> Result<(), String> {
    let target = tunnel.spec.str_at(&["forward_to"]).unwrap_or_else(|| {
        let remote_ip = tunnel
            .spec
            .str_at(&["remote_ip"])
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let remote_port = tunnel.spec.port_at(&["remote_port"]).unwrap_or(8080);
        format!("{}:{}", remote_ip, remote_port)
    });

    let parsed = parse_address_port(&target);
    let target_port = parsed.port.ok_or_else(|| {
        format!("invalid forward target '{}': port required", target)
    })?;

    state
        .forwarder
        .lock()
        .await
        .start_forward(listen_port, &parsed.host, target_port)
        .await
        .map_err(|err| err.to_string())
}

async fn create_panel_hosted_tunnel(
    state: &AppState,
    req: TunnelCreate,
    ctx: &RequestContext,
) -> Result<TunnelRow, ApiError> {
    let node_id = non_empty(req.node_id.clone())
        .or_else(|| non_empty(req.foreign_node_id.clone()))
        .or_else(|| non_empty(req.iran_node_id.clone()))
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "{} tunnels require a node to run the client side",
                req.core
            ))
        })?;
    let node = state
        .store
        .lock()
        .unwrap()
        .node(&node_id)
        .ok_or_else(|| ApiError::NotFound(format!("node {} not found", node_id)))?;

    let control_port = req
        .spec
        .port_at(&["control_port", "bind_port", "server_port", "listen_port"]);
    if control_port == Some(state.settings.api_port) {
        return Err(ApiError::BadRequest(format!(
            "port {} is reserved for the panel API; choose another control port",
            state.settings.api_port
        )));
    }

    let panel_host = synthesize_server_host(state, &node, &req.spec, ctx, false)?;

    let now = Utc::now();
    let tunnel = TunnelRow {
        id: new_id(),
        name: req.name,
        core: req.core,
        tunnel_type: req.tunnel_type,
        node_id: node.id.clone(),
        foreign_node_id: None,
        spec: req.spec,
        status: "pending".to_string(),
        error_message: None,
        revision: 1,
        used_mb: 0.0,
        quota_mb: 0.0,
        expires_at: None,
        created_at: now,
        updated_at: now,
    };
    let tunnel = state.store.lock().unwrap().insert_tunnel(tunnel);

    let outcome = dispatch_panel_hosted(state, &tunnel, &node, &panel_host).await;
    let (status, message) = match outcome {
        Ok(()) => ("active", None),
        Err(message) => ("error", Some(message)),
    };
    let updated = state
        .store
        .lock()
        .unwrap()
        .set_tunnel_status(&tunnel.id, status, message);
    Ok(updated.unwrap_or(tunnel))
}

/// Start the panel-side helper, then dispatch the client spec to the node;
/// the helper is rolled back when the node apply fails.
async fn dispatch_panel_hosted(
    state: &AppState,
    tunnel: &TunnelRow,
    node: &NodeRow,
    panel_host: &str,
) -> Result<(), String> {
    let mut server_spec = tunnel.spec.clone();
    server_spec.set_str("mode", "server");

    let core = tunnel.core.clone();
    let tunnel_id = tunnel.id.clone();
    let servers = state.servers.clone();
    let started = tokio::task::spawn_blocking(move || {
        servers
            .lock()
            .unwrap()
            .start_server(&core, &tunnel_id, &server_spec)
    })
    .await
    .map_err(|err| format!("panel server task failed: {}", err))?;

    if let Err(err) = started {
        return Err(format!("panel server error: {}", err));
    }

    let client_spec = compose_panel_client_spec(tunnel, panel_host).map_err(|err| {
        stop_panel_server(state, &tunnel.core, &tunnel.id);
        err.to_string()
    })?;

    let reply = state
        .node_client
        .post(
            node,
            "/api/agent/tunnels/apply",
            &dispatch_body(tunnel, client_spec),
        )
        .await;
    if !reply.is_success() {
        stop_panel_server(state, &tunnel.core, &tunnel.id);
        return Err(format!("node error: {}", reply.message));
    }

    Ok(())
}

fn stop_panel_server(state: &AppState, core: &str, tunnel_id: &str) {
    let servers = state.servers.clone();
    let core = core.to_string();
    let tunnel_id = tunnel_id.to_string();
    // Stop blocks on the terminate/kill window; push it off the async path.
    tokio::task::spawn_blocking(move || servers.lock().unwrap().stop_server(&core, &tunnel_id));
}

pub async fn update_tunnel(
    state: &AppState,
    tunnel_id: &str,
    update: TunnelUpdate,
    ctx: &RequestContext,
) -> Result<TunnelRow, ApiError> {
    let existing = state
        .store
        .lock()
        .unwrap()
        .tunnel(tunnel_id)
        .ok_or_else(|| ApiError::NotFound("tunnel not found".into()))?;

    let spec_changed = update
        .spec
        .as_ref()
        .map(|spec| *spec != existing.spec)
        .unwrap_or(false);

    let updated = state
        .store
        .lock()
        .unwrap()
        .update_tunnel_spec(tunnel_id, update.name, update.spec)
        .ok_or_else(|| ApiError::NotFound("tunnel not found".into()))?;

    if !spec_changed {
        return Ok(updated);
    }

    // The user's intent is persisted either way; a failed re-apply leaves
    // the tunnel in error for the next attempt.
    match redispatch_tunnel(state, tunnel_id, ctx).await {
        Ok(row) => Ok(row),
        Err(ApiError::Internal(message)) => {
            let row = state
                .store
                .lock()
                .unwrap()
                .tunnel(tunnel_id)
                .ok_or_else(|| ApiError::NotFound("tunnel not found".into()))?;
            warn!(tunnel_id, %message, "re-apply after spec update failed");
            Ok(row)
        }
        Err(err) => Err(err),
    }
}

/// Re-dispatch the persisted spec of a tunnel to its endpoint(s). Returns
/// the refreshed row on success; `ApiError::Internal` carries the failure
/// message after the row has been marked `error`.
pub async fn redispatch_tunnel(
    state: &AppState,
    tunnel_id: &str,
    ctx: &RequestContext,
) -> Result<TunnelRow, ApiError> {
    let tunnel = state
        .store
        .lock()
        .unwrap()
        .tunnel(tunnel_id)
        .ok_or_else(|| ApiError::NotFound("tunnel not found".into()))?;

    let outcome: Result<(), String> = match tunnel.core.as_str() {
        // Mesh-planned FRP rows are one-sided and carry an explicit mode;
        // they re-apply verbatim to their own node. User-created reverse
        // tunnels store the raw spec and get the full two-sided compose.
        "frp" if tunnel.spec.str_at(&["mode"]).is_some() => {
            let node = state
                .store
                .lock()
                .unwrap()
                .node(&tunnel.node_id)
                .ok_or_else(|| ApiError::NotFound("node not found".into()))?;
            let reply = state
                .node_client
                .post(
                    &node,
                    "/api/agent/tunnels/apply",
                    &dispatch_body(&tunnel, tunnel.spec.clone()),
                )
                .await;
            if reply.is_success() {
                Ok(())
            } else {
                Err(format!("node error: {}", reply.message))
            }
        }
        "frp" => {
            let (iran_node, foreign_node) = resolve_reverse_endpoints(state, &tunnel)?;
            match synthesize_server_host(state, &iran_node, &tunnel.spec, ctx, true) {
                Ok(server_host) => {
                    dispatch_reverse(state, &tunnel, &iran_node, &foreign_node, &server_host).await
                }
                Err(err) => Err(err.to_string()),
            }
        }
        "gost" => {
            if tunnel.node_id.is_empty() {
                let listen_port = tunnel
                    .spec
                    .port_at(&["listen_port", "remote_port"])
                    .ok_or_else(|| ApiError::BadRequest("gost tunnel has no listen_port".into()))?;
                start_panel_forward(state, &tunnel, listen_port).await
            } else {
                let node = state
                    .store
                    .lock()
                    .unwrap()
                    .node(&tunnel.node_id)
                    .ok_or_else(|| ApiError::NotFound("node not found".into()))?;
                let reply = state
                    .node_client
                    .post(
                        &node,
                        "/api/agent/tunnels/apply",
                        &dispatch_body(&tunnel, tunnel.spec.clone()),
                    )
                    .await;
                if reply.is_success() {
                    Ok(())
                } else {
                    Err(format!("node error: {}", reply.message))
                }
            }
        }
        core if PANEL_HOSTED_CORES.contains(&core) => {
            let node = state
                .store
                .lock()
                .unwrap()
                .node(&tunnel.node_id)
                .ok_or_else(|| ApiError::NotFound("node not found".into()))?;
            match synthesize_server_host(state, &node, &tunnel.spec, ctx, false) {
                Ok(panel_host) => dispatch_panel_hosted(state, &tunnel, &node, &panel_host).await,
                Err(err) => Err(err.to_string()),
            }
        }
        other => Err(format!("unknown core '{}'", other)),
    };

    match outcome {
        Ok(()) => {
            let row = state
                .store
                .lock()
                .unwrap()
                .set_tunnel_status(tunnel_id, "active", None)
                .ok_or_else(|| ApiError::NotFound("tunnel not found".into()))?;
            Ok(row)
        }
        Err(message) => {
            state
                .store
                .lock()
                .unwrap()
                .set_tunnel_status(tunnel_id, "error", Some(message.clone()));
            Err(ApiError::Internal(message))
        }
    }
}

fn resolve_reverse_endpoints(
    state: &AppState,
    tunnel: &TunnelRow,
) -> Result<(NodeRow, NodeRow), ApiError> {
    let store = state.store.lock().unwrap();

    let iran_node = store
        .node(&tunnel.node_id)
        .filter(|node| node.role() == NodeRole::Iran)
        .or_else(|| store.first_node_with_role(NodeRole::Iran))
        .ok_or_else(|| ApiError::BadRequest("no iran node available".into()))?;

    let foreign_node = tunnel
        .foreign_node_id
        .as_ref()
        .and_then(|id| store.node(id))
        .filter(|node| node.role() == NodeRole::Foreign)
        .or_else(|| store.first_node_with_role(NodeRole::Foreign))
        .ok_or_else(|| ApiError::BadRequest("no foreign node available".into()))?;

    Ok((iran_node, foreign_node))
}

pub async fn delete_tunnel(state: &AppState, tunnel_id: &str) -> Result<(), ApiError> {
    let tunnel = state
        .store
        .lock()
        .unwrap()
        .tunnel(tunnel_id)
        .ok_or_else(|| ApiError::NotFound("tunnel not found".into()))?;

    if PANEL_HOSTED_CORES.contains(&tunnel.core.as_str()) {
        stop_panel_server(state, &tunnel.core, &tunnel.id);
    }

    if tunnel.core == "gost" && tunnel.node_id.is_empty() {
        if let Some(listen_port) = tunnel.spec.port_at(&["listen_port", "remote_port"]) {
            state.forwarder.lock().await.stop_forward(listen_port).await;
        }
    }

    if tunnel.status == "active" {
        let remove = TunnelRemove {
            tunnel_id: tunnel.id.clone(),
        };
        let endpoints: Vec<Option<NodeRow>> = {
            let store = state.store.lock().unwrap();
            let mut nodes = vec![store.node(&tunnel.node_id)];
            if let Some(foreign_id) = &tunnel.foreign_node_id {
                nodes.push(store.node(foreign_id));
            }
            nodes
        };
        for node in endpoints.into_iter().flatten() {
            let reply = state
                .node_client
                .post(&node, "/api/agent/tunnels/remove", &remove)
                .await;
            if !reply.is_success() {
                warn!(tunnel_id, node = %node.id, message = %reply.message, "tunnel removal on node failed");
            }
        }
    }

    state.store.lock().unwrap().delete_tunnel(tunnel_id);
    info!(tunnel_id, "tunnel deleted");
    Ok(())
}

/// Panel-restart reconciliation: re-dispatch every active tunnel. Nodes
/// restore their own tunnels from `tunnels.json`, so this is strictly
/// additive — apply is idempotent on the node side and nothing is removed.
pub async fn reconcile_active_tunnels(state: &AppState) {
    let active: Vec<TunnelRow> = state
        .store
        .lock()
        .unwrap()
        .tunnels()
        .into_iter()
        .filter(|t| t.status == "active")
        .collect();

    if active.is_empty() {
        info!("no active tunnels to reconcile");
        return;
    }

    info!(count = active.len(), "reconciling active tunnels after panel restart");
    let ctx = RequestContext::default();
    let mut restored = 0usize;
    let mut failed = 0usize;

    for tunnel in active {
        match redispatch_tunnel(state, &tunnel.id, &ctx).await {
            Ok(_) => restored += 1,
            Err(err) => {
                failed += 1;
                error!(tunnel_id = %tunnel.id, error = %err, "reconciliation failed for tunnel");
            }
        }
    }

    info!(restored, failed, "tunnel reconciliation completed");
}

/// One reset cycle for a core: re-dispatch every active tunnel of that
/// core against both endpoints. Per-tunnel failures do not abort the
/// cycle.
pub async fn reset_core(state: &AppState, core: &str) {
    let tunnels = state.store.lock().unwrap().active_tunnels_for_core(core);
    info!(core, count = tunnels.len(), "resetting core tunnels");

    let ctx = RequestContext::default();
    for tunnel in tunnels {
        if let Err(err) = redispatch_tunnel(state, &tunnel.id, &ctx).await {
            error!(core, tunnel_id = %tunnel.id, error = %err, "reset failed for tunnel");
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

/// Pull byte counters from the nodes of active tunnels and mirror them
/// into `used_mb`.
pub async fn refresh_tunnel_usage(state: &AppState, tunnel_id: &str) -> Option<f64> {
    let tunnel = state.store.lock().unwrap().tunnel(tunnel_id)?;
    if tunnel.node_id.is_empty() {
        return None;
    }
    let node = state.store.lock().unwrap().node(&tunnel.node_id)?;

    let endpoint = format!("/api/agent/tunnels/traffic?tunnel_id={}", tunnel.id);
    let body = state.node_client.get(&node, &endpoint).await.ok()?;
    let bytes = body.get("bytes").and_then(Value::as_u64)?;
    let used_mb = bytes as f64 / (1024.0 * 1024.0);

    state
        .store
        .lock()
        .unwrap()
        .set_tunnel_usage(&tunnel.id, used_mb);
    Some(used_mb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> Spec {
        value.as_object().cloned().unwrap()
    }

    fn tunnel_with_spec(spec_value: serde_json::Value) -> TunnelRow {
        let now = Utc::now();
        TunnelRow {
            id: "tunnel-fixed-id".into(),
            name: "t1".into(),
            core: "frp".into(),
            tunnel_type: "tcp".into(),
            node_id: "iran-1".into(),
            foreign_node_id: Some("foreign-1".into()),
            spec: spec(spec_value),
            status: "pending".into(),
            error_message: None,
            revision: 1,
            used_mb: 0.0,
            quota_mb: 0.0,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn frp_specs_derive_bind_port_and_defaults() {
        let tunnel = tunnel_with_spec(json!({"local_port": 9000}));
        let (server, client, bind_port) = compose_frp_specs(&tunnel, "203.0.113.7");

        let expected = frp_bind_port("tunnel-fixed-id");
        assert_eq!(bind_port, expected);
        assert!((7000..8000).contains(&bind_port));

        assert_eq!(server.str_at(&["mode"]).unwrap(), "server");
        assert_eq!(server.port_at(&["bind_port"]).unwrap(), bind_port);

        assert_eq!(client.str_at(&["mode"]).unwrap(), "client");
        assert_eq!(client.str_at(&["server_addr"]).unwrap(), "203.0.113.7");
        assert_eq!(client.port_at(&["server_port"]).unwrap(), bind_port);
        assert_eq!(client.str_at(&["type"]).unwrap(), "tcp");
        assert_eq!(client.port_at(&["local_port"]).unwrap(), 9000);
        assert_eq!(client.port_at(&["remote_port"]).unwrap(), bind_port);
    }

    #[test]
    fn frp_specs_respect_user_bind_port_and_fall_back_to_tcp() {
        let tunnel = {
            let mut t = tunnel_with_spec(json!({"bind_port": 7777, "local_port": 9000}));
            t.tunnel_type = "ws".into();
            t
        };
        let (_, client, bind_port) = compose_frp_specs(&tunnel, "203.0.113.7");
        assert_eq!(bind_port, 7777);
        assert_eq!(client.str_at(&["type"]).unwrap(), "tcp");
    }

    #[test]
    fn ipv6_server_host_is_bracketed() {
        let tunnel = tunnel_with_spec(json!({"local_port": 9000}));
        let (_, client, _) = compose_frp_specs(&tunnel, "2001:db8::7");
        assert_eq!(client.str_at(&["server_addr"]).unwrap(), "[2001:db8::7]");
    }

    #[test]
    fn panel_client_spec_builds_core_specific_addressing() {
        let mut tunnel = tunnel_with_spec(json!({"token": "tk", "proxy_port": 443}));
        tunnel.core = "rathole".into();
        let client = compose_panel_client_spec(&tunnel, "203.0.113.7").unwrap();
        assert_eq!(client.str_at(&["remote_addr"]).unwrap(), "203.0.113.7:23333");

        tunnel.core = "chisel".into();
        tunnel.spec = spec(json!({"server_port": 8200, "reverse_port": 9100}));
        let client = compose_panel_client_spec(&tunnel, "203.0.113.7").unwrap();
        assert_eq!(
            client.str_at(&["server_url"]).unwrap(),
            "http://203.0.113.7:8200"
        );
    }

    #[test]
    fn host_part_strips_scheme_and_port() {
        assert_eq!(host_part("http://panel.example.net:8000"), "panel.example.net");
        assert_eq!(host_part("203.0.113.7:8000"), "203.0.113.7");
        assert_eq!(host_part("[2001:db8::1]:8000"), "2001:db8::1");
        assert_eq!(host_part("panel.example.net"), "panel.example.net");
    }

    #[test]
    fn loopback_hosts_are_not_acceptable() {
        for host in ["localhost", "127.0.0.1", "::1", "0.0.0.0", ""] {
            assert!(!acceptable_host(host), "host {:?}", host);
        }
        assert!(acceptable_host("203.0.113.7"));
    }
}
