//! Panel REST API.

pub mod core_health;
pub mod mesh;
pub mod nodes;
pub mod overlay;
pub mod tunnels;

use axum::http::{header, HeaderMap};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::orchestrator::RequestContext;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .nest("/api/nodes", nodes::router())
        .nest("/api/tunnels", tunnels::router())
        .nest("/api/mesh", mesh::router())
        .nest("/api/overlay", overlay::router())
        .nest("/api/core-health", core_health::router())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({"status": "ok", "service": "smite-panel"}))
}

/// Host context for server-address synthesis; `X-Forwarded-Host` outranks
/// the plain Host header.
pub fn request_context(headers: &HeaderMap) -> RequestContext {
    let forwarded_host = headers
        .get("x-forwarded-host")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty());
    let request_host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty());

    RequestContext {
        forwarded_host,
        request_host,
    }
}
