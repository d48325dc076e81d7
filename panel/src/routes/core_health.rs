//! Core health probes and reset-timer configuration.

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use smite_common::api::NodeRole;

use crate::error::ApiError;
use crate::orchestrator;
use crate::scheduler::RESET_CORES;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(core_health))
        .route("/reset-config", get(reset_configs))
        .route("/reset-config/:core", put(update_reset_config))
        .route("/reset/:core", post(manual_reset))
}

#[derive(Debug, Serialize)]
struct ResetConfigResponse {
    core: String,
    enabled: bool,
    interval_minutes: u32,
    last_reset: Option<DateTime<Utc>>,
    next_reset: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ResetConfigUpdate {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    interval_minutes: Option<u32>,
}

/// Probe every registered node once and report the result per core, iran
/// relays and foreign servers separately.
async fn core_health(State(state): State<AppState>) -> Json<Value> {
    let nodes = state.store.lock().unwrap().nodes();

    let mut iran_status = Map::new();
    let mut foreign_status = Map::new();
    for node in &nodes {
        let status = state.node_client.probe(node).await;
        let entry = json!({
            "id": node.id,
            "name": node.name,
            "role": node.role().as_str(),
            "status": status.as_str(),
        });
        match node.role() {
            NodeRole::Iran => iran_status.insert(node.id.clone(), entry),
            NodeRole::Foreign => foreign_status.insert(node.id.clone(), entry),
        };
    }

    let health: Vec<Value> = RESET_CORES
        .iter()
        .map(|core| {
            json!({
                "core": core,
                "nodes_status": iran_status.clone(),
                "servers_status": foreign_status.clone(),
            })
        })
        .collect();

    Json(Value::Array(health))
}

async fn reset_configs(State(state): State<AppState>) -> Json<Vec<ResetConfigResponse>> {
    let configs = state.store.lock().unwrap().reset_configs(&RESET_CORES);
    Json(
        configs
            .into_iter()
            .map(|config| ResetConfigResponse {
                core: config.core,
                enabled: config.enabled,
                interval_minutes: config.interval_minutes,
                last_reset: config.last_reset,
                next_reset: config.next_reset,
            })
            .collect(),
    )
}

async fn update_reset_config(
    State(state): State<AppState>,
    Path(core): Path<String>,
    Json(body): Json<ResetConfigUpdate>,
) -> Result<Json<ResetConfigResponse>, ApiError> {
    if !RESET_CORES.contains(&core.as_str()) {
        return Err(ApiError::BadRequest(format!("invalid core: {}", core)));
    }
    if let Some(interval) = body.interval_minutes {
        if interval < 1 {
            return Err(ApiError::BadRequest(
                "interval must be at least 1 minute".into(),
            ));
        }
    }

    let config = state.store.lock().unwrap().update_reset_config(&core, |config| {
        if let Some(enabled) = body.enabled {
            config.enabled = enabled;
        }
        if let Some(interval) = body.interval_minutes {
            config.interval_minutes = interval;
        }

        // Invariant: enabled configs always carry a future next_reset of
        // last_reset + interval (or now + interval without history).
        if config.enabled {
            let now = Utc::now();
            let interval = ChronoDuration::minutes(config.interval_minutes.max(1) as i64);
            config.next_reset = Some(
                config
                    .last_reset
                    .map(|last| last + interval)
                    .filter(|next| *next > now)
                    .unwrap_or(now + interval),
            );
        } else {
            config.next_reset = None;
        }
    });

    Ok(Json(ResetConfigResponse {
        core: config.core,
        enabled: config.enabled,
        interval_minutes: config.interval_minutes,
        last_reset: config.last_reset,
        next_reset: config.next_reset,
    }))
}

async fn manual_reset(
    State(state): State<AppState>,
    Path(core): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !RESET_CORES.contains(&core.as_str()) {
        return Err(ApiError::BadRequest(format!("invalid core: {}", core)));
    }

    let config = {
        let mut store = state.store.lock().unwrap();
        store.update_reset_config(&core, |config| {
            let now = Utc::now();
            config.last_reset = Some(now);
            if config.enabled {
                let interval = ChronoDuration::minutes(config.interval_minutes.max(1) as i64);
                config.next_reset = Some(now + interval);
            }
        })
    };

    orchestrator::reset_core(&state, &core).await;

    Ok(Json(json!({
        "status": "success",
        "message": format!("{} reset successfully", core),
        "last_reset": config.last_reset,
    })))
}
