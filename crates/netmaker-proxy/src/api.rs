//! Management and health API
//!
//! Served on its own listener, separate from the reverse proxy. The admin
//! endpoints carry no authentication of their own; access is bounded by the
//! address the listener binds to.
//!
//! # Endpoints
//!
//! - `GET /health`, `GET /ready` - Liveness and readiness
//! - `GET /netclient/status` - Overlay interface probe
//! - `GET /admin/user-mappings` - List IP to identity mappings
//! - `POST /admin/user-mappings` - Add or replace a mapping
//! - `DELETE /admin/user-mappings/{ip}` - Remove a mapping
//! - `POST /admin/sync-external-api` - Run one external sync now

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::mappings::{UserMapping, UserMappingStore};
use crate::netclient::NetclientProbe;
use crate::proxy::log_request;
use crate::sync::MappingSync;

/// Name reported by the health endpoints
const API_NAME: &str = "netmaker-k8s-api";

/// Shared state of the management API
#[derive(Clone)]
pub struct ApiState {
    /// Mapping store shared with the reverse proxy
    pub store: Arc<UserMappingStore>,
    /// External mapping sync, for on-demand runs
    pub sync: Arc<MappingSync>,
    /// Overlay interface probe
    pub netclient: Arc<NetclientProbe>,
}

/// Build the management router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/netclient/status", get(netclient_status))
        .route(
            "/admin/user-mappings",
            get(list_mappings).post(add_mapping),
        )
        .route("/admin/user-mappings/{ip}", delete(remove_mapping))
        .route("/admin/sync-external-api", post(sync_now))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "api": API_NAME }))
}

async fn ready() -> Json<Value> {
    Json(json!({ "status": "ready", "api": API_NAME }))
}

async fn netclient_status(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "netclient_status",
        "data": state.netclient.status(),
    }))
}

async fn list_mappings(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "user_mappings",
        "data": state.store.all(),
    }))
}

/// Body of `POST /admin/user-mappings`
#[derive(Debug, Deserialize)]
struct AddMappingRequest {
    ip: String,
    user: String,
    #[serde(default)]
    groups: Option<Vec<String>>,
}

async fn add_mapping(
    State(state): State<ApiState>,
    body: std::result::Result<Json<AddMappingRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(request) =
        body.map_err(|e| Error::invalid_request("Invalid request format", e.body_text()))?;

    if request.ip.trim().is_empty() {
        return Err(Error::invalid_request("Invalid request format", "ip is required"));
    }
    if request.user.trim().is_empty() {
        return Err(Error::invalid_request("Invalid request format", "user is required"));
    }

    let groups = request.groups.unwrap_or_default();
    state
        .store
        .set(request.ip.clone(), UserMapping::new(request.user.clone(), groups.clone()));
    info!(ip = %request.ip, user = %request.user, groups = ?groups, "User IP mapping added");

    Ok(Json(json!({
        "status": "mapping_added",
        "ip": request.ip,
        "user": request.user,
        "groups": groups,
    })))
}

async fn remove_mapping(State(state): State<ApiState>, Path(ip): Path<String>) -> Json<Value> {
    state.store.remove(&ip);
    info!(ip = %ip, "User IP mapping removed");
    Json(json!({ "status": "mapping_removed", "ip": ip }))
}

async fn sync_now(State(state): State<ApiState>) -> Result<Json<Value>> {
    if !state.sync.is_configured() {
        return Err(Error::SyncNotConfigured);
    }

    state.sync.fetch_once().await.map_err(|e| match e {
        Error::Sync(_) => e,
        other => Error::Sync(other.to_string()),
    })?;

    info!("Manual external API sync completed");
    Ok(Json(json!({
        "status": "sync_completed",
        "server": state.sync.server_domain(),
    })))
}
