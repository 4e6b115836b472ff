//! Plugin management endpoints.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use samskipnad_plugin::{CapabilityGrants, PluginError, PluginInfo, Service, ValueMap};
use serde::{Deserialize, Serialize};

use super::{plugin_error, ApiError, AppState};

// ─── Request / Response types ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub name: String,
    /// Binary to launch; defaults to `<plugin_dir>/<name>`.
    pub path: Option<PathBuf>,
    /// Services to grant; defaults to the host's default grants.
    pub services: Option<Vec<Service>>,
}

#[derive(Debug, Serialize)]
pub struct PluginListResponse {
    pub plugins: Vec<PluginInfo>,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub plugin: String,
    pub result: ValueMap,
}

// ─── Handlers ───────────────────────────────────────────────────────────

/// GET /api/admin/plugins: List live plugins.
pub async fn list_plugins(State(state): State<Arc<AppState>>) -> Json<PluginListResponse> {
    Json(PluginListResponse {
        plugins: state.host.list_plugins(),
    })
}

/// POST /api/admin/plugins: Launch and register a plugin binary.
pub async fn load_plugin(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoadRequest>,
) -> Result<(StatusCode, Json<PluginInfo>), ApiError> {
    if body.name.is_empty() || body.name.contains(['/', '\\']) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "invalid plugin name" })),
        ));
    }

    let path = body
        .path
        .unwrap_or_else(|| state.host.config().plugin_dir.join(&body.name));

    let result = match body.services {
        Some(services) => {
            state
                .host
                .load_plugin_with_grants(&body.name, &path, CapabilityGrants::only(services))
                .await
        }
        None => state.host.load_plugin(&body.name, &path).await,
    };
    result.map_err(plugin_error)?;

    let info = state
        .host
        .plugin_info(&body.name)
        // Crashed right after loading.
        .ok_or_else(|| plugin_error(PluginError::NotFound(body.name.clone())))?;

    tracing::info!(plugin = %body.name, path = %path.display(), "plugin loaded via API");
    Ok((StatusCode::CREATED, Json(info)))
}

/// GET /api/admin/plugins/{name}: Inspect one plugin.
pub async fn get_plugin(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<PluginInfo>, ApiError> {
    state
        .host
        .plugin_info(&name)
        .map(Json)
        .ok_or_else(|| plugin_error(PluginError::NotFound(name)))
}

/// DELETE /api/admin/plugins/{name}: Unload a plugin.
pub async fn unload_plugin(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.host.unload_plugin(&name).await.map_err(plugin_error)?;
    tracing::info!(plugin = %name, "plugin unloaded via API");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/admin/plugins/{name}/execute: Run the plugin with a JSON object.
pub async fn execute_plugin(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(params): Json<ValueMap>,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let result = state
        .host
        .execute_plugin(&name, params)
        .await
        .map_err(plugin_error)?;
    Ok(Json(ExecuteResponse {
        plugin: name,
        result,
    }))
}
