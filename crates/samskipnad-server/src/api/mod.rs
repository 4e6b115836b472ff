//! Admin HTTP API over the plugin host.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use samskipnad_plugin::{PluginError, PluginHost};
use serde::Serialize;
use tower_http::trace::TraceLayer;

pub mod plugins;

pub struct AppState {
    pub host: PluginHost,
}

pub type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Serialize)]
struct ApiStatus {
    status: &'static str,
    version: &'static str,
    plugins: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin_routes = Router::new()
        .route(
            "/plugins",
            get(plugins::list_plugins).post(plugins::load_plugin),
        )
        .route(
            "/plugins/{name}",
            get(plugins::get_plugin).delete(plugins::unload_plugin),
        )
        .route("/plugins/{name}/execute", post(plugins::execute_plugin));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/admin", admin_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<ApiStatus> {
    Json(ApiStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        plugins: state.host.get_loaded_plugins().len(),
    })
}

/// Map a host error onto an HTTP status with a JSON body.
pub fn plugin_error(e: PluginError) -> ApiError {
    let status = match &e {
        PluginError::NotFound(_) => StatusCode::NOT_FOUND,
        PluginError::AlreadyLoaded(_) => StatusCode::CONFLICT,
        PluginError::CapacityExceeded { .. } | PluginError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PluginError::BinaryMissing(_) | PluginError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        PluginError::Handshake(_) | PluginError::Initialization(_) => StatusCode::BAD_GATEWAY,
        PluginError::ExecutionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PluginError::Execution(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PluginError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("plugin operation failed: {e}");
    } else {
        tracing::debug!("plugin operation rejected: {e}");
    }
    (
        status,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}
