use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "config": {
            "default_model": config.upstream.default_model,
            "models_count": config.models.len(),
            "client_keys_count": config.client_authentication.allowed_keys.len(),
            "issued_keys_count": state.auth.store().map_or(0, |store| store.len()),
            "tools_count": state.tools.len(),
            "skills_count": state.prompts.skills().len(),
            "sessions_count": state.sessions.len(),
            "max_tool_rounds": config.agent.max_tool_rounds,
            "log_level": config.features.log_level,
        }
    }))
}
