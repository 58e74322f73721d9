use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};

use crate::config::ModelEntry;
use crate::error::BridgeError;
use crate::protocol::openai_chat::{OpenAiModel, OpenAiModelList};
use crate::state::AppState;

fn to_openai_model(entry: &ModelEntry, created: u64) -> OpenAiModel {
    OpenAiModel {
        id: entry.id.clone(),
        object: "model".to_string(),
        created,
        owned_by: entry.owned_by.clone(),
    }
}

/// List configured models in `OpenAI` format.
pub fn list_handler(State(state): State<Arc<AppState>>, headers: &HeaderMap) -> Response {
    if let Err(err) = state.auth.authenticate(headers) {
        return err.into_response();
    }
    let data = state
        .config
        .models
        .iter()
        .map(|entry| to_openai_model(entry, state.started_at))
        .collect();
    Json(OpenAiModelList {
        object: "list".to_string(),
        data,
    })
    .into_response()
}

/// Return one configured model, or an `OpenAI`-shaped 404.
pub fn get_handler(State(state): State<Arc<AppState>>, headers: &HeaderMap, model_id: &str) -> Response {
    if let Err(err) = state.auth.authenticate(headers) {
        return err.into_response();
    }
    match state.config.models.iter().find(|entry| entry.id == model_id) {
        Some(entry) => Json(to_openai_model(entry, state.started_at)).into_response(),
        None => BridgeError::NotFound(format!("Model {model_id} not found")).into_response(),
    }
}
