use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::config::ModelConfig;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub default_model: String,
    /// Requests naming other models are rejected when the registry is non-empty
    pub restricted: bool,
    pub models: Vec<ModelConfig>,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let llm = &state.settings.llm;
    Json(ModelsResponse {
        default_model: llm.default_model.clone(),
        restricted: !llm.models.is_empty(),
        models: llm.models.clone(),
    })
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ModelConfig>, ApiError> {
    state
        .settings
        .llm
        .model(&name)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Model {} is not registered", name)))
}
