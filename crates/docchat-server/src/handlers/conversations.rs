use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::services::{ExportError, ExportFormat, Exporter};
use crate::state::AppState;
use crate::store::{Conversation, ConversationSummary};
use crate::utils::cancel::CancelFlag;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub owner: String,
    pub title: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IdResponse {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub total: usize,
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    pub pinned: bool,
}

#[derive(Debug, Serialize)]
pub struct PinResponse {
    pub id: Uuid,
    pub pinned: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    pub max_age_days: Option<u64>,
    pub max_count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub deleted: usize,
    pub remaining: usize,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<IdResponse>), ApiError> {
    let owner = req.owner.trim();
    if owner.is_empty() {
        return Err(ApiError::BadRequest("owner is required".to_string()));
    }
    let title = req.title.filter(|t| !t.trim().is_empty());
    let id = state.store.create_conversation(owner, title, req.model);
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Query(query): Query<OwnerQuery>,
) -> Json<ListResponse> {
    let conversations = state.store.list(query.owner.as_deref());
    Json(ListResponse {
        total: conversations.len(),
        conversations,
    })
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Conversation>, ApiError> {
    Ok(Json(state.store.get(id)?))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pin_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PinRequest>,
) -> Result<Json<PinResponse>, ApiError> {
    state.store.set_pinned(id, req.pinned)?;
    Ok(Json(PinResponse {
        id,
        pinned: req.pinned,
    }))
}

pub async fn import_conversation(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<IdResponse>), ApiError> {
    let conversation = Exporter::parse_json(&body).map_err(|e| match e {
        ExportError::Json(err) => ApiError::BadRequest(format!("Invalid conversation export: {}", err)),
        other => other.into(),
    })?;
    let id = state.store.import(conversation)?;
    Ok((StatusCode::CREATED, Json(IdResponse { id })))
}

pub async fn export_conversation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref() {
        Some(name) => name.parse::<ExportFormat>()?,
        None => ExportFormat::Json,
    };
    let conversation = state.store.get(id)?;
    let bytes = Exporter::export(&conversation, format)?;

    let disposition = format!(
        "attachment; filename=\"conversation-{}.{}\"",
        id,
        format.extension()
    );
    Ok((
        [
            (header::CONTENT_TYPE, format.mime_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// Manual retention sweep. Missing limits fall back to the configured ones.
pub async fn retention_sweep(
    State(state): State<AppState>,
    body: Option<Json<SweepRequest>>,
) -> Result<Json<SweepResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let config = &state.settings.retention;
    let max_age = Duration::from_secs(
        req.max_age_days
            .unwrap_or(config.max_age_days)
            .saturating_mul(24 * 60 * 60),
    );
    let max_count = req.max_count.unwrap_or(config.max_count);

    let retention = state.retention.clone();
    let deleted = tokio::task::spawn_blocking(move || retention.sweep(max_age, max_count, &CancelFlag::new()))
        .await
        .map_err(|e| ApiError::Internal(format!("Retention sweep failed: {}", e)))?;

    info!("Manual retention sweep deleted {} conversations", deleted);
    Ok(Json(SweepResponse {
        deleted,
        remaining: state.store.len(),
    }))
}
