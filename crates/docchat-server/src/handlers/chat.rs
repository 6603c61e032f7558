use axum::{
    extract::{Path, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::try_join_all;
use serde::Deserialize;
use uuid::Uuid;

use crate::document::{ExtractedContent, Upload};
use crate::services::{ChatOutcome, ChatTurnInput};
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct AttachmentPayload {
    pub file_name: String,
    #[serde(default)]
    pub file_type: String,
    pub file_base64: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub message: String,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

fn decode(payload: AttachmentPayload) -> Result<Upload, ApiError> {
    let bytes = STANDARD.decode(payload.file_base64.trim()).map_err(|e| {
        ApiError::BadRequest(format!("Attachment {} is not valid base64: {}", payload.file_name, e))
    })?;
    Ok(Upload::new(bytes, payload.file_type, payload.file_name))
}

/// One chat turn. A failed model call is still a 200 with `status: "fallback"`.
pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<ChatOutcome>, ApiError> {
    if req.message.trim().is_empty() && req.attachments.is_empty() {
        return Err(ApiError::BadRequest("message or attachments required".to_string()));
    }
    let limits = &state.settings.limits;
    if req.attachments.len() > limits.max_batch_files {
        return Err(ApiError::PayloadTooLarge(format!(
            "{} attachments sent, the limit is {}",
            req.attachments.len(),
            limits.max_batch_files
        )));
    }
    // Fail fast before any extraction work
    state.store.get(id)?;

    let uploads = req
        .attachments
        .into_iter()
        .map(decode)
        .collect::<Result<Vec<_>, _>>()?;

    let attachments: Vec<ExtractedContent> = try_join_all(uploads.into_iter().map(|upload| {
        state
            .dispatcher
            .process_bounded(upload, limits.max_upload_bytes, limits.extraction_timeout())
    }))
    .await?;

    let outcome = state
        .chat
        .send(
            id,
            ChatTurnInput {
                text: req.message,
                attachments,
                model: req.model,
                temperature: req.temperature,
                max_tokens: req.max_tokens,
            },
        )
        .await?;

    Ok(Json(outcome))
}
