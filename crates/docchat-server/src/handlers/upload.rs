use axum::{
    extract::{Multipart, State},
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::document::{ExtractedContent, FormatInfo, ProcessError, Upload};
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FileResult {
    Ok {
        content: ExtractedContent,
    },
    Error {
        file_name: String,
        error: String,
        message: String,
    },
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub processed: usize,
    pub failed: usize,
    pub files: Vec<FileResult>,
}

#[derive(Debug, Serialize)]
pub struct FormatsResponse {
    pub formats: Vec<FormatInfo>,
    pub max_upload_bytes: u64,
    pub max_batch_files: usize,
}

pub async fn list_formats(State(state): State<AppState>) -> Json<FormatsResponse> {
    Json(FormatsResponse {
        formats: state.dispatcher.supported_formats(),
        max_upload_bytes: state.settings.limits.max_upload_bytes,
        max_batch_files: state.settings.limits.max_batch_files,
    })
}

fn error_kind(err: &ProcessError) -> &'static str {
    match err {
        ProcessError::UnsupportedFormat { .. } => "UnsupportedFormat",
        ProcessError::SizeExceeded { .. } => "SizeExceeded",
        ProcessError::Timeout(_) => "Timeout",
        ProcessError::BatchTooLarge { .. } => "BatchTooLarge",
        ProcessError::Busy(_) => "Busy",
    }
}

/// Multipart batch upload. Every `file` field is normalized on its own.
pub async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut uploads = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read field: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {}", e)))?;
        uploads.push(Upload::new(bytes.to_vec(), mime_type, file_name));
    }

    if uploads.is_empty() {
        return Err(ApiError::BadRequest("At least one file field is required".to_string()));
    }

    info!("Processing upload batch of {} files", uploads.len());
    let names: Vec<String> = uploads.iter().map(|u| u.file_name.clone()).collect();
    let limits = &state.settings.limits;
    let results = state
        .dispatcher
        .process_batch(
            uploads,
            limits.max_upload_bytes,
            limits.extraction_timeout(),
            limits.max_batch_files,
        )
        .await?;

    let files: Vec<FileResult> = results
        .into_iter()
        .zip(names)
        .map(|(result, file_name)| match result {
            Ok(content) => FileResult::Ok { content },
            Err(err) => FileResult::Error {
                file_name,
                error: error_kind(&err).to_string(),
                message: err.to_string(),
            },
        })
        .collect();

    let failed = files.iter().filter(|f| matches!(f, FileResult::Error { .. })).count();
    Ok(Json(UploadResponse {
        processed: files.len() - failed,
        failed,
        files,
    }))
}
