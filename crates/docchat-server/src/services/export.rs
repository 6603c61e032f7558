use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{Conversation, ConversationStore, Role};
use crate::utils::cancel::CancelFlag;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Unsupported export format: {0}")]
    UnknownFormat(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Export cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Text,
}

impl ExportFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
            ExportFormat::Text => "text/plain",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Text => "txt",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "text" | "txt" => Ok(ExportFormat::Text),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Renders conversations as JSON (lossless), CSV (one row per message,
/// attachments counted) or a plain-text transcript. Reads only.
pub struct Exporter;

impl Exporter {
    pub fn export(conversation: &Conversation, format: ExportFormat) -> Result<Vec<u8>, ExportError> {
        let bytes = match format {
            ExportFormat::Json => Self::to_json(conversation)?,
            ExportFormat::Csv => Self::to_csv(conversation)?,
            ExportFormat::Text => Self::to_text(conversation).into_bytes(),
        };
        debug!(
            "Exported conversation {} as {} ({} bytes)",
            conversation.id,
            format,
            bytes.len()
        );
        Ok(bytes)
    }

    fn to_json(conversation: &Conversation) -> Result<Vec<u8>, ExportError> {
        Ok(serde_json::to_vec_pretty(conversation)?)
    }

    fn to_csv(conversation: &Conversation) -> Result<Vec<u8>, ExportError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["role", "text", "timestamp", "attachments"])?;
        for message in &conversation.messages {
            writer.write_record([
                message.role.as_str(),
                message.text.as_str(),
                &message.created_at.to_rfc3339(),
                &message.attachments.len().to_string(),
            ])?;
        }
        writer
            .into_inner()
            .map_err(|e| ExportError::Csv(csv::Error::from(e.into_error())))
    }

    fn to_text(conversation: &Conversation) -> String {
        let title = conversation
            .title
            .as_deref()
            .unwrap_or("Untitled conversation");
        let mut out = format!(
            "Conversation: {}\nCreated: {}\nMessages: {}\n{}\n",
            title,
            conversation.created_at.format(TIMESTAMP_FORMAT),
            conversation.messages.len(),
            "=".repeat(50)
        );

        for message in &conversation.messages {
            out.push('\n');
            out.push_str(&format!(
                "[{}] {}:",
                message.created_at.format(TIMESTAMP_FORMAT),
                message.role.label()
            ));
            if let (Role::Assistant, Some(model)) = (message.role, &message.model_used) {
                out.push_str(&format!(" ({})", model));
            }
            out.push('\n');
            out.push_str(&message.text);
            out.push('\n');

            for attachment in &message.attachments {
                out.push_str(&format!(
                    "\n[Attachment: {} ({})]\n",
                    attachment.file.name, attachment.source_kind
                ));
                if attachment.has_text() {
                    out.push_str(attachment.extracted_text.trim_end());
                    out.push('\n');
                }
                for note in &attachment.extraction_errors {
                    out.push_str(&format!("! {}\n", note));
                }
                out.push_str("[End attachment]\n");
            }
        }
        out
    }

    /// Export several conversations, checking `cancel` between each one.
    /// Ids that vanished since the caller listed them are skipped.
    pub fn export_many(
        store: &ConversationStore,
        ids: &[Uuid],
        format: ExportFormat,
        cancel: &CancelFlag,
    ) -> Result<Vec<(Uuid, Vec<u8>)>, ExportError> {
        let mut exported = Vec::with_capacity(ids.len());
        for id in ids {
            if cancel.is_cancelled() {
                info!("Export cancelled after {} of {} conversations", exported.len(), ids.len());
                return Err(ExportError::Cancelled);
            }
            if let Ok(conversation) = store.get(*id) {
                exported.push((*id, Self::export(&conversation, format)?));
            }
        }
        Ok(exported)
    }

    /// Inverse of the JSON export
    pub fn parse_json(bytes: &[u8]) -> Result<Conversation, ExportError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
