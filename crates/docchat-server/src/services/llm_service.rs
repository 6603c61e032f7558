use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::LlmConfig;
use crate::document::ExtractedContent;
use crate::store::Role;

/// Failures at the language-model boundary
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("Upstream model service failed: {0}")]
    Upstream(String),

    #[error("Model service did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Model service returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("Model service is busy: {0}")]
    Busy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// One prior exchange carried as context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Instruction placed before the history
    pub system: Option<String>,
    pub prompt: String,
    pub history: Vec<ChatTurn>,
    pub attachments: Vec<ExtractedContent>,
    pub model: String,
    pub params: SamplingParams,
}

impl CompletionRequest {
    /// Attachment text blocks followed by the user's prompt
    pub fn user_content(&self) -> String {
        let mut content = String::new();
        for attachment in self.attachments.iter().filter(|a| a.has_text()) {
            content.push_str(&format!(
                "[Attachment: {} ({})]\n{}\n[End of attachment]\n\n",
                attachment.file.name, attachment.source_kind, attachment.extracted_text
            ));
        }
        content.push_str(&self.prompt);
        content
    }
}

/// The only way out to the model service. Treated as a black box with unknown latency.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ServiceError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible `/v1/chat/completions` client
#[derive(Clone)]
pub struct LlmService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ServiceError::Upstream(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            timeout: config.timeout(),
        })
    }

    fn wire_messages(request: &CompletionRequest) -> Vec<WireMessage> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if let Some(system) = &request.system {
            messages.push(WireMessage {
                role: "system",
                content: system.clone(),
            });
        }
        messages.extend(request.history.iter().map(|turn| WireMessage {
            role: turn.role.as_str(),
            content: turn.content.clone(),
        }));
        messages.push(WireMessage {
            role: Role::User.as_str(),
            content: request.user_content(),
        });
        messages
    }
}

#[async_trait]
impl CompletionService for LlmService {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ServiceError> {
        debug!(
            "Requesting completion from {} with {} history turns",
            request.model,
            request.history.len()
        );

        let body = ChatCompletionRequest {
            model: &request.model,
            messages: Self::wire_messages(&request),
            max_tokens: request.params.max_tokens,
            temperature: request.params.temperature,
            stream: false,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout(self.timeout)
            } else {
                ServiceError::Upstream(format!("Failed to call model API: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!(
                "Model API error: {} - {}",
                status, body
            )));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(format!("Failed to parse model response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| ServiceError::InvalidResponse("No content returned from model".to_string()))
    }
}
