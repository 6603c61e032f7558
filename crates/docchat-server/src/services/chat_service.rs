use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LlmConfig;
use crate::document::ExtractedContent;
use crate::services::llm_service::{
    ChatTurn, CompletionRequest, CompletionService, SamplingParams, ServiceError,
};
use crate::services::response_cache::{Fingerprint, ResponseCache};
use crate::store::{ConversationStore, Message, StoreError};
use crate::utils::limiters::Limiters;

const FALLBACK_MESSAGE: &str =
    "The assistant could not answer right now. Your message was saved, please try again.";

#[derive(Error, Debug)]
pub enum ChatError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown model: {0}")]
    UnknownModel(String),
}

/// One user turn as received from the caller
#[derive(Debug, Clone, Default)]
pub struct ChatTurnInput {
    pub text: String,
    pub attachments: Vec<ExtractedContent>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChatOutcome {
    Replied {
        user_message: Message,
        assistant_message: Message,
        cached: bool,
    },
    /// The model call failed. The user message is kept, nothing else is stored.
    Fallback {
        user_message: Message,
        message: String,
        error: String,
    },
}

/// Orchestrates one chat turn: history, store append, cached model call.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<ConversationStore>,
    completion: Arc<dyn CompletionService>,
    cache: ResponseCache,
    limiters: Limiters,
    llm: LlmConfig,
    cache_ttl: Duration,
}

impl ChatService {
    pub fn new(
        store: Arc<ConversationStore>,
        completion: Arc<dyn CompletionService>,
        cache: ResponseCache,
        limiters: Limiters,
        llm: LlmConfig,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            completion,
            cache,
            limiters,
            llm,
            cache_ttl,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    fn resolve_params(&self, conversation_model: Option<String>, input: &ChatTurnInput) -> Result<(String, SamplingParams), ChatError> {
        let model = input
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or(conversation_model)
            .unwrap_or_else(|| self.llm.default_model.clone());

        let mut max_tokens = input.max_tokens.unwrap_or(self.llm.max_tokens).max(1);
        if !self.llm.models.is_empty() {
            let registered = self
                .llm
                .model(&model)
                .ok_or_else(|| ChatError::UnknownModel(model.clone()))?;
            max_tokens = max_tokens.min(registered.max_tokens);
        }

        let temperature = input
            .temperature
            .unwrap_or(self.llm.temperature)
            .clamp(0.0, 2.0);

        Ok((model, SamplingParams { temperature, max_tokens }))
    }

    /// Upper bound for every attempt, the backoff between them and the wait for a slot
    fn total_budget(&self) -> Duration {
        let attempts = self.llm.max_retries.saturating_add(1);
        let mut budget = self.limiters.acquire_timeout + self.llm.timeout() * attempts;
        let mut backoff = Duration::from_millis(self.llm.retry_backoff_ms);
        for _ in 0..self.llm.max_retries {
            budget += backoff;
            backoff = backoff.saturating_mul(2);
        }
        budget
    }

    async fn complete_with_retry(&self, request: CompletionRequest) -> Result<String, ServiceError> {
        let _permit = self
            .limiters
            .acquire_completion()
            .await
            .map_err(|e| ServiceError::Busy(e.to_string()))?;

        let attempt_timeout = self.llm.timeout();
        let mut backoff = Duration::from_millis(self.llm.retry_backoff_ms);
        let mut attempt = 0;

        loop {
            let result = match tokio::time::timeout(attempt_timeout, self.completion.complete(request.clone())).await {
                Ok(Ok(text)) if text.trim().is_empty() => {
                    Err(ServiceError::InvalidResponse("Empty completion".to_string()))
                }
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout(attempt_timeout)),
            };

            match result {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.llm.max_retries => {
                    attempt += 1;
                    warn!(
                        "Completion attempt {} failed: {}. Retrying in {:?}",
                        attempt, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist the user message, ask the model (through the cache) and persist
    /// the reply. A failed model call yields `ChatOutcome::Fallback`.
    pub async fn send(&self, conversation_id: Uuid, input: ChatTurnInput) -> Result<ChatOutcome, ChatError> {
        let conversation = self.store.get(conversation_id)?;
        let (model, params) = self.resolve_params(conversation.model_used.clone(), &input)?;

        let history: Vec<ChatTurn> = self
            .store
            .recent_messages(conversation_id, self.llm.max_history_messages)?
            .into_iter()
            .map(|m| ChatTurn {
                role: m.role,
                content: m.text,
            })
            .collect();

        let user_message = self.store.append_message(
            conversation_id,
            Message::user(input.text.clone()).with_attachments(input.attachments.clone()),
        )?;

        let request = CompletionRequest {
            system: self.llm.system_prompt().map(str::to_string),
            prompt: input.text,
            history,
            attachments: input.attachments,
            model: model.clone(),
            params,
        };
        let fingerprint = Fingerprint::of(&request);

        let computed = AtomicBool::new(false);
        let result = self
            .cache
            .get_or_compute(&fingerprint, self.cache_ttl, self.total_budget(), || {
                computed.store(true, Ordering::Relaxed);
                self.complete_with_retry(request)
            })
            .await;

        match result {
            Ok(text) => {
                let cached = !computed.load(Ordering::Relaxed);
                let assistant_message = self
                    .store
                    .append_message(conversation_id, Message::assistant(text, model))?;
                debug!(
                    "Chat turn in {} answered ({})",
                    conversation_id,
                    if cached { "cached" } else { "fresh" }
                );
                Ok(ChatOutcome::Replied {
                    user_message,
                    assistant_message,
                    cached,
                })
            }
            Err(e) => {
                info!("Chat turn in {} fell back: {}", conversation_id, e);
                Ok(ChatOutcome::Fallback {
                    user_message,
                    message: FALLBACK_MESSAGE.to_string(),
                    error: e.to_string(),
                })
            }
        }
    }
}
