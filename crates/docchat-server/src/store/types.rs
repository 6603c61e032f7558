use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::document::ExtractedContent;

pub const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Capitalized form for transcripts
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<ExtractedContent>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            attachments: Vec::new(),
            created_at: Utc::now(),
            model_used: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>, model: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Assistant, text);
        message.model_used = Some(model.into());
        message
    }

    pub fn with_attachments(mut self, attachments: Vec<ExtractedContent>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Session or user key supplied by the caller
    pub owner: String,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Model of the latest assistant reply, or the one chosen at creation
    pub model_used: Option<String>,
    /// Distinct models in first-use order
    #[serde(default)]
    pub models_used: Vec<String>,
    #[serde(default)]
    pub pinned: bool,
}

impl Conversation {
    pub fn new(owner: impl Into<String>, title: Option<String>, model: Option<String>) -> Self {
        let now = Utc::now();
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            title,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            models_used: model.iter().cloned().collect(),
            model_used: model,
            pinned: false,
        }
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id,
            owner: self.owner.clone(),
            title: self.title.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            model_used: self.model_used.clone(),
            pinned: self.pinned,
        }
    }
}

/// Collapse whitespace and cut to [`TITLE_MAX_CHARS`] at a word boundary.
/// A single word longer than the limit is hard-cut.
pub fn derive_title(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    if collapsed.chars().count() <= TITLE_MAX_CHARS {
        return Some(collapsed);
    }

    let cut: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
    let next_is_break = collapsed
        .chars()
        .nth(TITLE_MAX_CHARS)
        .map(char::is_whitespace)
        .unwrap_or(true);
    if next_is_break {
        return Some(cut.trim_end().to_string());
    }

    match cut.rfind(' ') {
        Some(pos) if pos > 0 => Some(cut[..pos].trim_end().to_string()),
        _ => Some(cut),
    }
}

/// Lightweight listing row
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub owner: String,
    pub title: Option<String>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub model_used: Option<String>,
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub snippet: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// What the retention sweep needs to rank a conversation
#[derive(Debug, Clone, Copy)]
pub struct ConversationActivity {
    pub id: Uuid,
    pub updated_at: DateTime<Utc>,
    pub pinned: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub avg_messages_per_conversation: f64,
    pub pinned_conversations: usize,
    pub indexed_terms: usize,
    /// Conversations per model, from `models_used`
    pub model_usage: BTreeMap<String, usize>,
    /// Conversations per creation date (YYYY-MM-DD)
    pub conversations_by_date: BTreeMap<String, usize>,
    pub oldest_conversation: Option<DateTime<Utc>>,
    pub newest_conversation: Option<DateTime<Utc>>,
}
