use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use unicode_segmentation::UnicodeSegmentation;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::StoreError;
use super::index::{normalize_term, tokenize, InvertedIndex, MessageKey};
use super::persist::{load_records, Persister};
use super::types::{
    derive_title, Conversation, ConversationActivity, ConversationSummary, Message, Role,
    SearchHit, StoreStats,
};

const SNIPPET_CHARS: usize = 160;
const SNIPPET_LEAD_CHARS: usize = 40;

/// Conversations and their postings live under one lock, so a reader sees
/// a message and its postings together or not at all.
#[derive(Default)]
struct StoreInner {
    conversations: HashMap<Uuid, Conversation>,
    index: InvertedIndex,
}

impl StoreInner {
    fn insert_indexed(&mut self, conversation: Conversation) {
        for message in &conversation.messages {
            self.index.add_message(conversation.id, message);
        }
        self.conversations.insert(conversation.id, conversation);
    }

    fn remove(&mut self, id: Uuid) -> Option<Conversation> {
        let removed = self.conversations.remove(&id)?;
        self.index.remove_conversation(id);
        Some(removed)
    }
}

/// Imported and hydrated records must keep the append-only invariants
fn validate(conversation: &Conversation) -> Result<(), StoreError> {
    let mut seen = HashSet::with_capacity(conversation.messages.len());
    for message in &conversation.messages {
        if !seen.insert(message.id) {
            return Err(StoreError::InvalidRecord(format!(
                "duplicate message id {}",
                message.id
            )));
        }
    }

    if conversation
        .messages
        .windows(2)
        .any(|pair| pair[1].created_at < pair[0].created_at)
    {
        return Err(StoreError::InvalidRecord(
            "message timestamps are not in order".to_string(),
        ));
    }

    if conversation.updated_at < conversation.created_at {
        return Err(StoreError::InvalidRecord(
            "updated_at is earlier than created_at".to_string(),
        ));
    }

    Ok(())
}

/// Up to [`SNIPPET_CHARS`] characters around the first query term, from the
/// message text or else the first attachment that matched
fn snippet(message: &Message, terms: &HashSet<String>) -> String {
    let sources = std::iter::once(message.text.as_str())
        .chain(message.attachments.iter().map(|a| a.extracted_text.as_str()));

    for source in sources {
        let hit = source
            .unicode_word_indices()
            .find(|(_, word)| terms.contains(&normalize_term(word)));
        if let Some((byte_pos, _)) = hit {
            return window(source, byte_pos);
        }
    }
    window(&message.text, 0)
}

fn window(text: &str, byte_pos: usize) -> String {
    let char_pos = text[..byte_pos].chars().count();
    let start = char_pos.saturating_sub(SNIPPET_LEAD_CHARS);
    let total = text.chars().count();

    let body: String = text.chars().skip(start).take(SNIPPET_CHARS).collect();
    let body = body.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut out = String::with_capacity(body.len() + 6);
    if start > 0 {
        out.push('…');
    }
    out.push_str(&body);
    if start + SNIPPET_CHARS < total {
        out.push('…');
    }
    out
}

/// Process-wide conversation store with a derived inverted index.
///
/// In-memory by default; with a data dir every mutation is queued, in
/// order, to the write-behind persister.
pub struct ConversationStore {
    inner: RwLock<StoreInner>,
    persister: Option<Persister>,
}

impl ConversationStore {
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            persister: None,
        }
    }

    /// Hydrate from `data_dir` and start the persister, or fall back to memory only
    pub async fn open(data_dir: Option<PathBuf>) -> Result<Self, StoreError> {
        let Some(dir) = data_dir else {
            info!("Conversation store is in-memory only");
            return Ok(Self::in_memory());
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Persistence(format!("create {}: {}", dir.display(), e)))?;

        let mut inner = StoreInner::default();
        let mut skipped = 0;
        for record in load_records(&dir).await? {
            match validate(&record) {
                Ok(()) => inner.insert_indexed(record),
                Err(e) => {
                    warn!("Skipping conversation {}: {}", record.id, e);
                    skipped += 1;
                }
            }
        }

        info!(
            "Hydrated {} conversations ({} terms indexed, {} skipped) from {}",
            inner.conversations.len(),
            inner.index.term_count(),
            skipped,
            dir.display()
        );

        Ok(Self {
            inner: RwLock::new(inner),
            persister: Some(Persister::spawn(dir)),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.persister.is_some()
    }

    fn persist(&self, conversation: &Conversation) {
        if let Some(persister) = &self.persister {
            persister.save(conversation.clone());
        }
    }

    fn persist_delete(&self, id: Uuid) {
        if let Some(persister) = &self.persister {
            persister.delete(id);
        }
    }

    pub fn create_conversation(&self, owner: &str, title: Option<String>, model: Option<String>) -> Uuid {
        let conversation = Conversation::new(owner, title, model);
        let id = conversation.id;

        let mut inner = self.inner.write();
        self.persist(&conversation);
        inner.conversations.insert(id, conversation);
        debug!("Created conversation {} for owner {}", id, owner);
        id
    }

    /// Append and index in one critical section. Returns the message as stored,
    /// with `created_at` clamped so the sequence never goes back in time.
    pub fn append_message(&self, conversation_id: Uuid, mut message: Message) -> Result<Message, StoreError> {
        let mut inner = self.inner.write();
        let StoreInner { conversations, index } = &mut *inner;
        let conversation = conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound(conversation_id))?;

        if conversation.messages.iter().any(|m| m.id == message.id) {
            return Err(StoreError::InvalidRecord(format!(
                "message {} already exists",
                message.id
            )));
        }

        if let Some(last) = conversation.last_message() {
            if message.created_at < last.created_at {
                message.created_at = last.created_at;
            }
        }

        if conversation.title.is_none() && message.role == Role::User {
            conversation.title = derive_title(&message.text);
        }

        if let Some(model) = &message.model_used {
            if message.role == Role::Assistant {
                conversation.model_used = Some(model.clone());
            }
            if !conversation.models_used.contains(model) {
                conversation.models_used.push(model.clone());
            }
        }

        conversation.updated_at = conversation.updated_at.max(message.created_at);
        index.add_message(conversation_id, &message);
        conversation.messages.push(message.clone());
        self.persist(conversation);

        debug!(
            "Appended {} message {} to conversation {} ({} messages)",
            message.role,
            message.id,
            conversation_id,
            conversation.messages.len()
        );
        Ok(message)
    }

    pub fn get(&self, conversation_id: Uuid) -> Result<Conversation, StoreError> {
        self.inner
            .read()
            .conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(StoreError::NotFound(conversation_id))
    }

    pub fn get_message(&self, conversation_id: Uuid, message_id: Uuid) -> Result<Message, StoreError> {
        let inner = self.inner.read();
        let conversation = inner
            .conversations
            .get(&conversation_id)
            .ok_or(StoreError::NotFound(conversation_id))?;
        conversation
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or(StoreError::MessageNotFound {
                conversation_id,
                message_id,
            })
    }

    /// The last `count` messages, oldest first
    pub fn recent_messages(&self, conversation_id: Uuid, count: usize) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read();
        let conversation = inner
            .conversations
            .get(&conversation_id)
            .ok_or(StoreError::NotFound(conversation_id))?;
        let skip = conversation.messages.len().saturating_sub(count);
        Ok(conversation.messages[skip..].to_vec())
    }

    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        self.search_scoped(query, None, None)
    }

    /// Ranked by summed term frequency over `1 + ln(message count)`; newer first on ties
    pub fn search_scoped(&self, query: &str, owner: Option<&str>, limit: Option<usize>) -> Vec<SearchHit> {
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let inner = self.inner.read();
        let mut scored: Vec<(MessageKey, f64, &Message)> = inner
            .index
            .matches(&terms)
            .into_iter()
            .filter_map(|((conversation_id, message_id), frequency)| {
                let conversation = inner.conversations.get(&conversation_id)?;
                if owner.is_some_and(|o| o != conversation.owner) {
                    return None;
                }
                let message = conversation.messages.iter().find(|m| m.id == message_id)?;
                let weight = 1.0 + (conversation.messages.len() as f64).ln();
                Some(((conversation_id, message_id), frequency as f64 / weight, message))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.2.created_at.cmp(&a.2.created_at))
                .then_with(|| a.0.cmp(&b.0))
        });
        if let Some(limit) = limit {
            scored.truncate(limit);
        }

        debug!("Search '{}' matched {} messages", query, scored.len());

        scored
            .into_iter()
            .map(|((conversation_id, message_id), score, message)| SearchHit {
                conversation_id,
                message_id,
                snippet: snippet(message, &terms),
                score,
                created_at: message.created_at,
            })
            .collect()
    }

    /// Removes the conversation and all its postings together
    pub fn delete(&self, conversation_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .remove(conversation_id)
            .ok_or(StoreError::NotFound(conversation_id))?;
        self.persist_delete(conversation_id);
        info!("Deleted conversation {}", conversation_id);
        Ok(())
    }

    /// Delete only if untouched since `seen_updated_at` and not pinned
    pub fn delete_if_idle(&self, conversation_id: Uuid, seen_updated_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.write();
        let idle = inner
            .conversations
            .get(&conversation_id)
            .is_some_and(|c| !c.pinned && c.updated_at == seen_updated_at);
        if !idle {
            return false;
        }
        inner.remove(conversation_id);
        self.persist_delete(conversation_id);
        true
    }

    pub fn set_pinned(&self, conversation_id: Uuid, pinned: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(StoreError::NotFound(conversation_id))?;
        conversation.pinned = pinned;
        self.persist(conversation);
        Ok(())
    }

    /// Summaries, most recently updated first
    pub fn list(&self, owner: Option<&str>) -> Vec<ConversationSummary> {
        let inner = self.inner.read();
        let mut summaries: Vec<ConversationSummary> = inner
            .conversations
            .values()
            .filter(|c| owner.map_or(true, |o| o == c.owner))
            .map(Conversation::summary)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn activity(&self) -> Vec<ConversationActivity> {
        self.inner
            .read()
            .conversations
            .values()
            .map(|c| ConversationActivity {
                id: c.id,
                updated_at: c.updated_at,
                pinned: c.pinned,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let mut stats = StoreStats {
            total_conversations: inner.conversations.len(),
            indexed_terms: inner.index.term_count(),
            ..StoreStats::default()
        };

        for conversation in inner.conversations.values() {
            stats.total_messages += conversation.messages.len();
            if conversation.pinned {
                stats.pinned_conversations += 1;
            }
            for model in &conversation.models_used {
                *stats.model_usage.entry(model.clone()).or_insert(0) += 1;
            }
            let date = conversation.created_at.format("%Y-%m-%d").to_string();
            *stats.conversations_by_date.entry(date).or_insert(0) += 1;

            let created = conversation.created_at;
            stats.oldest_conversation = Some(stats.oldest_conversation.map_or(created, |o| o.min(created)));
            stats.newest_conversation = Some(stats.newest_conversation.map_or(created, |n| n.max(created)));
        }

        if stats.total_conversations > 0 {
            stats.avg_messages_per_conversation =
                stats.total_messages as f64 / stats.total_conversations as f64;
        }
        stats
    }

    /// Insert a conversation from a JSON export, keeping its ids and timestamps
    pub fn import(&self, conversation: Conversation) -> Result<Uuid, StoreError> {
        validate(&conversation)?;

        let id = conversation.id;
        let mut inner = self.inner.write();
        if inner.conversations.contains_key(&id) {
            return Err(StoreError::InvalidRecord(format!(
                "conversation {} already exists",
                id
            )));
        }
        self.persist(&conversation);
        inner.insert_indexed(conversation);
        info!("Imported conversation {}", id);
        Ok(id)
    }

    /// Wait until every queued mutation has been written
    pub async fn flush(&self) -> Result<(), StoreError> {
        match &self.persister {
            Some(persister) => persister.flush().await,
            None => Ok(()),
        }
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ExtractedContent, ExtractionNote, FileMetadata, SourceKind};
    use chrono::Duration;
    use std::sync::Arc;

    fn store_with(messages: &[&str]) -> (ConversationStore, Uuid) {
        let store = ConversationStore::in_memory();
        let id = store.create_conversation("alice", None, None);
        for text in messages {
            store.append_message(id, Message::user(*text)).unwrap();
        }
        (store, id)
    }

    #[test]
    fn test_append_to_unknown_conversation() {
        let store = ConversationStore::in_memory();
        let missing = Uuid::new_v4();
        let err = store.append_message(missing, Message::user("hi")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == missing));
        assert!(matches!(store.get(missing), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_title_comes_from_first_user_message() {
        let store = ConversationStore::in_memory();
        let id = store.create_conversation("alice", None, None);
        store
            .append_message(id, Message::assistant("Welcome!", "m1"))
            .unwrap();
        store.append_message(id, Message::user("How do lifetimes work?")).unwrap();
        store.append_message(id, Message::user("Second question")).unwrap();

        assert_eq!(store.get(id).unwrap().title.as_deref(), Some("How do lifetimes work?"));
    }

    #[test]
    fn test_explicit_title_is_kept() {
        let store = ConversationStore::in_memory();
        let id = store.create_conversation("alice", Some("Budget".to_string()), None);
        store.append_message(id, Message::user("first words")).unwrap();
        assert_eq!(store.get(id).unwrap().title.as_deref(), Some("Budget"));
    }

    #[test]
    fn test_created_at_is_clamped_monotonic() {
        let (store, id) = store_with(&["first"]);
        let first = store.get(id).unwrap().messages[0].created_at;

        let stale = Message::user("second").with_created_at(first - Duration::hours(1));
        let stored = store.append_message(id, stale).unwrap();
        assert_eq!(stored.created_at, first);

        let conversation = store.get(id).unwrap();
        assert!(conversation.messages.windows(2).all(|p| p[0].created_at <= p[1].created_at));
    }

    #[test]
    fn test_model_tracking() {
        let store = ConversationStore::in_memory();
        let id = store.create_conversation("alice", None, Some("fast".to_string()));
        store.append_message(id, Message::assistant("a", "smart")).unwrap();
        store.append_message(id, Message::assistant("b", "fast")).unwrap();

        let conversation = store.get(id).unwrap();
        assert_eq!(conversation.model_used.as_deref(), Some("fast"));
        assert_eq!(conversation.models_used, vec!["fast", "smart"]);
    }

    #[test]
    fn test_higher_term_frequency_ranks_first() {
        let store = ConversationStore::in_memory();
        let a = store.create_conversation("alice", None, None);
        let b = store.create_conversation("alice", None, None);
        store
            .append_message(a, Message::user("invoice invoice and another invoice"))
            .unwrap();
        store.append_message(b, Message::user("one invoice here")).unwrap();

        let hits = store.search("Invoice");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].conversation_id, a);
        assert_eq!(hits[1].conversation_id, b);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_apostrophes_do_not_split_matches() {
        let store = ConversationStore::in_memory();
        let id = store.create_conversation("alice", None, None);
        store
            .append_message(id, Message::user("It's the customer's last order"))
            .unwrap();

        assert_eq!(store.search("its").len(), 1);
        assert_eq!(store.search("customers").len(), 1);
        let hits = store.search("customer's order");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].snippet.contains("customer's"));
    }

    #[test]
    fn test_long_conversations_are_not_boosted() {
        let store = ConversationStore::in_memory();
        let short = store.create_conversation("alice", None, None);
        let long = store.create_conversation("alice", None, None);
        store.append_message(short, Message::user("tokio runtime")).unwrap();
        store.append_message(long, Message::user("tokio runtime")).unwrap();
        for i in 0..8 {
            store.append_message(long, Message::user(format!("filler {}", i))).unwrap();
        }

        let hits = store.search("tokio");
        assert_eq!(hits[0].conversation_id, short);
    }

    #[test]
    fn test_ties_prefer_newer_messages() {
        let store = ConversationStore::in_memory();
        let older = store.create_conversation("alice", None, None);
        let newer = store.create_conversation("alice", None, None);
        let now = Utc::now();
        store
            .append_message(older, Message::user("serde").with_created_at(now - Duration::minutes(5)))
            .unwrap();
        store
            .append_message(newer, Message::user("serde").with_created_at(now))
            .unwrap();

        let hits = store.search("serde");
        assert_eq!(hits[0].conversation_id, newer);
        assert_eq!(hits[0].score, hits[1].score);
    }

    #[test]
    fn test_attachment_text_is_searchable() {
        let (store, id) = store_with(&[]);
        let attachment = ExtractedContent::from_extraction(
            SourceKind::Text,
            FileMetadata::new("notes.txt", "text/plain", 20),
            crate::document::types::Extraction::new(
                "the quarterly forecast".to_string(),
                crate::document::StructuredFields::Empty,
            ),
        );
        let message = store
            .append_message(id, Message::user("see attached").with_attachments(vec![attachment]))
            .unwrap();

        let hits = store.search("forecast");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, message.id);
        assert_eq!(hits[0].snippet, "the quarterly forecast");
    }

    #[test]
    fn test_snippet_is_windowed() {
        let text = format!("{} needle {}", "lead ".repeat(30), "tail ".repeat(60));
        let (store, _) = store_with(&[text.as_str()]);
        let snippet = &store.search("needle")[0].snippet;
        assert!(snippet.starts_with('…'));
        assert!(snippet.ends_with('…'));
        assert!(snippet.contains("needle"));
        assert!(snippet.chars().count() <= SNIPPET_CHARS + 2);
    }

    #[test]
    fn test_search_scoped_by_owner_and_limit() {
        let store = ConversationStore::in_memory();
        let mine = store.create_conversation("alice", None, None);
        let theirs = store.create_conversation("bob", None, None);
        store.append_message(mine, Message::user("axum router")).unwrap();
        store.append_message(mine, Message::user("axum handler")).unwrap();
        store.append_message(theirs, Message::user("axum layer")).unwrap();

        let hits = store.search_scoped("axum", Some("alice"), None);
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.conversation_id == mine));
        assert_eq!(store.search_scoped("axum", None, Some(1)).len(), 1);
        assert!(store.search("!!!").is_empty());
    }

    #[test]
    fn test_delete_removes_postings() {
        let (store, id) = store_with(&["ephemeral words"]);
        store.delete(id).unwrap();

        assert!(store.search("ephemeral").is_empty());
        assert!(matches!(store.get(id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(id), Err(StoreError::NotFound(_))));
        assert_eq!(store.stats().indexed_terms, 0);
    }

    #[test]
    fn test_delete_if_idle_respects_changes_and_pins() {
        let (store, id) = store_with(&["one"]);
        let seen = store.get(id).unwrap().updated_at;

        store.set_pinned(id, true).unwrap();
        assert!(!store.delete_if_idle(id, seen));
        store.set_pinned(id, false).unwrap();

        store
            .append_message(id, Message::user("two").with_created_at(seen + Duration::seconds(1)))
            .unwrap();
        assert!(!store.delete_if_idle(id, seen));

        let latest = store.get(id).unwrap().updated_at;
        assert!(store.delete_if_idle(id, latest));
        assert!(store.is_empty());
    }

    #[test]
    fn test_recent_messages_and_get_message() {
        let (store, id) = store_with(&["a", "b", "c"]);
        let recent = store.recent_messages(id, 2).unwrap();
        let texts: Vec<&str> = recent.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);
        assert_eq!(store.recent_messages(id, 10).unwrap().len(), 3);

        let found = store.get_message(id, recent[0].id).unwrap();
        assert_eq!(found.text, "b");
        assert!(matches!(
            store.get_message(id, Uuid::new_v4()),
            Err(StoreError::MessageNotFound { .. })
        ));
    }

    #[test]
    fn test_list_is_per_owner_newest_first() {
        let store = ConversationStore::in_memory();
        let first = store.create_conversation("alice", None, None);
        let second = store.create_conversation("alice", None, None);
        store.create_conversation("bob", None, None);
        store
            .append_message(first, Message::user("bump").with_created_at(Utc::now() + Duration::seconds(5)))
            .unwrap();

        let listed = store.list(Some("alice"));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first);
        assert_eq!(listed[1].id, second);
        assert_eq!(store.list(None).len(), 3);
    }

    #[test]
    fn test_import_validates_records() {
        let (source, id) = store_with(&["alpha", "beta"]);
        let exported = source.get(id).unwrap();

        let target = ConversationStore::in_memory();
        assert_eq!(target.import(exported.clone()).unwrap(), id);
        assert_eq!(target.search("beta").len(), 1);
        assert!(matches!(target.import(exported.clone()), Err(StoreError::InvalidRecord(_))));

        let mut duplicated = exported.clone();
        duplicated.id = Uuid::new_v4();
        duplicated.messages[1].id = duplicated.messages[0].id;
        assert!(matches!(target.import(duplicated), Err(StoreError::InvalidRecord(_))));

        let mut reordered = exported;
        reordered.id = Uuid::new_v4();
        reordered.messages[0].created_at = reordered.messages[1].created_at + Duration::seconds(1);
        assert!(matches!(target.import(reordered), Err(StoreError::InvalidRecord(_))));
    }

    #[test]
    fn test_stats() {
        let store = ConversationStore::in_memory();
        let a = store.create_conversation("alice", None, Some("fast".to_string()));
        store.create_conversation("alice", None, None);
        store.append_message(a, Message::user("q")).unwrap();
        store.append_message(a, Message::assistant("r", "fast")).unwrap();
        store.set_pinned(a, true).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_conversations, 2);
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.avg_messages_per_conversation, 1.0);
        assert_eq!(stats.pinned_conversations, 1);
        assert_eq!(stats.model_usage.get("fast"), Some(&1));
        assert_eq!(stats.conversations_by_date.values().sum::<usize>(), 2);
        assert!(stats.oldest_conversation <= stats.newest_conversation);
    }

    #[test]
    fn test_concurrent_appends_are_all_indexed() {
        let store = Arc::new(ConversationStore::in_memory());
        let id = store.create_conversation("alice", None, None);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.append_message(id, Message::user(format!("worker{} shared", i))).unwrap();
                    store.search("shared").len()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap() >= 1);
        }

        assert_eq!(store.get(id).unwrap().messages.len(), 8);
        assert_eq!(store.search("shared").len(), 8);
    }

    #[tokio::test]
    async fn test_persisted_store_rehydrates() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = Some(dir.path().to_path_buf());

        let store = ConversationStore::open(data_dir.clone()).await.unwrap();
        assert!(store.is_persistent());
        let id = store.create_conversation("alice", None, None);
        store.append_message(id, Message::user("durable thoughts")).unwrap();
        let gone = store.create_conversation("alice", None, None);
        store.delete(gone).unwrap();
        store.flush().await.unwrap();
        let before = store.get(id).unwrap();

        let reopened = ConversationStore::open(data_dir).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(id).unwrap(), before);
        assert_eq!(reopened.search("durable").len(), 1);
    }

    #[test]
    fn test_failed_attachment_is_still_stored() {
        let (store, id) = store_with(&[]);
        let failed = ExtractedContent::failed(
            SourceKind::Pdf,
            FileMetadata::new("scan.pdf", "application/pdf", 10),
            ExtractionNote::new("broken xref"),
        );
        let stored = store
            .append_message(id, Message::user("here").with_attachments(vec![failed]))
            .unwrap();
        assert_eq!(store.get_message(id, stored.id).unwrap().attachments.len(), 1);
    }
}
