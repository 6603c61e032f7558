use std::collections::{HashMap, HashSet};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use super::types::Message;

/// (conversation id, message id)
pub type MessageKey = (Uuid, Uuid);

/// Lower-cased Unicode words; punctuation and whitespace are dropped,
/// including inside a word (`it's` -> `its`)
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .map(normalize_term)
        .filter(|w| !w.is_empty())
        .collect()
}

/// One segmented word as it is stored in the index
pub fn normalize_term(word: &str) -> String {
    word.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Text plus every attachment's extracted text
fn indexable_terms(message: &Message) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    let sources = std::iter::once(message.text.as_str())
        .chain(message.attachments.iter().map(|a| a.extracted_text.as_str()));
    for source in sources {
        for term in tokenize(source) {
            *counts.entry(term).or_insert(0) += 1;
        }
    }
    counts
}

/// Term -> message postings with term frequency. Derived from the
/// conversations, so it is rebuilt rather than persisted.
#[derive(Debug, Default)]
pub struct InvertedIndex {
    postings: HashMap<String, HashMap<MessageKey, u32>>,
    terms_by_conversation: HashMap<Uuid, HashSet<String>>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, conversation_id: Uuid, message: &Message) {
        let key = (conversation_id, message.id);
        let terms = self.terms_by_conversation.entry(conversation_id).or_default();
        for (term, count) in indexable_terms(message) {
            terms.insert(term.clone());
            self.postings.entry(term).or_default().insert(key, count);
        }
    }

    pub fn remove_conversation(&mut self, conversation_id: Uuid) {
        let Some(terms) = self.terms_by_conversation.remove(&conversation_id) else {
            return;
        };
        for term in terms {
            if let Some(postings) = self.postings.get_mut(&term) {
                postings.retain(|(conv, _), _| *conv != conversation_id);
                if postings.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
    }

    pub fn postings(&self, term: &str) -> Option<&HashMap<MessageKey, u32>> {
        self.postings.get(term)
    }

    /// Summed term frequency per message over the distinct query terms
    pub fn matches(&self, terms: &HashSet<String>) -> HashMap<MessageKey, u32> {
        let mut totals: HashMap<MessageKey, u32> = HashMap::new();
        for term in terms {
            if let Some(postings) = self.postings.get(term) {
                for (key, count) in postings {
                    *totals.entry(*key).or_insert(0) += count;
                }
            }
        }
        totals
    }

    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn contains_conversation(&self, conversation_id: &Uuid) -> bool {
        self.terms_by_conversation.contains_key(conversation_id)
    }
}
