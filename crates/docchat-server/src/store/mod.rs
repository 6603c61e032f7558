//! Conversation store
//!
//! Conversations, their messages and the inverted search index. Optionally
//! durable through the write-behind persister.

pub mod conversation_store;
pub mod error;
pub mod index;
pub mod persist;
pub mod types;

pub use conversation_store::ConversationStore;
pub use error::StoreError;
pub use index::tokenize;
pub use types::{
    derive_title, Conversation, ConversationActivity, ConversationSummary, Message, Role,
    SearchHit, StoreStats,
};
