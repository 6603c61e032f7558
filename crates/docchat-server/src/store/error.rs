use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Conversation {0} not found")]
    NotFound(Uuid),

    #[error("Message {message_id} not found in conversation {conversation_id}")]
    MessageNotFound {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    #[error("Invalid conversation record: {0}")]
    InvalidRecord(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}
