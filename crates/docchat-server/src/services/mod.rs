pub mod chat_service;
pub mod export;
pub mod llm_service;
pub mod response_cache;
pub mod retention;

pub use chat_service::{ChatError, ChatOutcome, ChatService, ChatTurnInput};
pub use export::{ExportError, ExportFormat, Exporter};
pub use llm_service::{ChatTurn, CompletionRequest, CompletionService, LlmService, SamplingParams, ServiceError};
pub use response_cache::{CacheMiss, CacheStats, Fingerprint, ResponseCache};
pub use retention::RetentionManager;
