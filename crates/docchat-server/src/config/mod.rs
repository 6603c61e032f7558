pub mod settings;

pub use settings::{
    CacheConfig, LimitsConfig, LlmConfig, LoggingConfig, ModelConfig, OcrConfig,
    RetentionConfig, ServerConfig, Settings, StorageConfig, TextConfig,
};
