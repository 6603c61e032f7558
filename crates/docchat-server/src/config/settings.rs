use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Give clear, well-structured answers. \
When the user attaches files, ground your answer in their content and say when something is not in them.";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub limits: LimitsConfig,
    pub ocr: OcrConfig,
    pub text: TextConfig,
    pub cache: CacheConfig,
    pub retention: RetentionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    /// Daily rolling log files are written here when set
    pub directory: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    pub max_upload_bytes: u64,
    pub extraction_timeout_ms: u64,
    pub extraction_concurrency: usize,
    pub completion_concurrency: usize,
    pub acquire_timeout_ms: u64,
    pub max_batch_files: usize,
}

impl LimitsConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OcrConfig {
    /// Images still yield format and dimensions when off
    pub enabled: bool,
    pub command: String,
    pub language: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TextConfig {
    /// WHATWG encoding labels, tried in order
    pub encodings: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_entries: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetentionConfig {
    pub max_age_days: u64,
    pub max_count: usize,
    /// 0 disables the periodic sweep
    pub sweep_interval_seconds: u64,
}

impl RetentionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_days.saturating_mul(24 * 60 * 60))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StorageConfig {
    /// In-memory only when absent
    pub data_dir: Option<String>,
}

impl StorageConfig {
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .as_deref()
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_history_messages: usize,
    /// Sent ahead of every conversation. Blank means none.
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub models: Vec<ModelConfig>,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    pub name: String,
    pub display_name: String,
    pub max_tokens: u32,
    #[serde(default)]
    pub supports_vision: bool,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = Self::builder_with_defaults()?
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("text.encodings")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Built-in defaults only, no file or environment sources
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::builder_with_defaults()?.build()?.try_deserialize()
    }

    fn builder_with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("logging.level", "info,docchat_server=debug")?
            .set_default("logging.json", true)?
            .set_default("limits.max_upload_bytes", 100 * 1024 * 1024)?
            .set_default("limits.extraction_timeout_ms", 30_000)?
            .set_default("limits.extraction_concurrency", 4)?
            .set_default("limits.completion_concurrency", 8)?
            .set_default("limits.acquire_timeout_ms", 10_000)?
            .set_default("limits.max_batch_files", 10)?
            .set_default("ocr.enabled", true)?
            .set_default("ocr.command", "tesseract")?
            .set_default("ocr.language", "eng")?
            .set_default(
                "text.encodings",
                vec!["utf-8", "utf-16le", "utf-16be", "windows-1252"],
            )?
            .set_default("cache.ttl_seconds", 1800)?
            .set_default("cache.max_entries", 100)?
            .set_default("retention.max_age_days", 30)?
            .set_default("retention.max_count", 500)?
            .set_default("retention.sweep_interval_seconds", 3600)?
            .set_default("llm.base_url", "http://127.0.0.1:8081")?
            .set_default("llm.default_model", "default")?
            .set_default("llm.timeout_seconds", 60)?
            .set_default("llm.max_retries", 1)?
            .set_default("llm.retry_backoff_ms", 500)?
            .set_default("llm.temperature", 0.7)?
            .set_default("llm.max_tokens", 2048)?
            .set_default("llm.max_history_messages", 10)?
            .set_default("llm.system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .set_default("llm.models", Vec::<config::Value>::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_complete() {
        let settings = Settings::defaults().unwrap();
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.limits.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(settings.text.encodings[0], "utf-8");
        assert_eq!(settings.cache.ttl(), Duration::from_secs(1800));
        assert!(settings.storage.data_dir().is_none());
        assert!(settings.llm.models.is_empty());
    }

    #[test]
    fn test_huge_retention_age_saturates() {
        let retention = RetentionConfig {
            max_age_days: u64::MAX,
            max_count: 1,
            sweep_interval_seconds: 0,
        };
        assert_eq!(retention.max_age(), Duration::from_secs(u64::MAX));

        let month = RetentionConfig { max_age_days: 30, ..retention };
        assert_eq!(month.max_age(), Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn test_blank_system_prompt_is_none() {
        let mut llm = Settings::defaults().unwrap().llm;
        assert!(llm.system_prompt().is_some_and(|p| p.starts_with("You are")));
        llm.system_prompt = Some(" \n ".to_string());
        assert!(llm.system_prompt().is_none());
    }

    #[test]
    fn test_blank_data_dir_means_in_memory() {
        let storage = StorageConfig { data_dir: Some("  ".to_string()) };
        assert!(storage.data_dir().is_none());
    }
}
