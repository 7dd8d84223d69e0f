//! kgraph Configuration Management
//!
//! Handles configuration from environment variables and TOML files with
//! sensible defaults for local runs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::schema::{ClassDefinition, MergePolicy, SeedEntity, System};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Pipeline configuration
    pub pipeline: PipelineConfig,

    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Graph snapshot storage
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Initial schema
    pub schema: SchemaSeed,
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        })
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_override()
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { message, .. } => ConfigError::ParseError { path, message },
            other => other,
        })
    }

    /// Parse TOML content
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variables on top of this configuration (env takes
    /// precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        // Pipeline
        if let Ok(workers) = std::env::var("KGRAPH_WORKERS") {
            self.pipeline.extraction_workers = parse_env("KGRAPH_WORKERS", workers)?;
        }
        if let Ok(strict) = std::env::var("KGRAPH_STRICT_MERGE") {
            self.pipeline.strict_merge = parse_env("KGRAPH_STRICT_MERGE", strict)?;
        }
        if let Ok(evolve) = std::env::var("KGRAPH_SCHEMA_EVOLUTION") {
            self.pipeline.schema_evolution = parse_env("KGRAPH_SCHEMA_EVOLUTION", evolve)?;
        }

        // Storage
        if let Ok(path) = std::env::var("KGRAPH_GRAPH_PATH") {
            self.storage.graph_path = PathBuf::from(path);
        }

        // LLM
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.openai_api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            self.llm.openai_base_url = Some(url);
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            self.llm.ollama_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(check) = std::env::var("KGRAPH_EXTRACTION_CHECK") {
            self.llm.check_extraction = parse_env("KGRAPH_EXTRACTION_CHECK", check)?;
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }

        self.validate()?;
        Ok(self)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.extraction_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.extraction_workers".to_string(),
                value: "0".to_string(),
            });
        }
        if self.pipeline.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pipeline.event_capacity".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of parallel extraction workers
    pub extraction_workers: usize,

    /// Abort a task's merge on the first failed item
    pub strict_merge: bool,

    /// Ask the schema advisor for extensions before extraction
    pub schema_evolution: bool,

    /// How candidate property values are merged into existing entities
    pub merge_policy: MergePolicy,

    /// Progress event channel capacity
    pub event_capacity: usize,

    /// Maximum number of finished tasks kept for status queries
    pub task_retention_capacity: u64,

    /// Seconds a finished task stays queryable
    pub task_retention_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extraction_workers: 4,
            strict_merge: false,
            schema_evolution: true,
            merge_policy: MergePolicy::FillMissing,
            event_capacity: 1024,
            task_retention_capacity: 10_000,
            task_retention_ttl_secs: 3600,
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// LLM provider to use
    pub provider: LlmProvider,

    /// OpenAI API key
    pub openai_api_key: Option<String>,

    /// OpenAI API base URL (for compatible APIs)
    pub openai_base_url: Option<String>,

    /// Ollama server URL
    pub ollama_url: String,

    /// Model name to use
    pub model: String,

    /// Maximum tokens for completion
    pub max_tokens: u32,

    /// Temperature for generation
    pub temperature: f32,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Ask the model to confirm or correct each extraction
    pub check_extraction: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAI,
            openai_api_key: None,
            openai_base_url: None,
            ollama_url: "http://localhost:11434".to_string(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 2048,
            temperature: 0.1,
            timeout_secs: 120,
            check_extraction: true,
        }
    }
}

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    Ollama,
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "ollama" => Ok(Self::Ollama),
            _ => Err(ConfigError::InvalidValue {
                key: "LLM_PROVIDER".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Graph snapshot storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON snapshot location
    pub graph_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            graph_path: PathBuf::from("kgraph.json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Initial schema: seed classes and seed entities
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchemaSeed {
    pub classes: Vec<ClassDefinition>,
    pub seed_entities: Vec<SeedEntity>,
}

impl SchemaSeed {
    /// Build the initial System
    pub fn into_system(self) -> crate::Result<System> {
        System::from_parts(self.classes, self.seed_entities)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl From<ConfigError> for crate::KgError {
    fn from(err: ConfigError) -> Self {
        crate::KgError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.extraction_workers, 4);
        assert!(!config.pipeline.strict_merge);
        assert!(config.pipeline.schema_evolution);
        assert_eq!(config.pipeline.merge_policy, MergePolicy::FillMissing);
        assert_eq!(config.pipeline.task_retention_capacity, 10_000);
        assert!(config.llm.check_extraction);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_llm_provider_parse() {
        assert_eq!(
            "openai".parse::<LlmProvider>().unwrap(),
            LlmProvider::OpenAI
        );
        assert_eq!(
            "OLLAMA".parse::<LlmProvider>().unwrap(),
            LlmProvider::Ollama
        );
        assert!("invalid".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let config = AppConfig::from_toml_str(
            r#"
            [pipeline]
            extraction_workers = 2
            merge_policy = "overwrite"

            [llm]
            check_extraction = false

            [storage]
            graph_path = "/tmp/g.json"

            [[schema.classes]]
            name = "App"
            properties = [{ name = "vendor", required = true }]

            [[schema.seed_entities]]
            name = "Me"
            classes = []
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.extraction_workers, 2);
        assert_eq!(config.pipeline.merge_policy, MergePolicy::Overwrite);
        assert!(config.pipeline.schema_evolution);
        assert!(!config.llm.check_extraction);
        assert_eq!(config.storage.graph_path, PathBuf::from("/tmp/g.json"));

        let system = config.schema.into_system().unwrap();
        assert!(system.get_class("app").unwrap().property("vendor").unwrap().required);
        assert_eq!(system.seed_entities().len(), 1);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = AppConfig::from_toml_str("[pipeline]\nextraction_workers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_file_missing() {
        let err = AppConfig::from_file("/nonexistent/kgraph.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileReadError { .. }));
    }
}
