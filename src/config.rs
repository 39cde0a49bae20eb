//! Configuration management for taskgen.
//!
//! Configuration can be set via environment variables:
//! - `OPENAI_API_KEY` - Required. API key for the model host.
//! - `TASKGEN_BASE_URL` - Optional. OpenAI-compatible base URL. Defaults to `https://api.openai.com/v1`.
//! - `TASKGEN_HOST` - Optional. Host tag used for usage accounting. Defaults to `openai`.
//! - `DEFAULT_MODEL` - Optional. Oracle model. Defaults to `gpt-4o-mini`.
//! - `TASKGEN_EMBED_MODEL` - Optional. Embedding model for the ranker. Defaults to `text-embedding-3-small`.
//! - `TASKGEN_MAX_SUBTASKS` - Optional. Subtask ceiling per agent. Defaults to `5`.
//! - `TASKGEN_SUMMARISE_COUNT` - Optional. History compaction threshold. Defaults to `5`.
//! - `TASKGEN_TOP_K` - Optional. Function retrieval budget. Defaults to `5`.
//! - `TASKGEN_RETRIEVAL_FALLBACK` - Optional. `compulsory_only` or `abort_subtask`.
//! - `TASKGEN_DEFAULT_TO_LLM` - Optional. Allow direct oracle answers. Defaults to `true`.
//! - `TASKGEN_CODE_ACTION` - Optional. Offer shell code actions. Defaults to `false`.
//! - `TASKGEN_CODE_DIR` - Optional. Working directory for code actions. Defaults to `.`.
//! - `TASKGEN_CODE_TIMEOUT_SECS` - Optional. Timeout for code actions. Defaults to `30`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::util::env_var_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// What the orchestrator does when capability retrieval fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalFallback {
    /// Present only compulsory functions (plus sub-agents and synthetic actions).
    #[default]
    CompulsoryOnly,
    /// Record the cycle as failed and move on to the next one.
    AbortSubtask,
}

impl FromStr for RetrievalFallback {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compulsory_only" | "compulsory" => Ok(Self::CompulsoryOnly),
            "abort_subtask" | "abort" => Ok(Self::AbortSubtask),
            other => Err(ConfigError::InvalidValue(
                "TASKGEN_RETRIEVAL_FALLBACK".to_string(),
                other.to_string(),
            )),
        }
    }
}

/// Ranker/embedding configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Embedding model used by the default ranker
    pub embed_model: String,

    /// Function retrieval budget
    pub top_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            embed_model: "text-embedding-3-small".to_string(),
            top_k: 5,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Model host API key
    pub api_key: String,

    /// OpenAI-compatible base URL (without the trailing endpoint)
    pub base_url: String,

    /// Host tag recorded in usage envelopes
    pub host: String,

    /// Default oracle model identifier
    pub default_model: String,

    /// Maximum subtasks per agent run
    pub max_subtasks: usize,

    /// Summarise history every N subtasks
    pub summarise_subtasks_count: usize,

    /// Whether the oracle may answer directly
    pub default_to_llm: bool,

    /// Policy on ranker failure
    pub retrieval_fallback: RetrievalFallback,

    /// Whether agents built from this config offer code actions
    pub code_action: bool,

    /// Working directory for code actions
    pub code_dir: PathBuf,

    /// Timeout applied to code actions
    pub code_timeout_secs: u64,

    /// Ranker configuration
    pub memory: MemoryConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENAI_API_KEY` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;

        let base_url = std::env::var("TASKGEN_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let host = std::env::var("TASKGEN_HOST").unwrap_or_else(|_| "openai".to_string());

        let default_model =
            std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let max_subtasks = parse_env("TASKGEN_MAX_SUBTASKS", 5)?;
        let summarise_subtasks_count = parse_env("TASKGEN_SUMMARISE_COUNT", 5)?;
        let code_timeout_secs = parse_env("TASKGEN_CODE_TIMEOUT_SECS", 30)?;

        let retrieval_fallback = match std::env::var("TASKGEN_RETRIEVAL_FALLBACK") {
            Ok(value) => value.parse()?,
            Err(_) => RetrievalFallback::default(),
        };

        let memory = MemoryConfig {
            embed_model: std::env::var("TASKGEN_EMBED_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            top_k: parse_env("TASKGEN_TOP_K", 5)?,
        };

        Ok(Self {
            api_key,
            base_url,
            host,
            default_model,
            max_subtasks,
            summarise_subtasks_count,
            default_to_llm: env_var_bool("TASKGEN_DEFAULT_TO_LLM", true),
            retrieval_fallback,
            code_action: env_var_bool("TASKGEN_CODE_ACTION", false),
            code_dir: std::env::var("TASKGEN_CODE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            code_timeout_secs,
            memory,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            host: "openai".to_string(),
            default_model,
            max_subtasks: 5,
            summarise_subtasks_count: 5,
            default_to_llm: true,
            retrieval_fallback: RetrievalFallback::default(),
            code_action: false,
            code_dir: PathBuf::from("."),
            code_timeout_secs: 30,
            memory: MemoryConfig::default(),
        }
    }

    pub fn code_timeout(&self) -> Duration {
        Duration::from_secs(self.code_timeout_secs)
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
