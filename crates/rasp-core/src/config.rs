use std::env;
use std::time::Duration;

use crate::error::{RaspError, RaspResult};

fn default_retrieval_top_k() -> usize {
    5
}

fn default_min_charge() -> i64 {
    50
}

fn default_max_prompt_len() -> usize {
    8_000
}

fn default_ai_temperature() -> f32 {
    0.2
}

fn default_ai_top_p() -> f32 {
    1.0
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn required_env(key: &str) -> RaspResult<String> {
    env::var(key).map_err(|_| RaspError::Config(format!("missing required environment variable {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn required_parse_env<T: std::str::FromStr>(key: &str) -> RaspResult<T> {
    required_env(key)?
        .parse()
        .map_err(|_| RaspError::Config(format!("invalid value for {key}")))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> RaspResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| RaspError::Config(format!("invalid value for {key}"))),
        Err(_) => Ok(default),
    }
}

/// Configuration for the EmbeddingClient (C1) HTTP adapter.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: Option<String>,
    pub api_key: String,
    pub model: String,
    /// Dimension every embedding response must match (spec §4.1); mismatches
    /// are rejected rather than silently reshaped.
    pub dim: usize,
}

impl EmbeddingConfig {
    pub fn from_env() -> RaspResult<Self> {
        Ok(Self {
            base_url: optional_env("EMBEDDING_BASE_URL"),
            api_key: required_env("EMBEDDING_KEY")?,
            model: required_env("EMBEDDING_MODEL")?,
            dim: required_parse_env("EMBEDDING_DIM")?,
        })
    }
}

/// Configuration for the CompletionClient (C3) HTTP adapter.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub base_url: Option<String>,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
}

impl CompletionConfig {
    pub fn from_env() -> RaspResult<Self> {
        Ok(Self {
            base_url: optional_env("LLM_BASE_URL"),
            api_key: required_env("LLM_KEY")?,
            model: required_env("LLM_MODEL")?,
            temperature: parse_env("AI_TEMPERATURE", default_ai_temperature())?,
            top_p: parse_env("AI_TOP_P", default_ai_top_p())?,
        })
    }
}

/// Configuration for the VectorStoreClient (C2) HTTP adapter.
#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub host: String,
    pub namespace: Option<String>,
    pub top_k: usize,
    /// Dimension of the vectors the index was built with (spec §4.2); a
    /// query vector of any other length is rejected before it is sent.
    pub dim: usize,
}

impl VectorStoreConfig {
    pub fn from_env() -> RaspResult<Self> {
        Ok(Self {
            host: required_env("VECTOR_INDEX_HOST")?,
            namespace: optional_env("VECTOR_NAMESPACE"),
            top_k: parse_env("RETRIEVAL_TOP_K", default_retrieval_top_k())?,
            dim: required_parse_env("VECTOR_INDEX_DIM")?,
        })
    }
}

/// Orchestrator-level limits and retry policy (spec.md §6, §9 open question 3).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_charge: i64,
    pub max_prompt_len: usize,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> RaspResult<Self> {
        Ok(Self {
            min_charge: parse_env("MIN_CHARGE", default_min_charge())?,
            max_prompt_len: parse_env("MAX_PROMPT_LEN", default_max_prompt_len())?,
            request_timeout: Duration::from_secs(parse_env("REQUEST_TIMEOUT", 30u64)?),
            max_retries: parse_env("MAX_RETRIES", default_max_retries())?,
            retry_delay: Duration::from_millis(parse_env("RETRY_DELAY", 500u64)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_config_falls_back_to_defaults_when_unset() {
        // SAFETY: test runs single-threaded within this process; no other
        // test in this module mutates these keys.
        unsafe {
            env::remove_var("MIN_CHARGE");
            env::remove_var("MAX_PROMPT_LEN");
        }
        let cfg = PipelineConfig::from_env().unwrap();
        assert_eq!(cfg.min_charge, default_min_charge());
        assert_eq!(cfg.max_prompt_len, default_max_prompt_len());
    }

    #[test]
    fn required_env_missing_is_config_error() {
        unsafe {
            env::remove_var("DEFINITELY_UNSET_RASP_KEY");
        }
        let err = required_env("DEFINITELY_UNSET_RASP_KEY").unwrap_err();
        assert!(matches!(err, RaspError::Config(_)));
    }
}
