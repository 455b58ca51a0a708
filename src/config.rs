//! Dispatch configuration
//!
//! Read from the process environment (after `.env` is loaded by the binary).
//! Every setting has a default so a bare environment still runs against the
//! public routing endpoints and the geometric fallback.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which chat backend the arbiter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    OpenAiCompatible,
    Ollama,
}

impl LlmBackend {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmBackend::OpenAiCompatible => "https://api.groq.com/openai/v1",
            LlmBackend::Ollama => "http://localhost:11434",
        }
    }
}

impl FromStr for LlmBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "groq" => Ok(LlmBackend::OpenAiCompatible),
            "ollama" => Ok(LlmBackend::Ollama),
            other => anyhow::bail!("unknown LLM backend '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// SQLite database holding customers, technicians and assignments
    pub db_path: PathBuf,
    pub ors_api_key: Option<String>,
    pub ors_base_url: String,
    pub osrm_base_url: String,
    /// Budget for each routing provider call
    pub routing_timeout: Duration,
    pub llm_backend: LlmBackend,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    /// Budget for the arbiter's model call
    pub llm_timeout: Duration,
    pub llm_temperature: f32,
    /// Maximum concurrent distance resolutions per dispatch
    pub resolver_concurrency: usize,
    pub shortlist_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("proximity_dispatch.db"),
            ors_api_key: None,
            ors_base_url: "https://api.openrouteservice.org".to_string(),
            osrm_base_url: "http://router.project-osrm.org".to_string(),
            routing_timeout: Duration::from_secs(10),
            llm_backend: LlmBackend::OpenAiCompatible,
            llm_base_url: LlmBackend::OpenAiCompatible.default_base_url().to_string(),
            llm_api_key: None,
            llm_model: "llama3-8b-8192".to_string(),
            llm_timeout: Duration::from_secs(30),
            llm_temperature: 0.3,
            resolver_concurrency: 8,
            shortlist_size: 3,
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let llm_backend = get("LLM_BACKEND")
            .map(|v| v.parse::<LlmBackend>())
            .transpose()
            .context("Invalid LLM_BACKEND")?
            .unwrap_or(defaults.llm_backend);

        Ok(Self {
            db_path: get("DISPATCH_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            ors_api_key: get("ORS_API_KEY"),
            ors_base_url: get("ORS_BASE_URL").unwrap_or(defaults.ors_base_url),
            osrm_base_url: get("OSRM_BASE_URL").unwrap_or(defaults.osrm_base_url),
            routing_timeout: parse_secs(get("ROUTING_TIMEOUT_SECS"), "ROUTING_TIMEOUT_SECS")?
                .unwrap_or(defaults.routing_timeout),
            llm_backend,
            // unset base URL follows the chosen backend
            llm_base_url: get("LLM_BASE_URL").unwrap_or_else(|| llm_backend.default_base_url().to_string()),
            llm_api_key: get("GROQ_API_KEY").or_else(|| get("LLM_API_KEY")),
            llm_model: get("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_timeout: parse_secs(get("LLM_TIMEOUT_SECS"), "LLM_TIMEOUT_SECS")?
                .unwrap_or(defaults.llm_timeout),
            llm_temperature: parse_value(get("LLM_TEMPERATURE"), "LLM_TEMPERATURE")?
                .unwrap_or(defaults.llm_temperature),
            resolver_concurrency: parse_value(get("RESOLVER_CONCURRENCY"), "RESOLVER_CONCURRENCY")?
                .unwrap_or(defaults.resolver_concurrency)
                .max(1),
            shortlist_size: parse_value(get("SHORTLIST_SIZE"), "SHORTLIST_SIZE")?
                .unwrap_or(defaults.shortlist_size)
                .max(1),
        })
    }
}

fn parse_value<T>(raw: Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("Invalid value for {}", key))
}

fn parse_secs(raw: Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse_value::<u64>(raw, key)?.map(Duration::from_secs))
}
