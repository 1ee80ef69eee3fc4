//! TOML configuration for the tutor backend.
//!
//! Non-secret settings live in a TOML file (default `./config/tutor.toml`).
//! API keys are read from the environment, optionally seeded from a `.env`
//! file by the binary at startup.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// OpenRouter models the assistant is tuned for. Anything else is replaced
/// by [`LlmConfig::fallback_model`] at load time.
pub const SUPPORTED_OPENROUTER_MODELS: &[&str] = &[
    "anthropic/claude-3.5-sonnet",
    "anthropic/claude-3-haiku",
    "openai/gpt-4o",
    "openai/gpt-4o-mini",
    "openai/gpt-4-turbo",
    "google/gemini-pro",
    "google/gemini-flash",
    "meta-llama/llama-3.1-405b-instruct",
    "meta-llama/llama-3.1-70b-instruct",
];

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub book: BookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:3000".to_string(),
        "http://localhost:3001".to_string(),
        "http://127.0.0.1:3000".to_string(),
    ]
}

/// Chat-completion settings. `provider = "openrouter"` is used when
/// `OPENROUTER_API_KEY` is set; otherwise the client falls back to OpenAI
/// with [`LlmConfig::openai_model`].
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub base_url: String,
    pub model: String,
    pub fallback_model: String,
    pub openai_base_url: String,
    pub openai_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub referer: String,
    pub app_title: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openrouter".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "anthropic/claude-3.5-sonnet".to_string(),
            fallback_model: "anthropic/claude-3.5-sonnet".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            timeout_secs: 60,
            max_retries: 2,
            referer: "http://localhost:3000".to_string(),
            app_title: "AI Book Assistant".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub backend: String,
    pub url: String,
    pub collection: String,
    pub top_k: usize,
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            url: "http://localhost:6333".to_string(),
            collection: "book_content".to_string(),
            top_k: 5,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub max_turns: usize,
    pub max_tokens: u32,
    /// Messages fed into the agent prompt.
    pub history_window: usize,
    /// Messages loaded from a stored session.
    pub session_history: usize,
    pub history_chars: usize,
    pub selected_text_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "BookAssistant".to_string(),
            max_turns: 5,
            max_tokens: 600,
            history_window: 6,
            session_history: 10,
            history_chars: 300,
            selected_text_chars: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub personalized_ttl_days: i64,
    pub translated_ttl_days: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            personalized_ttl_days: 7,
            translated_ttl_days: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BookConfig {
    /// Directory holding `<chapter-id>/overview.mdx` files.
    pub docs_dir: Option<PathBuf>,
    pub chapters: Vec<ChapterConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChapterConfig {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.server.bind.trim().is_empty() {
        bail!("server.bind must not be empty");
    }

    match config.llm.provider.as_str() {
        "openrouter" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be openrouter or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }
    if config.llm.max_tokens == 0 {
        bail!("llm.max_tokens must be >= 1");
    }
    if config.llm.provider == "openrouter"
        && !SUPPORTED_OPENROUTER_MODELS.contains(&config.llm.model.as_str())
    {
        tracing::warn!(
            model = %config.llm.model,
            fallback = %config.llm.fallback_model,
            "unsupported OpenRouter model, using fallback"
        );
        config.llm.model = config.llm.fallback_model.clone();
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "cohere" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, cohere, or openai.",
            other
        ),
    }

    match config.vector_store.backend.as_str() {
        "qdrant" | "sqlite" => {}
        other => bail!(
            "Unknown vector_store backend: '{}'. Must be qdrant or sqlite.",
            other
        ),
    }
    if config.vector_store.top_k == 0 {
        bail!("vector_store.top_k must be >= 1");
    }

    if config.agent.max_turns == 0 {
        bail!("agent.max_turns must be >= 1");
    }
    if config.agent.max_tokens == 0 {
        bail!("agent.max_tokens must be >= 1");
    }

    if config.cache.personalized_ttl_days < 1 || config.cache.translated_ttl_days < 1 {
        bail!("cache TTLs must be >= 1 day");
    }

    for chapter in &config.book.chapters {
        if !crate::book::is_valid_chapter_id(&chapter.id) {
            bail!("invalid chapter id in book.chapters: '{}'", chapter.id);
        }
    }

    Ok(config)
}
