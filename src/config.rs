//! Configuration parsing and validation.
//!
//! docfusion is configured with one TOML file, parsed once into an
//! immutable [`Config`] and handed to every builder and engine
//! constructor. Every section is optional; an empty file yields the
//! defaults below.
//!
//! ```toml
//! [snapshot]
//! dir = "./rag_storage"
//! keep_generations = 2
//!
//! [ingest]
//! docs_dir = "./docs"
//! include_globs = ["**/*.md"]
//! max_node_tokens = 1024
//!
//! [graph]
//! batch_size = 500             # checkpoint interval
//! max_triplets_per_node = 5
//! workers = 8
//!
//! [retrieval]
//! top_k = 10
//! rrf_k = 60.0
//! retriever_timeout_secs = 20
//!
//! [rerank]
//! batch_size = 5
//! top_n = 5
//!
//! [embedding]
//! provider = "openai"          # openai | ollama | hashing
//! model = "text-embedding-3-large"
//! dims = 3072
//!
//! [extraction]
//! provider = "openai"          # openai | anthropic | gemini
//! model = "gpt-4o-mini"
//! max_retries = 10
//!
//! [grading]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [synthesis]
//! provider = "anthropic"
//! model = "claude-3-5-sonnet-20240620"
//!
//! [synthesis.fallback]
//! provider = "gemini"
//! model = "gemini-2.0-flash"
//!
//! [server]
//! bind = "127.0.0.1:7341"
//! tool_name = "query_docs"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub snapshot: SnapshotConfig,
    pub ingest: IngestConfig,
    pub graph: GraphConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub embedding: EmbeddingConfig,
    pub extraction: ChatConfig,
    pub grading: ChatConfig,
    pub synthesis: SynthesisConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot: SnapshotConfig::default(),
            ingest: IngestConfig::default(),
            graph: GraphConfig::default(),
            retrieval: RetrievalConfig::default(),
            rerank: RerankConfig::default(),
            embedding: EmbeddingConfig::default(),
            extraction: ChatConfig {
                max_retries: 10,
                ..ChatConfig::default()
            },
            grading: ChatConfig::default(),
            synthesis: SynthesisConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SnapshotConfig {
    pub dir: PathBuf,
    /// Generation directories kept on disk, including the live one.
    pub keep_generations: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./rag_storage"),
            keep_generations: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub docs_dir: PathBuf,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    /// Sections longer than this are split on paragraph boundaries.
    pub max_node_tokens: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            docs_dir: PathBuf::from("./docs"),
            include_globs: vec!["**/*.md".to_string()],
            exclude_globs: Vec::new(),
            max_node_tokens: 1024,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    /// Nodes per checkpointed batch.
    pub batch_size: usize,
    pub max_triplets_per_node: usize,
    /// Concurrent extraction calls within one batch.
    pub workers: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_triplets_per_node: 5,
            workers: 8,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Results requested from each retriever.
    pub top_k: usize,
    /// RRF smoothing constant.
    pub rrf_k: f64,
    pub retriever_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            rrf_k: 60.0,
            retriever_timeout_secs: 20,
        }
    }
}

impl RetrievalConfig {
    pub fn retriever_timeout(&self) -> Duration {
        Duration::from_secs(self.retriever_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RerankConfig {
    pub batch_size: usize,
    pub top_n: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            top_n: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dims: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
    /// Base URL override (Ollama, or an OpenAI-compatible gateway).
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-large".to_string(),
            dims: 3072,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            backoff_base_ms: 1000,
            url: None,
        }
    }
}

/// Settings for one chat-completion provider.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChatConfig {
    pub provider: String,
    pub model: String,
    pub url: Option<String>,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    pub backoff_base_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            url: None,
            max_retries: 5,
            timeout_secs: 60,
            temperature: 0.0,
            max_tokens: 1024,
            backoff_base_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(flatten)]
    pub primary: ChatConfig,
    /// Used when the primary model fails after its retries.
    #[serde(default)]
    pub fallback: Option<ChatConfig>,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            primary: ChatConfig {
                provider: "anthropic".to_string(),
                model: "claude-3-5-sonnet-20240620".to_string(),
                max_tokens: 2048,
                ..ChatConfig::default()
            },
            fallback: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Name of the single query tool exposed over MCP and HTTP.
    pub tool_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7341".to_string(),
            tool_name: "query_docs".to_string(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.snapshot.keep_generations == 0 {
            bail!("snapshot.keep_generations must be >= 1");
        }
        if self.ingest.include_globs.is_empty() {
            bail!("ingest.include_globs must not be empty");
        }

        if self.graph.batch_size == 0 {
            bail!("graph.batch_size must be > 0");
        }
        if self.graph.workers == 0 {
            bail!("graph.workers must be > 0");
        }
        if self.graph.max_triplets_per_node == 0 {
            bail!("graph.max_triplets_per_node must be > 0");
        }

        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be > 0");
        }
        if self.retrieval.rrf_k.is_nan() || self.retrieval.rrf_k <= 0.0 {
            bail!("retrieval.rrf_k must be > 0");
        }
        if self.retrieval.retriever_timeout_secs == 0 {
            bail!("retrieval.retriever_timeout_secs must be > 0");
        }

        if self.rerank.batch_size == 0 {
            bail!("rerank.batch_size must be > 0");
        }
        if self.rerank.top_n == 0 {
            bail!("rerank.top_n must be > 0");
        }

        match self.embedding.provider.as_str() {
            "openai" | "ollama" | "hashing" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be openai, ollama, or hashing.",
                other
            ),
        }
        if self.embedding.dims == 0 {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                self.embedding.provider
            );
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }

        validate_chat("extraction", &self.extraction)?;
        validate_chat("grading", &self.grading)?;
        validate_chat("synthesis", &self.synthesis.primary)?;
        if let Some(fallback) = &self.synthesis.fallback {
            validate_chat("synthesis.fallback", fallback)?;
        }

        if self.server.tool_name.trim().is_empty() {
            bail!("server.tool_name must not be empty");
        }

        Ok(())
    }
}

fn validate_chat(section: &str, chat: &ChatConfig) -> Result<()> {
    match chat.provider.as_str() {
        "openai" | "anthropic" | "gemini" => {}
        other => bail!(
            "Unknown {} provider: '{}'. Must be openai, anthropic, or gemini.",
            section,
            other
        ),
    }
    if chat.model.trim().is_empty() {
        bail!("{}.model must be specified", section);
    }
    Ok(())
}
