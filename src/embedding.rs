//! Embedding providers.
//!
//! [`Embedder`] turns texts into vectors. Implementations:
//! - **`openai`**: `POST /v1/embeddings` with batching and backoff.
//! - **`ollama`**: a local Ollama instance's `/api/embed` endpoint.
//! - **`hashing`**: deterministic feature hashing over exact tokens. No
//!   network, no credentials; used offline and in tests.
//!
//! Use [`create_embedder`] to build the one the configuration selects.
//!
//! # Retry Strategy
//!
//! Network providers retry transient failures through
//! [`with_backoff`](crate::retry::with_backoff):
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docfusion_core::embedding::l2_normalize;
use docfusion_core::lexical::tokenize;
use serde_json::{json, Value};

use crate::config::EmbeddingConfig;
use crate::error::ProviderError;
use crate::llm::require_key;
use crate::retry::{send_json, with_backoff, RetryPolicy};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier persisted with the vector store; a change forces a full
    /// re-embed.
    fn model_id(&self) -> String;

    fn dims(&self) -> usize;

    /// Embed `texts`, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, ProviderError> {
    embedder
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("empty embedding response".into()))
}

pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, ProviderError> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims))),
        other => Err(ProviderError::Rejected(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ProviderError::Rejected(format!("failed to build HTTP client: {}", e)))
}

fn check_dims(vectors: &[Vec<f32>], expected: usize, want: usize) -> Result<(), ProviderError> {
    if vectors.len() != want {
        return Err(ProviderError::Malformed(format!(
            "expected {} embeddings, got {}",
            want,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(ProviderError::Malformed(format!(
            "expected {} dimensions, got {}",
            expected,
            bad.len()
        )));
    }
    Ok(())
}

// ============ OpenAI ============

/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    url: String,
    policy: RetryPolicy,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key: require_key("OPENAI_API_KEY")?,
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            policy: RetryPolicy::new(config.max_retries, config.backoff_base_ms),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> String {
        format!("openai/{}@{}", self.model, self.dims)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/v1/embeddings", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let body = json!({
                "model": self.model,
                "input": batch,
                "dimensions": self.dims,
            });
            let value = with_backoff(&self.policy, "openai.embeddings", || {
                send_json(
                    "OpenAI",
                    self.client
                        .post(&url)
                        .header("Authorization", format!("Bearer {}", self.api_key))
                        .json(&body),
                )
            })
            .await?;
            let vectors = parse_openai_response(&value)?;
            check_dims(&vectors, self.dims, batch.len())?;
            out.extend(vectors);
        }

        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::Malformed("OpenAI response missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::Malformed("OpenAI response missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    dims: usize,
    batch_size: usize,
    url: String,
    policy: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            model: config.model.clone(),
            dims: config.dims,
            batch_size: config.batch_size.max(1),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            policy: RetryPolicy::new(config.max_retries, config.backoff_base_ms),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> String {
        format!("ollama/{}@{}", self.model, self.dims)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let body = json!({ "model": self.model, "input": batch });
            let value = with_backoff(&self.policy, "ollama.embed", || {
                send_json("Ollama", self.client.post(&url).json(&body))
            })
            .await?;
            let vectors = parse_ollama_response(&value)?;
            check_dims(&vectors, self.dims, batch.len())?;
            out.extend(vectors);
        }

        Ok(out)
    }
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::Malformed("Ollama response missing embeddings array".into()))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|a| {
                    a.iter()
                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                        .collect::<Vec<f32>>()
                })
                .ok_or_else(|| ProviderError::Malformed("Ollama embedding is not an array".into()))
        })
        .collect()
}

// ============ Hashing ============

/// Deterministic bag-of-tokens embedding.
///
/// Each token is hashed (FNV-1a) into one of `dims` buckets and the vector
/// is L2-normalized. Identical text always yields the identical vector,
/// across processes and platforms.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(8) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let idx = (fnv1a(token.as_bytes()) % self.dims as u64) as usize;
            vec[idx] += 1.0;
        }
        l2_normalize(&mut vec);
        vec
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> String {
        format!("hashing@{}", self.dims)
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
