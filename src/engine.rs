//! Query engine: fusion retrieval → rerank → answer synthesis.
//!
//! An engine is immutable once built. It holds the node store and the
//! three retrievers of one snapshot; observing a newer snapshot means
//! building a new engine (see [`crate::rebuild`]).

use std::sync::Arc;

use async_trait::async_trait;
use docfusion_core::models::{Citation, Node};
use docfusion_core::store::NodeStore;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ProviderError, QueryError};
use crate::llm::ChatModel;
use crate::rerank::Reranker;
use crate::retriever::{FusionRetriever, RetrieverFailure};

/// Returned as the answer when no retriever matched anything.
pub const NO_RESULTS_ANSWER: &str = "No relevant documentation was found for this query.";

#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    /// Answer `query` from `context`, best node first.
    async fn synthesize(&self, query: &str, context: &[Node]) -> Result<String, ProviderError>;
}

/// Synthesizes with a primary model, falling back to a second one when the
/// primary fails after its retries.
pub struct LlmSynthesizer {
    primary: Arc<dyn ChatModel>,
    fallback: Option<Arc<dyn ChatModel>>,
}

impl LlmSynthesizer {
    pub fn new(primary: Arc<dyn ChatModel>, fallback: Option<Arc<dyn ChatModel>>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl AnswerSynthesizer for LlmSynthesizer {
    async fn synthesize(&self, query: &str, context: &[Node]) -> Result<String, ProviderError> {
        let prompt = answer_prompt(query, context);
        match self.primary.complete(&prompt).await {
            Ok(answer) => Ok(answer),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    warn!(primary = %self.primary.name(), fallback = %fallback.name(), error = %e, "synthesis failed, trying fallback model");
                    fallback.complete(&prompt).await
                }
                None => Err(e),
            },
        }
    }
}

fn answer_prompt(query: &str, context: &[Node]) -> String {
    let mut ctx = String::new();
    for node in context {
        ctx.push_str(&format!("source: {}\n{}\n\n", node.source_path, node.indexed_text()));
    }
    format!(
        "Context information is below.\n\
---------------------\n\
{ctx}\
---------------------\n\
Given the context information and not prior knowledge, answer the query. \
Quote API names exactly as they appear in the context.\n\
Query: {query}\n\
Answer: "
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    /// Nodes the answer was grounded on, in rerank order.
    pub citations: Vec<Citation>,
    /// Retrievers left out of fusion. Non-empty means degraded mode.
    pub degraded: Vec<RetrieverFailure>,
    /// Candidates whose rerank batch could not be graded.
    pub ungraded: Vec<String>,
}

impl QueryResponse {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }

    /// True when retrieval succeeded but matched nothing.
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }
}

pub struct QueryEngine {
    nodes: NodeStore,
    fusion: FusionRetriever,
    reranker: Reranker,
    synthesizer: Arc<dyn AnswerSynthesizer>,
    top_k: usize,
    top_n: usize,
}

impl QueryEngine {
    pub fn new(
        nodes: NodeStore,
        fusion: FusionRetriever,
        reranker: Reranker,
        synthesizer: Arc<dyn AnswerSynthesizer>,
        top_k: usize,
        top_n: usize,
    ) -> Self {
        Self {
            nodes,
            fusion,
            reranker,
            synthesizer,
            top_k,
            top_n,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub async fn query(&self, text: &str) -> Result<QueryResponse, QueryError> {
        let fused = self.fusion.retrieve(text, self.top_k).await?;

        if fused.results.is_empty() {
            info!(degraded = fused.degraded.len(), "query matched no nodes");
            return Ok(QueryResponse {
                answer: NO_RESULTS_ANSWER.to_string(),
                citations: Vec::new(),
                degraded: fused.degraded,
                ungraded: Vec::new(),
            });
        }

        let reranked = self
            .reranker
            .rerank(text, &fused.results, &self.nodes, self.top_n)
            .await;

        let mut context = Vec::with_capacity(reranked.candidates.len());
        let mut citations = Vec::with_capacity(reranked.candidates.len());
        for candidate in &reranked.candidates {
            let Some(node) = self.nodes.get(&candidate.result.node_id) else {
                warn!(node = %candidate.result.node_id, "retrieved node missing from node store");
                continue;
            };
            citations.push(Citation {
                node_id: node.id.clone(),
                source_path: node.source_path.clone(),
                heading_path: node.heading_path.clone(),
                fused_score: candidate.result.fused_score,
            });
            context.push(node.clone());
        }

        let answer = self
            .synthesizer
            .synthesize(text, &context)
            .await
            .map_err(QueryError::Synthesis)?;

        info!(
            fused = fused.results.len(),
            cited = citations.len(),
            degraded = fused.degraded.len(),
            ungraded = reranked.ungraded.len(),
            "query answered"
        );

        Ok(QueryResponse {
            answer,
            citations,
            degraded: fused.degraded,
            ungraded: reranked.ungraded,
        })
    }
}
