//! LLM relevance reranking.
//!
//! The fused candidate list is cut into batches of `batch_size` and each
//! batch is graded with one [`RelevanceGrader`] call. Ordering is done by
//! [`merge_grades`]: graded candidates by relevance, then the members of
//! any batch whose grading failed, in fused order. A failed batch never
//! fails the query; its ids are reported in [`RerankOutcome::ungraded`].
//!
//! ```text
//! fused: [c1 c2 c3 c4 c5][c6 c7 c8 c9 c10][c11 ...]
//!             │                 │
//!          grade ✓           grade ✗ ──▶ appended after graded, in fused order
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use docfusion_core::models::{FusedResult, Node};
use docfusion_core::rerank::{merge_grades, BatchGrades};
use docfusion_core::store::NodeStore;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::llm::ChatModel;

pub use docfusion_core::rerank::{RerankOutcome, RerankedCandidate};

#[async_trait]
pub trait RelevanceGrader: Send + Sync {
    /// Grade `batch` against `query`. Returns one entry per batch member in
    /// order; `None` for members the grader did not score.
    async fn grade(&self, query: &str, batch: &[Node]) -> Result<Vec<Option<f64>>, ProviderError>;
}

pub struct Reranker {
    grader: Arc<dyn RelevanceGrader>,
    batch_size: usize,
}

impl Reranker {
    pub fn new(grader: Arc<dyn RelevanceGrader>, batch_size: usize) -> Self {
        Self {
            grader,
            batch_size: batch_size.max(1),
        }
    }

    /// Grade and reorder `candidates`, keeping at most `top_n`.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: &[FusedResult],
        store: &NodeStore,
        top_n: usize,
    ) -> RerankOutcome {
        let mut grades = Vec::new();

        for (seq, batch) in candidates.chunks(self.batch_size).enumerate() {
            let nodes: Option<Vec<Node>> = batch
                .iter()
                .map(|c| store.get(&c.node_id).cloned())
                .collect();
            let Some(nodes) = nodes else {
                warn!(batch = seq, "rerank batch references unknown nodes, leaving ungraded");
                grades.push(BatchGrades::Failed);
                continue;
            };

            match self.grader.grade(query, &nodes).await {
                Ok(scores) => {
                    debug!(batch = seq, graded = scores.iter().flatten().count(), "batch graded");
                    grades.push(BatchGrades::Graded(scores));
                }
                Err(e) => {
                    warn!(batch = seq, size = nodes.len(), error = %e, "rerank batch failed, falling back to fused order");
                    grades.push(BatchGrades::Failed);
                }
            }
        }

        merge_grades(candidates, self.batch_size, &grades, top_n)
    }
}

/// Choice-select grader: the model lists `Doc: n, Relevance: s` lines for
/// the documents worth consulting.
pub struct LlmGrader {
    model: Arc<dyn ChatModel>,
}

impl LlmGrader {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl RelevanceGrader for LlmGrader {
    async fn grade(&self, query: &str, batch: &[Node]) -> Result<Vec<Option<f64>>, ProviderError> {
        let reply = self.model.complete(&choice_select_prompt(query, batch)).await?;
        Ok(parse_choice_select(&reply, batch.len()))
    }
}

fn choice_select_prompt(query: &str, batch: &[Node]) -> String {
    let mut docs = String::new();
    for (i, node) in batch.iter().enumerate() {
        docs.push_str(&format!("Document {}:\n{}\n\n", i + 1, node.indexed_text()));
    }
    format!(
        "A list of documents is shown below. Each document has a number next to it. \
A question is also provided.\n\
Respond with the numbers of the documents you should consult to answer the question, \
in order of relevance, as well as the relevance score. The relevance score is a number \
from 1-10 based on how relevant you think the document is to the question.\n\
Do not include any documents that are not relevant to the question.\n\
Example format:\n\
Doc: 2, Relevance: 7\n\
Doc: 1, Relevance: 4\n\n\
{docs}\
Question: {query}\n\
Answer:\n"
    )
}

/// Parse `Doc: n, Relevance: s` lines into per-member scores.
///
/// Document numbers are 1-based. Out-of-range numbers and unparseable
/// lines are ignored; a repeated number keeps its first score.
pub fn parse_choice_select(reply: &str, batch_len: usize) -> Vec<Option<f64>> {
    let mut scores = vec![None; batch_len];

    for line in reply.lines() {
        let lower = line.to_lowercase();
        let (Some(doc_at), Some(rel_at)) = (lower.find("doc"), lower.find("relevance")) else {
            continue;
        };
        if rel_at < doc_at {
            continue;
        }
        let Some(doc) = first_number(&lower[doc_at + 3..rel_at]) else {
            continue;
        };
        let Some(score) = first_number(&lower[rel_at + "relevance".len()..]) else {
            continue;
        };

        let doc = doc as usize;
        if doc == 0 || doc > batch_len {
            continue;
        }
        if scores[doc - 1].is_none() {
            scores[doc - 1] = Some(score);
        }
    }

    scores
}

fn first_number(s: &str) -> Option<f64> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].trim_end_matches('.').parse().ok()
}
