//! Retriever capability and the fusion retriever.
//!
//! Exactly three retrievers exist (vector, graph, lexical) and
//! [`FusionRetriever`] holds one of each in a named field; there is no
//! registry. A query fans out to all three concurrently and fans back in:
//!
//! ```text
//!              ┌─▶ vector.retrieve_top_k ──(timeout)─┐
//! query ──join─┼─▶ graph.retrieve_top_k  ──(timeout)─┼─▶ RRF ─▶ FusionOutcome
//!              └─▶ lexical.retrieve_top_k──(timeout)─┘
//! ```
//!
//! Each retriever has its own timeout. A retriever that errors or times
//! out is dropped from fusion and reported in [`FusionOutcome::degraded`];
//! if all three fail the call returns
//! [`QueryError::RetrievalUnavailable`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docfusion_core::fusion::reciprocal_rank_fusion;
use docfusion_core::models::{FusedResult, RetrievalResult, RetrieverSource};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ProviderError, QueryError};

#[async_trait]
pub trait Retriever: Send + Sync {
    fn source(&self) -> RetrieverSource;

    /// Up to `k` results, rank 1 first.
    async fn retrieve_top_k(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, ProviderError>;
}

/// Turn `(node_id, score)` pairs, best first, into ranked results.
pub fn ranked(source: RetrieverSource, scored: Vec<(String, f64)>) -> Vec<RetrievalResult> {
    scored
        .into_iter()
        .enumerate()
        .map(|(i, (node_id, raw_score))| RetrievalResult {
            node_id,
            source,
            rank: i + 1,
            raw_score,
        })
        .collect()
}

/// A retriever left out of fusion for this query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrieverFailure {
    pub source: RetrieverSource,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FusionOutcome {
    pub results: Vec<FusedResult>,
    /// Result count per retriever that answered.
    pub retrieved: BTreeMap<RetrieverSource, usize>,
    /// Retrievers that failed or timed out. Non-empty means degraded mode.
    pub degraded: Vec<RetrieverFailure>,
}

impl FusionOutcome {
    pub fn is_degraded(&self) -> bool {
        !self.degraded.is_empty()
    }
}

pub struct FusionRetriever {
    vector: Arc<dyn Retriever>,
    graph: Arc<dyn Retriever>,
    lexical: Arc<dyn Retriever>,
    rrf_k: f64,
    timeout: Duration,
}

impl FusionRetriever {
    pub fn new(
        vector: Arc<dyn Retriever>,
        graph: Arc<dyn Retriever>,
        lexical: Arc<dyn Retriever>,
        rrf_k: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            vector,
            graph,
            lexical,
            rrf_k,
            timeout,
        }
    }

    /// Query all three retrievers for `k` results each and fuse.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<FusionOutcome, QueryError> {
        let (vector, graph, lexical) = tokio::join!(
            run_one(self.vector.as_ref(), RetrieverSource::Vector, query, k, self.timeout),
            run_one(self.graph.as_ref(), RetrieverSource::Graph, query, k, self.timeout),
            run_one(self.lexical.as_ref(), RetrieverSource::Lexical, query, k, self.timeout),
        );

        let mut lists = Vec::new();
        let mut retrieved = BTreeMap::new();
        let mut degraded = Vec::new();
        for outcome in [vector, graph, lexical] {
            match outcome {
                Ok((source, ids)) => {
                    retrieved.insert(source, ids.len());
                    lists.push((source, ids));
                }
                Err(failure) => {
                    warn!(source = %failure.source, reason = %failure.reason, "retriever unavailable, fusing without it");
                    degraded.push(failure);
                }
            }
        }

        if lists.is_empty() {
            return Err(QueryError::RetrievalUnavailable {
                failures: degraded
                    .iter()
                    .map(|f| format!("{}: {}", f.source, f.reason))
                    .collect(),
            });
        }

        let results = reciprocal_rank_fusion(&lists, self.rrf_k);
        debug!(fused = results.len(), degraded = degraded.len(), "fusion complete");

        Ok(FusionOutcome {
            results,
            retrieved,
            degraded,
        })
    }
}

async fn run_one(
    retriever: &dyn Retriever,
    source: RetrieverSource,
    query: &str,
    k: usize,
    timeout: Duration,
) -> Result<(RetrieverSource, Vec<String>), RetrieverFailure> {
    debug_assert_eq!(retriever.source(), source);
    match tokio::time::timeout(timeout, retriever.retrieve_top_k(query, k)).await {
        Ok(Ok(mut results)) => {
            results.sort_by_key(|r| r.rank);
            results.truncate(k);
            Ok((source, results.into_iter().map(|r| r.node_id).collect()))
        }
        Ok(Err(e)) => Err(RetrieverFailure {
            source,
            reason: e.to_string(),
        }),
        Err(_) => Err(RetrieverFailure {
            source,
            reason: format!("timed out after {:?}", timeout),
        }),
    }
}
