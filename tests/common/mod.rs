#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docfusion::config::Config;
use docfusion::embedding::HashingEmbedder;
use docfusion::engine::AnswerSynthesizer;
use docfusion::error::ProviderError;
use docfusion::extract::TripletExtractor;
use docfusion::providers::Providers;
use docfusion::rerank::RelevanceGrader;
use docfusion::retriever::{ranked, Retriever};
use docfusion_core::chunk::content_hash;
use docfusion_core::lexical::tokenize;
use docfusion_core::models::{Node, RetrievalResult, RetrieverSource, Triplet};

pub fn node(id: &str, text: &str) -> Node {
    Node {
        id: id.to_string(),
        source_path: format!("{}.md", id),
        heading_path: vec![id.to_string()],
        text: text.to_string(),
        content_hash: content_hash(text),
        embedding: None,
    }
}

/// `n` nodes with ids `n0000`, `n0001`, ...
pub fn numbered_nodes(n: usize) -> Vec<Node> {
    (0..n)
        .map(|i| node(&format!("n{:04}", i), &format!("Wrapper{} exposes Method{}", i, i)))
        .collect()
}

/// Deterministic extractor: `(heading, mentions, token)` for the first
/// tokens of the node text. Records every node it is called for and fails
/// on the configured node id (or on every node).
#[derive(Default)]
pub struct CountingExtractor {
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
    fail_all: bool,
}

impl CountingExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_on(id: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_on: Some(id.to_string()),
            ..Self::default()
        })
    }

    /// Every call fails, as during a provider outage.
    pub fn failing_all() -> Arc<Self> {
        Arc::new(Self {
            fail_all: true,
            ..Self::default()
        })
    }

    /// Node ids extracted so far, sorted.
    pub fn calls(&self) -> Vec<String> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TripletExtractor for CountingExtractor {
    async fn extract(&self, node: &Node, max_triplets: usize) -> Result<Vec<Triplet>, ProviderError> {
        self.calls.lock().unwrap().push(node.id.clone());
        if self.fail_all || self.fail_on.as_deref() == Some(node.id.as_str()) {
            return Err(ProviderError::Transient("rate limited".into()));
        }
        let subject = node
            .heading_path
            .last()
            .cloned()
            .unwrap_or_else(|| node.id.clone());
        Ok(tokenize(&node.text)
            .into_iter()
            .filter(|t| t.len() > 3)
            .take(max_triplets)
            .map(|object| Triplet {
                subject: subject.clone(),
                predicate: "mentions".to_string(),
                object,
                source_node_id: node.id.clone(),
                confidence: 1.0,
            })
            .collect())
    }
}

/// Grades by a fixed id → score table; fails any batch containing one of
/// `failing`. Unknown ids are not mentioned.
#[derive(Default)]
pub struct TableGrader {
    pub scores: HashMap<String, f64>,
    pub failing: HashSet<String>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl RelevanceGrader for TableGrader {
    async fn grade(&self, _query: &str, batch: &[Node]) -> Result<Vec<Option<f64>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if batch.iter().any(|n| self.failing.contains(&n.id)) {
            return Err(ProviderError::Transient("grader overloaded".into()));
        }
        Ok(batch.iter().map(|n| self.scores.get(&n.id).copied()).collect())
    }
}

/// Answers with the ids of the context nodes.
#[derive(Default)]
pub struct EchoSynthesizer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl AnswerSynthesizer for EchoSynthesizer {
    async fn synthesize(&self, query: &str, context: &[Node]) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ids: Vec<&str> = context.iter().map(|n| n.id.as_str()).collect();
        Ok(format!("{} -> {}", query, ids.join(",")))
    }
}

pub struct FixedRetriever(pub RetrieverSource, pub Vec<&'static str>);

#[async_trait]
impl Retriever for FixedRetriever {
    fn source(&self) -> RetrieverSource {
        self.0
    }

    async fn retrieve_top_k(&self, _query: &str, k: usize) -> Result<Vec<RetrievalResult>, ProviderError> {
        Ok(ranked(
            self.0,
            self.1.iter().take(k).map(|id| (id.to_string(), 1.0)).collect(),
        ))
    }
}

pub struct SlowRetriever(pub RetrieverSource, pub Duration);

#[async_trait]
impl Retriever for SlowRetriever {
    fn source(&self) -> RetrieverSource {
        self.0
    }

    async fn retrieve_top_k(&self, _query: &str, _k: usize) -> Result<Vec<RetrievalResult>, ProviderError> {
        tokio::time::sleep(self.1).await;
        Ok(ranked(self.0, vec![("late".to_string(), 1.0)]))
    }
}

pub struct BrokenRetriever(pub RetrieverSource);

#[async_trait]
impl Retriever for BrokenRetriever {
    fn source(&self) -> RetrieverSource {
        self.0
    }

    async fn retrieve_top_k(&self, _query: &str, _k: usize) -> Result<Vec<RetrievalResult>, ProviderError> {
        Err(ProviderError::Transient("connection refused".into()))
    }
}

pub fn fake_providers(extractor: Arc<CountingExtractor>) -> Providers {
    Providers {
        embedder: Arc::new(HashingEmbedder::new(256)),
        extractor,
        grader: Arc::new(TableGrader::default()),
        synthesizer: Arc::new(EchoSynthesizer::default()),
    }
}

/// Offline config over `docs` with the snapshot under `snapshot`.
pub fn test_config(docs: &Path, snapshot: &Path) -> Config {
    let mut config = Config::default();
    config.ingest.docs_dir = docs.to_path_buf();
    config.snapshot.dir = snapshot.to_path_buf();
    config.graph.batch_size = 2;
    config.graph.workers = 2;
    config.embedding.provider = "hashing".to_string();
    config.embedding.dims = 256;
    config.retrieval.retriever_timeout_secs = 5;
    config
}

/// A small BakkesMod-style SDK doc set.
pub fn write_docs(dir: &Path) {
    std::fs::create_dir_all(dir.join("api")).unwrap();
    std::fs::write(
        dir.join("api/ball.md"),
        "# BallWrapper\n\nWrapper around the game ball.\n\n## GetVelocity\n\nGetVelocity returns the ball velocity as a Vector.\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("api/car.md"),
        "# CarWrapper\n\nWrapper around a player car.\n\n## GetBoostComponent\n\nReturns the BoostWrapper holding the boost amount.\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("events.md"),
        "# Events\n\nHook the goal scored event with HookEvent and Function TAGame.Ball_TA.OnHitGoal.\n",
    )
    .unwrap();
}
