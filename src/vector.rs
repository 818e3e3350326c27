//! Vector index: embedding refresh by content hash, and cosine retrieval.
//!
//! The vector store in the snapshot keeps one embedding per node id with
//! the content hash it was computed from. A rebuild only embeds nodes whose
//! hash has no stored embedding; a different embedding model invalidates
//! everything.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use docfusion_core::embedding::cosine_similarity;
use docfusion_core::models::{RetrievalResult, RetrieverSource};
use docfusion_core::store::NodeStore;
use serde::Serialize;
use tracing::{debug, info};

use crate::embedding::{embed_query, Embedder};
use crate::error::{BuildError, ProviderError};
use crate::retriever::{ranked, Retriever};
use crate::snapshot::{VectorEntry, VectorStore};

#[derive(Debug, Clone, Default, Serialize)]
pub struct VectorReport {
    pub embedded: usize,
    pub reused: usize,
    pub removed: usize,
    /// All stored embeddings were discarded because the model changed.
    pub model_changed: bool,
}

pub struct VectorIndexBuilder {
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl VectorIndexBuilder {
    pub fn new(embedder: Arc<dyn Embedder>, batch_size: usize) -> Self {
        Self {
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    /// Bring `vectors` in line with `nodes` and attach every embedding to
    /// its node.
    ///
    /// On error, `vectors` is left unchanged.
    pub async fn build(&self, nodes: &mut NodeStore, vectors: &mut VectorStore) -> Result<VectorReport, BuildError> {
        let mut report = VectorReport::default();
        let model = self.embedder.model_id();
        let dims = self.embedder.dims();

        let previous = if vectors.model == model && vectors.dims == dims {
            vectors.entries.clone()
        } else {
            if !vectors.entries.is_empty() {
                info!(from = %vectors.model, to = %model, "embedding model changed, re-embedding all nodes");
                report.model_changed = true;
            }
            BTreeMap::new()
        };

        // Same content under a new id (heading renamed) reuses the vector.
        let by_hash: HashMap<&str, &VectorEntry> = previous
            .values()
            .map(|e| (e.content_hash.as_str(), e))
            .collect();

        let mut entries = BTreeMap::new();
        let mut pending: Vec<(String, String, String)> = Vec::new();
        for node in nodes.iter() {
            let reusable = previous
                .get(&node.id)
                .filter(|e| e.content_hash == node.content_hash)
                .or_else(|| by_hash.get(node.content_hash.as_str()).copied());
            match reusable {
                Some(entry) => {
                    entries.insert(node.id.clone(), entry.clone());
                    report.reused += 1;
                }
                None => pending.push((node.id.clone(), node.content_hash.clone(), node.indexed_text())),
            }
        }
        report.removed = previous.keys().filter(|id| !nodes.contains(id)).count();

        for batch in pending.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, _, text)| text.clone()).collect();
            let embeddings = match self.embedder.embed(&texts).await {
                Ok(e) if e.len() == batch.len() => e,
                Ok(e) => {
                    return Err(BuildError::Embedding(ProviderError::Malformed(format!(
                        "expected {} embeddings, got {}",
                        batch.len(),
                        e.len()
                    ))));
                }
                Err(e) => return Err(BuildError::Embedding(e)),
            };
            for ((id, hash, _), embedding) in batch.iter().zip(embeddings) {
                entries.insert(
                    id.clone(),
                    VectorEntry {
                        content_hash: hash.clone(),
                        embedding,
                    },
                );
            }
            report.embedded += batch.len();
            debug!(embedded = report.embedded, pending = pending.len(), "embedding batch done");
        }

        vectors.model = model;
        vectors.dims = dims;
        vectors.entries = entries;
        attach(nodes, vectors);

        info!(
            embedded = report.embedded,
            reused = report.reused,
            removed = report.removed,
            "vector index ready"
        );
        Ok(report)
    }
}

/// Copy stored embeddings onto the nodes they belong to.
pub fn attach(nodes: &mut NodeStore, vectors: &VectorStore) {
    let attached: Vec<_> = std::mem::take(nodes)
        .into_nodes()
        .into_iter()
        .map(|mut node| {
            node.embedding = vectors
                .entries
                .get(&node.id)
                .filter(|e| e.content_hash == node.content_hash)
                .map(|e| e.embedding.clone());
            node
        })
        .collect();
    *nodes = NodeStore::new(attached);
}

/// Brute-force cosine search over embedded nodes.
pub struct VectorRetriever {
    embedder: Arc<dyn Embedder>,
    index: Vec<(String, Vec<f32>)>,
}

impl VectorRetriever {
    pub fn new(embedder: Arc<dyn Embedder>, nodes: &NodeStore) -> Self {
        let index = nodes
            .iter()
            .filter_map(|n| n.embedding.clone().map(|e| (n.id.clone(), e)))
            .collect();
        Self { embedder, index }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    fn source(&self) -> RetrieverSource {
        RetrieverSource::Vector
    }

    async fn retrieve_top_k(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, ProviderError> {
        if self.index.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = embed_query(self.embedder.as_ref(), query).await?;

        let mut scored: Vec<(usize, f64)> = self
            .index
            .iter()
            .enumerate()
            .map(|(i, (_, v))| (i, cosine_similarity(&query_vec, v) as f64))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(ranked(
            RetrieverSource::Vector,
            scored
                .into_iter()
                .map(|(i, score)| (self.index[i].0.clone(), score))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use docfusion_core::models::Node;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        inner: HashingEmbedder,
        embedded: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for Counting {
        fn model_id(&self) -> String {
            self.inner.model_id()
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
            self.inner.embed(texts).await
        }
    }

    fn node(id: &str, text: &str) -> Node {
        Node {
            id: id.to_string(),
            source_path: "a.md".to_string(),
            heading_path: Vec::new(),
            text: text.to_string(),
            content_hash: docfusion_core::chunk::content_hash(text),
            embedding: None,
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            inner: HashingEmbedder::new(64),
            embedded: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_reembeds_only_changed_hashes() {
        let embedder = counting();
        let builder = VectorIndexBuilder::new(embedder.clone(), 2);
        let mut vectors = VectorStore::default();

        let mut nodes = NodeStore::new(vec![node("a", "boost pads"), node("b", "ball physics"), node("c", "car wrapper")]);
        let report = builder.build(&mut nodes, &mut vectors).await.unwrap();
        assert_eq!(report.embedded, 3);
        assert!(nodes.iter().all(|n| n.embedding.is_some()));

        let mut nodes = NodeStore::new(vec![node("a", "boost pads"), node("b", "ball spin"), node("d", "car wrapper")]);
        let report = builder.build(&mut nodes, &mut vectors).await.unwrap();
        assert_eq!(report.embedded, 1);
        assert_eq!(report.reused, 2);
        assert_eq!(report.removed, 1);
        assert_eq!(embedder.embedded.load(Ordering::SeqCst), 4);
        assert!(!vectors.entries.contains_key("c"));
    }

    #[tokio::test]
    async fn test_model_change_reembeds_everything() {
        let builder = VectorIndexBuilder::new(counting(), 8);
        let mut vectors = VectorStore {
            model: "other@64".to_string(),
            dims: 64,
            entries: BTreeMap::new(),
        };
        vectors.entries.insert(
            "a".to_string(),
            VectorEntry {
                content_hash: docfusion_core::chunk::content_hash("x"),
                embedding: vec![0.0; 64],
            },
        );
        let mut nodes = NodeStore::new(vec![node("a", "x")]);
        let report = builder.build(&mut nodes, &mut vectors).await.unwrap();
        assert!(report.model_changed);
        assert_eq!(report.embedded, 1);
        assert_eq!(vectors.model, "hashing@64");
    }

    #[tokio::test]
    async fn test_vector_retriever_prefers_overlap() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(256));
        let builder = VectorIndexBuilder::new(embedder.clone(), 8);
        let mut vectors = VectorStore::default();
        let mut nodes = NodeStore::new(vec![
            node("ball", "ball velocity and spin"),
            node("boost", "boost amount refills from pads"),
        ]);
        builder.build(&mut nodes, &mut vectors).await.unwrap();

        let retriever = VectorRetriever::new(embedder, &nodes);
        let results = retriever.retrieve_top_k("boost pads", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].node_id, "boost");
    }
}
