//! Stack assembly: ingest, bring the snapshot up to date, build a query
//! engine.
//!
//! ```text
//! ingest ──▶ load snapshot ──┬─ NotFound / Corrupt ─▶ fresh graph build ─┐
//!                            ├─ Partial ────────────▶ resume ────────────┤
//!                            └─ Complete ───────────▶ incremental refresh┤
//!                                                                        ▼
//!          engine ◀── lexical (rebuilt) ◀── persist ◀── vectors (by content hash)
//! ```
//!
//! [`build_stack`] is the only code path that writes a snapshot: `dfx
//! build` and the rebuild worker use it, under the snapshot writer lock.
//! Query-only paths (`dfx query`, `dfx eval`, the startup engine of `dfx
//! serve`) use [`open_engine`], which loads a complete snapshot as-is and
//! never calls the extractor or writes to disk.

use std::sync::Arc;

use docfusion_core::models::Triplet;
use docfusion_core::store::NodeStore;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::QueryEngine;
use crate::error::SnapshotError;
use crate::graph::{BuildReport, GraphRetriever, KnowledgeGraphBuilder};
use crate::ingest::ingest;
use crate::lexical::LexicalRetriever;
use crate::providers::Providers;
use crate::rerank::Reranker;
use crate::retriever::FusionRetriever;
use crate::snapshot::{Snapshot, SnapshotStatus, SnapshotStore};
use crate::vector::{attach, VectorIndexBuilder, VectorReport, VectorRetriever};

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// Ignore any existing snapshot and build from scratch.
    pub fresh: bool,
}

/// What was found on disk before building.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotOrigin {
    NotBuilt,
    /// Discarded because a record was unreadable or inconsistent.
    Corrupt { reason: String },
    /// Discarded because `--fresh` was given.
    Discarded,
    Partial { processed: usize },
    Complete { nodes: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct StackReport {
    pub origin: SnapshotOrigin,
    pub nodes: usize,
    pub triplets: usize,
    pub graph: BuildReport,
    pub vectors: VectorReport,
    /// Generation live after the build.
    pub generation: Option<String>,
}

pub struct Stack {
    pub engine: QueryEngine,
    pub report: StackReport,
}

/// Load the snapshot, branching on why it could not be used.
pub fn open_snapshot(store: &SnapshotStore, options: BuildOptions) -> Result<(Snapshot, SnapshotOrigin)> {
    if options.fresh {
        return Ok((Snapshot::empty(), SnapshotOrigin::Discarded));
    }
    match store.load() {
        Ok(snapshot) => {
            let origin = match snapshot.status() {
                SnapshotStatus::Complete => SnapshotOrigin::Complete {
                    nodes: snapshot.docstore.len(),
                },
                SnapshotStatus::Partial => SnapshotOrigin::Partial {
                    processed: snapshot.checkpoint.processed,
                },
            };
            Ok((snapshot, origin))
        }
        Err(SnapshotError::NotFound(_)) => Ok((Snapshot::empty(), SnapshotOrigin::NotBuilt)),
        Err(e @ SnapshotError::Corrupt { .. }) => {
            warn!(error = %e, "snapshot is corrupt, rebuilding from scratch");
            Ok((Snapshot::empty(), SnapshotOrigin::Corrupt { reason: e.to_string() }))
        }
        Err(e) => Err(e).context("Failed to read snapshot"),
    }
}

/// Ingest documents, bring the snapshot up to date and assemble a
/// [`QueryEngine`] over it.
pub async fn build_stack(config: &Config, providers: &Providers, options: BuildOptions) -> Result<Stack> {
    let store = SnapshotStore::new(&config.snapshot.dir, config.snapshot.keep_generations);
    let _lock = store.lock().context("Cannot build the index")?;

    let mut nodes = ingest(&config.ingest)?;
    let (mut snapshot, origin) = open_snapshot(&store, options)?;
    info!(origin = ?origin, nodes = nodes.len(), "building index stack");

    let mut graph_builder = KnowledgeGraphBuilder::new(providers.extractor.clone(), store.clone(), &config.graph);
    let graph = graph_builder
        .build(&nodes, &mut snapshot)
        .await
        .context("Knowledge graph build failed")?;

    let vector_builder = VectorIndexBuilder::new(providers.embedder.clone(), config.embedding.batch_size);
    let vectors = vector_builder
        .build(&mut nodes, &mut snapshot.vectors)
        .await
        .context("Vector index build failed")?;

    if vectors.embedded > 0 || vectors.removed > 0 || vectors.model_changed {
        store
            .persist(&mut snapshot)
            .context("Failed to persist vector store")?;
    }
    let generation = store.current_generation()?;

    let report = StackReport {
        origin,
        nodes: nodes.len(),
        triplets: snapshot.triplets.len(),
        graph,
        vectors,
        generation,
    };

    let engine = assemble_engine(config, providers, nodes, snapshot.triplets);
    info!(nodes = report.nodes, triplets = report.triplets, "index stack ready");
    Ok(Stack { engine, report })
}

/// Load a complete snapshot and assemble a [`QueryEngine`] over it.
///
/// Read-only: the docs directory is not scanned, no provider is called
/// while loading and nothing is written. Edits since the last build are
/// not visible until `dfx build` (or the rebuild worker) runs.
pub fn open_engine(config: &Config, providers: &Providers) -> Result<QueryEngine> {
    let store = SnapshotStore::new(&config.snapshot.dir, config.snapshot.keep_generations);
    let snapshot = match store.load() {
        Ok(snapshot) => snapshot,
        Err(SnapshotError::NotFound(dir)) => {
            bail!("No index found in {}; run `dfx build` first", dir.display())
        }
        Err(e @ SnapshotError::Corrupt { .. }) => {
            return Err(e).context("Index snapshot is corrupt; run `dfx build` to rebuild it")
        }
        Err(e) => return Err(e).context("Failed to read snapshot"),
    };
    if snapshot.status() == SnapshotStatus::Partial {
        bail!(
            "Index snapshot is partial ({} nodes committed); run `dfx build` to resume it",
            snapshot.checkpoint.processed
        );
    }

    let model = providers.embedder.model_id();
    let dims = providers.embedder.dims();
    if !snapshot.vectors.entries.is_empty() && (snapshot.vectors.model != model || snapshot.vectors.dims != dims) {
        bail!(
            "Index embeddings were made with {} ({} dims) but {} ({} dims) is configured; run `dfx build`",
            snapshot.vectors.model,
            snapshot.vectors.dims,
            model,
            dims
        );
    }

    let mut stored: Vec<_> = snapshot.docstore.into_values().collect();
    stored.sort_by(|a, b| {
        a.source_path
            .cmp(&b.source_path)
            .then_with(|| a.heading_path.cmp(&b.heading_path))
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut nodes = NodeStore::new(stored);
    attach(&mut nodes, &snapshot.vectors);
    let missing = nodes.iter().filter(|n| n.embedding.is_none()).count();
    if missing > 0 {
        warn!(missing, "nodes without stored embeddings are invisible to vector search; run `dfx build`");
    }

    info!(
        generation = ?store.current_generation()?,
        nodes = nodes.len(),
        triplets = snapshot.triplets.len(),
        "loaded index snapshot"
    );
    Ok(assemble_engine(config, providers, nodes, snapshot.triplets))
}

fn assemble_engine(
    config: &Config,
    providers: &Providers,
    nodes: NodeStore,
    triplets: Vec<Triplet>,
) -> QueryEngine {
    let vector = Arc::new(VectorRetriever::new(providers.embedder.clone(), &nodes));
    let graph = Arc::new(GraphRetriever::new(triplets));
    let lexical = Arc::new(LexicalRetriever::build(&nodes));

    let fusion = FusionRetriever::new(
        vector,
        graph,
        lexical,
        config.retrieval.rrf_k,
        config.retrieval.retriever_timeout(),
    );
    let reranker = Reranker::new(providers.grader.clone(), config.rerank.batch_size);

    QueryEngine::new(
        nodes,
        fusion,
        reranker,
        providers.synthesizer.clone(),
        config.retrieval.top_k,
        config.rerank.top_n,
    )
}
