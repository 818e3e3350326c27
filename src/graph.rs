//! Checkpointed knowledge-graph builder and the graph retriever.
//!
//! # State machine
//!
//! ```text
//!  Empty ──▶ Building ──▶ Checkpointed ──▶ Building ──▶ … ──▶ Complete
//!                                                              │  ▲
//!                                               refresh(new)   ▼  │
//!                                                           Building
//! ```
//!
//! # Build and resume
//!
//! The node sequence is cut into contiguous batches of `batch_size`. For
//! each batch the extractor runs once per node (at most `workers` at a
//! time). Only when every node in the batch has succeeded are the triplets
//! appended and `{docstore, graph store, checkpoint}` persisted as one
//! snapshot generation. The next batch starts after that write returns.
//!
//! Resume picks up every node not yet in the docstore. A node committed by
//! an earlier batch is never sent to the extractor again, however many
//! times the process restarts and even if files were added or removed in
//! between: commitment is tracked by node id, not by position.
//! `checkpoint.processed` counts committed nodes.
//!
//! # Incremental refresh
//!
//! On a complete snapshot, the new node sequence is diffed against the
//! docstore by id and content hash:
//!
//! | Node | Action |
//! |------|--------|
//! | same id, same hash | untouched |
//! | same id, new hash | triplets dropped, node re-extracted |
//! | new id | extracted, unless a vanished node had the same hash (triplets re-attributed) |
//! | id gone | triplets dropped |
//!
//! Work is proportional to the diff. The docstore only ever holds nodes
//! whose triplets are committed, so an interrupted refresh is finished by
//! the next refresh.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use docfusion_core::graph::TripletIndex;
use docfusion_core::models::{Node, RetrievalResult, RetrieverSource, Triplet};
use docfusion_core::store::NodeStore;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::GraphConfig;
use crate::error::{BuildError, MalformedNode, ProviderError};
use crate::extract::TripletExtractor;
use crate::retriever::{ranked, Retriever};
use crate::snapshot::{Snapshot, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Empty,
    Building,
    Checkpointed,
    Complete,
}

impl BuildState {
    pub fn of(snapshot: &Snapshot) -> Self {
        if snapshot.checkpoint.complete {
            BuildState::Complete
        } else if snapshot.checkpoint.processed == 0 {
            BuildState::Empty
        } else {
            BuildState::Checkpointed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Fresh,
    Resume,
    Refresh,
}

/// What one builder run did.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub mode: BuildMode,
    /// Nodes handed to the extractor.
    pub extracted: usize,
    pub batches: usize,
    pub triplets_added: usize,
    pub triplets_removed: usize,
    /// Refresh only: new ids that took over a vanished node's triplets.
    pub rekeyed: usize,
    /// Refresh only: nodes whose content was unchanged.
    pub unchanged: usize,
    pub malformed: Vec<MalformedNode>,
}

impl BuildReport {
    fn new(mode: BuildMode) -> Self {
        Self {
            mode,
            extracted: 0,
            batches: 0,
            triplets_added: 0,
            triplets_removed: 0,
            rekeyed: 0,
            unchanged: 0,
            malformed: Vec::new(),
        }
    }
}

struct BatchOutput {
    triplets: Vec<Triplet>,
    malformed: Vec<MalformedNode>,
    extracted: usize,
}

pub struct KnowledgeGraphBuilder {
    extractor: Arc<dyn TripletExtractor>,
    store: SnapshotStore,
    batch_size: usize,
    max_triplets: usize,
    workers: usize,
    state: BuildState,
}

impl KnowledgeGraphBuilder {
    pub fn new(extractor: Arc<dyn TripletExtractor>, store: SnapshotStore, config: &GraphConfig) -> Self {
        Self {
            extractor,
            store,
            batch_size: config.batch_size.max(1),
            max_triplets: config.max_triplets_per_node,
            workers: config.workers.max(1),
            state: BuildState::Empty,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Bring `snapshot`'s graph up to date with `nodes`.
    ///
    /// Partial or empty snapshots are built/resumed from the checkpoint;
    /// complete ones are refreshed. Every committed batch is persisted
    /// before the next starts. On error, `snapshot` matches the last
    /// persisted generation.
    pub async fn build(&mut self, nodes: &NodeStore, snapshot: &mut Snapshot) -> Result<BuildReport, BuildError> {
        self.state = BuildState::of(snapshot);
        match self.state {
            BuildState::Complete => self.refresh(nodes, snapshot).await,
            BuildState::Empty => {
                let mut report = BuildReport::new(BuildMode::Fresh);
                self.build_from_checkpoint(nodes, snapshot, &mut report).await?;
                Ok(report)
            }
            BuildState::Checkpointed | BuildState::Building => {
                let mut report = BuildReport::new(BuildMode::Resume);
                self.build_from_checkpoint(nodes, snapshot, &mut report).await?;
                // Nodes that changed while the build was interrupted.
                let catch_up = self.refresh(nodes, snapshot).await?;
                report.extracted += catch_up.extracted;
                report.batches += catch_up.batches;
                report.triplets_added += catch_up.triplets_added;
                report.triplets_removed += catch_up.triplets_removed;
                report.rekeyed += catch_up.rekeyed;
                report.malformed.extend(catch_up.malformed);
                Ok(report)
            }
        }
    }

    async fn build_from_checkpoint(
        &mut self,
        nodes: &NodeStore,
        snapshot: &mut Snapshot,
        report: &mut BuildReport,
    ) -> Result<(), BuildError> {
        let pending = resume_pending(nodes, snapshot);
        let total = nodes.len();

        if snapshot.checkpoint.processed > 0 {
            info!(
                processed = snapshot.checkpoint.processed,
                remaining = pending.len(),
                total,
                "resuming graph build from checkpoint"
            );
        } else {
            info!(total, batch_size = self.batch_size, "starting graph build");
        }

        if pending.is_empty() {
            snapshot.checkpoint.processed = snapshot.docstore.len();
            snapshot.checkpoint.complete = true;
            self.persist(snapshot, |_| {})?;
            self.state = BuildState::Complete;
            return Ok(());
        }

        let mut offset = 0;
        while offset < pending.len() {
            let end = (offset + self.batch_size).min(pending.len());
            let batch = &pending[offset..end];
            let seq = snapshot.checkpoint.batch_seq + 1;
            self.state = BuildState::Building;

            let output = self.extract_batch(batch, seq, offset).await?;
            let complete = end == pending.len();

            let prev_triplets = snapshot.triplets.len();
            let prev_checkpoint = snapshot.checkpoint.clone();
            let added = output.triplets.len();

            snapshot.triplets.extend(output.triplets);
            for node in batch {
                snapshot.docstore.insert(node.id.clone(), stored(node));
            }
            snapshot.checkpoint.processed = snapshot.docstore.len();
            snapshot.checkpoint.batch_seq = seq;
            snapshot.checkpoint.complete = complete;

            self.persist(snapshot, |s| {
                s.triplets.truncate(prev_triplets);
                for node in batch {
                    s.docstore.remove(&node.id);
                }
                s.checkpoint = prev_checkpoint.clone();
            })?;

            info!(
                batch = seq,
                processed = snapshot.checkpoint.processed,
                total,
                triplets = added,
                "checkpoint saved"
            );
            report.batches += 1;
            report.extracted += output.extracted;
            report.triplets_added += added;
            report.malformed.extend(output.malformed);
            self.state = if complete {
                BuildState::Complete
            } else {
                BuildState::Checkpointed
            };
            offset = end;
        }

        Ok(())
    }

    async fn refresh(&mut self, nodes: &NodeStore, snapshot: &mut Snapshot) -> Result<BuildReport, BuildError> {
        let mut report = BuildReport::new(BuildMode::Refresh);

        let mut changed: HashSet<&str> = HashSet::new();
        let mut added: Vec<&Node> = Vec::new();
        for node in nodes.iter() {
            match snapshot.docstore.get(&node.id) {
                Some(prev) if prev.content_hash == node.content_hash => report.unchanged += 1,
                Some(_) => {
                    changed.insert(node.id.as_str());
                }
                None => added.push(node),
            }
        }
        let vanished: Vec<String> = snapshot
            .docstore
            .keys()
            .filter(|id| !nodes.contains(id))
            .cloned()
            .collect();

        if changed.is_empty() && added.is_empty() && vanished.is_empty() {
            debug!(nodes = nodes.len(), "graph up to date");
            self.state = BuildState::Complete;
            return Ok(report);
        }

        // Content-hash-only identity: a new id carrying a vanished node's
        // exact content inherits its triplets.
        let mut vanished_by_hash: HashMap<String, Vec<String>> = HashMap::new();
        for id in &vanished {
            if let Some(node) = snapshot.docstore.get(id) {
                vanished_by_hash
                    .entry(node.content_hash.clone())
                    .or_default()
                    .push(id.clone());
            }
        }
        let mut rekey: BTreeMap<String, String> = BTreeMap::new();
        let mut to_extract: HashSet<&str> = changed.clone();
        for node in &added {
            // Several vanished nodes may share the hash: prefer one from the
            // same file, else the lowest id.
            let inherited = vanished_by_hash.get_mut(&node.content_hash).and_then(|ids| {
                let pos = ids
                    .iter()
                    .position(|id| {
                        snapshot
                            .docstore
                            .get(id)
                            .is_some_and(|old| old.source_path == node.source_path)
                    })
                    .or(if ids.is_empty() { None } else { Some(0) })?;
                Some(ids.remove(pos))
            });
            match inherited {
                Some(old_id) => {
                    rekey.insert(old_id, node.id.clone());
                }
                None => {
                    to_extract.insert(node.id.as_str());
                }
            }
        }

        info!(
            changed = changed.len(),
            added = added.len(),
            removed = vanished.len(),
            rekeyed = rekey.len(),
            "refreshing graph"
        );

        // Step 1: drop stale triplets and docstore entries, re-attribute
        // rekeyed ones. One durable write.
        let prev = snapshot.clone();
        let dropped: HashSet<&str> = vanished
            .iter()
            .map(String::as_str)
            .filter(|id| !rekey.contains_key(*id))
            .chain(changed.iter().copied())
            .collect();
        let before = snapshot.triplets.len();
        snapshot
            .triplets
            .retain(|t| !dropped.contains(t.source_node_id.as_str()));
        report.triplets_removed = before - snapshot.triplets.len();
        for t in snapshot.triplets.iter_mut() {
            if let Some(new_id) = rekey.get(&t.source_node_id) {
                t.source_node_id = new_id.clone();
            }
        }
        for id in &vanished {
            snapshot.docstore.remove(id);
        }
        for id in &changed {
            snapshot.docstore.remove(*id);
        }
        for new_id in rekey.values() {
            if let Some(node) = nodes.get(new_id) {
                snapshot.docstore.insert(new_id.clone(), stored(node));
            }
        }
        report.rekeyed = rekey.len();
        snapshot.checkpoint.processed = snapshot.docstore.len();
        snapshot.checkpoint.batch_seq += 1;
        snapshot.checkpoint.complete = true;
        self.state = BuildState::Building;
        self.persist(snapshot, |s| *s = prev.clone())?;

        // Step 2: extract changed and new nodes in batches, node order.
        let pending: Vec<Node> = nodes
            .iter()
            .filter(|n| to_extract.contains(n.id.as_str()))
            .cloned()
            .collect();
        for (i, batch) in pending.chunks(self.batch_size).enumerate() {
            let seq = snapshot.checkpoint.batch_seq + 1;
            let output = self.extract_batch(batch, seq, i * self.batch_size).await?;

            let prev_triplets = snapshot.triplets.len();
            let prev_checkpoint = snapshot.checkpoint.clone();
            let added_count = output.triplets.len();

            snapshot.triplets.extend(output.triplets);
            for node in batch {
                snapshot.docstore.insert(node.id.clone(), stored(node));
            }
            snapshot.checkpoint.processed = snapshot.docstore.len();
            snapshot.checkpoint.batch_seq = seq;

            self.persist(snapshot, |s| {
                s.triplets.truncate(prev_triplets);
                for node in batch {
                    s.docstore.remove(&node.id);
                }
                s.checkpoint = prev_checkpoint.clone();
            })?;

            info!(batch = seq, nodes = batch.len(), triplets = added_count, "refresh batch saved");
            report.batches += 1;
            report.extracted += output.extracted;
            report.triplets_added += added_count;
            report.malformed.extend(output.malformed);
        }

        self.state = BuildState::Complete;
        Ok(report)
    }

    /// Persist, restoring the in-memory snapshot with `rollback` on failure.
    fn persist(&self, snapshot: &mut Snapshot, rollback: impl FnOnce(&mut Snapshot)) -> Result<(), BuildError> {
        let batch_seq = snapshot.checkpoint.batch_seq;
        match self.store.persist(snapshot) {
            Ok(_) => Ok(()),
            Err(source) => {
                rollback(snapshot);
                warn!(batch = batch_seq, error = %source, "checkpoint write failed, last checkpoint kept");
                Err(BuildError::CheckpointIo { batch_seq, source })
            }
        }
    }

    /// Run extraction for one batch. Fails as a whole if any node fails.
    async fn extract_batch(&self, batch: &[Node], seq: u64, start: usize) -> Result<BatchOutput, BuildError> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut results: Vec<Option<Vec<Triplet>>> = vec![None; batch.len()];
        let mut malformed = Vec::new();
        let mut extracted = 0;

        for (pos, node) in batch.iter().enumerate() {
            if node.is_blank() {
                let warning = MalformedNode {
                    node_id: node.id.clone(),
                    reason: "empty content".to_string(),
                };
                warn!(node = %node.id, source = %node.source_path, "skipping malformed node: empty content");
                malformed.push(warning);
                results[pos] = Some(Vec::new());
                continue;
            }

            extracted += 1;
            let semaphore = Arc::clone(&semaphore);
            let extractor = Arc::clone(&self.extractor);
            let node = node.clone();
            let max_triplets = self.max_triplets;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = extractor.extract(&node, max_triplets).await;
                (pos, node.id, result)
            });
        }

        let fail = |node_id: String, source: ProviderError| BuildError::BatchFailed {
            batch_seq: seq,
            start,
            end: start + batch.len(),
            node_id,
            source,
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((pos, _, Ok(triplets))) => results[pos] = Some(triplets),
                Ok((_, node_id, Err(e))) => {
                    tasks.abort_all();
                    warn!(batch = seq, node = %node_id, error = %e, "extraction failed, abandoning batch");
                    return Err(fail(node_id, e));
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(fail(
                        "<task>".to_string(),
                        ProviderError::Malformed(format!("extraction task failed: {}", e)),
                    ));
                }
            }
        }

        let mut triplets = Vec::new();
        for (node, found) in batch.iter().zip(results) {
            for mut t in found.unwrap_or_default().into_iter().take(self.max_triplets) {
                t.source_node_id = node.id.clone();
                triplets.push(t);
            }
        }

        Ok(BatchOutput {
            triplets,
            malformed,
            extracted,
        })
    }
}

/// Docstore copy of a node; embeddings live in the vector store.
fn stored(node: &Node) -> Node {
    Node {
        embedding: None,
        ..node.clone()
    }
}

/// Nodes a fresh build or resume still has to extract, in node order.
///
/// Anything already in the docstore was committed by an earlier batch and
/// is left to the catch-up refresh (which re-extracts it only if its
/// content changed). A node carrying the content of a committed node that
/// has since vanished is also left to the refresh, which re-keys it.
fn resume_pending(nodes: &NodeStore, snapshot: &Snapshot) -> Vec<Node> {
    let vanished_hashes: HashSet<&str> = snapshot
        .docstore
        .values()
        .filter(|n| !nodes.contains(&n.id))
        .map(|n| n.content_hash.as_str())
        .collect();
    nodes
        .iter()
        .filter(|n| !snapshot.docstore.contains_key(&n.id) && !vanished_hashes.contains(n.content_hash.as_str()))
        .cloned()
        .collect()
}

/// Keyword/one-hop retriever over the committed triplets.
pub struct GraphRetriever {
    index: TripletIndex,
}

impl GraphRetriever {
    pub fn new(triplets: Vec<Triplet>) -> Self {
        Self {
            index: TripletIndex::new(triplets),
        }
    }
}

#[async_trait]
impl Retriever for GraphRetriever {
    fn source(&self) -> RetrieverSource {
        RetrieverSource::Graph
    }

    async fn retrieve_top_k(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, ProviderError> {
        Ok(ranked(RetrieverSource::Graph, self.index.rank_nodes(query, k)))
    }
}
