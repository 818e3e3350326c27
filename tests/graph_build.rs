mod common;

use std::collections::BTreeMap;
use std::fs;

use common::{fake_providers, node, numbered_nodes, test_config, write_docs, CountingExtractor};
use docfusion::config::GraphConfig;
use docfusion::error::BuildError;
use docfusion::graph::{BuildMode, BuildState, KnowledgeGraphBuilder};
use docfusion::snapshot::{Snapshot, SnapshotStore};
use docfusion::stack::{build_stack, BuildOptions, SnapshotOrigin};
use docfusion_core::models::Triplet;
use docfusion_core::store::NodeStore;

fn graph_config(batch_size: usize) -> GraphConfig {
    GraphConfig {
        batch_size,
        max_triplets_per_node: 5,
        workers: 8,
    }
}

fn triplets_by_node(triplets: &[Triplet]) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, Vec<&Triplet>> = BTreeMap::new();
    for t in triplets {
        out.entry(t.source_node_id.clone()).or_default().push(t);
    }
    out.into_iter()
        .map(|(id, ts)| (id, serde_json::to_string(&ts).unwrap()))
        .collect()
}

#[tokio::test]
async fn test_resume_never_reextracts_checkpointed_nodes() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path(), 2);
    let nodes = NodeStore::new(numbered_nodes(1200));

    // First run dies in the second batch.
    let crashing = CountingExtractor::failing_on("n0700");
    let mut builder = KnowledgeGraphBuilder::new(crashing, store.clone(), &graph_config(500));
    let mut snapshot = Snapshot::empty();
    let err = builder.build(&nodes, &mut snapshot).await.unwrap_err();
    match err {
        BuildError::BatchFailed {
            batch_seq,
            start,
            end,
            node_id,
            ..
        } => {
            assert_eq!((batch_seq, start, end), (2, 500, 1000));
            assert_eq!(node_id, "n0700");
        }
        other => panic!("expected BatchFailed, got {}", other),
    }
    assert_eq!(builder.state(), BuildState::Building);

    let on_disk = store.load().unwrap();
    assert_eq!(on_disk.checkpoint.processed, 500);
    assert!(!on_disk.checkpoint.complete);
    assert_eq!(on_disk.docstore.len(), 500);

    // Restart: fresh process, fresh builder, snapshot from disk.
    let extractor = CountingExtractor::new();
    let mut builder = KnowledgeGraphBuilder::new(extractor.clone(), store.clone(), &graph_config(500));
    let mut snapshot = store.load().unwrap();
    let report = builder.build(&nodes, &mut snapshot).await.unwrap();

    let expected: Vec<String> = (500..1200).map(|i| format!("n{:04}", i)).collect();
    assert_eq!(extractor.calls(), expected);
    assert_eq!(report.mode, BuildMode::Resume);
    assert_eq!(report.batches, 2);
    assert_eq!(builder.state(), BuildState::Complete);

    let done = store.load().unwrap();
    assert!(done.checkpoint.complete);
    assert_eq!(done.checkpoint.processed, 1200);
    assert_eq!(done.checkpoint.batch_seq, 3);
}

#[tokio::test]
async fn test_refresh_extracts_only_changed_node() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path(), 2);
    let mut all = numbered_nodes(10);
    let mut snapshot = Snapshot::empty();

    let mut builder = KnowledgeGraphBuilder::new(CountingExtractor::new(), store.clone(), &graph_config(4));
    builder.build(&NodeStore::new(all.clone()), &mut snapshot).await.unwrap();
    let before = triplets_by_node(&snapshot.triplets);

    all[3] = node("n0003", "Wrapper3 now exposes Teleport instead");
    let extractor = CountingExtractor::new();
    let mut builder = KnowledgeGraphBuilder::new(extractor.clone(), store.clone(), &graph_config(4));
    let mut snapshot = store.load().unwrap();
    let report = builder.build(&NodeStore::new(all), &mut snapshot).await.unwrap();

    assert_eq!(extractor.calls(), vec!["n0003".to_string()]);
    assert_eq!(report.mode, BuildMode::Refresh);
    assert_eq!(report.unchanged, 9);

    let after = triplets_by_node(&snapshot.triplets);
    for (id, encoded) in &before {
        if id != "n0003" {
            assert_eq!(after.get(id), Some(encoded), "triplets for {} changed", id);
        }
    }
    assert_ne!(after.get("n0003"), before.get("n0003"));
    assert!(store.load().unwrap().checkpoint.complete);
}

#[tokio::test]
async fn test_refresh_drops_triplets_of_removed_nodes() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path(), 2);
    let all = numbered_nodes(5);
    let mut snapshot = Snapshot::empty();
    let mut builder = KnowledgeGraphBuilder::new(CountingExtractor::new(), store.clone(), &graph_config(2));
    builder.build(&NodeStore::new(all.clone()), &mut snapshot).await.unwrap();

    let extractor = CountingExtractor::new();
    let mut builder = KnowledgeGraphBuilder::new(extractor.clone(), store.clone(), &graph_config(2));
    let report = builder
        .build(&NodeStore::new(all[..4].to_vec()), &mut snapshot)
        .await
        .unwrap();

    assert_eq!(extractor.count(), 0);
    assert!(report.triplets_removed > 0);
    assert!(snapshot.triplets.iter().all(|t| t.source_node_id != "n0004"));
    assert!(!store.load().unwrap().docstore.contains_key("n0004"));
}

#[tokio::test]
async fn test_unchanged_refresh_does_not_write() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path(), 5);
    let nodes = NodeStore::new(numbered_nodes(3));
    let mut snapshot = Snapshot::empty();
    let mut builder = KnowledgeGraphBuilder::new(CountingExtractor::new(), store.clone(), &graph_config(2));
    builder.build(&nodes, &mut snapshot).await.unwrap();
    let generation = store.current_generation().unwrap();

    builder.build(&nodes, &mut snapshot).await.unwrap();
    assert_eq!(store.current_generation().unwrap(), generation);
}

#[tokio::test]
async fn test_malformed_node_is_skipped_with_warning() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path(), 2);
    let nodes = NodeStore::new(vec![
        node("a", "BallWrapper velocity"),
        node("blank", "   \n"),
        node("c", "CarWrapper boost"),
    ]);
    let extractor = CountingExtractor::new();
    let mut builder = KnowledgeGraphBuilder::new(extractor.clone(), store.clone(), &graph_config(10));
    let mut snapshot = Snapshot::empty();
    let report = builder.build(&nodes, &mut snapshot).await.unwrap();

    assert_eq!(report.malformed.len(), 1);
    assert_eq!(report.malformed[0].node_id, "blank");
    assert_eq!(extractor.calls(), vec!["a".to_string(), "c".to_string()]);
    assert!(snapshot.checkpoint.complete);
    assert_eq!(snapshot.checkpoint.processed, 3);
}

#[tokio::test]
async fn test_checkpoint_write_failure_keeps_memory_consistent() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("blocker");
    fs::write(&blocker, "not a directory").unwrap();
    let store = SnapshotStore::new(blocker.join("snapshot"), 2);

    let mut builder = KnowledgeGraphBuilder::new(CountingExtractor::new(), store, &graph_config(2));
    let mut snapshot = Snapshot::empty();
    let err = builder
        .build(&NodeStore::new(numbered_nodes(3)), &mut snapshot)
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::CheckpointIo { batch_seq: 1, .. }));
    assert!(snapshot.triplets.is_empty());
    assert!(snapshot.docstore.is_empty());
    assert_eq!(snapshot.checkpoint.processed, 0);
}

#[tokio::test]
async fn test_rebuild_is_byte_identical() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = tmp.path().join("docs");
    write_docs(&docs);

    let mut records = Vec::new();
    for name in ["snap-a", "snap-b"] {
        let config = test_config(&docs, &tmp.path().join(name));
        let providers = fake_providers(CountingExtractor::new());
        let stack = build_stack(&config, &providers, BuildOptions::default()).await.unwrap();
        assert_eq!(stack.report.origin, SnapshotOrigin::NotBuilt);

        let generation = stack.report.generation.unwrap();
        let dir = tmp.path().join(name).join(generation);
        records.push((
            fs::read(dir.join("graph_store.json")).unwrap(),
            fs::read(dir.join("vector_store.json")).unwrap(),
            fs::read(dir.join("docstore.json")).unwrap(),
        ));
    }
    assert_eq!(records[0], records[1]);

    // Same directory again: nothing to do, nothing rewritten.
    let config = test_config(&docs, &tmp.path().join("snap-a"));
    let extractor = CountingExtractor::new();
    let stack = build_stack(&config, &fake_providers(extractor.clone()), BuildOptions::default())
        .await
        .unwrap();
    assert!(matches!(stack.report.origin, SnapshotOrigin::Complete { .. }));
    assert_eq!(extractor.count(), 0);
    assert_eq!(stack.report.vectors.embedded, 0);
}

#[tokio::test]
async fn test_corrupt_snapshot_triggers_fresh_build() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = tmp.path().join("docs");
    write_docs(&docs);
    let snap = tmp.path().join("snap");
    let config = test_config(&docs, &snap);

    let stack = build_stack(&config, &fake_providers(CountingExtractor::new()), BuildOptions::default())
        .await
        .unwrap();
    let generation = stack.report.generation.unwrap();
    fs::write(snap.join(&generation).join("checkpoint.json"), "{").unwrap();

    let extractor = CountingExtractor::new();
    let stack = build_stack(&config, &fake_providers(extractor.clone()), BuildOptions::default())
        .await
        .unwrap();
    assert!(matches!(stack.report.origin, SnapshotOrigin::Corrupt { .. }));
    assert_eq!(extractor.count(), stack.report.nodes);
    assert!(SnapshotStore::new(&snap, 2).load().unwrap().checkpoint.complete);
}

fn triplet_counts(triplets: &[Triplet]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for t in triplets {
        *counts.entry(t.source_node_id.clone()).or_insert(0) += 1;
    }
    counts
}

/// Run a build over `nodes` that dies on `fail_on`, leaving a partial
/// snapshot on disk.
async fn interrupted_build(store: &SnapshotStore, nodes: &[docfusion_core::models::Node], batch_size: usize, fail_on: &str) {
    let mut builder = KnowledgeGraphBuilder::new(
        CountingExtractor::failing_on(fail_on),
        store.clone(),
        &graph_config(batch_size),
    );
    let mut snapshot = Snapshot::empty();
    builder
        .build(&NodeStore::new(nodes.to_vec()), &mut snapshot)
        .await
        .unwrap_err();
}

#[tokio::test]
async fn test_resume_after_new_file_skips_committed_nodes() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path(), 2);
    let original = numbered_nodes(6);
    interrupted_build(&store, &original, 3, "n0004").await;

    let committed = store.load().unwrap();
    assert_eq!(committed.checkpoint.processed, 3);
    let before = triplet_counts(&committed.triplets);

    // A document added while the build was down sorts first.
    let mut shifted = vec![node("a-new", "NewWrapper exposes Teleport")];
    shifted.extend(original);

    let extractor = CountingExtractor::new();
    let mut builder = KnowledgeGraphBuilder::new(extractor.clone(), store.clone(), &graph_config(3));
    let mut snapshot = store.load().unwrap();
    let report = builder.build(&NodeStore::new(shifted), &mut snapshot).await.unwrap();

    assert_eq!(extractor.calls(), vec!["a-new", "n0003", "n0004", "n0005"]);
    assert_eq!(report.mode, BuildMode::Resume);
    let after = triplet_counts(&snapshot.triplets);
    for id in ["n0000", "n0001", "n0002"] {
        assert_eq!(after.get(id), before.get(id), "triplets for {} duplicated", id);
    }
    let done = store.load().unwrap();
    assert!(done.checkpoint.complete);
    assert_eq!(done.checkpoint.processed, 7);
    assert_eq!(triplet_counts(&done.triplets), after);
}

#[tokio::test]
async fn test_resume_after_edit_reextracts_only_the_edited_node() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path(), 2);
    let mut nodes = numbered_nodes(6);
    interrupted_build(&store, &nodes, 3, "n0004").await;

    // A committed node is edited, and one uncommitted node is deleted.
    nodes[1] = node("n0001", "Teleport gadget replaces it");
    nodes.remove(5);

    let extractor = CountingExtractor::new();
    let mut builder = KnowledgeGraphBuilder::new(extractor.clone(), store.clone(), &graph_config(3));
    let mut snapshot = store.load().unwrap();
    builder.build(&NodeStore::new(nodes.clone()), &mut snapshot).await.unwrap();

    assert_eq!(extractor.calls(), vec!["n0001", "n0003", "n0004"]);
    assert!(snapshot
        .triplets
        .iter()
        .any(|t| t.source_node_id == "n0001" && t.object == "teleport"));
    assert!(!snapshot
        .triplets
        .iter()
        .any(|t| t.source_node_id == "n0001" && t.object == "method1"));
    assert_eq!(snapshot.docstore.len(), 5);
    assert_eq!(builder.state(), BuildState::Complete);
}

#[tokio::test]
async fn test_failed_refresh_batch_is_finished_by_next_refresh() {
    let tmp = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(tmp.path().join("live"), 2);
    let mut nodes = numbered_nodes(6);
    let mut snapshot = Snapshot::empty();
    KnowledgeGraphBuilder::new(CountingExtractor::new(), store.clone(), &graph_config(2))
        .build(&NodeStore::new(nodes.clone()), &mut snapshot)
        .await
        .unwrap();

    for i in 1..=4 {
        let id = format!("n{:04}", i);
        nodes[i] = node(&id, &format!("Wrapper{} renamed to Gadget{}", i, i));
    }

    let mut builder = KnowledgeGraphBuilder::new(CountingExtractor::failing_on("n0003"), store.clone(), &graph_config(2));
    let err = builder.build(&NodeStore::new(nodes.clone()), &mut snapshot).await.unwrap_err();
    assert!(matches!(err, BuildError::BatchFailed { ref node_id, .. } if node_id == "n0003"));

    let on_disk = store.load().unwrap();
    assert!(on_disk.checkpoint.complete);
    assert!(!on_disk.docstore.contains_key("n0003"));
    assert!(on_disk.triplets.iter().all(|t| t.source_node_id != "n0003"));

    let extractor = CountingExtractor::new();
    let mut builder = KnowledgeGraphBuilder::new(extractor.clone(), store.clone(), &graph_config(2));
    let mut snapshot = store.load().unwrap();
    builder.build(&NodeStore::new(nodes.clone()), &mut snapshot).await.unwrap();
    assert_eq!(extractor.calls(), vec!["n0003", "n0004"]);

    // Same graph as building the edited corpus from scratch.
    let reference = SnapshotStore::new(tmp.path().join("reference"), 2);
    let mut fresh = Snapshot::empty();
    KnowledgeGraphBuilder::new(CountingExtractor::new(), reference, &graph_config(2))
        .build(&NodeStore::new(nodes), &mut fresh)
        .await
        .unwrap();
    assert_eq!(triplets_by_node(&snapshot.triplets), triplets_by_node(&fresh.triplets));
}

#[tokio::test]
async fn test_second_writer_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = tmp.path().join("docs");
    write_docs(&docs);
    let snap = tmp.path().join("snap");
    let config = test_config(&docs, &snap);

    let held = SnapshotStore::new(&snap, 2).lock().unwrap();
    let extractor = CountingExtractor::new();
    let err = build_stack(&config, &fake_providers(extractor.clone()), BuildOptions::default())
        .await
        .err()
        .unwrap();
    assert!(format!("{:#}", err).contains("locked by another build"));
    assert_eq!(extractor.count(), 0);
    assert!(SnapshotStore::new(&snap, 2).current_generation().unwrap().is_none());

    drop(held);
    build_stack(&config, &fake_providers(extractor), BuildOptions::default())
        .await
        .unwrap();
}
