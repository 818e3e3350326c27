mod common;

use std::sync::Arc;

use common::{fake_providers, test_config, write_docs, CountingExtractor};
use docfusion::rebuild::{live_channel, spawn_rebuild_worker, ChangeEvent};
use docfusion::stack::{build_stack, BuildOptions};

#[tokio::test]
async fn test_queued_events_coalesce_into_one_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = tmp.path().join("docs");
    write_docs(&docs);
    let config = test_config(&docs, &tmp.path().join("snap"));

    let stack = build_stack(&config, &fake_providers(CountingExtractor::new()), BuildOptions::default())
        .await
        .unwrap();

    let extractor = CountingExtractor::new();
    let handle = spawn_rebuild_worker(Arc::new(config), fake_providers(extractor.clone()), stack.engine);
    let mut live = handle.subscribe();
    assert_eq!(live.borrow().revision, 0);

    // The worker has not been polled yet; all three land in the queue.
    let events = handle.sender();
    events.try_send(ChangeEvent::Changed(docs.join("api/ball.md"))).unwrap();
    events.try_send(ChangeEvent::Removed(docs.join("old.md"))).unwrap();
    events.try_send(ChangeEvent::Requested).unwrap();
    drop(events);

    live.changed().await.unwrap();
    assert_eq!(live.borrow_and_update().revision, 1);

    handle.shutdown().await;
    assert_eq!(live.borrow().revision, 1);
    assert_eq!(extractor.count(), 0);
}

#[tokio::test]
async fn test_new_file_is_served_after_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = tmp.path().join("docs");
    write_docs(&docs);
    let config = test_config(&docs, &tmp.path().join("snap"));

    let stack = build_stack(&config, &fake_providers(CountingExtractor::new()), BuildOptions::default())
        .await
        .unwrap();
    let before = stack.engine.node_count();

    let extractor = CountingExtractor::new();
    let handle = spawn_rebuild_worker(Arc::new(config), fake_providers(extractor.clone()), stack.engine);
    let mut live = handle.subscribe();

    let added = docs.join("api/boost.md");
    std::fs::write(&added, "# BoostWrapper\n\nGetCurrentBoostAmount returns the boost left.\n").unwrap();
    handle.sender().send(ChangeEvent::Changed(added)).await.unwrap();

    live.changed().await.unwrap();
    let current = handle.current();
    assert_eq!(current.revision, 1);
    assert_eq!(current.engine.node_count(), before + 1);
    assert_eq!(extractor.count(), 1);

    let response = current.engine.query("GetCurrentBoostAmount boost").await.unwrap();
    assert!(response
        .citations
        .iter()
        .any(|c| c.source_path == "api/boost.md"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_fixed_engine_channel_stays_open_while_sender_is_held() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = tmp.path().join("docs");
    write_docs(&docs);
    let config = test_config(&docs, &tmp.path().join("snap"));
    let stack = build_stack(&config, &fake_providers(CountingExtractor::new()), BuildOptions::default())
        .await
        .unwrap();

    let (tx, rx) = live_channel(stack.engine);
    assert_eq!(rx.borrow().revision, 0);
    assert_eq!(rx.has_changed().ok(), Some(false));

    drop(tx);
    assert!(rx.has_changed().is_err());
    assert_eq!(rx.borrow().engine.node_count(), stack.report.nodes);
}
