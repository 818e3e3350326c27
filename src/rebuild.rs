//! Serialized rebuild worker.
//!
//! One task owns every rebuild. Change events arrive on an mpsc channel;
//! anything queued while a rebuild runs is drained and folded into the next
//! one, so there is never more than one rebuild in flight and a burst of
//! edits costs one extra cycle, not one per event.
//!
//! Each successful rebuild produces a new, immutable [`QueryEngine`],
//! published through a `watch` channel. Readers clone the current
//! `Arc` per query; a running engine is never modified in place.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::engine::QueryEngine;
use crate::providers::Providers;
use crate::stack::{build_stack, BuildOptions};

const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Changed(PathBuf),
    Removed(PathBuf),
    /// Explicit request, not tied to a file.
    Requested,
}

/// The engine currently serving queries.
#[derive(Clone)]
pub struct LiveEngine {
    pub engine: Arc<QueryEngine>,
    /// Incremented on every successful rebuild; `0` is the startup engine.
    pub revision: u64,
}

pub struct RebuildHandle {
    events: mpsc::Sender<ChangeEvent>,
    live: watch::Receiver<LiveEngine>,
    task: JoinHandle<()>,
}

impl RebuildHandle {
    /// Sender for change events; hand this to the file watcher.
    pub fn sender(&self) -> mpsc::Sender<ChangeEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveEngine> {
        self.live.clone()
    }

    pub fn current(&self) -> LiveEngine {
        self.live.borrow().clone()
    }

    /// Stop accepting events and wait for an in-flight rebuild to finish.
    ///
    /// Returns once the worker has exited. Any other sender handed out
    /// must be dropped first.
    pub async fn shutdown(self) {
        drop(self.events);
        if let Err(e) = self.task.await {
            error!(error = %e, "rebuild worker panicked");
        }
    }
}

/// Channel publishing `initial` as revision 0.
///
/// Receivers only see a closed channel once the sender is dropped, so the
/// caller keeps it for as long as the engine is served.
pub fn live_channel(initial: QueryEngine) -> (watch::Sender<LiveEngine>, watch::Receiver<LiveEngine>) {
    watch::channel(LiveEngine {
        engine: Arc::new(initial),
        revision: 0,
    })
}

/// Spawn the rebuild worker, serving `initial` until the first rebuild.
pub fn spawn_rebuild_worker(config: Arc<Config>, providers: Providers, initial: QueryEngine) -> RebuildHandle {
    let (events_tx, events_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (live_tx, live_rx) = live_channel(initial);
    let task = tokio::spawn(run_worker(config, providers, events_rx, live_tx));
    RebuildHandle {
        events: events_tx,
        live: live_rx,
        task,
    }
}

async fn run_worker(
    config: Arc<Config>,
    providers: Providers,
    mut events: mpsc::Receiver<ChangeEvent>,
    live: watch::Sender<LiveEngine>,
) {
    let mut revision = 0u64;

    while let Some(first) = events.recv().await {
        let mut coalesced = 1usize;
        while events.try_recv().is_ok() {
            coalesced += 1;
        }
        info!(trigger = ?first, coalesced, "rebuilding index");

        match build_stack(&config, &providers, BuildOptions::default()).await {
            Ok(stack) => {
                revision += 1;
                info!(
                    revision,
                    nodes = stack.report.nodes,
                    extracted = stack.report.graph.extracted,
                    embedded = stack.report.vectors.embedded,
                    "reloaded query engine"
                );
                live.send_replace(LiveEngine {
                    engine: Arc::new(stack.engine),
                    revision,
                });
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "rebuild failed, still serving previous engine");
            }
        }
    }

    info!(revision, "rebuild worker stopped");
}
