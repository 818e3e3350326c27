//! File-watch bridge: `notify` events under the docs root become
//! [`ChangeEvent`]s on the rebuild channel.

use std::path::Path;

use anyhow::{Context, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::ingest::DocMatcher;
use crate::rebuild::ChangeEvent;

/// Keeps the underlying watcher alive; dropping it stops watching.
pub struct DocsWatcher {
    _watcher: RecommendedWatcher,
}

/// Watch `config.docs_dir` recursively and forward indexed-document changes.
pub fn watch_docs(config: &IngestConfig, events: mpsc::Sender<ChangeEvent>) -> Result<DocsWatcher> {
    let root = config
        .docs_dir
        .canonicalize()
        .with_context(|| format!("Docs directory does not exist: {}", config.docs_dir.display()))?;
    let matcher = DocMatcher::new(&IngestConfig {
        docs_dir: root.clone(),
        ..config.clone()
    })?;

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                for change in classify(&matcher, &event) {
                    match events.try_send(change) {
                        Ok(()) => {}
                        // A queued event already guarantees a rebuild.
                        Err(TrySendError::Full(_)) => debug!("rebuild queue full, event coalesced"),
                        Err(TrySendError::Closed(_)) => {}
                    }
                }
            }
            Err(e) => warn!(error = %e, "file watch error"),
        },
        NotifyConfig::default(),
    )?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!(root = %root.display(), "watching documentation for changes");

    Ok(DocsWatcher { _watcher: watcher })
}

/// Map one notify event to change events for indexed documents only.
pub fn classify(matcher: &DocMatcher, event: &Event) -> Vec<ChangeEvent> {
    let removed = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => false,
        EventKind::Remove(_) => true,
        _ => return Vec::new(),
    };
    event
        .paths
        .iter()
        .filter(|p| is_indexed(matcher, p))
        .map(|p| {
            if removed {
                ChangeEvent::Removed(p.clone())
            } else {
                ChangeEvent::Changed(p.clone())
            }
        })
        .collect()
}

fn is_indexed(matcher: &DocMatcher, path: &Path) -> bool {
    matcher.relative(path).is_some()
}
