//! Command implementations behind the `dfx` binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::config::Config;
use crate::mcp::{run_stdio, McpBridge};
use crate::providers::Providers;
use crate::rebuild::{live_channel, spawn_rebuild_worker, ChangeEvent};
use crate::server::{format_answer, run_http};
use crate::snapshot::SnapshotStore;
use crate::stack::{build_stack, open_engine, BuildOptions, SnapshotOrigin, StackReport};
use crate::status::index_status;
use crate::watch::watch_docs;

/// Which tool surface `serve` starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    Mcp,
    Http,
}

fn providers(config: &Config) -> Result<Providers> {
    Providers::from_config(config).context("Provider initialization failed")
}

pub fn print_report(report: &StackReport) {
    let origin = match &report.origin {
        SnapshotOrigin::NotBuilt => "no snapshot, fresh build".to_string(),
        SnapshotOrigin::Corrupt { reason } => format!("corrupt snapshot discarded ({})", reason),
        SnapshotOrigin::Discarded => "existing snapshot ignored (--fresh)".to_string(),
        SnapshotOrigin::Partial { processed } => format!("resumed from checkpoint at node {}", processed),
        SnapshotOrigin::Complete { nodes } => format!("incremental refresh of {} nodes", nodes),
    };
    println!("Build: {}", origin);
    println!("  nodes:            {}", report.nodes);
    println!("  triplets:         {}", report.triplets);
    println!(
        "  graph:            {} extracted in {} batches (+{} / -{} triplets, {} rekeyed, {} unchanged)",
        report.graph.extracted,
        report.graph.batches,
        report.graph.triplets_added,
        report.graph.triplets_removed,
        report.graph.rekeyed,
        report.graph.unchanged
    );
    println!(
        "  vectors:          {} embedded, {} reused, {} removed",
        report.vectors.embedded, report.vectors.reused, report.vectors.removed
    );
    for m in &report.graph.malformed {
        println!("  warning:          {}", m);
    }
    if let Some(generation) = &report.generation {
        println!("  snapshot:         {}", generation);
    }
}

pub async fn run_build(config: &Config, fresh: bool) -> Result<()> {
    let providers = providers(config)?;
    let stack = build_stack(config, &providers, BuildOptions { fresh }).await?;
    print_report(&stack.report);
    Ok(())
}

pub async fn run_query(config: &Config, text: &str, json: bool) -> Result<()> {
    if text.trim().is_empty() {
        bail!("query must not be empty");
    }
    let providers = providers(config)?;
    let engine = open_engine(config, &providers)?;
    let response = engine.query(text).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", format_answer(&response));
    }
    Ok(())
}

pub fn run_status(config: &Config) -> Result<()> {
    let store = SnapshotStore::new(&config.snapshot.dir, config.snapshot.keep_generations);
    let status = index_status(&store)?;
    println!("{}", status.render());
    Ok(())
}

/// Run one query per non-empty, non-`#` line of `path` and print how many
/// sources each answer drew on.
pub async fn run_eval(config: &Config, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read query file: {}", path.display()))?;
    let queries: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    if queries.is_empty() {
        bail!("No queries found in {}", path.display());
    }

    let providers = providers(config)?;
    let engine = open_engine(config, &providers)?;
    println!("Evaluating {} queries...", queries.len());

    let mut failures = 0;
    for query in &queries {
        let started = Instant::now();
        let result = engine.query(query).await;
        let elapsed = started.elapsed();
        println!("Q: {}", query);
        match result {
            Ok(response) => {
                println!("  sources used: {}", response.citations.len());
                if response.is_degraded() {
                    let missing: Vec<&str> = response.degraded.iter().map(|f| f.source.as_str()).collect();
                    println!("  degraded:     {}", missing.join(", "));
                }
                if !response.ungraded.is_empty() {
                    println!("  ungraded:     {}", response.ungraded.len());
                }
            }
            Err(e) => {
                failures += 1;
                println!("  error:        {}", e);
            }
        }
        println!("  latency:      {} ms", elapsed.as_millis());
    }
    println!("{} of {} queries answered.", queries.len() - failures, queries.len());
    Ok(())
}

pub async fn run_serve(config: Config, surface: Surface, live_reload: bool) -> Result<()> {
    // Credentials are checked before anything is loaded or served.
    let providers = providers(&config)?;
    let initial = open_engine(&config, &providers)?;
    info!(nodes = initial.node_count(), "serving index snapshot");

    let config = Arc::new(config);
    let tool_name = config.server.tool_name.clone();

    // Whatever publishes engines must outlive the server.
    let (engine, _worker, _publisher) = if live_reload {
        let handle = spawn_rebuild_worker(config.clone(), providers, initial);
        let watcher = watch_docs(&config.ingest, handle.sender())?;
        // Pick up edits made since the last build.
        if handle.sender().try_send(ChangeEvent::Requested).is_err() {
            info!("rebuild already queued");
        }
        (handle.subscribe(), Some((handle, watcher)), None)
    } else {
        let (tx, rx) = live_channel(initial);
        (rx, None, Some(tx))
    };

    match surface {
        Surface::Mcp => run_stdio(McpBridge::new(&tool_name, engine)).await,
        Surface::Http => run_http(&config.server.bind, &tool_name, engine).await,
    }
}
