//! Document loading and node parsing.
//!
//! Walks `ingest.docs_dir`, keeps files matching the include globs (minus
//! excludes and the usual VCS/build directories), sanitizes their text and
//! splits them into heading-aware nodes. Output order is sorted by relative
//! path so the node sequence is stable across runs.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use docfusion_core::chunk::parse_markdown_nodes;
use docfusion_core::models::Document;
use docfusion_core::store::NodeStore;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::IngestConfig;

/// Include/exclude filter relative to the docs root.
pub struct DocMatcher {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl DocMatcher {
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            root: config.docs_dir.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative `/`-separated path of `path` if it is an indexed document.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel.is_empty() || self.exclude.is_match(&rel) || !self.include.is_match(&rel) {
            return None;
        }
        Some(rel)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

/// Load every matching document under the docs root.
pub fn load_documents(config: &IngestConfig) -> Result<Vec<Document>> {
    let matcher = DocMatcher::new(config)?;
    if !matcher.root().is_dir() {
        bail!("Docs directory does not exist: {}", matcher.root().display());
    }

    let mut docs = Vec::new();
    for entry in WalkDir::new(matcher.root()) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = matcher.relative(entry.path()) else {
            continue;
        };
        match read_document(entry.path(), &rel) {
            Ok(doc) => docs.push(doc),
            Err(e) => warn!(path = %rel, error = %e, "skipping unreadable document"),
        }
    }

    docs.sort_by(|a, b| a.source_path.cmp(&b.source_path));
    Ok(docs)
}

fn read_document(path: &Path, relative: &str) -> Result<Document> {
    let metadata = std::fs::metadata(path)?;
    let bytes = std::fs::read(path)?;
    let raw = String::from_utf8(bytes)
        .with_context(|| format!("{} is not valid UTF-8", relative))?;

    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut doc = Document {
        source_path: relative.to_string(),
        text: sanitize(&raw),
        metadata: Default::default(),
    };
    doc.metadata.insert("file_name".to_string(), file_name);
    doc.metadata
        .insert("file_size".to_string(), metadata.len().to_string());
    doc.metadata
        .insert("modified_at".to_string(), modified.to_rfc3339());
    Ok(doc)
}

/// Drop non-printable characters, keeping `\n`, `\r` and `\t`.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| matches!(c, '\n' | '\r' | '\t') || !(c.is_control() || *c == '\u{feff}'))
        .collect()
}

/// Load documents and parse them into one ordered node store.
pub fn ingest(config: &IngestConfig) -> Result<NodeStore> {
    let docs = load_documents(config)?;
    let mut nodes = Vec::new();
    for doc in &docs {
        nodes.extend(parse_markdown_nodes(doc, config.max_node_tokens));
    }
    info!(documents = docs.len(), nodes = nodes.len(), "ingested documents");
    Ok(NodeStore::new(nodes))
}
