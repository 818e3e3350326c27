//! Core data models shared by the builders and the query path.
//!
//! Nodes are the unit every index is built over. Triplets and the
//! checkpoint belong to the knowledge-graph builder; retrieval and fusion
//! results live only for the duration of one query.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A loaded, sanitized source document.
///
/// Metadata is filled in at ingestion time and not touched afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Path relative to the docs root, with `/` separators.
    pub source_path: String,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// A chunk of a document with a stable identity.
///
/// The id is derived from the source path and heading path, so the same
/// section keeps its id across ingestion runs. `content_hash` is the
/// SHA-256 of `text` and is the only change detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub source_path: String,
    /// Enclosing headings, outermost first (e.g. `["ActorWrapper", "SetLocation"]`).
    pub heading_path: Vec<String>,
    pub text: String,
    pub content_hash: String,
    /// Populated by the vector builder; never persisted in the docstore.
    #[serde(default, skip_serializing)]
    pub embedding: Option<Vec<f32>>,
}

impl Node {
    /// Text handed to embedding and lexical indexing: the heading path as a
    /// breadcrumb line followed by the body.
    pub fn indexed_text(&self) -> String {
        if self.heading_path.is_empty() {
            self.text.clone()
        } else {
            format!("{}\n\n{}", self.heading_path.join(" > "), self.text)
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// An extracted `(subject, predicate, object)` fact attributed to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triplet {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub source_node_id: String,
    pub confidence: f64,
}

/// Durable marker of knowledge-graph build progress.
///
/// `processed` counts nodes of the build's node sequence whose triplets are
/// committed. The checkpoint is only ever advanced together with the write
/// it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processed: usize,
    pub batch_seq: u64,
    pub complete: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn empty() -> Self {
        Self {
            processed: 0,
            batch_seq: 0,
            complete: false,
            updated_at: Utc::now(),
        }
    }
}

/// One of the three fixed retrievers.
///
/// Declaration order is the fusion priority order used for tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieverSource {
    Vector,
    Graph,
    Lexical,
}

impl RetrieverSource {
    pub const ALL: [RetrieverSource; 3] = [
        RetrieverSource::Vector,
        RetrieverSource::Graph,
        RetrieverSource::Lexical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieverSource::Vector => "vector",
            RetrieverSource::Graph => "graph",
            RetrieverSource::Lexical => "lexical",
        }
    }
}

impl fmt::Display for RetrieverSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single retriever's judgment about one node. Rank 1 is most relevant.
///
/// `raw_score` is only meaningful within its own retriever.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub node_id: String,
    pub source: RetrieverSource,
    pub rank: usize,
    pub raw_score: f64,
}

/// A node's combined standing after rank fusion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    pub node_id: String,
    pub fused_score: f64,
    /// Retrievers that returned this node, in priority order.
    pub sources: Vec<RetrieverSource>,
}

/// A node used to ground an answer, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub node_id: String,
    pub source_path: String,
    pub heading_path: Vec<String>,
    pub fused_score: f64,
}
