//! Typed errors for the build and query paths.
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | [`ProviderError::Transient`] | any provider call | retried with backoff |
//! | [`ProviderError::Auth`] | provider construction / calls | fatal at startup |
//! | [`MalformedNode`] | graph builder | node skipped, warning recorded |
//! | [`BuildError::CheckpointIo`] | snapshot persist | build halts, last checkpoint kept |
//! | [`SnapshotError::Corrupt`] | snapshot load | fresh rebuild |
//! | [`SnapshotError::Locked`] | second writer | build refused |
//! | [`QueryError::RetrievalUnavailable`] | fusion retriever | query fails, no answer |
//!
//! Rerank degradation is not an error; it is reported on
//! `RerankOutcome::ungraded`.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// Network failure, rate limit or server error. Safe to retry.
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider authentication failed: {0}")]
    Auth(String),

    /// The provider refused the request; retrying will not help.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// A node the graph builder could not process. Recorded, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("malformed node {node_id}: {reason}")]
pub struct MalformedNode {
    pub node_id: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    /// No snapshot has been written to this directory yet.
    #[error("no snapshot found in {0}")]
    NotFound(PathBuf),

    #[error("corrupt snapshot record {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Another process holds the writer lock on this snapshot directory.
    #[error("snapshot {0} is locked by another build; wait for it to finish")]
    Locked(PathBuf),

    #[error("snapshot I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SnapshotError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SnapshotError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        SnapshotError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    /// Persisting a batch failed. Everything up to the previous checkpoint
    /// is still on disk and resumable.
    #[error("checkpoint write failed for batch {batch_seq}: {source}")]
    CheckpointIo {
        batch_seq: u64,
        #[source]
        source: SnapshotError,
    },

    /// Extraction failed for a node after retries; the batch was abandoned.
    #[error("batch {batch_seq} (nodes {start}..{end}) failed on node {node_id}: {source}")]
    BatchFailed {
        batch_seq: u64,
        start: usize,
        end: usize,
        node_id: String,
        #[source]
        source: ProviderError,
    },

    #[error("embedding failed: {0}")]
    Embedding(#[source] ProviderError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Error, Debug)]
pub enum QueryError {
    /// Every retriever failed or timed out.
    #[error("retrieval unavailable: {}", failures.join("; "))]
    RetrievalUnavailable { failures: Vec<String> },

    #[error("answer synthesis failed: {0}")]
    Synthesis(#[source] ProviderError),
}
