//! Snapshot integrity report for `dfx status`.

use serde::Serialize;

use crate::error::SnapshotError;
use crate::snapshot::{SnapshotStatus, SnapshotStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum IndexStatus {
    NotBuilt,
    Corrupt {
        reason: String,
    },
    Partial {
        generation: String,
        processed: usize,
        batch_seq: u64,
        triplets: usize,
        updated_at: String,
    },
    Complete {
        generation: String,
        nodes: usize,
        triplets: usize,
        vectors: usize,
        embedding_model: String,
        updated_at: String,
    },
}

/// Inspect the snapshot directory without modifying it.
pub fn index_status(store: &SnapshotStore) -> Result<IndexStatus, SnapshotError> {
    let snapshot = match store.load() {
        Ok(s) => s,
        Err(SnapshotError::NotFound(_)) => return Ok(IndexStatus::NotBuilt),
        Err(e @ SnapshotError::Corrupt { .. }) => {
            return Ok(IndexStatus::Corrupt { reason: e.to_string() })
        }
        Err(e) => return Err(e),
    };
    let generation = store.current_generation()?.unwrap_or_default();
    let updated_at = snapshot.checkpoint.updated_at.to_rfc3339();

    Ok(match snapshot.status() {
        SnapshotStatus::Partial => IndexStatus::Partial {
            generation,
            processed: snapshot.checkpoint.processed,
            batch_seq: snapshot.checkpoint.batch_seq,
            triplets: snapshot.triplets.len(),
            updated_at,
        },
        SnapshotStatus::Complete => IndexStatus::Complete {
            generation,
            nodes: snapshot.docstore.len(),
            triplets: snapshot.triplets.len(),
            vectors: snapshot.vectors.entries.len(),
            embedding_model: snapshot.vectors.model,
            updated_at,
        },
    })
}

impl IndexStatus {
    /// Human-readable report lines.
    pub fn render(&self) -> String {
        match self {
            IndexStatus::NotBuilt => "Index: not built (run `dfx build`)".to_string(),
            IndexStatus::Corrupt { reason } => format!(
                "Index: CORRUPT\n  {}\n  The next `dfx build` rebuilds from scratch.",
                reason
            ),
            IndexStatus::Partial {
                generation,
                processed,
                batch_seq,
                triplets,
                updated_at,
            } => format!(
                "Index: partial ({})\n  graph build interrupted after {} nodes (batch {})\n  triplets:   {}\n  checkpoint: {}\n  Run `dfx build` to resume.",
                generation, processed, batch_seq, triplets, updated_at
            ),
            IndexStatus::Complete {
                generation,
                nodes,
                triplets,
                vectors,
                embedding_model,
                updated_at,
            } => format!(
                "Index: complete ({})\n  nodes:      {}\n  triplets:   {}\n  vectors:    {} ({})\n  updated:    {}",
                generation, nodes, triplets, vectors, embedding_model, updated_at
            ),
        }
    }
}
