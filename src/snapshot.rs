//! On-disk index snapshot.
//!
//! A snapshot is four JSON records written together:
//!
//! | Record | Contents |
//! |--------|----------|
//! | `docstore.json` | node id → [`Node`] (without embeddings) |
//! | `vector_store.json` | embedding model, dims, node id → content hash + base64 embedding |
//! | `graph_store.json` | triplets plus the `processed` / `complete` they correspond to |
//! | `checkpoint.json` | [`Checkpoint`] |
//!
//! # Layout and atomicity
//!
//! ```text
//! rag_storage/
//! ├── CURRENT              "gen-00000007"
//! ├── gen-00000006/        previous generation (pruned past keep_generations)
//! └── gen-00000007/
//!     ├── docstore.json
//!     ├── vector_store.json
//!     ├── graph_store.json
//!     └── checkpoint.json
//! ```
//!
//! A persist writes a complete new generation into a temporary directory
//! (every file fsynced), renames it into place, then swaps `CURRENT` with
//! a temp-file + rename. A crash at any point leaves `CURRENT` naming a
//! fully written generation, so the checkpoint can never claim progress
//! the graph store does not contain.
//!
//! Maps are `BTreeMap`s, so unchanged content serializes byte-identically.
//!
//! # Writers
//!
//! Only one process may build at a time. A writer takes an exclusive
//! advisory lock on `dir/LOCK` with [`SnapshotStore::lock`] and holds it
//! for the whole build; the OS releases it if the process dies. Readers
//! never lock: they only follow `CURRENT` to a finished generation.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use docfusion_core::models::{Checkpoint, Node, Triplet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SnapshotError;

const CURRENT: &str = "CURRENT";
const LOCK: &str = "LOCK";
const DOCSTORE: &str = "docstore.json";
const VECTOR_STORE: &str = "vector_store.json";
const GRAPH_STORE: &str = "graph_store.json";
const CHECKPOINT: &str = "checkpoint.json";
const GEN_PREFIX: &str = "gen-";
const TMP_PREFIX: &str = ".tmp-gen-";

/// Embeddings keyed by node id, tagged with the model that produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorStore {
    pub model: String,
    pub dims: usize,
    pub entries: BTreeMap<String, VectorEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub content_hash: String,
    #[serde(with = "blob_base64")]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GraphStoreRecord {
    processed: usize,
    complete: bool,
    triplets: Vec<Triplet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    /// Graph build finished; safe for incremental refresh.
    Complete,
    /// Graph build interrupted; resume before querying the graph.
    Partial,
}

/// In-memory form of one snapshot generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub docstore: BTreeMap<String, Node>,
    pub vectors: VectorStore,
    pub triplets: Vec<Triplet>,
    pub checkpoint: Checkpoint,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            docstore: BTreeMap::new(),
            vectors: VectorStore::default(),
            triplets: Vec::new(),
            checkpoint: Checkpoint::empty(),
        }
    }

    pub fn status(&self) -> SnapshotStatus {
        if self.checkpoint.complete {
            SnapshotStatus::Complete
        } else {
            SnapshotStatus::Partial
        }
    }
}

/// Reader/writer for a snapshot directory. Exactly one builder writes.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    keep_generations: usize,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, keep_generations: usize) -> Self {
        Self {
            dir: dir.into(),
            keep_generations: keep_generations.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the writer lock, failing with [`SnapshotError::Locked`] if
    /// another build holds it. Released when the guard is dropped.
    pub fn lock(&self) -> Result<SnapshotLock, SnapshotError> {
        fs::create_dir_all(&self.dir).map_err(|e| SnapshotError::io(&self.dir, e))?;
        let path = self.dir.join(LOCK);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SnapshotError::io(&path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "snapshot writer lock taken");
                Ok(SnapshotLock { file })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(SnapshotError::Locked(self.dir.clone())),
            Err(e) => Err(SnapshotError::io(&path, e)),
        }
    }

    /// Name of the live generation, if any.
    pub fn current_generation(&self) -> Result<Option<String>, SnapshotError> {
        let path = self.dir.join(CURRENT);
        match fs::read_to_string(&path) {
            Ok(s) => {
                let name = s.trim().to_string();
                if parse_generation(&name).is_none() {
                    return Err(SnapshotError::corrupt(path, format!("invalid generation name {:?}", name)));
                }
                Ok(Some(name))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SnapshotError::io(path, e)),
        }
    }

    /// Load the live generation.
    ///
    /// [`SnapshotError::NotFound`] means nothing has been built yet;
    /// [`SnapshotError::Corrupt`] means a record is missing, unparseable,
    /// or inconsistent with its siblings.
    pub fn load(&self) -> Result<Snapshot, SnapshotError> {
        let Some(generation) = self.current_generation()? else {
            return Err(SnapshotError::NotFound(self.dir.clone()));
        };
        let gen_dir = self.dir.join(&generation);

        let docstore: BTreeMap<String, Node> = read_record(&gen_dir.join(DOCSTORE))?;
        let vectors: VectorStore = read_record(&gen_dir.join(VECTOR_STORE))?;
        let graph: GraphStoreRecord = read_record(&gen_dir.join(GRAPH_STORE))?;
        let checkpoint: Checkpoint = read_record(&gen_dir.join(CHECKPOINT))?;

        if graph.processed != checkpoint.processed || graph.complete != checkpoint.complete {
            return Err(SnapshotError::corrupt(
                gen_dir.join(GRAPH_STORE),
                format!(
                    "graph store (processed={}, complete={}) disagrees with checkpoint (processed={}, complete={})",
                    graph.processed, graph.complete, checkpoint.processed, checkpoint.complete
                ),
            ));
        }
        if let Some((id, node)) = docstore.iter().find(|(id, node)| **id != node.id) {
            return Err(SnapshotError::corrupt(
                gen_dir.join(DOCSTORE),
                format!("key {} holds node {}", id, node.id),
            ));
        }
        if let Some((id, _)) = vectors
            .entries
            .iter()
            .find(|(_, e)| e.embedding.len() != vectors.dims)
        {
            return Err(SnapshotError::corrupt(
                gen_dir.join(VECTOR_STORE),
                format!("embedding for {} does not have {} dims", id, vectors.dims),
            ));
        }

        debug!(generation = %generation, nodes = docstore.len(), triplets = graph.triplets.len(), "snapshot loaded");

        Ok(Snapshot {
            docstore,
            vectors,
            triplets: graph.triplets,
            checkpoint,
        })
    }

    /// Durably write `snapshot` as a new generation and make it live.
    ///
    /// Stamps `checkpoint.updated_at`. Returns the generation name.
    pub fn persist(&self, snapshot: &mut Snapshot) -> Result<String, SnapshotError> {
        fs::create_dir_all(&self.dir).map_err(|e| SnapshotError::io(&self.dir, e))?;

        snapshot.checkpoint.updated_at = Utc::now();
        let next = self.max_generation()? + 1;
        let name = generation_name(next);
        let tmp_dir = self.dir.join(format!("{}{:08}", TMP_PREFIX, next));
        let gen_dir = self.dir.join(&name);

        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir).map_err(|e| SnapshotError::io(&tmp_dir, e))?;
        }
        fs::create_dir(&tmp_dir).map_err(|e| SnapshotError::io(&tmp_dir, e))?;

        let graph = GraphStoreRecord {
            processed: snapshot.checkpoint.processed,
            complete: snapshot.checkpoint.complete,
            triplets: snapshot.triplets.clone(),
        };
        write_record(&tmp_dir.join(DOCSTORE), &snapshot.docstore)?;
        write_record(&tmp_dir.join(VECTOR_STORE), &snapshot.vectors)?;
        write_record(&tmp_dir.join(GRAPH_STORE), &graph)?;
        write_record(&tmp_dir.join(CHECKPOINT), &snapshot.checkpoint)?;
        sync_dir(&tmp_dir)?;

        fs::rename(&tmp_dir, &gen_dir).map_err(|e| SnapshotError::io(&gen_dir, e))?;

        let current_tmp = self.dir.join(format!("{}.tmp", CURRENT));
        write_bytes(&current_tmp, format!("{}\n", name).as_bytes())?;
        let current = self.dir.join(CURRENT);
        fs::rename(&current_tmp, &current).map_err(|e| SnapshotError::io(&current, e))?;
        sync_dir(&self.dir)?;

        self.prune(next);
        debug!(generation = %name, processed = snapshot.checkpoint.processed, complete = snapshot.checkpoint.complete, "snapshot persisted");
        Ok(name)
    }

    /// All generation directories present, oldest first.
    pub fn generations(&self) -> Result<Vec<String>, SnapshotError> {
        let mut found: Vec<(u64, String)> = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SnapshotError::io(&self.dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| SnapshotError::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(n) = parse_generation(&name) {
                found.push((n, name));
            }
        }
        found.sort();
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    fn max_generation(&self) -> Result<u64, SnapshotError> {
        Ok(self
            .generations()?
            .iter()
            .filter_map(|g| parse_generation(g))
            .max()
            .unwrap_or(0))
    }

    /// Remove generations older than the newest `keep_generations`, plus any
    /// leftover temp directories. Failures only cost disk space.
    fn prune(&self, live: u64) {
        let generations = match self.generations() {
            Ok(g) => g,
            Err(e) => {
                warn!(error = %e, "could not list snapshot generations for pruning");
                return;
            }
        };
        let excess = generations.len().saturating_sub(self.keep_generations);
        for name in generations.iter().take(excess) {
            if parse_generation(name) == Some(live) {
                continue;
            }
            let path = self.dir.join(name);
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %e, "failed to prune snapshot generation");
            }
        }

        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                    let _ = fs::remove_dir_all(entry.path());
                }
            }
        }
    }
}

/// Exclusive writer lock on a snapshot directory.
#[derive(Debug)]
pub struct SnapshotLock {
    file: File,
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn generation_name(n: u64) -> String {
    format!("{}{:08}", GEN_PREFIX, n)
}

fn parse_generation(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(GEN_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SnapshotError::corrupt(path, "record missing"));
        }
        Err(e) => return Err(SnapshotError::io(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|e| SnapshotError::corrupt(path, e))
}

fn write_record<T: Serialize>(path: &Path, value: &T) -> Result<(), SnapshotError> {
    let mut bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| SnapshotError::io(path, std::io::Error::other(e)))?;
    bytes.push(b'\n');
    write_bytes(path, &bytes)
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let mut file = File::create(path).map_err(|e| SnapshotError::io(path, e))?;
    file.write_all(bytes).map_err(|e| SnapshotError::io(path, e))?;
    file.sync_all().map_err(|e| SnapshotError::io(path, e))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), SnapshotError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| SnapshotError::io(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), SnapshotError> {
    Ok(())
}

/// Embeddings as base64 of the little-endian `f32` blob.
mod blob_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use docfusion_core::embedding::{blob_to_vec, vec_to_blob};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(vec: &[f32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(vec_to_blob(vec)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(d)?;
        let bytes = STANDARD.decode(encoded).map_err(serde::de::Error::custom)?;
        if bytes.len() % 4 != 0 {
            return Err(serde::de::Error::custom("embedding blob length is not a multiple of 4"));
        }
        Ok(blob_to_vec(&bytes))
    }
}
