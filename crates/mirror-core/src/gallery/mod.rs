//! Gallery database: enrolled (embedding, label) records with nearest-neighbor lookup.
//!
//! Records are keyed by a monotonically allocated `i64` index that is never
//! reused, so a stale index can never alias a later enrollment. Queries are an
//! exact linear scan using cosine similarity; ties resolve to the lowest index.
//!
//! All operations take `&self`. State sits behind a reader/writer lock, so
//! concurrent queries run in parallel while insert, delete and load are
//! exclusive. A load swaps the whole state in one step and never exposes a
//! partially restored gallery.

pub mod store;

use crate::types::{cosine_similarity, GalleryRecord, QueryResult};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub use store::{store_path, PersistError, GALLERY_FILE};

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no record with index {0}")]
    NotFound(i64),
    #[error("gallery is empty")]
    EmptyDatabase,
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(&'static str),
    #[error("record index space exhausted")]
    IndexExhausted,
    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistError),
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    label: String,
    embedding: Vec<f32>,
}

/// Full gallery contents, ordered by index. Exchanged with the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Snapshot {
    pub dimension: Option<usize>,
    pub next_index: i64,
    pub records: Vec<GalleryRecord>,
}

#[derive(Debug, Default)]
struct GalleryState {
    /// Established embedding length. Fixed by the first insert or by a load.
    dimension: Option<usize>,
    next_index: i64,
    records: BTreeMap<i64, Entry>,
}

impl GalleryState {
    fn check_dimension(&self, embedding: &[f32]) -> Result<(), GalleryError> {
        match self.dimension {
            Some(expected) if expected != embedding.len() => Err(GalleryError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Validate a query embedding: length first, then finiteness.
    fn check_query(&self, embedding: &[f32]) -> Result<(), GalleryError> {
        self.check_dimension(embedding)?;
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(GalleryError::InvalidEmbedding("non-finite value"));
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            dimension: self.dimension,
            next_index: self.next_index,
            records: self
                .records
                .iter()
                .map(|(&index, entry)| GalleryRecord {
                    index,
                    label: entry.label.clone(),
                    embedding: entry.embedding.clone(),
                })
                .collect(),
        }
    }

    /// Scores for every record, ascending by index.
    fn scores<'a>(&'a self, query: &'a [f32]) -> impl Iterator<Item = (i64, &'a Entry, f32)> + 'a {
        self.records
            .iter()
            .map(move |(&index, entry)| (index, entry, cosine_similarity(query, &entry.embedding)))
    }
}

impl From<Snapshot> for GalleryState {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            dimension: snapshot.dimension,
            next_index: snapshot.next_index,
            records: snapshot
                .records
                .into_iter()
                .map(|r| {
                    (
                        r.index,
                        Entry {
                            label: r.label,
                            embedding: r.embedding,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// In-memory gallery with optional on-disk persistence.
#[derive(Debug, Default)]
pub struct Gallery {
    state: RwLock<GalleryState>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll an embedding under `label` and return its index.
    ///
    /// Duplicate labels and duplicate embeddings are allowed.
    pub fn insert(&self, embedding: &[f32], label: &str) -> Result<i64, GalleryError> {
        let mut state = self.state.write();
        state.check_dimension(embedding)?;
        if embedding.is_empty() {
            return Err(GalleryError::InvalidEmbedding("empty embedding"));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(GalleryError::InvalidEmbedding("non-finite value"));
        }

        let index = state.next_index;
        state.next_index = index.checked_add(1).ok_or(GalleryError::IndexExhausted)?;
        state.dimension = Some(embedding.len());
        state.records.insert(
            index,
            Entry {
                label: label.to_string(),
                embedding: embedding.to_vec(),
            },
        );
        tracing::debug!(index, label, "gallery: record inserted");
        Ok(index)
    }

    /// Remove the record with `index`. The index is never handed out again.
    pub fn delete(&self, index: i64) -> Result<(), GalleryError> {
        let mut state = self.state.write();
        match state.records.remove(&index) {
            Some(entry) => {
                tracing::debug!(index, label = %entry.label, "gallery: record deleted");
                Ok(())
            }
            None => Err(GalleryError::NotFound(index)),
        }
    }

    /// Best match for `embedding` by cosine similarity.
    ///
    /// No score threshold is applied; callers decide what counts as a match.
    pub fn query_top(&self, embedding: &[f32]) -> Result<QueryResult, GalleryError> {
        let state = self.state.read();
        state.check_query(embedding)?;

        let mut best: Option<(i64, &Entry, f32)> = None;
        // Ascending index + strict comparison: the lowest index wins ties.
        for candidate in state.scores(embedding) {
            if best.map_or(true, |(_, _, score)| candidate.2 > score) {
                best = Some(candidate);
            }
        }

        best.map(|(index, entry, score)| QueryResult {
            index,
            label: entry.label.clone(),
            score,
        })
        .ok_or(GalleryError::EmptyDatabase)
    }

    /// The `k` best matches, highest score first, ties by lowest index.
    pub fn query_top_k(&self, embedding: &[f32], k: usize) -> Result<Vec<QueryResult>, GalleryError> {
        let state = self.state.read();
        state.check_query(embedding)?;
        if state.records.is_empty() {
            return Err(GalleryError::EmptyDatabase);
        }

        let mut scored: Vec<(i64, &Entry, f32)> = state.scores(embedding).collect();
        // Stable sort keeps ascending index order among equal scores.
        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let results = scored
            .into_iter()
            .take(k)
            .map(|(index, entry, score)| QueryResult {
                index,
                label: entry.label.clone(),
                score,
            })
            .collect();
        Ok(results)
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().records.is_empty()
    }

    /// Established embedding dimensionality, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.state.read().dimension
    }

    /// Index the next insert will receive.
    pub fn next_index(&self) -> i64 {
        self.state.read().next_index
    }

    pub fn get(&self, index: i64) -> Option<GalleryRecord> {
        self.state.read().records.get(&index).map(|entry| GalleryRecord {
            index,
            label: entry.label.clone(),
            embedding: entry.embedding.clone(),
        })
    }

    /// All records, ordered by index.
    pub fn records(&self) -> Vec<GalleryRecord> {
        self.state.read().snapshot().records
    }

    /// Persist the full gallery under `store_key`.
    pub fn save(&self, store_key: &Path) -> Result<(), GalleryError> {
        let snapshot = self.state.read().snapshot();
        let path = store_path(store_key);
        store::write(&path, &snapshot)?;
        tracing::info!(
            path = %path.display(),
            records = snapshot.records.len(),
            next_index = snapshot.next_index,
            "gallery saved"
        );
        Ok(())
    }

    /// Replace the in-memory gallery with the one stored under `store_key`.
    ///
    /// Either the whole store is read and validated and then swapped in, or
    /// an error is returned and the current contents are left untouched.
    pub fn load(&self, store_key: &Path) -> Result<(), GalleryError> {
        let path = store_path(store_key);
        let snapshot = store::read(&path)?;
        let records = snapshot.records.len();
        let next_index = snapshot.next_index;

        *self.state.write() = GalleryState::from(snapshot);

        tracing::info!(path = %path.display(), records, next_index, "gallery loaded");
        Ok(())
    }
}
