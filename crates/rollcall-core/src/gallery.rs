//! In-memory gallery of enrolled embeddings with snapshot reads.
//!
//! Writers are serialized by a writer mutex and publish a fresh immutable
//! snapshot on every change. Readers clone the current `Arc` under a short
//! read lock, so they never see a half-applied write and never wait on the
//! copy a writer is building.

use crate::types::{EmbeddingId, EnrolledEmbedding, OwnerId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GalleryError {
    #[error("embedding id already present: {0}")]
    DuplicateId(EmbeddingId),
    #[error("embedding id not found: {0}")]
    NotFound(EmbeddingId),
}

/// Immutable point-in-time view of the gallery.
#[derive(Debug, Default)]
pub struct GallerySnapshot {
    /// Incremented on every published change.
    pub version: u64,
    pub entries: Vec<EnrolledEmbedding>,
}

impl GallerySnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn owner_count(&self) -> usize {
        self.entries.iter().map(|e| &e.owner_id).collect::<HashSet<_>>().len()
    }

    pub fn entries_for<'a>(&'a self, owner: &'a OwnerId) -> impl Iterator<Item = &'a EnrolledEmbedding> + 'a {
        self.entries.iter().filter(move |e| &e.owner_id == owner)
    }
}

pub struct GalleryIndex {
    dimension: usize,
    current: RwLock<Arc<GallerySnapshot>>,
    /// Ids present in `current`; holding this lock makes the caller the only writer.
    writer: Mutex<HashSet<EmbeddingId>>,
}

impl GalleryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            current: RwLock::new(Arc::new(GallerySnapshot::default())),
            writer: Mutex::new(HashSet::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Consistent snapshot for exhaustive comparison.
    pub fn all(&self) -> Arc<GallerySnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.all().is_empty()
    }

    /// Add one record.
    ///
    /// # Panics
    ///
    /// Panics if the vector dimension differs from the gallery's.
    pub fn insert(&self, record: EnrolledEmbedding) -> Result<(), GalleryError> {
        self.check_dimension(&record);
        let mut ids = self.writer.lock();
        if ids.contains(&record.embedding_id) {
            return Err(GalleryError::DuplicateId(record.embedding_id));
        }

        let base = self.all();
        let mut entries = Vec::with_capacity(base.entries.len() + 1);
        entries.extend(base.entries.iter().cloned());
        ids.insert(record.embedding_id.clone());
        tracing::debug!(id = %record.embedding_id, owner = %record.owner_id, "gallery insert");
        entries.push(record);
        self.publish(base.version, entries);
        Ok(())
    }

    /// Remove one record by id, returning it.
    pub fn remove(&self, id: &EmbeddingId) -> Result<EnrolledEmbedding, GalleryError> {
        let mut ids = self.writer.lock();
        if !ids.remove(id) {
            return Err(GalleryError::NotFound(id.clone()));
        }

        let base = self.all();
        let mut removed = None;
        let mut entries = Vec::with_capacity(base.entries.len().saturating_sub(1));
        for entry in base.entries.iter() {
            if &entry.embedding_id == id {
                removed = Some(entry.clone());
            } else {
                entries.push(entry.clone());
            }
        }
        self.publish(base.version, entries);
        tracing::debug!(%id, "gallery remove");
        removed.ok_or_else(|| GalleryError::NotFound(id.clone()))
    }

    /// Replace the whole gallery with records loaded from storage.
    ///
    /// Rejects the batch (leaving the gallery untouched) if it repeats an id.
    pub fn load(&self, records: Vec<EnrolledEmbedding>) -> Result<(), GalleryError> {
        let mut fresh = HashSet::with_capacity(records.len());
        for r in &records {
            self.check_dimension(r);
            if !fresh.insert(r.embedding_id.clone()) {
                return Err(GalleryError::DuplicateId(r.embedding_id.clone()));
            }
        }

        let mut ids = self.writer.lock();
        let base = self.all();
        *ids = fresh;
        let count = records.len();
        self.publish(base.version, records);
        tracing::info!(embeddings = count, "gallery loaded");
        Ok(())
    }

    /// Write-through hook: called once storage has durably committed `record`.
    pub fn on_enrollment_committed(&self, record: EnrolledEmbedding) -> Result<(), GalleryError> {
        let id = record.embedding_id.clone();
        self.insert(record)?;
        tracing::info!(%id, "enrollment committed to gallery");
        Ok(())
    }

    fn publish(&self, base_version: u64, entries: Vec<EnrolledEmbedding>) {
        let snapshot = Arc::new(GallerySnapshot {
            version: base_version + 1,
            entries,
        });
        *self.current.write() = snapshot;
    }

    fn check_dimension(&self, record: &EnrolledEmbedding) {
        assert_eq!(
            record.vector.dim(),
            self.dimension,
            "embedding dimension mismatch for {}",
            record.embedding_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    fn record(id: &str, owner: &str, v: [f32; 2]) -> EnrolledEmbedding {
        let mut r = EnrolledEmbedding::new(OwnerId::new(owner), Embedding::from_raw(v.to_vec()), "photo.jpg");
        r.embedding_id = EmbeddingId::new(id);
        r
    }

    #[test]
    fn test_insert_and_snapshot() {
        let g = GalleryIndex::new(2);
        g.insert(record("e1", "alice", [1.0, 0.0])).unwrap();
        g.insert(record("e2", "alice", [0.0, 1.0])).unwrap();
        let snap = g.all();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.owner_count(), 1);
        assert_eq!(snap.version, 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let g = GalleryIndex::new(2);
        g.insert(record("e1", "alice", [1.0, 0.0])).unwrap();
        let err = g.insert(record("e1", "bob", [0.0, 1.0])).unwrap_err();
        assert_eq!(err, GalleryError::DuplicateId(EmbeddingId::new("e1")));
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_remove_missing_is_not_found() {
        let g = GalleryIndex::new(2);
        let err = g.remove(&EmbeddingId::new("nope")).unwrap_err();
        assert_eq!(err, GalleryError::NotFound(EmbeddingId::new("nope")));
    }

    #[test]
    fn test_remove_then_reinsert_same_id() {
        let g = GalleryIndex::new(2);
        g.insert(record("e1", "alice", [1.0, 0.0])).unwrap();
        let removed = g.remove(&EmbeddingId::new("e1")).unwrap();
        assert_eq!(removed.owner_id, OwnerId::new("alice"));
        assert!(g.is_empty());
        g.insert(record("e1", "alice", [1.0, 0.0])).unwrap();
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_old_snapshot_unchanged_by_writes() {
        let g = GalleryIndex::new(2);
        g.insert(record("e1", "alice", [1.0, 0.0])).unwrap();
        let before = g.all();
        g.insert(record("e2", "bob", [0.0, 1.0])).unwrap();
        g.remove(&EmbeddingId::new("e1")).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before.entries[0].embedding_id, EmbeddingId::new("e1"));
        assert_eq!(g.all().entries[0].embedding_id, EmbeddingId::new("e2"));
    }

    #[test]
    fn test_load_replaces_and_rejects_duplicates() {
        let g = GalleryIndex::new(2);
        g.insert(record("old", "zed", [1.0, 0.0])).unwrap();
        g.load(vec![record("a", "alice", [1.0, 0.0]), record("b", "bob", [0.0, 1.0])])
            .unwrap();
        assert_eq!(g.len(), 2);

        let err = g
            .load(vec![record("x", "alice", [1.0, 0.0]), record("x", "bob", [0.0, 1.0])])
            .unwrap_err();
        assert_eq!(err, GalleryError::DuplicateId(EmbeddingId::new("x")));
        assert_eq!(g.len(), 2);
        assert!(g.insert(record("old", "zed", [1.0, 0.0])).is_ok());
    }

    #[test]
    #[should_panic(expected = "embedding dimension mismatch")]
    fn test_dimension_mismatch_panics() {
        let g = GalleryIndex::new(3);
        let _ = g.insert(record("e1", "alice", [1.0, 0.0]));
    }

    #[test]
    fn test_concurrent_inserts_and_reads() {
        let g = Arc::new(GalleryIndex::new(2));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let g = Arc::clone(&g);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        g.insert(record(&format!("{t}-{i}"), &format!("owner{t}"), [1.0, i as f32]))
                            .unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let g = Arc::clone(&g);
            std::thread::spawn(move || {
                let mut last = 0;
                for _ in 0..200 {
                    let snap = g.all();
                    assert!(snap.version >= last);
                    assert_eq!(snap.version as usize, snap.len());
                    last = snap.version;
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(g.len(), 200);
    }
}
