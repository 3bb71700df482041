//! Boundary to the persistence layer.
//!
//! The engine never does storage I/O on its own; it talks to whatever
//! implements [`EmbeddingStore`]. Storage is the source of truth: the gallery
//! is filled from [`EmbeddingStore::load_all`] at startup and only learns
//! about a new enrollment after [`EmbeddingStore::commit`] succeeds.

use crate::codec::CodecError;
use crate::gallery::{GalleryError, GalleryIndex};
use crate::types::{EmbeddingId, EnrolledEmbedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt embedding {id}: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: CodecError,
    },
    #[error("stored records rejected by gallery: {0}")]
    Gallery(#[from] GalleryError),
}

pub trait EmbeddingStore: Send + Sync {
    /// Every stored record, for filling the gallery at startup.
    fn load_all(&self) -> Result<Vec<EnrolledEmbedding>, StoreError>;

    /// Durably write one record. Returns only once the write is committed.
    fn commit(&self, record: &EnrolledEmbedding) -> Result<(), StoreError>;

    /// Delete one record; `Ok(false)` if it was not stored.
    fn delete(&self, id: &EmbeddingId) -> Result<bool, StoreError>;
}

/// Replace the gallery contents with everything in `store`.
pub fn load_gallery(store: &dyn EmbeddingStore, gallery: &GalleryIndex) -> Result<usize, StoreError> {
    let records = store.load_all()?;
    let count = records.len();
    gallery.load(records)?;
    Ok(count)
}
