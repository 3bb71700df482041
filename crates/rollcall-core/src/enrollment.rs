//! Enrollment: a batch of one person's photos → stored reference embeddings.

use crate::extractor::{ExtractError, FaceExtractor};
use crate::gallery::{GalleryError, GalleryIndex};
use crate::runtime::RuntimeError;
use crate::store::{EmbeddingStore, StoreError};
use crate::types::{EnrolledEmbedding, OwnerId};
use std::sync::Arc;
use thiserror::Error;

/// Why one enrollment photo was rejected. The rest of the batch continues.
#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face found")]
    NoFaceFound,
    #[error("{count} faces found; an enrollment photo must show exactly one")]
    MultipleFaces { count: usize },
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("gallery: {0}")]
    Gallery(#[from] GalleryError),
}

/// One enrollment photo.
#[derive(Debug, Clone, Copy)]
pub struct ImageInput<'a> {
    /// Path or identifier recorded as the embedding's source.
    pub source_ref: &'a str,
    pub bytes: &'a [u8],
}

#[derive(Debug)]
pub struct ImageOutcome {
    pub source_ref: String,
    pub result: Result<EnrolledEmbedding, EnrollError>,
}

#[derive(Debug)]
pub struct EnrollmentReport {
    pub owner_id: OwnerId,
    /// One entry per input image, in input order.
    pub outcomes: Vec<ImageOutcome>,
    /// Previous embeddings removed by a re-enrollment.
    pub superseded: usize,
}

impl EnrollmentReport {
    pub fn enrolled(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.enrolled()
    }
}

pub struct EnrollmentPipeline {
    extractor: FaceExtractor,
    gallery: Arc<GalleryIndex>,
    store: Option<Arc<dyn EmbeddingStore>>,
}

impl EnrollmentPipeline {
    /// Gallery-only pipeline; nothing is persisted.
    pub fn new(extractor: FaceExtractor, gallery: Arc<GalleryIndex>) -> Self {
        Self {
            extractor,
            gallery,
            store: None,
        }
    }

    /// Commit every record to `store` before it reaches the gallery.
    pub fn with_store(mut self, store: Arc<dyn EmbeddingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Enroll each image independently and report per-image outcomes.
    ///
    /// Returns `Err` only for a runtime fault, which stops the batch; images
    /// enrolled before the fault stay enrolled.
    pub fn enroll(&self, owner_id: &OwnerId, images: &[ImageInput<'_>]) -> Result<EnrollmentReport, RuntimeError> {
        let mut outcomes = Vec::with_capacity(images.len());
        for image in images {
            let result = match self.enroll_one(owner_id, image) {
                Ok(record) => Ok(record),
                Err(Fault::Runtime(e)) => {
                    tracing::error!(owner = %owner_id, source = image.source_ref, error = %e, "enrollment aborted");
                    return Err(e);
                }
                Err(Fault::Image(e)) => {
                    tracing::warn!(owner = %owner_id, source = image.source_ref, error = %e, "enrollment image rejected");
                    Err(e)
                }
            };
            outcomes.push(ImageOutcome {
                source_ref: image.source_ref.to_string(),
                result,
            });
        }

        let report = EnrollmentReport {
            owner_id: owner_id.clone(),
            outcomes,
            superseded: 0,
        };
        tracing::info!(
            owner = %owner_id,
            enrolled = report.enrolled(),
            failed = report.failed(),
            "enrollment finished"
        );
        Ok(report)
    }

    /// Enroll new photos and, if at least one succeeds, drop the owner's
    /// previous embeddings. With no success the old enrollment is kept.
    pub fn reenroll(&self, owner_id: &OwnerId, images: &[ImageInput<'_>]) -> Result<EnrollmentReport, RuntimeError> {
        let previous: Vec<_> = self
            .gallery
            .all()
            .entries_for(owner_id)
            .map(|e| e.embedding_id.clone())
            .collect();

        let mut report = self.enroll(owner_id, images)?;
        if report.enrolled() == 0 {
            tracing::warn!(owner = %owner_id, "re-enrollment produced no embeddings; keeping previous");
            return Ok(report);
        }

        for id in &previous {
            if let Some(store) = &self.store {
                if let Err(e) = store.delete(id) {
                    tracing::error!(%id, error = %e, "failed to delete superseded embedding; kept");
                    continue;
                }
            }
            match self.gallery.remove(id) {
                Ok(_) => report.superseded += 1,
                Err(e) => tracing::debug!(%id, error = %e, "superseded embedding already gone"),
            }
        }

        tracing::info!(owner = %owner_id, superseded = report.superseded, "re-enrollment finished");
        Ok(report)
    }

    fn enroll_one(&self, owner_id: &OwnerId, image: &ImageInput<'_>) -> Result<EnrolledEmbedding, Fault> {
        let mut faces = self.extractor.extract(image.bytes)?;
        let face = match faces.len() {
            0 => return Err(EnrollError::NoFaceFound.into()),
            1 => faces.remove(0),
            count => return Err(EnrollError::MultipleFaces { count }.into()),
        };

        let record = EnrolledEmbedding::new(owner_id.clone(), face.embedding, image.source_ref);
        if let Some(store) = &self.store {
            store.commit(&record).map_err(EnrollError::from)?;
        }
        self.gallery
            .on_enrollment_committed(record.clone())
            .map_err(EnrollError::from)?;

        tracing::debug!(
            owner = %owner_id,
            id = %record.embedding_id,
            detection_score = face.detection_score,
            "enrollment image accepted"
        );
        Ok(record)
    }
}

/// Internal split between batch-stopping and per-image failures.
enum Fault {
    Runtime(RuntimeError),
    Image(EnrollError),
}

impl From<EnrollError> for Fault {
    fn from(e: EnrollError) -> Self {
        Fault::Image(e)
    }
}

impl From<ExtractError> for Fault {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::InvalidImage(reason) => Fault::Image(EnrollError::InvalidImage(reason)),
            ExtractError::Runtime(e) => Fault::Runtime(e),
        }
    }
}
