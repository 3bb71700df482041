//! Face extraction: image decoding and validation in front of the model runtime.

use crate::runtime::{InferenceBackend, RuntimeError};
use crate::types::DetectedFace;
use image::{ImageFormat, ImageReader, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

const ACCEPTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Bmp,
    ImageFormat::WebP,
];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("runtime: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Accepted input envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Largest encoded input accepted, in bytes.
    pub max_bytes: usize,
    /// Smallest accepted width or height.
    pub min_dimension: u32,
    /// Largest accepted width or height.
    pub max_dimension: u32,
    /// Faces scoring below this are dropped.
    pub min_detection_score: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
            min_dimension: 64,
            max_dimension: 8192,
            min_detection_score: 0.5,
        }
    }
}

/// Decodes images and runs them through the inference backend.
#[derive(Clone)]
pub struct FaceExtractor {
    backend: Arc<dyn InferenceBackend>,
    config: ExtractorConfig,
}

impl FaceExtractor {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: ExtractorConfig) -> Self {
        Self { backend, config }
    }

    pub fn embedding_dim(&self) -> usize {
        self.backend.embedding_dim()
    }

    /// Decode `bytes` and return every face, highest detection score first.
    ///
    /// An image with no faces yields an empty vector.
    pub fn extract(&self, bytes: &[u8]) -> Result<Vec<DetectedFace>, ExtractError> {
        let image = self.decode(bytes)?;
        self.extract_decoded(&image)
    }

    /// Same as [`extract`](Self::extract) for already-decoded pixels.
    pub fn extract_decoded(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, ExtractError> {
        self.check_dimensions(image.width(), image.height())?;

        let mut faces = self.backend.detect_and_embed(image)?;
        let detected = faces.len();
        faces.retain(|f| f.detection_score >= self.config.min_detection_score);
        faces.sort_by(|a, b| b.detection_score.total_cmp(&a.detection_score));

        tracing::debug!(
            detected,
            kept = faces.len(),
            min_score = self.config.min_detection_score,
            "faces extracted"
        );
        Ok(faces)
    }

    /// Validate and decode an encoded image without running inference.
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage, ExtractError> {
        if bytes.is_empty() {
            return Err(ExtractError::InvalidImage("empty input".into()));
        }
        if bytes.len() > self.config.max_bytes {
            return Err(ExtractError::InvalidImage(format!(
                "{} bytes exceeds limit of {}",
                bytes.len(),
                self.config.max_bytes
            )));
        }

        let format = image::guess_format(bytes)
            .map_err(|_| ExtractError::InvalidImage("unrecognized image format".into()))?;
        if !ACCEPTED_FORMATS.contains(&format) {
            return Err(ExtractError::InvalidImage(format!("unsupported format {format:?}")));
        }

        // Header-only read first so oversized images are rejected before a full decode.
        let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
            .into_dimensions()
            .map_err(|e| ExtractError::InvalidImage(format!("unreadable header: {e}")))?;
        self.check_dimensions(width, height)?;

        let decoded = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| ExtractError::InvalidImage(format!("decode failed: {e}")))?;
        Ok(decoded.to_rgb8())
    }

    fn check_dimensions(&self, width: u32, height: u32) -> Result<(), ExtractError> {
        let (lo, hi) = (width.min(height), width.max(height));
        if lo < self.config.min_dimension || hi > self.config.max_dimension {
            return Err(ExtractError::InvalidImage(format!(
                "{width}x{height} outside accepted range {}..={} px",
                self.config.min_dimension, self.config.max_dimension
            )));
        }
        Ok(())
    }
}
