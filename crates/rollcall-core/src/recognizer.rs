//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts face embeddings from aligned 112×112 RGB crops using the
//! w600k_r50 ArcFace model.

use crate::alignment::ALIGNED_SIZE;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // NOT 128.0: ArcFace uses symmetric normalization
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}; download w600k_r50.onnx from insightface (buffalo_l)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("expected {expected}-dim embedding, model produced {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("model produced a non-finite value at index {0}")]
    NonFinite(usize),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based embedding extractor.
pub struct FaceRecognizer {
    session: Session,
    embedding_dim: usize,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize, embedding_dim: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            embedding_dim,
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            embedding_dim,
        })
    }

    /// Run the model on one preprocessed crop, returning the raw (unnormalized) vector.
    pub fn run(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, RecognizerError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        check_output(raw, self.embedding_dim)
    }
}

/// Accept a raw model output only if it has the expected width and every value is finite.
fn check_output(raw: &[f32], expected: usize) -> Result<Vec<f32>, RecognizerError> {
    if raw.len() != expected {
        return Err(RecognizerError::DimensionMismatch {
            expected,
            actual: raw.len(),
        });
    }
    if let Some(index) = raw.iter().position(|v| !v.is_finite()) {
        return Err(RecognizerError::NonFinite(index));
    }
    Ok(raw.to_vec())
}

/// Convert an aligned 112×112 RGB crop into a NCHW float tensor.
pub fn preprocess(aligned_face: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in aligned_face.enumerate_pixels() {
        if x as usize >= size || y as usize >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }

    tensor
}
