//! Model runtime: the process-wide owner of the SCRFD and ArcFace sessions.
//!
//! A [`ModelRuntime`] is constructed once, loaded once with
//! [`ModelRuntime::load`], and shared by `Arc` with every request handler.
//! ORT sessions need `&mut` to run, so each session sits behind its own mutex
//! in a small pool. Only the model call itself holds a lock; image
//! preprocessing, alignment and decoding run unlocked.

use crate::alignment;
use crate::detector::{self, DetectorConfig, DetectorError, FaceDetector};
use crate::recognizer::{self, FaceRecognizer, RecognizerError, ARCFACE_EMBEDDING_DIM, ARCFACE_MODEL_VERSION};
use crate::types::{DetectedFace, Embedding};
use image::RgbImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Startup failure: the process cannot serve without its models.
#[derive(Error, Debug)]
pub enum InitError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("invalid runtime config: {0}")]
    InvalidConfig(String),
}

/// Per-call inference failure. Never retried.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("model runtime not loaded; call ModelRuntime::load() at startup")]
    NotLoaded,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// The inference boundary the extractor talks to.
///
/// [`ModelRuntime`] is the production implementation. Implementations must be
/// deterministic for identical pixels and return L2-normalized embeddings.
pub trait InferenceBackend: Send + Sync {
    fn detect_and_embed(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, RuntimeError>;

    /// Dimension of every embedding this backend produces.
    fn embedding_dim(&self) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub detector_path: PathBuf,
    pub recognizer_path: PathBuf,
    /// ORT intra-op threads per session.
    pub intra_threads: usize,
    /// Number of independent session pairs; concurrent calls beyond this wait.
    pub pool_size: usize,
    pub embedding_dim: usize,
    pub detector: DetectorConfig,
}

impl RuntimeConfig {
    /// Standard file names inside a model directory.
    pub fn from_model_dir(model_dir: &Path) -> Self {
        Self {
            detector_path: model_dir.join(DETECTOR_MODEL_FILE),
            recognizer_path: model_dir.join(RECOGNIZER_MODEL_FILE),
            intra_threads: 2,
            pool_size: 1,
            embedding_dim: ARCFACE_EMBEDDING_DIM,
            detector: DetectorConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), InitError> {
        if self.pool_size == 0 {
            return Err(InitError::InvalidConfig("pool_size must be at least 1".into()));
        }
        if self.intra_threads == 0 {
            return Err(InitError::InvalidConfig("intra_threads must be at least 1".into()));
        }
        if self.embedding_dim == 0 {
            return Err(InitError::InvalidConfig("embedding_dim must be at least 1".into()));
        }
        Ok(())
    }
}

/// Snapshot of runtime state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub detector_path: PathBuf,
    pub recognizer_path: PathBuf,
    pub model_version: &'static str,
    pub embedding_dim: usize,
    pub pool_size: usize,
    pub intra_threads: usize,
    pub loaded: bool,
}

/// Fixed set of mutex-guarded workers handed out round-robin.
struct Pool<T> {
    slots: Vec<Mutex<T>>,
    next: AtomicUsize,
}

impl<T> Pool<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            slots: items.into_iter().map(Mutex::new).collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Run `f` on a free worker, or wait for the round-robin pick if all are busy.
    fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let len = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        for i in 0..len {
            if let Some(mut guard) = self.slots[(start + i) % len].try_lock() {
                return f(&mut guard);
            }
        }
        let mut guard = self.slots[start].lock();
        f(&mut guard)
    }
}

struct LoadedModels {
    detectors: Pool<FaceDetector>,
    recognizers: Pool<FaceRecognizer>,
}

/// Process-wide owner of the detection and embedding models.
pub struct ModelRuntime {
    config: RuntimeConfig,
    models: OnceLock<LoadedModels>,
    init_lock: Mutex<()>,
}

impl ModelRuntime {
    /// Create an unloaded runtime. Does not touch the model files.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            models: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn is_loaded(&self) -> bool {
        self.models.get().is_some()
    }

    /// Load both models. Fails fast on missing or incompatible files.
    ///
    /// Idempotent: once loaded, further calls return `Ok(())` immediately.
    /// Concurrent first calls load exactly once. A failed load leaves the
    /// runtime unloaded.
    pub fn load(&self) -> Result<(), InitError> {
        if self.is_loaded() {
            return Ok(());
        }
        let _guard = self.init_lock.lock();
        if self.is_loaded() {
            return Ok(());
        }

        self.config.validate()?;

        let mut detectors = Vec::with_capacity(self.config.pool_size);
        let mut recognizers = Vec::with_capacity(self.config.pool_size);
        for _ in 0..self.config.pool_size {
            detectors.push(FaceDetector::load(&self.config.detector_path, self.config.intra_threads)?);
            recognizers.push(FaceRecognizer::load(
                &self.config.recognizer_path,
                self.config.intra_threads,
                self.config.embedding_dim,
            )?);
        }

        let installed = fill_once(
            &self.models,
            LoadedModels {
                detectors: Pool::new(detectors),
                recognizers: Pool::new(recognizers),
            },
        );
        // init_lock is held and is_loaded was re-checked under it.
        debug_assert!(installed, "model cell filled while init_lock was held");

        tracing::info!(
            pool_size = self.config.pool_size,
            intra_threads = self.config.intra_threads,
            embedding_dim = self.config.embedding_dim,
            "model runtime loaded"
        );
        Ok(())
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            detector_path: self.config.detector_path.clone(),
            recognizer_path: self.config.recognizer_path.clone(),
            model_version: ARCFACE_MODEL_VERSION,
            embedding_dim: self.config.embedding_dim,
            pool_size: self.config.pool_size,
            intra_threads: self.config.intra_threads,
            loaded: self.is_loaded(),
        }
    }
}

impl InferenceBackend for ModelRuntime {
    fn detect_and_embed(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, RuntimeError> {
        let models = self.models.get().ok_or(RuntimeError::NotLoaded)?;

        let input = detector::preprocess(image);
        let raw = models.detectors.with(|d| d.run(&input))?;
        let detections = detector::postprocess(&raw, &self.config.detector);

        let mut faces = Vec::with_capacity(detections.len());
        for det in detections {
            let Some(landmarks) = det.landmarks else {
                tracing::debug!(score = det.score, "detection without landmarks skipped");
                continue;
            };

            let aligned = alignment::align_face(image, &landmarks);
            let tensor = recognizer::preprocess(&aligned);
            let raw = models.recognizers.with(|r| r.run(&tensor))?;

            faces.push(DetectedFace {
                bbox: det.bbox,
                landmarks,
                embedding: Embedding::from_raw(raw),
                detection_score: det.score.clamp(0.0, 1.0),
            });
        }

        tracing::debug!(
            width = image.width(),
            height = image.height(),
            faces = faces.len(),
            "inference complete"
        );
        Ok(faces)
    }

    fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }
}

/// Fill `cell` unless it already holds a value. The existing value wins.
fn fill_once<T>(cell: &OnceLock<T>, value: T) -> bool {
    match cell.set(value) {
        Ok(()) => true,
        Err(_) => {
            tracing::warn!("models already installed; discarding the new set");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn missing_config() -> RuntimeConfig {
        RuntimeConfig::from_model_dir(Path::new("/nonexistent/rollcall-models"))
    }

    #[test]
    fn test_from_model_dir_paths() {
        let config = RuntimeConfig::from_model_dir(Path::new("/opt/models"));
        assert_eq!(config.detector_path, Path::new("/opt/models/det_10g.onnx"));
        assert_eq!(config.recognizer_path, Path::new("/opt/models/w600k_r50.onnx"));
        assert_eq!(config.embedding_dim, 512);
    }

    #[test]
    fn test_load_missing_models_fails_fast() {
        let runtime = ModelRuntime::new(missing_config());
        let err = runtime.load().unwrap_err();
        assert!(matches!(err, InitError::Detector(DetectorError::ModelNotFound(_))));
        assert!(!runtime.is_loaded());
    }

    #[test]
    fn test_load_rejects_zero_pool() {
        let mut config = missing_config();
        config.pool_size = 0;
        let err = ModelRuntime::new(config).load().unwrap_err();
        assert!(matches!(err, InitError::InvalidConfig(_)));
    }

    #[test]
    fn test_detect_before_load_is_not_loaded() {
        let runtime = ModelRuntime::new(missing_config());
        let img = RgbImage::new(64, 64);
        let err = runtime.detect_and_embed(&img).unwrap_err();
        assert!(matches!(err, RuntimeError::NotLoaded));
    }

    #[test]
    fn test_info_reports_unloaded() {
        let info = ModelRuntime::new(missing_config()).info();
        assert!(!info.loaded);
        assert_eq!(info.model_version, "w600k_r50");
        assert_eq!(info.pool_size, 1);
    }

    #[test]
    fn test_fill_once_keeps_first_value() {
        let cell = OnceLock::new();
        assert!(fill_once(&cell, 1u32));
        assert!(!fill_once(&cell, 2u32));
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    fn test_pool_round_robin_uses_every_slot() {
        let pool = Pool::new(vec![0u32; 3]);
        for _ in 0..6 {
            pool.with(|n| *n += 1);
        }
        let counts: Vec<u32> = pool.slots.iter().map(|s| *s.lock()).collect();
        assert_eq!(counts, vec![2, 2, 2]);
    }

    #[test]
    fn test_pool_concurrent_access() {
        let pool = Arc::new(Pool::new(vec![0u64; 2]));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        pool.with(|n| *n += 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let total: u64 = pool.slots.iter().map(|s| *s.lock()).sum();
        assert_eq!(total, 800);
    }
}
