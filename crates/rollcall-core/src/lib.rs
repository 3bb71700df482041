//! rollcall-core: face identification engine for attendance.
//!
//! SCRFD finds faces and five landmarks, each face is aligned to 112x112 and
//! embedded with ArcFace, and the embeddings are matched against an in-memory
//! gallery of enrolled students. Both models run on ONNX Runtime.

pub mod alignment;
pub mod attendance;
pub mod codec;
pub mod detector;
pub mod enrollment;
pub mod extractor;
pub mod gallery;
pub mod recognizer;
pub mod resolver;
pub mod runtime;
pub mod store;
pub mod types;

use std::path::PathBuf;

pub use attendance::{AttendanceMatchPipeline, AttendanceReport, OutcomeCounts};
pub use enrollment::{EnrollError, EnrollmentPipeline, EnrollmentReport, ImageInput, ImageOutcome};
pub use extractor::{ExtractError, ExtractorConfig, FaceExtractor};
pub use gallery::{GalleryError, GalleryIndex, GallerySnapshot};
pub use resolver::{
    AmbiguityReason, MatchOutcome, MatchResolver, MatchResult, OwnerScore, ResolverConfig,
    ResolverConfigError,
};
pub use runtime::{InferenceBackend, InitError, ModelRuntime, RuntimeConfig, RuntimeError};
pub use store::{EmbeddingStore, StoreError};
pub use types::{BoundingBox, DetectedFace, Embedding, EmbeddingId, EnrolledEmbedding, Landmarks, OwnerId};

/// `$XDG_DATA_HOME/rollcall/models`, or `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// `$XDG_DATA_HOME/rollcall`, or `~/.local/share/rollcall`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
