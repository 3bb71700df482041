use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Axis-aligned face box in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another box, 0.0 when the union is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// L2-normalized face embedding (512-dimensional for ArcFace w600k_r50).
///
/// Construction always normalizes, so similarity between two embeddings is a
/// plain dot product. A zero vector stays zero and scores 0.0 against anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Normalize raw model output into an embedding.
    pub fn from_raw(mut values: Vec<f32>) -> Self {
        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in values.iter_mut() {
                *v /= norm;
            }
        }
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.values
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// # Panics
    ///
    /// Panics if the two embeddings have different dimensions. Every vector in
    /// one deployment comes from the same extractor, so a mismatch is a bug.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        assert_eq!(
            self.values.len(),
            other.values.len(),
            "embedding dimension mismatch"
        );
        let dot: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum();
        dot.clamp(-1.0, 1.0)
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::from_raw(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

/// Opaque reference to an enrolled person. Not unique across the gallery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier of one stored embedding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingId(String);

impl EmbeddingId {
    /// Fresh random (v4) identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmbeddingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A face found in one image. Produced per inference call, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
    pub embedding: Embedding,
    /// Detector confidence in [0, 1].
    pub detection_score: f32,
}

/// A stored reference embedding for one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledEmbedding {
    pub embedding_id: EmbeddingId,
    pub owner_id: OwnerId,
    pub vector: Embedding,
    /// Path or identifier of the photo this embedding came from.
    pub source_image_ref: String,
    pub enrolled_at: DateTime<Utc>,
}

impl EnrolledEmbedding {
    /// New record with a generated id, stamped now.
    pub fn new(owner_id: OwnerId, vector: Embedding, source_image_ref: impl Into<String>) -> Self {
        Self {
            embedding_id: EmbeddingId::generate(),
            owner_id,
            vector,
            source_image_ref: source_image_ref.into(),
            enrolled_at: Utc::now(),
        }
    }
}
