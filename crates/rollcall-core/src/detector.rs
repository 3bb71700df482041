//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//!
//! Pre- and post-processing are free functions so callers can keep them
//! outside whatever lock guards the session; only [`FaceDetector::run`] needs
//! `&mut self`.

use crate::types::{BoundingBox, Landmarks};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_REQUIRED_OUTPUTS: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface (buffalo_l)")]
    ModelNotFound(String),
    #[error("incompatible detector model: {0}")]
    IncompatibleModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum anchor score kept before NMS.
    pub score_threshold: f32,
    /// IoU above which a lower-scored box is suppressed.
    pub nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

/// One raw detector hit in source-image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub landmarks: Option<Landmarks>,
}

/// Preprocessed detector input plus the scale needed to map boxes back.
pub struct DetectorInput {
    tensor: Array4<f32>,
    scale: f32,
}

/// Owned per-stride output tensors, copied out of the session.
pub struct RawDetections {
    strides: Vec<StrideOutput>,
    scale: f32,
}

struct StrideOutput {
    stride: usize,
    scores: Vec<f32>,
    bboxes: Vec<f32>,
    kps: Vec<f32>,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < SCRFD_REQUIRED_OUTPUTS {
            return Err(DetectorError::IncompatibleModel(format!(
                "SCRFD requires {SCRFD_REQUIRED_OUTPUTS} outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Run the model on a preprocessed input. This is the only step that
    /// touches the session.
    pub fn run(&mut self, input: &DetectorInput) -> Result<RawDetections, DetectorError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.tensor.view())?])?;

        let mut strides = Vec::with_capacity(SCRFD_STRIDES.len());
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| -> Result<Vec<f32>, DetectorError> {
                let (_, data) = outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                })?;
                Ok(data.to_vec())
            };
            strides.push(StrideOutput {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            });
        }

        Ok(RawDetections {
            strides,
            scale: input.scale,
        })
    }
}

/// Letterbox an RGB image into the 640×640 NCHW tensor SCRFD expects.
///
/// The image is scaled to fit and placed at the top-left corner.
pub fn preprocess(img: &RgbImage) -> DetectorInput {
    let (width, height) = (img.width().max(1) as f32, img.height().max(1) as f32);
    let scale = (SCRFD_INPUT_SIZE as f32 / width).min(SCRFD_INPUT_SIZE as f32 / height);
    let new_w = ((width * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((height * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);

    let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);

    // Padding is the mean pixel, which normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    DetectorInput { tensor, scale }
}

/// Decode all strides, apply NMS and sort by descending score.
pub fn postprocess(raw: &RawDetections, config: &DetectorConfig) -> Vec<Detection> {
    let mut all = Vec::new();
    for out in &raw.strides {
        all.extend(decode_stride(out, raw.scale, config.score_threshold));
    }
    nms(all, config.nms_threshold)
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name tensors "score_8", "bbox_16", "kps_32", ... or use
/// generic numeric names. Named tensors are mapped to stride slots; otherwise
/// the standard positional order is assumed:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [v[0], v[1], v[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(out: &StrideOutput, scale: f32, threshold: f32) -> Vec<Detection> {
    let stride = out.stride as f32;
    let grid_w = SCRFD_INPUT_SIZE / out.stride;
    let grid_h = SCRFD_INPUT_SIZE / out.stride;
    let num_anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = out.scores.get(idx).copied().unwrap_or(0.0);
        if score < threshold {
            continue;
        }

        let Some(b) = out.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * stride;
        let anchor_y = (cell / grid_w) as f32 * stride;

        // Distances to the four box edges, in stride units; then undo letterbox scale.
        let x1 = (anchor_x - b[0] * stride) / scale;
        let y1 = (anchor_y - b[1] * stride) / scale;
        let x2 = (anchor_x + b[2] * stride) / scale;
        let y2 = (anchor_y + b[3] * stride) / scale;

        let landmarks = out.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| {
                (
                    (anchor_x + k[i * 2] * stride) / scale,
                    (anchor_y + k[i * 2 + 1] * stride) / scale,
                )
            })
        });

        detections.push(Detection {
            bbox: BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: keep the best box of each overlapping cluster.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}
