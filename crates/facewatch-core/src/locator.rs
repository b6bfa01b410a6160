//! Face location.
//!
//! [`ScrfdLocator`] runs the SCRFD (Sample and Computation Redistribution for
//! Efficient Face Detection) model over an image pyramid, decodes the three
//! anchor strides of each level, then merges all candidates with a
//! neighbour-counting NMS.

use crate::types::FaceRegion;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_BASE_INPUT_SIZE: usize = 640;
const SCRFD_MIN_INPUT_SIZE: usize = 160;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
/// Pyramid input sizes are rounded to the coarsest stride.
const SCRFD_SIZE_ALIGN: usize = 32;

/// Locates faces in a decoded image.
///
/// For a validly decoded image the result is a (possibly empty) list of
/// regions inside the image bounds. Errors only report backend failures,
/// never image content.
pub trait FaceLocator: Send {
    fn locate(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, LocatorError>;
}

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface into the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection tuning.
///
/// - `scale_step`: ratio between successive pyramid input sizes. A larger
///   step means fewer levels and candidate windows: faster, but more faces
///   are missed.
/// - `min_neighbors`: overlapping candidates a detection must absorb during
///   NMS to be kept. Higher values drop false positives but miss more faces.
/// - `min_face_size`: regions whose shorter side is below this many pixels
///   are discarded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    pub scale_step: f32,
    pub min_neighbors: usize,
    pub min_face_size: u32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            scale_step: 2.0,
            min_neighbors: 1,
            min_face_size: 20,
            score_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

impl DetectionParams {
    /// Input sizes of the detection pyramid, largest first.
    pub fn pyramid_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![SCRFD_BASE_INPUT_SIZE];
        if self.scale_step.is_nan() || self.scale_step <= 1.0 {
            return sizes;
        }

        let mut current = SCRFD_BASE_INPUT_SIZE as f32;
        loop {
            current /= self.scale_step;
            let size = (current / SCRFD_SIZE_ALIGN as f32).round() as usize * SCRFD_SIZE_ALIGN;
            if size < SCRFD_MIN_INPUT_SIZE {
                break;
            }
            if sizes.last() != Some(&size) {
                sizes.push(size);
            }
        }
        sizes
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// A decoded detection in source-image coordinates, before NMS.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

/// A candidate that survived NMS, with the number of candidates it absorbed.
#[derive(Debug, Clone, Copy)]
struct Cluster {
    best: Candidate,
    neighbors: usize,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD-based face locator.
pub struct ScrfdLocator {
    session: Session,
    params: DetectionParams,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdLocator {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, params: DetectionParams) -> Result<Self, LocatorError> {
        if !model_path.exists() {
            return Err(LocatorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            levels = ?params.pyramid_sizes(),
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(LocatorError::InferenceFailed(format!(
                "SCRFD model requires at least 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            params,
            stride_indices,
        })
    }

    fn detect_level(
        &mut self,
        rgb: &RgbImage,
        size: usize,
    ) -> Result<Vec<Candidate>, LocatorError> {
        let (input, letterbox) = letterbox(rgb, size);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(|e| {
                LocatorError::InferenceFailed(format!("scores stride {stride}: {e}"))
            })?;
            let (_, bboxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(|e| {
                LocatorError::InferenceFailed(format!("bboxes stride {stride}: {e}"))
            })?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                stride,
                size,
                &letterbox,
                self.params.score_threshold,
            ));
        }

        Ok(candidates)
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&mut self, image: &DynamicImage) -> Result<Vec<FaceRegion>, LocatorError> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let rgb = image.to_rgb8();
        let mut candidates = Vec::new();
        for size in self.params.pyramid_sizes() {
            let level = self.detect_level(&rgb, size)?;
            tracing::trace!(size, candidates = level.len(), "SCRFD pyramid level");
            candidates.extend(level);
        }

        let clusters = nms(candidates, self.params.nms_threshold);
        let regions = finalize(&clusters, &self.params, width, height);
        tracing::debug!(
            clusters = clusters.len(),
            faces = regions.len(),
            "SCRFD located faces"
        );

        Ok(regions)
    }
}

/// Letterbox an RGB image into a `size`×`size` NCHW tensor normalized to the
/// SCRFD input distribution. Padding is the mean, which normalizes to 0.0.
fn letterbox(rgb: &RgbImage, size: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = rgb.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size as u32);
    let pad_x = ((size as u32 - new_w) / 2) as usize;
    let pad_y = ((size as u32 - new_h) / 2) as usize;

    let resized = imageops::resize(rgb, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = x as usize + pad_x;
        let ty = y as usize + pad_y;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    let info = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (tensor, info)
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) are mapped directly; otherwise
/// the standard positional layout is assumed: [0-2] scores, [3-5] bboxes.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping"
            );
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode candidates for a single stride of one pyramid level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut candidates = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if !(score > threshold) {
            continue;
        }

        let bbox_off = idx * 4;
        let Some(offsets) = bboxes.get(bbox_off..bbox_off + 4) else {
            continue;
        };

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * step;
        let anchor_cy = (anchor_idx / grid) as f32 * step;

        let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
        let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

        candidates.push(Candidate {
            x1: unmap_x(anchor_cx - offsets[0] * step),
            y1: unmap_y(anchor_cy - offsets[1] * step),
            x2: unmap_x(anchor_cx + offsets[2] * step),
            y2: unmap_y(anchor_cy + offsets[3] * step),
            score,
        });
    }

    candidates
}

/// Non-maximum suppression that counts how many candidates each kept
/// detection suppressed.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Cluster> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut clusters = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }

        let mut neighbors = 0;
        for j in (i + 1)..candidates.len() {
            if !suppressed[j] && iou(&candidates[i], &candidates[j]) > iou_threshold {
                suppressed[j] = true;
                neighbors += 1;
            }
        }

        clusters.push(Cluster {
            best: candidates[i],
            neighbors,
        });
    }

    clusters
}

/// Apply neighbour and size filters, then snap to pixel regions.
fn finalize(
    clusters: &[Cluster],
    params: &DetectionParams,
    width: u32,
    height: u32,
) -> Vec<FaceRegion> {
    clusters
        .iter()
        .filter(|c| c.neighbors >= params.min_neighbors)
        .filter_map(|c| {
            let b = c.best;
            FaceRegion::from_corners((b.x1, b.y1, b.x2, b.y2), b.score, width, height)
        })
        .filter(|r| r.width.min(r.height) >= params.min_face_size)
        .collect()
}

/// Intersection-over-Union between two candidates.
fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter_area = inter_w * inter_h;

    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union_area = area_a + area_b - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}
