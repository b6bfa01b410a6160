//! Feature extraction from located face regions.
//!
//! Every extractor canonicalizes its input the same way: clamp the region to
//! the image, crop, resize to a fixed resolution and reduce to luminance.
//! This keeps vectors from differently sized faces comparable.

use crate::types::{FaceRegion, FeatureDescriptor, FeatureKind, FeatureVector};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Canonical side length for [`LumaExtractor`] crops.
pub const CANONICAL_SIZE: u32 = 100;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("face region is empty after clamping to the image")]
    EmptyRegion,
    #[error("model file not found: {0}; download w600k_r50.onnx from insightface into the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face region into a [`FeatureVector`].
pub trait FeatureExtractor: Send {
    /// Descriptor shared by every vector this extractor produces.
    fn descriptor(&self) -> FeatureDescriptor;

    fn extract(
        &mut self,
        image: &DynamicImage,
        region: &FaceRegion,
    ) -> Result<FeatureVector, ExtractError>;
}

/// Crop `region` out of `image` and resize it to a `size`×`size` luminance patch.
pub fn canonical_crop(
    image: &DynamicImage,
    region: &FaceRegion,
    size: u32,
) -> Result<GrayImage, ExtractError> {
    let clamped = region
        .clamp_to(image.width(), image.height())
        .ok_or(ExtractError::EmptyRegion)?;

    let crop = image.crop_imm(clamped.x, clamped.y, clamped.width, clamped.height);
    Ok(crop.resize_exact(size, size, FilterType::Triangle).to_luma8())
}

/// Raw canonical luminance as the feature: the reference baseline, paired
/// with [`MeanAbsDiffScorer`](crate::scorer::MeanAbsDiffScorer).
#[derive(Debug, Clone)]
pub struct LumaExtractor {
    size: u32,
}

impl LumaExtractor {
    pub fn new() -> Self {
        Self { size: CANONICAL_SIZE }
    }

    /// Use a non-default canonical resolution. Vectors from different sizes
    /// are not comparable.
    pub fn with_size(size: u32) -> Self {
        Self { size: size.max(1) }
    }
}

impl Default for LumaExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor for LumaExtractor {
    fn descriptor(&self) -> FeatureDescriptor {
        FeatureDescriptor {
            kind: FeatureKind::Luma,
            dim: (self.size * self.size) as usize,
        }
    }

    fn extract(
        &mut self,
        image: &DynamicImage,
        region: &FaceRegion,
    ) -> Result<FeatureVector, ExtractError> {
        let canonical = canonical_crop(image, region, self.size)?;
        Ok(FeatureVector {
            values: canonical.into_raw().into_iter().map(f32::from).collect(),
            descriptor: self.descriptor(),
        })
    }
}

/// ArcFace embedding extractor (w600k_r50) via ONNX Runtime.
///
/// Produces L2-normalized 512-dimensional embeddings, paired with
/// [`CosineScorer`](crate::scorer::CosineScorer).
pub struct ArcFaceExtractor {
    session: Session,
}

impl ArcFaceExtractor {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ExtractError> {
        if !model_path.exists() {
            return Err(ExtractError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 112×112 luminance crop into a NCHW float tensor,
    /// replicating luminance across the three input channels.
    fn preprocess(crop: &GrayImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in crop.enumerate_pixels() {
            let normalized = (pixel[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = normalized;
            }
        }

        tensor
    }
}

impl FeatureExtractor for ArcFaceExtractor {
    fn descriptor(&self) -> FeatureDescriptor {
        FeatureDescriptor {
            kind: FeatureKind::ArcFace,
            dim: ARCFACE_EMBEDDING_DIM,
        }
    }

    fn extract(
        &mut self,
        image: &DynamicImage,
        region: &FaceRegion,
    ) -> Result<FeatureVector, ExtractError> {
        let crop = canonical_crop(image, region, ARCFACE_INPUT_SIZE)?;
        let input = Self::preprocess(&crop);
        let descriptor = self.descriptor();

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ExtractError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(FeatureVector {
            values: l2_normalize(raw),
            descriptor,
        })
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}
