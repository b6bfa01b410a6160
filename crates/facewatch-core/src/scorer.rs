//! Similarity scoring between feature vectors.
//!
//! Scorers return values in [0, 1], are exactly symmetric, return exactly
//! `1.0` for identical vectors, and decrease as the vectors diverge.

use crate::types::FeatureVector;
use thiserror::Error;

/// Largest luminance value a [`LumaExtractor`](crate::extractor::LumaExtractor) emits.
const MAX_CHANNEL_VALUE: f64 = 255.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("feature vectors are not comparable: {left} vs {right}")]
    Incomparable { left: String, right: String },
    #[error("feature vectors are empty")]
    Empty,
}

/// Compares two feature vectors.
pub trait SimilarityScorer: Send + Sync {
    fn score(&self, a: &FeatureVector, b: &FeatureVector) -> Result<f32, ScoreError>;
}

fn check_comparable(a: &FeatureVector, b: &FeatureVector) -> Result<(), ScoreError> {
    if a.descriptor != b.descriptor || a.values.len() != b.values.len() {
        return Err(ScoreError::Incomparable {
            left: format!("{} ({} values)", a.descriptor, a.values.len()),
            right: format!("{} ({} values)", b.descriptor, b.values.len()),
        });
    }
    if a.values.is_empty() {
        return Err(ScoreError::Empty);
    }
    Ok(())
}

/// `1 − mean(|a − b|) / 255` over canonical luminance crops.
///
/// A weak baseline: sensitive to lighting and pose.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanAbsDiffScorer;

impl SimilarityScorer for MeanAbsDiffScorer {
    fn score(&self, a: &FeatureVector, b: &FeatureVector) -> Result<f32, ScoreError> {
        check_comparable(a, b)?;

        let total: f64 = a
            .values
            .iter()
            .zip(&b.values)
            .map(|(x, y)| f64::from((x - y).abs()))
            .sum();
        let mean = total / a.values.len() as f64;

        Ok((1.0 - mean / MAX_CHANNEL_VALUE).clamp(0.0, 1.0) as f32)
    }
}

/// Cosine similarity rescaled from [-1, 1] to [0, 1].
///
/// Always processes every dimension.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineScorer;

impl SimilarityScorer for CosineScorer {
    fn score(&self, a: &FeatureVector, b: &FeatureVector) -> Result<f32, ScoreError> {
        check_comparable(a, b)?;

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        let mut identical = true;

        for (&x, &y) in a.values.iter().zip(&b.values) {
            let (x64, y64) = (f64::from(x), f64::from(y));
            dot += x64 * y64;
            norm_a += x64 * x64;
            norm_b += y64 * y64;
            identical &= x == y;
        }

        if identical {
            return Ok(1.0);
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let cosine = if denom > 0.0 { dot / denom } else { 0.0 };
        Ok(((cosine + 1.0) / 2.0).clamp(0.0, 1.0) as f32)
    }
}
