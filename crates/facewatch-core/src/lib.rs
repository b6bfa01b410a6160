//! facewatch-core — Face location and gallery matching engine.
//!
//! Locates faces in a decoded image, canonicalizes each face into a
//! [`FeatureVector`], and scores it against every entry of a
//! [`GalleryIndex`] to produce one [`MatchResult`] per face.

pub mod decode;
pub mod extractor;
pub mod gallery;
pub mod locator;
pub mod pipeline;
pub mod scorer;
pub mod types;

pub use decode::{decode_image, DecodeError};
pub use extractor::{ArcFaceExtractor, ExtractError, FeatureExtractor, LumaExtractor};
pub use gallery::{GalleryError, GalleryIndex, IndexedEntry};
pub use locator::{DetectionParams, FaceLocator, LocatorError, ScrfdLocator};
pub use pipeline::{FaceEngine, MatchPipeline, PipelineError};
pub use scorer::{CosineScorer, MeanAbsDiffScorer, ScoreError, SimilarityScorer};
pub use types::{
    FaceError, FaceRegion, FeatureDescriptor, FeatureKind, FeatureVector, GalleryEntry,
    MatchReport, MatchResult,
};

/// Similarity threshold used when none is configured. Comparison is exclusive.
pub const DEFAULT_THRESHOLD: f32 = 0.7;

