//! Detection-and-matching pipeline.
//!
//! Locate faces, extract one feature per face, scan the whole gallery
//! snapshot for the best-scoring entry and apply an exclusive threshold.

use crate::extractor::{ExtractError, FeatureExtractor};
use crate::gallery::{GalleryError, GalleryIndex, IndexedEntry};
use crate::locator::{FaceLocator, LocatorError};
use crate::scorer::{ScoreError, SimilarityScorer};
use crate::types::{FaceError, FaceRegion, FeatureDescriptor, FeatureVector, MatchResult};
use image::DynamicImage;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("locator error: {0}")]
    Locator(#[from] LocatorError),
    #[error("extractor error: {0}")]
    Extract(#[from] ExtractError),
    #[error("scorer error: {0}")]
    Score(#[from] ScoreError),
    #[error("deadline exceeded during gallery scan")]
    DeadlineExceeded,
}

/// A located face and the outcome of extracting its feature.
pub struct DescribedFace {
    pub region: FaceRegion,
    pub feature: Result<FeatureVector, ExtractError>,
}

/// Feature of the face chosen to represent a reference image.
pub struct ReferenceFeature {
    pub region: FaceRegion,
    pub feature: FeatureVector,
    /// Faces located in the reference image.
    pub face_count: u32,
}

/// Locator and extractor used together, so gallery features and probe
/// features always come from the same configuration.
pub struct FaceEngine {
    locator: Box<dyn FaceLocator>,
    extractor: Box<dyn FeatureExtractor>,
}

impl FaceEngine {
    pub fn new(locator: Box<dyn FaceLocator>, extractor: Box<dyn FeatureExtractor>) -> Self {
        Self { locator, extractor }
    }

    pub fn descriptor(&self) -> FeatureDescriptor {
        self.extractor.descriptor()
    }

    /// Locate faces and extract a feature for each, in locator order.
    pub fn describe(&mut self, image: &DynamicImage) -> Result<Vec<DescribedFace>, LocatorError> {
        let regions = self.locator.locate(image)?;
        Ok(regions
            .into_iter()
            .map(|region| DescribedFace {
                feature: self.extractor.extract(image, &region),
                region,
            })
            .collect())
    }

    /// Feature of the highest-confidence face in a reference image.
    ///
    /// Confidence is only used to rank faces within this one image.
    pub fn reference_feature(
        &mut self,
        image: &DynamicImage,
    ) -> Result<ReferenceFeature, GalleryError> {
        let regions = self.locator.locate(image)?;

        let mut best: Option<&FaceRegion> = None;
        for region in &regions {
            if best.map_or(true, |b| region.confidence > b.confidence) {
                best = Some(region);
            }
        }
        let region = *best.ok_or(GalleryError::NoFaceInReference)?;

        let feature = self.extractor.extract(image, &region)?;
        Ok(ReferenceFeature {
            region,
            feature,
            face_count: regions.len() as u32,
        })
    }
}

/// Runs [`FaceEngine`] output against a gallery.
pub struct MatchPipeline {
    engine: FaceEngine,
    scorer: Box<dyn SimilarityScorer>,
}

impl MatchPipeline {
    pub fn new(engine: FaceEngine, scorer: Box<dyn SimilarityScorer>) -> Self {
        Self { engine, scorer }
    }

    /// Engine for deriving gallery features with the same configuration.
    pub fn engine_mut(&mut self) -> &mut FaceEngine {
        &mut self.engine
    }

    /// One [`MatchResult`] per located face, in locator order.
    ///
    /// An empty result means no faces were found. A face whose crop is
    /// empty yields a failed entry instead of aborting the batch. `deadline`
    /// is checked before every gallery comparison.
    pub fn run(
        &mut self,
        image: &DynamicImage,
        gallery: &GalleryIndex,
        threshold: f32,
        deadline: Option<Instant>,
    ) -> Result<Vec<MatchResult>, PipelineError> {
        let faces = self.engine.describe(image)?;
        if faces.is_empty() {
            tracing::debug!("match: no faces located");
            return Ok(Vec::new());
        }

        let snapshot = gallery.all();
        tracing::debug!(
            faces = faces.len(),
            gallery = snapshot.len(),
            threshold,
            "match: scanning gallery"
        );

        let mut results = Vec::with_capacity(faces.len());
        for face in faces {
            let feature = match face.feature {
                Ok(feature) => feature,
                Err(ExtractError::EmptyRegion) => {
                    tracing::warn!(region = ?face.region, "match: empty face region, skipping");
                    results.push(MatchResult::failed(face.region, FaceError::EmptyRegion));
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let best = best_match(self.scorer.as_ref(), &feature, &snapshot, deadline)?;
            let score = best.map_or(0.0, |(_, score)| score);
            let matched = best.is_some() && score > threshold;
            let entry = best
                .filter(|_| matched)
                .map(|(idx, _)| snapshot[idx].entry.clone());

            tracing::debug!(
                region = ?face.region,
                score,
                matched,
                entry = entry.as_ref().map(|e| e.id.as_str()),
                "match: face scored"
            );

            results.push(MatchResult {
                region: face.region,
                matched,
                entry,
                score,
                error: None,
            });
        }

        Ok(results)
    }
}

/// Index and score of the best entry across the whole gallery.
///
/// Every entry is scored; the first of equal maxima wins.
fn best_match(
    scorer: &dyn SimilarityScorer,
    probe: &FeatureVector,
    gallery: &[IndexedEntry],
    deadline: Option<Instant>,
) -> Result<Option<(usize, f32)>, PipelineError> {
    let mut best: Option<(usize, f32)> = None;

    for (idx, indexed) in gallery.iter().enumerate() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(PipelineError::DeadlineExceeded);
        }

        let score = scorer.score(probe, &indexed.feature)?;
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((idx, score));
        }
    }

    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::LumaExtractor;
    use crate::scorer::MeanAbsDiffScorer;
    use crate::types::GalleryEntry;
    use image::{Rgb, RgbImage};

    struct FixedLocator(Vec<FaceRegion>);

    impl FaceLocator for FixedLocator {
        fn locate(&mut self, _image: &DynamicImage) -> Result<Vec<FaceRegion>, LocatorError> {
            Ok(self.0.clone())
        }
    }

    struct ConstScorer(f32);

    impl SimilarityScorer for ConstScorer {
        fn score(&self, _a: &FeatureVector, _b: &FeatureVector) -> Result<f32, ScoreError> {
            Ok(self.0)
        }
    }

    fn region(x: u32, y: u32, width: u32, height: u32) -> FaceRegion {
        FaceRegion { x, y, width, height, confidence: 0.9 }
    }

    fn pipeline_with(regions: Vec<FaceRegion>, scorer: Box<dyn SimilarityScorer>) -> MatchPipeline {
        let engine = FaceEngine::new(Box::new(FixedLocator(regions)), Box::new(LumaExtractor::new()));
        MatchPipeline::new(engine, scorer)
    }

    fn pipeline(regions: Vec<FaceRegion>) -> MatchPipeline {
        pipeline_with(regions, Box::new(MeanAbsDiffScorer))
    }

    fn patterned() -> DynamicImage {
        let img = RgbImage::from_fn(200, 200, |x, y| {
            let v = ((x * 3 + y * 5) % 256) as u8;
            Rgb([v, v.wrapping_mul(7), 255 - v])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn uniform(value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb([value, value, value])))
    }

    fn add(pipeline: &mut MatchPipeline, gallery: &GalleryIndex, label: &str, image: &DynamicImage) -> GalleryEntry {
        let entry = GalleryEntry::new(label, "Unknown", format!("/tmp/{label}.png"));
        gallery.add(entry, image, pipeline.engine_mut()).unwrap()
    }

    #[test]
    fn test_no_faces_returns_empty() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![]);
        let results = p.run(&patterned(), &gallery, 0.7, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_identical_crop_matches_with_full_score() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(50, 50, 100, 100)]);
        let reference = patterned();
        let e = add(&mut p, &gallery, "A", &reference);

        let results = p.run(&reference, &gallery, 0.7, None).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].matched);
        assert_eq!(results[0].entry.as_ref().map(|m| m.id.as_str()), Some(e.id.as_str()));
        assert_eq!(results[0].score, 1.0);
        assert!(results[0].error.is_none());
    }

    #[test]
    fn test_empty_gallery_two_faces() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(0, 0, 50, 50), region(100, 100, 60, 60)]);
        let results = p.run(&patterned(), &gallery, 0.7, None).unwrap();

        assert_eq!(results.len(), 2);
        for r in &results {
            assert!(!r.matched);
            assert!(r.entry.is_none());
            assert_eq!(r.score, 0.0);
        }
    }

    #[test]
    fn test_score_equal_to_threshold_is_not_a_match() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline_with(vec![region(10, 10, 80, 80)], Box::new(ConstScorer(0.7)));
        add(&mut p, &gallery, "A", &patterned());

        let results = p.run(&patterned(), &gallery, 0.7, None).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].matched);
        assert!(results[0].entry.is_none());
        assert_eq!(results[0].score, 0.7);

        let relaxed = p.run(&patterned(), &gallery, 0.69, None).unwrap();
        assert!(relaxed[0].matched);
    }

    #[test]
    fn test_best_match_wins_over_first_adequate() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(20, 20, 100, 100)]);
        let near = add(&mut p, &gallery, "near", &uniform(80));
        let exact = add(&mut p, &gallery, "exact", &uniform(100));

        let results = p.run(&uniform(100), &gallery, 0.7, None).unwrap();
        let r = &results[0];
        assert!(r.matched);
        assert_eq!(r.entry.as_ref().unwrap().id, exact.id);
        assert_ne!(r.entry.as_ref().unwrap().id, near.id);
        assert_eq!(r.score, 1.0);
    }

    #[test]
    fn test_ties_keep_first_entry() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(20, 20, 100, 100)]);
        let first = add(&mut p, &gallery, "first", &uniform(120));
        add(&mut p, &gallery, "second", &uniform(120));

        let results = p.run(&uniform(120), &gallery, 0.7, None).unwrap();
        assert_eq!(results[0].entry.as_ref().unwrap().id, first.id);
    }

    #[test]
    fn test_below_threshold_reports_best_score_without_entry() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(20, 20, 100, 100)]);
        add(&mut p, &gallery, "dark", &uniform(0));
        add(&mut p, &gallery, "mid", &uniform(128));

        let results = p.run(&uniform(255), &gallery, 0.7, None).unwrap();
        let r = &results[0];
        assert!(!r.matched);
        assert!(r.entry.is_none());
        // 1 - 127/255
        assert!((r.score - (1.0 - 127.0 / 255.0)).abs() < 0.01);
    }

    #[test]
    fn test_lower_threshold_never_loses_a_match() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(0, 0, 100, 100)]);
        for value in [60, 90, 150] {
            add(&mut p, &gallery, &format!("v{value}"), &uniform(value));
        }

        let thresholds = [0.99, 0.95, 0.9, 0.8, 0.5, 0.0];
        let mut was_matched = false;
        for t in thresholds {
            let results = p.run(&uniform(100), &gallery, t, None).unwrap();
            if was_matched {
                assert!(results[0].matched, "match lost when relaxing threshold to {t}");
            }
            was_matched = results[0].matched;
        }
        assert!(was_matched);
    }

    #[test]
    fn test_empty_region_is_a_partial_failure() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(0, 0, 50, 50), region(500, 500, 10, 10)]);
        add(&mut p, &gallery, "A", &patterned());

        let results = p.run(&patterned(), &gallery, 0.7, None).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].error.is_none());
        assert_eq!(results[1].error, Some(FaceError::EmptyRegion));
        assert!(!results[1].matched);
        assert_eq!(results[1].score, 0.0);
        assert_eq!(results[1].region, region(500, 500, 10, 10));
    }

    #[test]
    fn test_results_follow_locator_order() {
        let regions = vec![region(100, 100, 40, 40), region(0, 0, 30, 30), region(60, 10, 20, 50)];
        let gallery = GalleryIndex::new();
        let mut p = pipeline(regions.clone());
        let results = p.run(&patterned(), &gallery, 0.7, None).unwrap();
        let got: Vec<FaceRegion> = results.iter().map(|r| r.region).collect();
        assert_eq!(got, regions);
    }

    #[test]
    fn test_expired_deadline_aborts_scan() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(0, 0, 50, 50)]);
        add(&mut p, &gallery, "A", &patterned());

        let err = p.run(&patterned(), &gallery, 0.7, Some(Instant::now())).unwrap_err();
        assert!(matches!(err, PipelineError::DeadlineExceeded));
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn test_mismatched_extractor_is_an_error() {
        let gallery = GalleryIndex::new();
        let mut p = pipeline(vec![region(0, 0, 50, 50)]);
        add(&mut p, &gallery, "A", &patterned());

        let engine = FaceEngine::new(
            Box::new(FixedLocator(vec![region(0, 0, 50, 50)])),
            Box::new(LumaExtractor::with_size(32)),
        );
        let mut other = MatchPipeline::new(engine, Box::new(MeanAbsDiffScorer));
        let err = other.run(&patterned(), &gallery, 0.7, None).unwrap_err();
        assert!(matches!(err, PipelineError::Score(ScoreError::Incomparable { .. })));
    }

    #[test]
    fn test_reference_feature_uses_most_confident_face() {
        let mut engine = FaceEngine::new(
            Box::new(FixedLocator(vec![
                FaceRegion { confidence: 0.3, ..region(0, 0, 20, 20) },
                FaceRegion { confidence: 0.8, ..region(40, 40, 30, 30) },
                FaceRegion { confidence: 0.8, ..region(90, 90, 30, 30) },
            ])),
            Box::new(LumaExtractor::new()),
        );
        let reference = engine.reference_feature(&patterned()).unwrap();
        assert_eq!(reference.face_count, 3);
        assert_eq!((reference.region.x, reference.region.y), (40, 40));
    }
}
