use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Axis-aligned face region in source-image pixel coordinates.
///
/// Always non-empty and inside the image it was located in. `confidence` is
/// an opaque ranking hint from the detector. It is not calibrated and must
/// not be read as a probability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
}

impl FaceRegion {
    /// Intersect this region with a `width`×`height` image.
    ///
    /// Returns `None` when nothing of the region lies inside the image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<FaceRegion> {
        let x0 = self.x.min(width);
        let y0 = self.y.min(height);
        let x1 = self.x.saturating_add(self.width).min(width);
        let y1 = self.y.saturating_add(self.height).min(height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(FaceRegion {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
            confidence: self.confidence,
        })
    }

    /// Build a region from floating-point corners, snapped outward to whole
    /// pixels and clamped to the image.
    pub(crate) fn from_corners(
        corners: (f32, f32, f32, f32),
        confidence: f32,
        width: u32,
        height: u32,
    ) -> Option<FaceRegion> {
        let (x1, y1, x2, y2) = corners;
        let (w, h) = (width as f32, height as f32);

        let left = x1.floor().clamp(0.0, w) as u32;
        let top = y1.floor().clamp(0.0, h) as u32;
        let right = x2.ceil().clamp(0.0, w) as u32;
        let bottom = y2.ceil().clamp(0.0, h) as u32;

        if right <= left || bottom <= top {
            return None;
        }

        Some(FaceRegion {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
            confidence,
        })
    }
}

/// Which extractor produced a feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Canonical luminance crop.
    Luma,
    /// ArcFace embedding.
    ArcFace,
}

/// Identifies the extractor configuration behind a [`FeatureVector`].
///
/// Vectors are only comparable when their descriptors are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub kind: FeatureKind,
    pub dim: usize,
}

impl fmt::Display for FeatureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FeatureKind::Luma => write!(f, "luma/{}", self.dim),
            FeatureKind::ArcFace => write!(f, "arcface/{}", self.dim),
        }
    }
}

/// Fixed-length feature representation of one face crop. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub values: Vec<f32>,
    pub descriptor: FeatureDescriptor,
}

/// A reference identity in the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub id: String,
    pub label: String,
    pub category: String,
    /// Handle of the stored reference image.
    pub reference_image: PathBuf,
    /// Faces located in the reference image when it was added.
    pub face_count: u32,
    pub created_at: DateTime<Utc>,
}

impl GalleryEntry {
    /// New entry with a fresh v4 id and the current time.
    pub fn new(
        label: impl Into<String>,
        category: impl Into<String>,
        reference_image: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.into(),
            category: category.into(),
            reference_image: reference_image.into(),
            face_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Per-face failure recorded inside an otherwise successful match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceError {
    /// The face crop had zero area after clamping to the image.
    EmptyRegion,
}

/// Verdict for one located face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    #[serde(rename = "bbox")]
    pub region: FaceRegion,
    pub matched: bool,
    /// Best gallery entry, present only when `matched`.
    pub entry: Option<GalleryEntry>,
    /// Best similarity over the whole gallery scan, in [0, 1].
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FaceError>,
}

impl MatchResult {
    pub(crate) fn failed(region: FaceRegion, error: FaceError) -> Self {
        Self {
            region,
            matched: false,
            entry: None,
            score: 0.0,
            error: Some(error),
        }
    }
}

/// Match results for one image plus a human-readable summary.
#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    pub message: String,
    pub faces: Vec<MatchResult>,
}

impl MatchReport {
    pub fn new(faces: Vec<MatchResult>) -> Self {
        let message = if faces.is_empty() {
            "No faces detected in the image".to_string()
        } else {
            format!("Detected {} face(s)", faces.len())
        };
        Self { message, faces }
    }

    /// Number of faces that matched a gallery entry.
    pub fn match_count(&self) -> usize {
        self.faces.iter().filter(|f| f.matched).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x: u32, y: u32, width: u32, height: u32) -> FaceRegion {
        FaceRegion { x, y, width, height, confidence: 0.9 }
    }

    #[test]
    fn test_clamp_inside_is_unchanged() {
        let r = region(10, 10, 20, 20);
        assert_eq!(r.clamp_to(100, 100), Some(r));
    }

    #[test]
    fn test_clamp_trims_overhang() {
        let r = region(90, 95, 20, 20).clamp_to(100, 100).unwrap();
        assert_eq!((r.x, r.y, r.width, r.height), (90, 95, 10, 5));
    }

    #[test]
    fn test_clamp_outside_is_none() {
        assert!(region(100, 0, 10, 10).clamp_to(100, 100).is_none());
        assert!(region(0, 0, 0, 10).clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_from_corners_snaps_outward_and_clamps() {
        let r = FaceRegion::from_corners((-5.5, 10.2, 40.1, 120.0), 0.8, 100, 100).unwrap();
        assert_eq!((r.x, r.y, r.width, r.height), (0, 10, 41, 90));
        assert!((r.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_from_corners_degenerate() {
        assert!(FaceRegion::from_corners((50.0, 50.0, 50.0, 60.0), 0.9, 100, 100).is_none());
        assert!(FaceRegion::from_corners((200.0, 0.0, 300.0, 10.0), 0.9, 100, 100).is_none());
    }

    #[test]
    fn test_report_message() {
        assert_eq!(MatchReport::new(vec![]).message, "No faces detected in the image");

        let face = MatchResult::failed(region(0, 0, 5, 5), FaceError::EmptyRegion);
        let report = MatchReport::new(vec![face.clone(), face]);
        assert_eq!(report.message, "Detected 2 face(s)");
        assert_eq!(report.match_count(), 0);
    }

    #[test]
    fn test_match_result_serializes_bbox() {
        let face = MatchResult {
            region: region(1, 2, 3, 4),
            matched: false,
            entry: None,
            score: 0.0,
            error: None,
        };
        let json = serde_json::to_value(&face).unwrap();
        assert_eq!(json["bbox"]["width"], 3);
        assert!(json.get("error").is_none());
    }
}
