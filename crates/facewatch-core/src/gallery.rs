//! In-memory gallery of reference identities.
//!
//! Readers take a copy-on-write snapshot at the start of a scan; writers
//! build a new entry list and swap it in, so a scan never observes a
//! half-updated gallery.

use crate::extractor::ExtractError;
use crate::locator::LocatorError;
use crate::pipeline::FaceEngine;
use crate::types::{FeatureVector, GalleryEntry};
use image::DynamicImage;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("no face detected in reference image")]
    NoFaceInReference,
    #[error("gallery entry not found: {0}")]
    NotFound(String),
    #[error("gallery entry already exists: {0}")]
    DuplicateId(String),
    #[error("locator error: {0}")]
    Locator(#[from] LocatorError),
    #[error("extractor error: {0}")]
    Extract(#[from] ExtractError),
}

/// A gallery entry together with the feature derived from its reference face.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub entry: GalleryEntry,
    pub feature: FeatureVector,
}

/// Reference identities in stable insertion order.
#[derive(Debug)]
pub struct GalleryIndex {
    entries: RwLock<Arc<[IndexedEntry]>>,
}

impl Default for GalleryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl GalleryIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Consistent snapshot of every entry, in insertion order.
    pub fn all(&self) -> Arc<[IndexedEntry]> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entry records without features, in insertion order.
    pub fn entries(&self) -> Vec<GalleryEntry> {
        self.all().iter().map(|e| e.entry.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<GalleryEntry> {
        self.all()
            .iter()
            .find(|e| e.entry.id == id)
            .map(|e| e.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an entry whose reference image must contain at least one face.
    ///
    /// The feature of the highest-confidence face is cached with the entry
    /// and `face_count` is filled in. Nothing is stored on failure.
    pub fn add(
        &self,
        mut entry: GalleryEntry,
        reference: &DynamicImage,
        engine: &mut FaceEngine,
    ) -> Result<GalleryEntry, GalleryError> {
        let reference = engine.reference_feature(reference)?;
        entry.face_count = reference.face_count;

        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if guard.iter().any(|e| e.entry.id == entry.id) {
            return Err(GalleryError::DuplicateId(entry.id));
        }

        let mut next = guard.to_vec();
        next.push(IndexedEntry {
            entry: entry.clone(),
            feature: reference.feature,
        });
        *guard = next.into();

        tracing::info!(
            id = %entry.id,
            label = %entry.label,
            faces = entry.face_count,
            size = guard.len(),
            "gallery: entry added"
        );
        Ok(entry)
    }

    /// Remove the logical record for `id` and return it.
    ///
    /// Releasing the stored reference image is the caller's job.
    pub fn remove(&self, id: &str) -> Result<GalleryEntry, GalleryError> {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let pos = guard
            .iter()
            .position(|e| e.entry.id == id)
            .ok_or_else(|| GalleryError::NotFound(id.to_string()))?;

        let mut next = guard.to_vec();
        let removed = next.remove(pos);
        *guard = next.into();

        tracing::info!(id, size = guard.len(), "gallery: entry removed");
        Ok(removed.entry)
    }

    /// Rebuild the index from persisted records, keeping their order.
    ///
    /// Records whose reference image no longer yields a face are skipped.
    /// Returns the number of entries restored.
    pub fn restore<I>(&self, records: I, engine: &mut FaceEngine) -> usize
    where
        I: IntoIterator<Item = (GalleryEntry, DynamicImage)>,
    {
        let mut restored = Vec::new();
        for (entry, image) in records {
            match engine.reference_feature(&image) {
                Ok(reference) => restored.push(IndexedEntry {
                    entry,
                    feature: reference.feature,
                }),
                Err(err) => {
                    tracing::warn!(id = %entry.id, error = %err, "gallery: skipping entry on restore");
                }
            }
        }

        let count = restored.len();
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = restored.into();
        tracing::info!(count, "gallery: restored");
        count
    }
}
