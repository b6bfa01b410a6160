use crate::config::{Config, ExtractorKind};
use facewatch_core::{
    decode_image, ArcFaceExtractor, CosineScorer, DecodeError, ExtractError, FaceEngine,
    FeatureExtractor, GalleryEntry, GalleryError, GalleryIndex, LocatorError, LumaExtractor,
    MatchPipeline, MatchReport, MeanAbsDiffScorer, PipelineError, ScrfdLocator, SimilarityScorer,
};
use facewatch_store::{GalleryStore, SqliteGalleryStore, StoreError};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Label and category given to entries added without one.
const UNKNOWN: &str = "Unknown";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0}")]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    Gallery(#[from] GalleryError),
    #[error("match failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("locator error: {0}")]
    Locator(#[from] LocatorError),
    #[error("extractor error: {0}")]
    Extractor(#[from] ExtractError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// Whether the caller sent bad input, as opposed to an internal failure.
    pub fn is_client_error(&self) -> bool {
        match self {
            EngineError::Decode(_) => true,
            EngineError::Gallery(err) => matches!(
                err,
                GalleryError::NoFaceInReference
                    | GalleryError::NotFound(_)
                    | GalleryError::DuplicateId(_)
            ),
            EngineError::Store(err) => matches!(err, StoreError::NotFound(_)),
            _ => false,
        }
    }
}

/// Upload forwarded from the IPC surface.
pub struct Upload {
    pub bytes: Vec<u8>,
    pub filename: String,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Match {
        upload: Upload,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<MatchReport, EngineError>>,
    },
    Add {
        label: String,
        category: String,
        upload: Upload,
        reply: oneshot::Sender<Result<GalleryEntry, EngineError>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Result<GalleryEntry, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<GalleryEntry>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    gallery: Arc<GalleryIndex>,
    threshold: f32,
    match_timeout: Option<Duration>,
    descriptor: String,
}

impl EngineHandle {
    /// Match every face in an uploaded image against the gallery.
    pub async fn match_image(&self, upload: Upload) -> Result<MatchReport, EngineError> {
        let deadline = self.match_timeout.map(|t| Instant::now() + t);
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Match {
            upload,
            deadline,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Store an uploaded reference image and add it to the gallery.
    pub async fn add_entry(
        &self,
        label: &str,
        category: &str,
        upload: Upload,
    ) -> Result<GalleryEntry, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Add {
            label: or_unknown(label),
            category: or_unknown(category),
            upload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Remove a gallery entry and release its reference image.
    pub async fn remove_entry(&self, id: &str) -> Result<GalleryEntry, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Remove {
            id: id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Every stored record, including ones that could not be indexed at startup.
    pub async fn list_entries(&self) -> Result<Vec<GalleryEntry>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::List { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn gallery_size(&self) -> usize {
        self.gallery.len()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    async fn send(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx
            .send(req)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

fn or_unknown(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build the matching pipeline selected by the configuration.
///
/// Loads the ONNX models synchronously so startup fails fast.
pub fn build_pipeline(config: &Config) -> Result<MatchPipeline, EngineError> {
    let scrfd_path = config.scrfd_model_path();
    let locator = ScrfdLocator::load(&scrfd_path, config.detection)?;
    tracing::info!(path = %scrfd_path.display(), "SCRFD locator loaded");

    let (extractor, scorer): (Box<dyn FeatureExtractor>, Box<dyn SimilarityScorer>) =
        match config.extractor {
            ExtractorKind::Luma => (Box::new(LumaExtractor::new()), Box::new(MeanAbsDiffScorer)),
            ExtractorKind::Arcface => {
                let arcface_path = config.arcface_model_path();
                let extractor = ArcFaceExtractor::load(&arcface_path)?;
                tracing::info!(path = %arcface_path.display(), "ArcFace extractor loaded");
                (Box::new(extractor), Box::new(CosineScorer))
            }
        };

    Ok(MatchPipeline::new(
        FaceEngine::new(Box::new(locator), extractor),
        scorer,
    ))
}

/// Open the store, load the models, restore the gallery and spawn the engine.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let mut pipeline = build_pipeline(config)?;
    let store = SqliteGalleryStore::open(&config.db_path, &config.image_dir)?;

    let gallery = Arc::new(GalleryIndex::new());
    restore_gallery(&store, &gallery, &mut pipeline)?;

    spawn_with(
        pipeline,
        Box::new(store),
        gallery,
        config.similarity_threshold,
        config.match_timeout(),
    )
}

/// Rebuild the in-memory gallery from stored records.
pub fn restore_gallery(
    store: &dyn GalleryStore,
    gallery: &GalleryIndex,
    pipeline: &mut MatchPipeline,
) -> Result<usize, EngineError> {
    let records = store.list()?;
    let total = records.len();

    let loaded: Vec<(GalleryEntry, image::DynamicImage)> = records
        .into_iter()
        .filter_map(|entry| match load_reference(&entry.reference_image) {
            Ok(image) => Some((entry, image)),
            Err(err) => {
                tracing::warn!(id = %entry.id, error = %err, "reference image unreadable; entry skipped");
                None
            }
        })
        .collect();

    let restored = gallery.restore(loaded, pipeline.engine_mut());
    tracing::info!(restored, total, "gallery restored from store");
    Ok(restored)
}

fn load_reference(path: &Path) -> Result<image::DynamicImage, EngineError> {
    let bytes = std::fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    Ok(decode_image(&bytes, &name)?)
}

/// Spawn the engine on a dedicated OS thread around an already built
/// pipeline, store and gallery.
pub fn spawn_with(
    mut pipeline: MatchPipeline,
    mut store: Box<dyn GalleryStore>,
    gallery: Arc<GalleryIndex>,
    threshold: f32,
    match_timeout: Option<Duration>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);
    let descriptor = pipeline.engine_mut().descriptor().to_string();
    let engine_gallery = Arc::clone(&gallery);

    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Match {
                        upload,
                        deadline,
                        reply,
                    } => {
                        let result =
                            run_match(&mut pipeline, &engine_gallery, &upload, threshold, deadline);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Add {
                        label,
                        category,
                        upload,
                        reply,
                    } => {
                        let result = run_add(
                            &mut pipeline,
                            store.as_mut(),
                            &engine_gallery,
                            label,
                            category,
                            &upload,
                        );
                        let _ = reply.send(result);
                    }
                    EngineRequest::Remove { id, reply } => {
                        let result = run_remove(store.as_mut(), &engine_gallery, &id);
                        let _ = reply.send(result);
                    }
                    EngineRequest::List { reply } => {
                        let _ = reply.send(store.list().map_err(EngineError::from));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        gallery,
        threshold,
        match_timeout,
        descriptor,
    })
}

fn run_match(
    pipeline: &mut MatchPipeline,
    gallery: &GalleryIndex,
    upload: &Upload,
    threshold: f32,
    deadline: Option<Instant>,
) -> Result<MatchReport, EngineError> {
    let image = decode_image(&upload.bytes, &upload.filename)?;
    let faces = pipeline.run(&image, gallery, threshold, deadline)?;
    let report = MatchReport::new(faces);

    tracing::info!(
        filename = %upload.filename,
        faces = report.faces.len(),
        matches = report.match_count(),
        "match: completed"
    );
    Ok(report)
}

/// Save the reference image, index it, then persist the record. Every
/// failure after the image is saved undoes the earlier steps.
fn run_add(
    pipeline: &mut MatchPipeline,
    store: &mut dyn GalleryStore,
    gallery: &GalleryIndex,
    label: String,
    category: String,
    upload: &Upload,
) -> Result<GalleryEntry, EngineError> {
    let image = decode_image(&upload.bytes, &upload.filename)?;
    let path = store.save_reference_image(&upload.bytes, &upload.filename)?;

    let entry = GalleryEntry::new(label, category, path.clone());
    let entry = match gallery.add(entry, &image, pipeline.engine_mut()) {
        Ok(entry) => entry,
        Err(err) => {
            discard(store, &path);
            return Err(err.into());
        }
    };

    if let Err(err) = store.insert(&entry) {
        if let Err(rollback) = gallery.remove(&entry.id) {
            tracing::error!(id = %entry.id, error = %rollback, "add: index rollback failed");
        }
        discard(store, &path);
        return Err(err.into());
    }

    Ok(entry)
}

fn discard(store: &mut dyn GalleryStore, path: &Path) {
    if let Err(err) = store.discard_reference_image(path) {
        tracing::warn!(path = %path.display(), error = %err, "failed to discard reference image");
    }
}

/// Delete the stored record first, then drop it from the index. Records
/// skipped at startup are only in the store; they are still removable.
fn run_remove(
    store: &mut dyn GalleryStore,
    gallery: &GalleryIndex,
    id: &str,
) -> Result<GalleryEntry, EngineError> {
    match store.delete(id) {
        Ok(stored) => match gallery.remove(id) {
            Ok(entry) => Ok(entry),
            Err(GalleryError::NotFound(_)) => {
                tracing::info!(id, "remove: record was not indexed");
                Ok(stored)
            }
            Err(err) => Err(err.into()),
        },
        Err(StoreError::NotFound(_)) => {
            let entry = gallery.remove(id)?;
            tracing::warn!(id, "remove: entry was indexed but not stored");
            Ok(entry)
        }
        Err(err) => Err(err.into()),
    }
}
