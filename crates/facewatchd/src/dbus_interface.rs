use crate::engine::{EngineError, EngineHandle, Upload};
use serde::Serialize;
use zbus::interface;

/// D-Bus interface for the facewatch gallery daemon.
///
/// Bus name: org.facewatch.Gallery1
/// Object path: /org/facewatch/Gallery1
pub struct FacewatchService {
    engine: EngineHandle,
}

impl FacewatchService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.facewatch.Gallery1")]
impl FacewatchService {
    /// Match every face in the image against the gallery.
    async fn match_image(&self, image: Vec<u8>, filename: String) -> zbus::fdo::Result<String> {
        tracing::info!(filename = %filename, bytes = image.len(), "match requested");
        let report = self
            .engine
            .match_image(Upload {
                bytes: image,
                filename,
            })
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// Add a reference image to the gallery under a label and category.
    async fn add_entry(
        &self,
        label: String,
        category: String,
        image: Vec<u8>,
        filename: String,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(label = %label, category = %category, filename = %filename, "add requested");
        let entry = self
            .engine
            .add_entry(
                &label,
                &category,
                Upload {
                    bytes: image,
                    filename,
                },
            )
            .await
            .map_err(to_fdo)?;
        to_json(&entry)
    }

    async fn list_entries(&self) -> zbus::fdo::Result<String> {
        let entries = self.engine.list_entries().await.map_err(to_fdo)?;
        to_json(&entries)
    }

    /// Remove an entry by ID. Unknown IDs are rejected.
    async fn remove_entry(&self, id: String) -> zbus::fdo::Result<bool> {
        tracing::info!(id = %id, "remove requested");
        self.engine.remove_entry(&id).await.map_err(to_fdo)?;
        Ok(true)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "gallery_size": self.engine.gallery_size(),
            "similarity_threshold": self.engine.threshold(),
            "features": self.engine.descriptor(),
        })
        .to_string())
    }
}

/// Bad input maps to `InvalidArgs`, everything else to `Failed`.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    if err.is_client_error() {
        tracing::info!(error = %err, "request rejected");
        zbus::fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::error!(error = %err, "request failed");
        zbus::fdo::Error::Failed(err.to_string())
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}
