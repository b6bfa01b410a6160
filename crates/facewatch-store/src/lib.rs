//! facewatch-store — Gallery persistence.
//!
//! Gallery records live in a SQLite table; reference images are kept as
//! files in an image directory and released when their record is deleted.

use chrono::{DateTime, Utc};
use facewatch_core::GalleryEntry;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("gallery entry not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Durable storage of gallery records and their reference images.
pub trait GalleryStore: Send {
    /// Write reference image bytes under a unique name and return its handle.
    fn save_reference_image(&mut self, bytes: &[u8], original_name: &str)
        -> Result<PathBuf, StoreError>;

    /// Delete a reference image that never made it into a record.
    fn discard_reference_image(&mut self, path: &Path) -> Result<(), StoreError>;

    fn insert(&mut self, entry: &GalleryEntry) -> Result<(), StoreError>;

    /// Delete the record and its reference image.
    fn delete(&mut self, id: &str) -> Result<GalleryEntry, StoreError>;

    /// Every record in insertion order.
    fn list(&self) -> Result<Vec<GalleryEntry>, StoreError>;
}

/// SQLite-backed [`GalleryStore`].
pub struct SqliteGalleryStore {
    conn: Connection,
    image_dir: PathBuf,
}

impl SqliteGalleryStore {
    /// Open (or create) the database at `db_path` and the image directory.
    pub fn open(db_path: &Path, image_dir: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            create_dir(parent)?;
        }
        create_dir(image_dir)?;

        let conn = Connection::open(db_path)?;
        let store = Self::with_connection(conn, image_dir)?;
        tracing::info!(
            db = %db_path.display(),
            images = %image_dir.display(),
            "gallery store opened"
        );
        Ok(store)
    }

    /// In-memory database; images still go to `image_dir`.
    pub fn open_in_memory(image_dir: &Path) -> Result<Self, StoreError> {
        create_dir(image_dir)?;
        Self::with_connection(Connection::open_in_memory()?, image_dir)
    }

    fn with_connection(conn: Connection, image_dir: &Path) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gallery_entries (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                label       TEXT NOT NULL,
                category    TEXT NOT NULL,
                image_path  TEXT NOT NULL,
                face_count  INTEGER NOT NULL,
                created_at  TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn,
            image_dir: image_dir.to_path_buf(),
        })
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    fn get(&self, id: &str) -> Result<Option<GalleryEntry>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, label, category, image_path, face_count, created_at
                 FROM gallery_entries WHERE id = ?1",
                params![id],
                read_row,
            )
            .optional()?;
        row.map(into_entry).transpose()
    }
}

impl GalleryStore for SqliteGalleryStore {
    fn save_reference_image(
        &mut self,
        bytes: &[u8],
        original_name: &str,
    ) -> Result<PathBuf, StoreError> {
        let path = self.image_dir.join(unique_image_name(original_name));
        std::fs::write(&path, bytes).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "reference image saved");
        Ok(path)
    }

    fn discard_reference_image(&mut self, path: &Path) -> Result<(), StoreError> {
        remove_file_if_exists(path)
    }

    fn insert(&mut self, entry: &GalleryEntry) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO gallery_entries (id, label, category, image_path, face_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id,
                entry.label,
                entry.category,
                entry.reference_image.to_string_lossy(),
                entry.face_count,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        tracing::info!(id = %entry.id, label = %entry.label, "gallery record stored");
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<GalleryEntry, StoreError> {
        let entry = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        self.conn
            .execute("DELETE FROM gallery_entries WHERE id = ?1", params![id])?;

        if let Err(err) = remove_file_if_exists(&entry.reference_image) {
            tracing::warn!(id, error = %err, "gallery record deleted but image removal failed");
        }

        tracing::info!(id, "gallery record deleted");
        Ok(entry)
    }

    fn list(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, label, category, image_path, face_count, created_at
             FROM gallery_entries ORDER BY seq",
        )?;
        let rows = stmt.query_map([], read_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(into_entry(row?)?);
        }
        Ok(entries)
    }
}

type RawRow = (String, String, String, String, u32, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_entry(raw: RawRow) -> Result<GalleryEntry, StoreError> {
    let (id, label, category, image_path, face_count, created_at) = raw;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StoreError::Corrupt {
            id: id.clone(),
            reason: format!("created_at: {e}"),
        })?
        .with_timezone(&Utc);

    Ok(GalleryEntry {
        id,
        label,
        category,
        reference_image: PathBuf::from(image_path),
        face_count,
        created_at,
    })
}

fn create_dir(dir: &Path) -> Result<(), StoreError> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

fn remove_file_if_exists(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Reduce an uploaded filename to ASCII alphanumerics, `.`, `-` and `_`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}

/// `ref_<timestamp>_<8 hex>_<sanitized name>`
fn unique_image_name(original_name: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let tag = uuid::Uuid::new_v4().simple().to_string();
    format!("ref_{stamp}_{}_{}", &tag[..8], sanitize_filename(original_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> SqliteGalleryStore {
        SqliteGalleryStore::open(&dir.join("gallery.db"), &dir.join("images")).unwrap()
    }

    fn entry_with_image(store: &mut SqliteGalleryStore, label: &str) -> GalleryEntry {
        let path = store.save_reference_image(b"fake image bytes", "mug shot.png").unwrap();
        let mut entry = GalleryEntry::new(label, "Unknown", path);
        entry.face_count = 1;
        entry
    }

    #[test]
    fn test_insert_and_list_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());

        let a = entry_with_image(&mut store, "a");
        let b = entry_with_image(&mut store, "b");
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].label, "b");
        assert_eq!(listed[0].face_count, 1);
        assert_eq!(listed[0].created_at.timestamp(), a.created_at.timestamp());
    }

    #[test]
    fn test_delete_removes_record_and_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let a = entry_with_image(&mut store, "a");
        store.insert(&a).unwrap();
        assert!(a.reference_image.exists());

        let removed = store.delete(&a.id).unwrap();
        assert_eq!(removed.id, a.id);
        assert!(!a.reference_image.exists());
        assert!(store.list().unwrap().is_empty());

        assert!(matches!(store.delete(&a.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_tolerates_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let a = entry_with_image(&mut store, "a");
        store.insert(&a).unwrap();
        std::fs::remove_file(&a.reference_image).unwrap();

        assert!(store.delete(&a.id).is_ok());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = store(dir.path());
            let a = entry_with_image(&mut store, "a");
            store.insert(&a).unwrap();
            a.id
        };

        let reopened = store(dir.path());
        let listed = reopened.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SqliteGalleryStore::open_in_memory(&dir.path().join("images")).unwrap();
        let a = entry_with_image(&mut store, "a");
        store.insert(&a).unwrap();
        assert!(matches!(store.insert(&a), Err(StoreError::Db(_))));
    }

    #[test]
    fn test_saved_image_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        let path = store.save_reference_image(b"x", "../../etc/passwd").unwrap();

        assert_eq!(path.parent(), Some(store.image_dir()));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("ref_"));
        assert!(name.ends_with("_passwd"));

        store.discard_reference_image(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("mug shot (1).JPG"), "mug_shot__1_.JPG");
        assert_eq!(sanitize_filename("C:\\photos\\a.png"), "a.png");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("///"), "image");
    }
}
