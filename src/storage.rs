//! Persistence backends.
//!
//! The vault persists three things, each behind its own trait so callers can
//! swap in a database, object store or test double:
//!
//! - [`KeyStore`]: the master key metadata document (never raw key bytes).
//! - [`IndexStore`]: one record per vault entry, upserted atomically.
//! - [`BlobStore`]: opaque ciphertext blobs keyed by `ciphertext_ref`.
//!
//! The file-system implementations make every single-record write atomic by
//! writing a temp file in the same directory and renaming it over the target.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::encoding;
use crate::error::{Result, VaultError};
use crate::index::VaultEntry;
use crate::key_manager::KeyMetadata;

/// Durable home of the master key metadata document.
pub trait KeyStore: Send + Sync {
    /// Load the document, or `None` if the vault was never initialized.
    fn load(&self) -> Result<Option<KeyMetadata>>;
    /// Replace the whole document atomically.
    fn save(&self, metadata: &KeyMetadata) -> Result<()>;
}

/// Durable home of the vault index.
pub trait IndexStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<VaultEntry>>;
    /// Insert or replace one entry. Must be atomic per entry.
    fn upsert(&self, entry: &VaultEntry) -> Result<()>;
    /// Remove one entry. Removing an absent entry is not an error.
    fn remove(&self, file_id: &str) -> Result<()>;
}

/// Opaque ciphertext storage. Blobs are only ever read and written whole.
pub trait BlobStore: Send + Sync {
    fn put(&self, ciphertext_ref: &str, data: &[u8]) -> Result<()>;
    fn get(&self, ciphertext_ref: &str) -> Result<Option<Vec<u8>>>;
    /// Delete one blob. Deleting an absent blob is not an error.
    fn delete(&self, ciphertext_ref: &str) -> Result<()>;
}

/// Write `data` to `path` so readers see either the old or the new content.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));

    let mut file = File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_optional(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// File-system backends
// ---------------------------------------------------------------------------

/// Key metadata stored as one pretty-printed JSON document.
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyStore for FileKeyStore {
    fn load(&self) -> Result<Option<KeyMetadata>> {
        match read_optional(&self.path)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn save(&self, metadata: &KeyMetadata) -> Result<()> {
        let data = serde_json::to_vec_pretty(metadata)?;
        write_atomic(&self.path, &data)
    }
}

/// One JSON file per vault entry, named by the URL-safe base64 of its file id.
pub struct JsonDirIndexStore {
    dir: PathBuf,
}

impl JsonDirIndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, file_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", encoding::file_name_for(file_id)))
    }
}

impl IndexStore for JsonDirIndexStore {
    fn load_all(&self) -> Result<Vec<VaultEntry>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for item in read_dir {
            let path = item?.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if !is_record {
                continue;
            }
            let data = fs::read(&path)?;
            entries.push(serde_json::from_slice(&data)?);
        }
        Ok(entries)
    }

    fn upsert(&self, entry: &VaultEntry) -> Result<()> {
        let data = serde_json::to_vec_pretty(entry)?;
        write_atomic(&self.record_path(&entry.file_id), &data)
    }

    fn remove(&self, file_id: &str) -> Result<()> {
        remove_optional(&self.record_path(file_id))
    }
}

/// Blobs stored as individual files under one directory.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn blob_path(&self, ciphertext_ref: &str) -> Result<PathBuf> {
        let valid = !ciphertext_ref.is_empty()
            && ciphertext_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(VaultError::InvalidParameters(format!(
                "invalid ciphertext ref: {ciphertext_ref:?}"
            )));
        }
        Ok(self.dir.join(ciphertext_ref))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, ciphertext_ref: &str, data: &[u8]) -> Result<()> {
        write_atomic(&self.blob_path(ciphertext_ref)?, data)
    }

    fn get(&self, ciphertext_ref: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.blob_path(ciphertext_ref)?)
    }

    fn delete(&self, ciphertext_ref: &str) -> Result<()> {
        remove_optional(&self.blob_path(ciphertext_ref)?)
    }
}

// ---------------------------------------------------------------------------
// In-memory backends
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryKeyStore {
    metadata: Mutex<Option<KeyMetadata>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn load(&self) -> Result<Option<KeyMetadata>> {
        Ok(self.metadata.lock().clone())
    }

    fn save(&self, metadata: &KeyMetadata) -> Result<()> {
        *self.metadata.lock() = Some(metadata.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryIndexStore {
    entries: Mutex<HashMap<String, VaultEntry>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for MemoryIndexStore {
    fn load_all(&self) -> Result<Vec<VaultEntry>> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    fn upsert(&self, entry: &VaultEntry) -> Result<()> {
        self.entries
            .lock()
            .insert(entry.file_id.clone(), entry.clone());
        Ok(())
    }

    fn remove(&self, file_id: &str) -> Result<()> {
        self.entries.lock().remove(file_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs held.
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, ciphertext_ref: &str, data: &[u8]) -> Result<()> {
        self.blobs
            .lock()
            .insert(ciphertext_ref.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, ciphertext_ref: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().get(ciphertext_ref).cloned())
    }

    fn delete(&self, ciphertext_ref: &str) -> Result<()> {
        self.blobs.lock().remove(ciphertext_ref);
        Ok(())
    }
}
