//! File blob storage.
//!
//! Uploads themselves are handled elsewhere; the engine only needs to
//! remove blobs when their file records go away.

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::room::FileRef;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobError {
    /// Already gone. Sweeps treat this as success.
    #[error("blob {0} is missing")]
    Missing(String),
    #[error("blob key {0} is not a plain file name")]
    InvalidKey(String),
    #[error("blob I/O error: {0}")]
    Io(String),
}

pub trait BlobStore: Send + Sync {
    fn remove(&self, file: &FileRef) -> Result<(), BlobError>;
}

/// Blobs stored as files directly under one directory.
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a path inside the root, refusing anything that
    /// could escape it.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        let mut components = Path::new(key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => Ok(self.root.join(name)),
            _ => Err(BlobError::InvalidKey(key.to_string())),
        }
    }

    /// Write a blob. Used by upload handlers and tests.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, BlobError> {
        let path = self.path_for(key)?;
        std::fs::create_dir_all(&self.root).map_err(|e| BlobError::Io(e.to_string()))?;
        std::fs::write(&path, bytes).map_err(|e| BlobError::Io(e.to_string()))?;
        Ok(path)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }
}

impl BlobStore for DiskBlobStore {
    fn remove(&self, file: &FileRef) -> Result<(), BlobError> {
        let path = self.path_for(&file.blob_key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobError::Missing(file.blob_key.clone())),
            Err(e) => Err(BlobError::Io(format!("{}: {e}", path.display()))),
        }
    }
}
