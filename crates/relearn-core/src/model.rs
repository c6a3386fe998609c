//! The model file shared by writers (training, model updates) and readers
//! (inference, late-join catch-up).
//!
//! Writes go to a sibling temp file that is renamed into place while holding
//! the write guard, so a reader never observes a partially written model.

use crate::error::ModelStoreError;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::{RwLock, RwLockReadGuard};

pub struct ModelStore {
    path: PathBuf,
    guard: RwLock<()>,
}

/// Shared read access to the model file. Writers wait until it is dropped.
pub struct ModelLease<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    path: &'a Path,
}

impl ModelLease<'_> {
    pub fn path(&self) -> &Path {
        self.path
    }
}

impl ModelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        let _read = self.guard.read().await;
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Hold the model for the duration of an inference run.
    ///
    /// Returns `None` if no model has been written yet.
    pub async fn lease(&self) -> Option<ModelLease<'_>> {
        let guard = self.guard.read().await;
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            Some(ModelLease {
                _guard: guard,
                path: &self.path,
            })
        } else {
            None
        }
    }

    /// Current model bytes, or `None` if no model has been written yet.
    pub async fn read(&self) -> Result<Option<Vec<u8>>, ModelStoreError> {
        let _read = self.guard.read().await;
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ModelStoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replace the model with `bytes`.
    pub async fn replace(&self, bytes: &[u8]) -> Result<(), ModelStoreError> {
        let _write = self.guard.write().await;
        let staging = self.staging_path();
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|source| self.write_error(&staging, source))?;
        self.commit(&staging).await
    }

    async fn commit(&self, staging: &Path) -> Result<(), ModelStoreError> {
        if let Err(source) = tokio::fs::rename(staging, &self.path).await {
            let _ = tokio::fs::remove_file(staging).await;
            return Err(self.write_error(&self.path, source));
        }
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        self.path.with_file_name(format!(".{name}.partial"))
    }

    fn write_error(&self, path: &Path, source: io::Error) -> ModelStoreError {
        ModelStoreError::Write {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_store_has_no_model() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("weights.pt"));
        assert!(!store.exists().await);
        assert!(store.lease().await.is_none());
        assert_eq!(store.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn replace_overwrites_and_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("weights.pt"));
        store.replace(b"v1").await.unwrap();
        store.replace(b"v2").await.unwrap();
        assert_eq!(store.read().await.unwrap().as_deref(), Some(&b"v2"[..]));

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("weights.pt")]);
    }

    #[tokio::test]
    async fn writer_waits_for_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ModelStore::new(dir.path().join("weights.pt")));
        store.replace(b"old").await.unwrap();

        let lease = store.lease().await.unwrap();
        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.replace(b"new").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());
        assert_eq!(std::fs::read(lease.path()).unwrap(), b"old");

        drop(lease);
        writer.await.unwrap().unwrap();
        assert_eq!(store.read().await.unwrap().as_deref(), Some(&b"new"[..]));
    }
}
