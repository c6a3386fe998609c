//! Permanent training and validation corpora (`images/` and `labels/`).

use crate::error::TrainingError;
use crate::staging::StagedImageRecord;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Corpus {
    root: PathBuf,
}

impl Corpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn labels_dir(&self) -> PathBuf {
        self.root.join("labels")
    }

    pub async fn create_dirs(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.images_dir()).await?;
        tokio::fs::create_dir_all(self.labels_dir()).await
    }

    /// A corpus with no `images/` directory counts as empty.
    pub async fn is_empty(&self) -> Result<bool, TrainingError> {
        let dir = self.images_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(TrainingError::storage(dir, e)),
        };
        let first = entries
            .next_entry()
            .await
            .map_err(|e| TrainingError::storage(&dir, e))?;
        Ok(first.is_none())
    }

    /// Move a staged pair out of the holding area into this corpus.
    ///
    /// If the annotation cannot be moved the image goes back to the holding
    /// area, so a corpus never holds an image without its label.
    pub async fn promote(&self, record: &StagedImageRecord) -> Result<(), TrainingError> {
        let image = destination(&self.images_dir(), &record.image_path)?;
        let annotation = destination(&self.labels_dir(), &record.annotation_path)?;
        move_file(&record.image_path, &image).await?;
        if let Err(e) = move_file(&record.annotation_path, &annotation).await {
            if let Err(undo) = move_file(&image, &record.image_path).await {
                tracing::error!(image = %record.id, "Failed to return image to holding area: {}", undo);
            }
            return Err(e);
        }
        Ok(())
    }
}

fn destination(dir: &Path, source: &Path) -> Result<PathBuf, TrainingError> {
    match source.file_name() {
        Some(name) => Ok(dir.join(name)),
        None => Err(TrainingError::storage(
            source,
            io::Error::new(io::ErrorKind::InvalidInput, "staged path has no file name"),
        )),
    }
}

/// Rename, falling back to copy and delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<(), TrainingError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    if let Err(e) = tokio::fs::copy(from, to).await {
        let _ = tokio::fs::remove_file(to).await;
        return Err(TrainingError::storage(from, e));
    }
    tokio::fs::remove_file(from)
        .await
        .map_err(|e| TrainingError::storage(from, e))
}
