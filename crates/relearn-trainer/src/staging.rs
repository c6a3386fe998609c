//! Holding area for uploaded images.
//!
//! Each upload is written as `<usage>/<id>.<ext>` plus `<usage>/<id>.txt`
//! under the holding root. Only once both files are on disk does the record
//! join the available list, which the training loop drains in one step.

use crate::error::StagingError;
use relearn_core::{ANNOTATION_EXTENSION, ImageUsageType, normalize_extension};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// An uploaded image and annotation waiting for promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImageRecord {
    pub id: Uuid,
    pub usage: ImageUsageType,
    pub image_path: PathBuf,
    pub annotation_path: PathBuf,
}

pub struct StagingArea {
    root: PathBuf,
    available: Mutex<Vec<StagedImageRecord>>,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            available: Mutex::new(Vec::new()),
        }
    }

    pub fn holding_dir(&self, usage: ImageUsageType) -> PathBuf {
        self.root.join(usage.dir_name())
    }

    pub async fn create_dirs(&self) -> io::Result<()> {
        for usage in [ImageUsageType::Training, ImageUsageType::Validation] {
            tokio::fs::create_dir_all(self.holding_dir(usage)).await?;
        }
        Ok(())
    }

    /// Write an uploaded pair into the holding area and publish it.
    pub async fn accept_upload(
        &self,
        image_bytes: &[u8],
        extension: &str,
        annotation_bytes: &[u8],
        usage: ImageUsageType,
    ) -> Result<StagedImageRecord, StagingError> {
        if usage == ImageUsageType::Detect {
            return Err(StagingError::UnsupportedUsage(usage));
        }
        let extension = normalize_extension(extension)?;

        let id = Uuid::new_v4();
        let dir = self.holding_dir(usage);
        let record = StagedImageRecord {
            id,
            usage,
            image_path: dir.join(format!("{id}.{extension}")),
            annotation_path: dir.join(format!("{id}.{ANNOTATION_EXTENSION}")),
        };
        write_pair(
            &record.image_path,
            image_bytes,
            &record.annotation_path,
            annotation_bytes,
        )
        .await?;

        self.lock().push(record.clone());
        tracing::debug!(image = %id, %usage, "staged upload");
        Ok(record)
    }

    /// Take every available record. Uploads accepted afterwards wait for the
    /// next drain.
    pub fn drain(&self) -> Vec<StagedImageRecord> {
        std::mem::take(&mut *self.lock())
    }

    /// Put records that could not be promoted back in front of the list, so
    /// the next drain retries them before newer uploads.
    pub fn requeue(&self, records: Vec<StagedImageRecord>) {
        if records.is_empty() {
            return;
        }
        self.lock().splice(0..0, records);
    }

    pub fn available_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StagedImageRecord>> {
        self.available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write both artifacts or neither.
async fn write_pair(
    image_path: &Path,
    image_bytes: &[u8],
    annotation_path: &Path,
    annotation_bytes: &[u8],
) -> Result<(), StagingError> {
    if let Err(source) = tokio::fs::write(image_path, image_bytes).await {
        let _ = tokio::fs::remove_file(image_path).await;
        return Err(StagingError::PartialWrite {
            path: image_path.to_path_buf(),
            source,
        });
    }
    if let Err(source) = tokio::fs::write(annotation_path, annotation_bytes).await {
        let _ = tokio::fs::remove_file(annotation_path).await;
        let _ = tokio::fs::remove_file(image_path).await;
        return Err(StagingError::PartialWrite {
            path: annotation_path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
