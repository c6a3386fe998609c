use relearn_core::{CommandError, ImageUsageType, InvalidExtension, MessengerError, ModelStoreError};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure accepting an uploaded image.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("{0} images cannot be staged for training")]
    UnsupportedUsage(ImageUsageType),

    #[error(transparent)]
    Extension(#[from] InvalidExtension),

    /// One of the two artifacts could not be written. Nothing was published.
    #[error("failed to write {path}: {source}")]
    PartialWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure of one training cycle.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("training exited with status {exit_code:?}: {stderr}")]
    Exited {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("training output has no weights marker ({parser})")]
    MissingWeights { parser: &'static str },

    #[error("storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Model(#[from] ModelStoreError),
}

impl TrainingError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TrainingError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Storage failures the training task cannot recover from.
    pub fn is_fatal(&self) -> bool {
        let source = match self {
            TrainingError::Storage { source, .. } => source,
            TrainingError::Model(e) => e.io_error(),
            _ => return false,
        };
        matches!(
            source.kind(),
            io::ErrorKind::PermissionDenied
                | io::ErrorKind::StorageFull
                | io::ErrorKind::ReadOnlyFilesystem
        )
    }
}

/// Failure sending an image from an image source.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("not connected to a trainer")]
    NotConnected,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} has no file extension")]
    MissingExtension(PathBuf),

    #[error(transparent)]
    Send(#[from] MessengerError),
}
