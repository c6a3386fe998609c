use relearn_core::{CommandError, InvalidExtension, MessengerError};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure running inference for one request. No response is sent.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Extension(#[from] InvalidExtension),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("detection exited with status {exit_code:?}: {stderr}")]
    Exited {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("detection output has no results marker ({parser})")]
    MissingResults { parser: &'static str },

    #[error("failed to read image dimensions: {0}")]
    ImageSize(#[from] imagesize::ImageError),

    #[error("{path}:{line}: {message}")]
    LabelParse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure of a client-side detection request.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("not connected to a detector")]
    NotConnected,

    #[error("detector disconnected before responding")]
    DetectorDisconnected,

    #[error("no detection response within {0:?}")]
    TimedOut(Duration),

    #[error("detector rejected the request in state {state}")]
    Rejected { state: String },

    #[error(transparent)]
    Send(#[from] MessengerError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} has no file extension")]
    MissingExtension(PathBuf),
}
