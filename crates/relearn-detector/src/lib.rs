//! Detector service and detection client.
//!
//! A detector keeps a local copy of the newest model (pushed by the trainer
//! over the trainer link) and answers client `detect_request` messages by
//! running the external detection command against it.

mod client;
mod detector;
mod error;
mod labels;

pub use client::DetectionClient;
pub use detector::{
    DetectorStructure, Inference, TrainerLinkStructure, detector_structure, trainer_link_structure,
};
pub use error::{DetectionError, InferenceError};
pub use labels::{load_labels, parse_labels};
