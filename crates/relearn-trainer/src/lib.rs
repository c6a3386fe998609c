//! Trainer service.
//!
//! Image sources upload labeled images into a [`StagingArea`]. A single
//! [`TrainingLoop`] periodically promotes them into the training and
//! validation [`Corpus`], retrains, and publishes the new model through the
//! [`Broadcaster`] to every connected detector.

mod broadcast;
mod corpus;
mod error;
mod image_source;
mod staging;
mod trainer;
mod training;

pub use broadcast::{BroadcastReport, Broadcaster, ModelPublisher};
pub use corpus::Corpus;
pub use error::{StagingError, TrainingError, UploadError};
pub use image_source::ImageSource;
pub use staging::{StagedImageRecord, StagingArea};
pub use trainer::{TrainerStructure, trainer_structure};
pub use training::{CycleOutcome, TrainingLoop, TrainingSettings};
