//! Detector service: answers detection requests with the locally cached
//! model and keeps that model in sync with the trainer.

use crate::error::InferenceError;
use crate::labels::load_labels;
use relearn_core::artifacts::{self, ArtifactParser, Yolov5Markers};
use relearn_core::command::ExternalCommand;
use relearn_core::{
    ActiveState, DetectedLabel, DetectorMessage, DetectorMessageKind, HandlerError,
    ImageUsageType, Influence, ModelStore, Role, Structure, TrainerMessage, TrainerMessageKind,
    normalize_extension,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub type DetectorStructure = Structure<DetectorMessage, ActiveState>;
pub type TrainerLinkStructure = Structure<TrainerMessage, ActiveState>;

/// Runs the external detection command against the cached model.
pub struct Inference {
    model: Arc<ModelStore>,
    command: ExternalCommand,
    parser: Box<dyn ArtifactParser>,
    temp_dir: PathBuf,
    image_size: u32,
}

impl Inference {
    /// Request images are written under `<temp_root>/detect`.
    pub fn new(
        model: Arc<ModelStore>,
        command: ExternalCommand,
        temp_root: &Path,
        image_size: u32,
    ) -> Self {
        Self {
            model,
            command,
            parser: Box::new(Yolov5Markers),
            temp_dir: temp_root.join(ImageUsageType::Detect.dir_name()),
            image_size,
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn ArtifactParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub async fn create_dirs(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.temp_dir).await
    }

    /// Detect objects in one image.
    ///
    /// Returns `Ok(None)` if there is no model yet. The model cannot be
    /// replaced while the command runs.
    pub async fn detect(
        &self,
        image_bytes: &[u8],
        extension: &str,
    ) -> Result<Option<Vec<DetectedLabel>>, InferenceError> {
        let extension = normalize_extension(extension)?;
        let Some(lease) = self.model.lease().await else {
            return Ok(None);
        };

        let image_path = self.temp_dir.join(format!("{}.{extension}", Uuid::new_v4()));
        tokio::fs::write(&image_path, image_bytes)
            .await
            .map_err(|source| InferenceError::Io {
                path: image_path.clone(),
                source,
            })?;

        let result = self.run(&image_path, lease.path(), image_bytes).await;
        drop(lease);
        if let Err(e) = tokio::fs::remove_file(&image_path).await {
            tracing::debug!(path = %image_path.display(), "could not remove request image: {}", e);
        }
        result.map(Some)
    }

    async fn run(
        &self,
        image_path: &Path,
        model_path: &Path,
        image_bytes: &[u8],
    ) -> Result<Vec<DetectedLabel>, InferenceError> {
        let image_size = self.image_size.to_string();
        let output = self
            .command
            .run([
                image_path.as_os_str(),
                model_path.as_os_str(),
                OsStr::new(&image_size),
            ])
            .await?;
        if !output.success() {
            return Err(InferenceError::Exited {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        let results = self
            .parser
            .results_dir(&output.stdout)
            .ok_or(InferenceError::MissingResults {
                parser: self.parser.name(),
            })?;
        let results = match self.command.working_dir() {
            Some(dir) => artifacts::resolve(dir, &results),
            None => results,
        };
        load_labels(&results, image_path, image_bytes).await
    }
}

/// Client-facing structure: answers `detect_request`.
///
/// A request that cannot be answered (no model yet, failed inference) gets
/// no response.
pub fn detector_structure(inference: Arc<Inference>) -> DetectorStructure {
    let mut structure = Structure::new("detector", ActiveState::Active);

    structure.add_transition(
        DetectorMessageKind::DetectRequest,
        Role::Client,
        ActiveState::Active,
        ActiveState::Active,
        move |influence: Influence<DetectorMessage>| {
            let inference = inference.clone();
            async move {
                let DetectorMessage::DetectRequest {
                    image_bytes,
                    image_extension,
                    image_id,
                } = influence.message
                else {
                    return Ok(());
                };

                let Some(detected_labels) = inference.detect(&image_bytes, &image_extension).await?
                else {
                    tracing::info!(image = %image_id, "No model available yet, dropping request");
                    return Ok(());
                };
                tracing::debug!(image = %image_id, labels = detected_labels.len(), "detection finished");
                influence.peer.send(DetectorMessage::DetectResponse {
                    image_id,
                    detected_labels,
                })?;
                Ok::<(), HandlerError>(())
            }
        },
    );

    structure.on_connect(Role::Client, |peer, _tag| async move {
        tracing::info!(peer = %peer.id(), "Client connected");
        Ok(())
    });
    structure.on_disconnect(Role::Client, |peer_id| async move {
        tracing::info!(peer = %peer_id, "Client disconnected");
    });

    structure
}

/// Trainer-facing structure: applies `update_model_broadcast` to `model`.
pub fn trainer_link_structure(model: Arc<ModelStore>) -> TrainerLinkStructure {
    let mut structure = Structure::new("detector-trainer-link", ActiveState::Active);

    structure.add_transition(
        TrainerMessageKind::UpdateModelBroadcast,
        Role::Trainer,
        ActiveState::Active,
        ActiveState::Active,
        move |influence: Influence<TrainerMessage>| {
            let model = model.clone();
            async move {
                if let TrainerMessage::UpdateModelBroadcast { model_bytes } = influence.message {
                    model.replace(&model_bytes).await?;
                    tracing::info!(bytes = model_bytes.len(), "Updated model from trainer");
                }
                Ok::<(), HandlerError>(())
            }
        },
    );
    structure.add_transition(
        TrainerMessageKind::TrainerError,
        Role::Trainer,
        ActiveState::Active,
        ActiveState::Active,
        |influence: Influence<TrainerMessage>| async move {
            if let TrainerMessage::TrainerError {
                structure_state_name,
                original_message_json,
            } = influence.message
            {
                tracing::warn!(state = %structure_state_name, "Trainer rejected message: {}", original_message_json);
            }
            Ok(())
        },
    );

    structure.on_connect(Role::Trainer, |peer, _tag| async move {
        tracing::info!(peer = %peer.id(), "Connected to trainer");
        Ok(())
    });
    structure.on_disconnect(Role::Trainer, |peer_id| async move {
        tracing::warn!(peer = %peer_id, "Lost connection to trainer; model updates stopped");
    });

    structure
}
