//! Uploading side of the trainer link.

use crate::error::UploadError;
use relearn_core::{
    ActiveState, ImageUsageType, Influence, Peer, Role, Structure, TrainerMessage,
    TrainerMessageKind,
};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

type TrainerSlot = Arc<Mutex<Option<Peer<TrainerMessage>>>>;

/// Sends labeled images to a trainer.
///
/// Connect [`ImageSource::structure`] to the trainer's image-source listener
/// (as [`Role::ImageSource`]), then call [`ImageSource::send_image`].
pub struct ImageSource {
    structure: Arc<Structure<TrainerMessage, ActiveState>>,
    trainer: TrainerSlot,
}

impl Default for ImageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageSource {
    pub fn new() -> Self {
        let trainer: TrainerSlot = Arc::new(Mutex::new(None));
        let mut structure = Structure::new("image-source", ActiveState::Active);

        let slot = trainer.clone();
        structure.on_connect(Role::Trainer, move |peer, _tag| {
            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(peer);
            async { Ok(()) }
        });
        let slot = trainer.clone();
        structure.on_disconnect(Role::Trainer, move |peer_id| {
            let mut trainer = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if trainer.as_ref().is_some_and(|peer| peer.id() == peer_id) {
                *trainer = None;
            }
            async {}
        });
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
                    tracing::warn!(
                        state = %structure_state_name,
                        "Trainer rejected message: {}",
                        original_message_json
                    );
                }
                Ok(())
            },
        );

        Self {
            structure: Arc::new(structure),
            trainer,
        }
    }

    pub fn structure(&self) -> Arc<Structure<TrainerMessage, ActiveState>> {
        self.structure.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.trainer()
            .is_some_and(|trainer| !trainer.is_closed())
    }

    /// Read an image and its annotation from disk and announce them.
    ///
    /// The extension sent is the image file's.
    pub async fn send_image(
        &self,
        image_path: &Path,
        annotation_path: &Path,
        usage: ImageUsageType,
    ) -> Result<(), UploadError> {
        let image_extension = image_path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .ok_or_else(|| UploadError::MissingExtension(image_path.to_path_buf()))?;
        let image_bytes = read(image_path).await?;
        let annotation_bytes = read(annotation_path).await?;

        let trainer = self.trainer().ok_or(UploadError::NotConnected)?;
        trainer.send(TrainerMessage::AddImageAnnouncement {
            image_bytes,
            image_extension,
            annotation_bytes,
            image_usage_type: usage,
        })?;
        tracing::info!(image = %image_path.display(), %usage, "Sent image to trainer");
        Ok(())
    }

    fn trainer(&self) -> Option<Peer<TrainerMessage>> {
        self.trainer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

async fn read(path: &Path) -> Result<Vec<u8>, UploadError> {
    tokio::fs::read(path).await.map_err(|source| UploadError::Read {
        path: path.to_path_buf(),
        source,
    })
}
