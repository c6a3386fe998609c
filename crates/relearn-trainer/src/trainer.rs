//! The trainer's peer state machine.
//!
//! Image sources upload labeled images; detectors are registered with the
//! broadcaster for model updates. Nothing else is accepted.

use crate::broadcast::Broadcaster;
use crate::staging::StagingArea;
use relearn_core::{
    ActiveState, HandlerError, Influence, Role, Structure, TrainerMessage, TrainerMessageKind,
};
use std::sync::Arc;

pub type TrainerStructure = Structure<TrainerMessage, ActiveState>;

pub fn trainer_structure(
    staging: Arc<StagingArea>,
    broadcaster: Arc<Broadcaster>,
) -> TrainerStructure {
    let mut structure = Structure::new("trainer", ActiveState::Active);

    structure.add_transition(
        TrainerMessageKind::AddImageAnnouncement,
        Role::ImageSource,
        ActiveState::Active,
        ActiveState::Active,
        move |influence: Influence<TrainerMessage>| {
            let staging = staging.clone();
            async move {
                if let TrainerMessage::AddImageAnnouncement {
                    image_bytes,
                    image_extension,
                    annotation_bytes,
                    image_usage_type,
                } = influence.message
                {
                    let record = staging
                        .accept_upload(
                            &image_bytes,
                            &image_extension,
                            &annotation_bytes,
                            image_usage_type,
                        )
                        .await?;
                    tracing::info!(
                        peer = %influence.peer.id(),
                        image = %record.id,
                        usage = %record.usage,
                        "Accepted image"
                    );
                }
                Ok::<(), HandlerError>(())
            }
        },
    );

    structure.on_connect(Role::ImageSource, |peer, _tag| async move {
        tracing::info!(peer = %peer.id(), "Image source connected");
        Ok(())
    });
    structure.on_disconnect(Role::ImageSource, |peer_id| async move {
        tracing::info!(peer = %peer_id, "Image source disconnected");
    });

    let registry = broadcaster.clone();
    structure.on_connect(Role::Detector, move |peer, _tag| {
        let broadcaster = registry.clone();
        async move {
            tracing::info!(peer = %peer.id(), "Detector connected");
            broadcaster.register(peer).await?;
            Ok::<(), HandlerError>(())
        }
    });
    structure.on_disconnect(Role::Detector, move |peer_id| {
        let broadcaster = broadcaster.clone();
        async move {
            if broadcaster.deregister(peer_id).await {
                tracing::info!(peer = %peer_id, "Detector disconnected");
            }
        }
    });

    structure
}

#[cfg(test)]
mod tests {
    use super::*;
    use relearn_core::{ImageUsageType, ModelStore, Outbox, Peer, PeerId, StructureError};

    struct Fixture {
        _dir: tempfile::TempDir,
        staging: Arc<StagingArea>,
        model: Arc<ModelStore>,
        broadcaster: Arc<Broadcaster>,
        structure: TrainerStructure,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(StagingArea::new(dir.path().join("temp_images")));
        staging.create_dirs().await.unwrap();
        let model = Arc::new(ModelStore::new(dir.path().join("training.pt")));
        let broadcaster = Arc::new(Broadcaster::new(model.clone()));
        let structure = trainer_structure(staging.clone(), broadcaster.clone());
        Fixture {
            _dir: dir,
            staging,
            model,
            broadcaster,
            structure,
        }
    }

    async fn connect(
        structure: &TrainerStructure,
        role: Role,
    ) -> (PeerId, Outbox<TrainerMessage>) {
        let (peer, rx) = Peer::channel(PeerId::new(), role);
        let id = peer.id();
        structure.connect(peer, None).await.unwrap();
        (id, rx)
    }

    fn announcement(usage: ImageUsageType) -> TrainerMessage {
        TrainerMessage::AddImageAnnouncement {
            image_bytes: b"img".to_vec(),
            image_extension: ".jpg".into(),
            annotation_bytes: b"0 0.5 0.5 0.1 0.1".to_vec(),
            image_usage_type: usage,
        }
    }

    #[tokio::test]
    async fn image_source_upload_is_staged() {
        let fx = fixture().await;
        let (source, _rx) = connect(&fx.structure, Role::ImageSource).await;
        fx.structure
            .dispatch(source, announcement(ImageUsageType::Training))
            .await
            .unwrap();

        let staged = fx.staging.drain();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].usage, ImageUsageType::Training);
        assert!(staged[0].image_path.exists());
    }

    #[tokio::test]
    async fn detect_usage_upload_fails_without_staging() {
        let fx = fixture().await;
        let (source, _rx) = connect(&fx.structure, Role::ImageSource).await;
        let err = fx
            .structure
            .dispatch(source, announcement(ImageUsageType::Detect))
            .await
            .unwrap_err();
        assert!(matches!(err, StructureError::Handler { .. }));
        assert_eq!(fx.staging.available_len(), 0);
    }

    #[tokio::test]
    async fn detector_upload_gets_trainer_error() {
        let fx = fixture().await;
        let (detector, mut rx) = connect(&fx.structure, Role::Detector).await;
        let err = fx
            .structure
            .dispatch(detector, announcement(ImageUsageType::Training))
            .await
            .unwrap_err();
        assert!(matches!(err, StructureError::Transition { .. }));
        match rx.try_recv().unwrap().message {
            TrainerMessage::TrainerError {
                structure_state_name,
                ..
            } => assert_eq!(structure_state_name, "active"),
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(fx.staging.available_len(), 0);
    }

    #[tokio::test]
    async fn clients_are_rejected() {
        let fx = fixture().await;
        let (peer, _rx) = Peer::channel(PeerId::new(), Role::Client);
        let err = fx.structure.connect(peer, None).await.unwrap_err();
        assert!(matches!(err, StructureError::UnexpectedSource { .. }));
    }

    #[tokio::test]
    async fn detector_lifecycle_tracks_registry() {
        let fx = fixture().await;
        fx.model.replace(b"current").await.unwrap();

        let (detector, mut rx) = connect(&fx.structure, Role::Detector).await;
        assert_eq!(fx.broadcaster.detector_count().await, 1);
        match rx.try_recv().unwrap().message {
            TrainerMessage::UpdateModelBroadcast { model_bytes } => {
                assert_eq!(model_bytes, b"current")
            }
            other => panic!("unexpected message {other:?}"),
        }

        fx.structure.disconnect(detector).await;
        assert_eq!(fx.broadcaster.detector_count().await, 0);
    }
}
