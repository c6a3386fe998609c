//! Client side of the detector link.
//!
//! Every request gets a fresh image id and a one-shot slot in the pending
//! table. The `detect_response` handler fills the slot with the matching id.
//! Losing the detector drops every slot, which fails the waiting callers.

use crate::error::DetectionError;
use relearn_core::{
    ActiveState, DetectedLabel, DetectorMessage, DetectorMessageKind, HandlerError, Influence,
    MessengerError, Peer, Role, Structure,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

enum Reply {
    Labels(Vec<DetectedLabel>),
    Rejected { state: String },
}

#[derive(Default)]
struct ClientState {
    detector: Option<Peer<DetectorMessage>>,
    pending: HashMap<Uuid, oneshot::Sender<Reply>>,
}

type Shared = Arc<Mutex<ClientState>>;

fn lock(shared: &Shared) -> MutexGuard<'_, ClientState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, thiserror::Error)]
#[error("response for unknown request {0}")]
struct UnknownRequest(Uuid);

/// Removes a pending slot when the waiting call finishes or is cancelled.
struct PendingSlot<'a> {
    shared: &'a Shared,
    image_id: Uuid,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.shared).pending.remove(&self.image_id);
    }
}

pub struct DetectionClient {
    structure: Arc<Structure<DetectorMessage, ActiveState>>,
    shared: Shared,
}

impl Default for DetectionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionClient {
    pub fn new() -> Self {
        let shared: Shared = Arc::default();
        let mut structure = Structure::new("client", ActiveState::Active);

        let state = shared.clone();
        structure.on_connect(Role::Detector, move |peer, _tag| {
            tracing::info!(peer = %peer.id(), "Connected to detector");
            lock(&state).detector = Some(peer);
            async { Ok(()) }
        });

        let state = shared.clone();
        structure.on_disconnect(Role::Detector, move |peer_id| {
            let mut state = lock(&state);
            if state.detector.as_ref().is_some_and(|peer| peer.id() == peer_id) {
                state.detector = None;
                let failed = state.pending.len();
                state.pending.clear();
                tracing::warn!(peer = %peer_id, failed, "Detector disconnected");
            }
            async {}
        });

        let state = shared.clone();
        structure.add_transition(
            DetectorMessageKind::DetectResponse,
            Role::Detector,
            ActiveState::Active,
            ActiveState::Active,
            move |influence: Influence<DetectorMessage>| {
                let result = match influence.message {
                    DetectorMessage::DetectResponse {
                        image_id,
                        detected_labels,
                    } => match lock(&state).pending.remove(&image_id) {
                        Some(slot) => {
                            let _ = slot.send(Reply::Labels(detected_labels));
                            Ok(())
                        }
                        None => Err(HandlerError::from(UnknownRequest(image_id))),
                    },
                    _ => Ok(()),
                };
                async move { result }
            },
        );

        let state = shared.clone();
        structure.add_transition(
            DetectorMessageKind::DetectorError,
            Role::Detector,
            ActiveState::Active,
            ActiveState::Active,
            move |influence: Influence<DetectorMessage>| {
                if let DetectorMessage::DetectorError {
                    structure_state_name,
                    original_message_json,
                } = influence.message
                {
                    tracing::warn!(state = %structure_state_name, "Detector rejected message: {}", original_message_json);
                    if let Ok(DetectorMessage::DetectRequest { image_id, .. }) =
                        serde_json::from_str::<DetectorMessage>(&original_message_json)
                        && let Some(slot) = lock(&state).pending.remove(&image_id)
                    {
                        let _ = slot.send(Reply::Rejected {
                            state: structure_state_name,
                        });
                    }
                }
                async { Ok(()) }
            },
        );

        Self {
            structure: Arc::new(structure),
            shared,
        }
    }

    /// The structure to connect to a detector (as [`Role::Client`]).
    pub fn structure(&self) -> Arc<Structure<DetectorMessage, ActiveState>> {
        self.structure.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared)
            .detector
            .as_ref()
            .is_some_and(|peer| !peer.is_closed())
    }

    /// Number of requests waiting for a response.
    pub fn pending(&self) -> usize {
        lock(&self.shared).pending.len()
    }

    /// Ask the detector for the labels in one image and wait for the answer.
    ///
    /// Fails with [`DetectionError::DetectorDisconnected`] if the detector is
    /// already gone or goes away first. There is no timeout; see
    /// [`request_detection_timeout`](Self::request_detection_timeout).
    pub async fn request_detection(
        &self,
        image_bytes: Vec<u8>,
        image_extension: &str,
    ) -> Result<Vec<DetectedLabel>, DetectionError> {
        let image_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let detector = {
            let mut state = lock(&self.shared);
            let detector = state.detector.clone().ok_or(DetectionError::NotConnected)?;
            state.pending.insert(image_id, tx);
            detector
        };
        let _slot = PendingSlot {
            shared: &self.shared,
            image_id,
        };

        detector
            .send(DetectorMessage::DetectRequest {
                image_bytes,
                image_extension: image_extension.to_string(),
                image_id,
            })
            .map_err(|e| match e {
                MessengerError::ConnectionClosed(_) => DetectionError::DetectorDisconnected,
                e => DetectionError::Send(e),
            })?;
        tracing::debug!(image = %image_id, "detection requested");

        match rx.await {
            Ok(Reply::Labels(labels)) => Ok(labels),
            Ok(Reply::Rejected { state }) => Err(DetectionError::Rejected { state }),
            Err(_) => Err(DetectionError::DetectorDisconnected),
        }
    }

    pub async fn request_detection_timeout(
        &self,
        image_bytes: Vec<u8>,
        image_extension: &str,
        timeout: Duration,
    ) -> Result<Vec<DetectedLabel>, DetectionError> {
        tokio::time::timeout(timeout, self.request_detection(image_bytes, image_extension))
            .await
            .map_err(|_| DetectionError::TimedOut(timeout))?
    }

    /// Detect objects in an image file, bounded by `timeout`.
    pub async fn detect_file(
        &self,
        image_path: &Path,
        timeout: Duration,
    ) -> Result<Vec<DetectedLabel>, DetectionError> {
        let extension = image_path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .ok_or_else(|| DetectionError::MissingExtension(image_path.to_path_buf()))?;
        let image_bytes =
            tokio::fs::read(image_path)
                .await
                .map_err(|source| DetectionError::Read {
                    path: image_path.to_path_buf(),
                    source,
                })?;
        self.request_detection_timeout(image_bytes, &extension, timeout)
            .await
    }
}
