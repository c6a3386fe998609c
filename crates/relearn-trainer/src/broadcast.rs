//! Fan-out of trained models to connected detectors.

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use relearn_core::{MessengerError, ModelStore, ModelStoreError, Peer, PeerId, TrainerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Somewhere a freshly trained model is delivered.
pub trait ModelPublisher: Send + Sync {
    fn publish<'a>(&'a self, model: &'a [u8]) -> BoxFuture<'a, ()>;
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Detectors found disconnected and removed from the registry.
    pub disconnected: Vec<PeerId>,
    pub failed: usize,
}

/// Registry of connected detectors.
///
/// Registration and broadcast both run under the registry lock, and the
/// trainer writes the model file before broadcasting, so a detector either
/// reads the new model when it registers or receives it in the broadcast.
pub struct Broadcaster {
    model: Arc<ModelStore>,
    detectors: Mutex<HashMap<PeerId, Peer<TrainerMessage>>>,
}

impl Broadcaster {
    pub fn new(model: Arc<ModelStore>) -> Self {
        Self {
            model,
            detectors: Mutex::new(HashMap::new()),
        }
    }

    /// Add a detector, sending it the current model first if one exists.
    pub async fn register(&self, peer: Peer<TrainerMessage>) -> Result<(), ModelStoreError> {
        let mut detectors = self.detectors.lock().await;
        if let Some(model_bytes) = self.model.read().await? {
            let len = model_bytes.len();
            if let Err(e) = peer.send(TrainerMessage::UpdateModelBroadcast { model_bytes }) {
                tracing::warn!(peer = %peer.id(), "Failed to send current model: {}", e);
                return Ok(());
            }
            tracing::info!(peer = %peer.id(), bytes = len, "Sent current model to detector");
        }
        detectors.insert(peer.id(), peer);
        Ok(())
    }

    pub async fn deregister(&self, peer_id: PeerId) -> bool {
        self.detectors.lock().await.remove(&peer_id).is_some()
    }

    pub async fn detector_count(&self) -> usize {
        self.detectors.lock().await.len()
    }

    /// Send `model` to every registered detector.
    ///
    /// Disconnected detectors are dropped from the registry; any other send
    /// failure is logged and skipped. A detector that has stopped reading
    /// holds at most [`OUTBOX_CAPACITY`](relearn_core::OUTBOX_CAPACITY)
    /// queued models; later broadcasts to it fail until it catches up.
    pub async fn broadcast(&self, model: &[u8]) -> BroadcastReport {
        let mut detectors = self.detectors.lock().await;
        let message = TrainerMessage::UpdateModelBroadcast {
            model_bytes: model.to_vec(),
        };

        let mut report = BroadcastReport::default();
        for (peer_id, peer) in detectors.iter() {
            match peer.send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(MessengerError::ConnectionClosed(_)) => {
                    tracing::info!(peer = %peer_id, "Detector disconnected");
                    report.disconnected.push(*peer_id);
                }
                Err(MessengerError::OutboxFull(_)) => {
                    tracing::warn!(peer = %peer_id, "Detector is not keeping up, model not queued");
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_id, "Failed to send model: {}", e);
                    report.failed += 1;
                }
            }
        }
        for peer_id in &report.disconnected {
            detectors.remove(peer_id);
        }

        tracing::info!(
            delivered = report.delivered,
            disconnected = report.disconnected.len(),
            failed = report.failed,
            "Broadcast model ({} bytes)",
            model.len()
        );
        report
    }
}

impl ModelPublisher for Broadcaster {
    fn publish<'a>(&'a self, model: &'a [u8]) -> BoxFuture<'a, ()> {
        self.broadcast(model).map(|_| ()).boxed()
    }
}

impl ModelPublisher for ModelStore {
    fn publish<'a>(&'a self, model: &'a [u8]) -> BoxFuture<'a, ()> {
        async move {
            match self.replace(model).await {
                Ok(()) => tracing::info!(path = %self.path().display(), "Model updated"),
                Err(e) => tracing::warn!("Failed to store model: {}", e),
            }
        }
        .boxed()
    }
}
