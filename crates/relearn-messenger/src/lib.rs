//! WebSocket messenger.
//!
//! Delivers connect, message and disconnect events from WebSocket
//! connections to a [`Structure`], and writes whatever handlers queue on a
//! [`Peer`] back to the wire.
//!
//! Every listener serves exactly one role. The connecting side opens with a
//! [`Handshake`] frame naming its role (and an optional tag); a handshake for
//! any other role is refused.

use futures_util::{SinkExt, StreamExt};
use relearn_core::{
    Envelope, Handshake, MessengerError, Outbox, Peer, PeerId, Protocol, Role, Structure,
    StructureError, StructureState,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Largest accepted frame/message. Model broadcasts are tens of megabytes
/// once base64 encoded.
const MAX_MESSAGE_SIZE: usize = 512 << 20;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Messenger(#[from] MessengerError),

    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error("connection closed before handshake")]
    HandshakeMissing,

    #[error("no handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("listener for {expected} refused handshake from {actual}")]
    RoleMismatch { expected: Role, actual: Role },
}

/// Owns listeners and outbound connections; [`Messenger::stop`] closes them all.
pub struct Messenger {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new()
    }
}

impl Messenger {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Accept connections from peers of `role` on `addr`.
    ///
    /// Returns the bound address (useful with port 0).
    pub async fn listen<M, S>(
        &self,
        addr: SocketAddr,
        role: Role,
        structure: Arc<Structure<M, S>>,
    ) -> Result<SocketAddr, TransportError>
    where
        M: Protocol,
        S: StructureState,
    {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!(structure = structure.name(), %role, "Listening on ws://{}", local);

        let mut shutdown = self.shutdown.subscribe();
        let connection_shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, client_addr) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                tracing::warn!("Accept failed: {}", e);
                                continue;
                            }
                        };
                        let structure = structure.clone();
                        let shutdown = connection_shutdown.subscribe();
                        connections.spawn(async move {
                            if let Err(e) = accept_connection(stream, role, structure, shutdown).await {
                                tracing::warn!("Connection error from {}: {}", client_addr, e);
                            }
                        });
                    }
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                    _ = shutdown.changed() => break,
                }
            }
            drop(listener);
            while connections.join_next().await.is_some() {}
            tracing::debug!("listener on {} stopped", local);
        });
        self.track(task);
        Ok(local)
    }

    /// Open a connection to a peer of `remote_role` at `url`, introducing
    /// ourselves as `local_role`.
    ///
    /// Returns once the local structure has admitted the peer, so handlers can
    /// send to it immediately.
    pub async fn connect<M, S>(
        &self,
        url: &str,
        local_role: Role,
        remote_role: Role,
        tag: Option<serde_json::Value>,
        structure: Arc<Structure<M, S>>,
    ) -> Result<PeerId, TransportError>
    where
        M: Protocol,
        S: StructureState,
    {
        let (mut ws, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config()), false).await?;

        let handshake = Handshake {
            role: local_role,
            tag,
        };
        let text = serde_json::to_string(&handshake).map_err(MessengerError::from)?;
        ws.send(Message::Text(text.into())).await?;

        let (peer, outbox) = Peer::channel(PeerId::new(), remote_role);
        let peer_id = peer.id();
        if let Err(e) = structure.connect(peer, None).await {
            let _ = ws.close(None).await;
            return Err(e.into());
        }
        tracing::info!(structure = structure.name(), peer = %peer_id, "Connected to {} at {}", remote_role, url);

        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(run_connection(ws, peer_id, outbox, structure, shutdown));
        self.track(task);
        Ok(peer_id)
    }

    /// Close every listener and connection and wait for the owned tasks,
    /// accepted connections included.
    ///
    /// Messages already queued on a connection are written before it closes.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE))
}

async fn accept_connection<M, S>(
    stream: TcpStream,
    role: Role,
    structure: Arc<Structure<M, S>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError>
where
    M: Protocol,
    S: StructureState,
{
    let opening = async {
        let mut ws =
            tokio_tungstenite::accept_async_with_config(stream, Some(ws_config())).await?;
        let handshake = read_handshake(&mut ws).await?;
        Ok::<_, TransportError>((ws, handshake))
    };
    let (mut ws, handshake) = tokio::select! {
        opened = tokio::time::timeout(HANDSHAKE_TIMEOUT, opening) => opened
            .map_err(|_| TransportError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??,
        // Not admitted yet, so there is nothing to flush.
        () = stopped(&mut shutdown) => return Ok(()),
    };
    if handshake.role != role {
        let _ = ws.close(None).await;
        return Err(TransportError::RoleMismatch {
            expected: role,
            actual: handshake.role,
        });
    }

    let (peer, outbox) = Peer::channel(PeerId::new(), role);
    let peer_id = peer.id();
    if let Err(e) = structure.connect(peer, handshake.tag).await {
        let _ = ws.close(None).await;
        return Err(e.into());
    }
    tracing::info!(structure = structure.name(), peer = %peer_id, %role, "Peer connected");

    run_connection(ws, peer_id, outbox, structure, shutdown).await;
    Ok(())
}

/// Resolves once the messenger is stopping, including if it already is.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn read_handshake<T>(ws: &mut WebSocketStream<T>) -> Result<Handshake, TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = ws.next().await.ok_or(TransportError::HandshakeMissing)??;
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|e| TransportError::Messenger(MessengerError::Codec(e)));
            }
            Message::Close(_) => return Err(TransportError::HandshakeMissing),
            _ => {}
        }
    }
}

/// Pump one connection until either side closes or the messenger stops.
///
/// Inbound messages are dispatched one at a time, in arrival order.
async fn run_connection<T, M, S>(
    ws: WebSocketStream<T>,
    peer_id: PeerId,
    mut outbox: Outbox<M>,
    structure: Arc<Structure<M, S>>,
    mut shutdown: watch::Receiver<bool>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    M: Protocol,
    S: StructureState,
{
    let (mut sink, mut stream) = ws.split();

    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            tracing::debug!(peer = %peer_id, "WebSocket error: {}", e);
                            break;
                        }
                        None => break,
                    };
                    match frame {
                        Message::Text(text) => {
                            let envelope: Envelope<M> = match serde_json::from_str(&text) {
                                Ok(envelope) => envelope,
                                Err(e) => {
                                    tracing::warn!(peer = %peer_id, "Invalid message: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = structure.dispatch(peer_id, envelope.message).await {
                                tracing::warn!(peer = %peer_id, "{}", e);
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                outbound = outbox.recv() => {
                    let Some(envelope) = outbound else { break };
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(peer = %peer_id, "Failed to encode message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        tracing::debug!(peer = %peer_id, "Send failed: {}", e);
                        break;
                    }
                }

                _ = shutdown.changed() => {
                    // Flush what handlers already queued, then close.
                    while let Ok(envelope) = outbox.try_recv() {
                        let Ok(text) = serde_json::to_string(&envelope) else { continue };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    // Senders observe the closed connection before the structure forgets the peer.
    drop(outbox);
    structure.disconnect(peer_id).await;
    tracing::info!(structure = structure.name(), peer = %peer_id, "Connection closed");
}
