//! Peer state machine.
//!
//! A [`Structure`] owns a transition table keyed by
//! `(message kind, source role, current state)` and the current state of every
//! connected peer. Anything not in the table is a protocol error: the sender
//! gets the catalog's structural-error message (if the message type defines
//! one) and the connection carries on.
//!
//! Connections are admitted per role: a role with no connect handler is
//! rejected as an unexpected source.

use crate::error::{HandlerError, StructureError};
use crate::message::Protocol;
use crate::peer::{Peer, PeerId, Role};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A state value of a peer state machine.
pub trait StructureState: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> StructureState for T where T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{}

/// An inbound message together with the connection it arrived on.
pub struct Influence<M> {
    pub peer: Peer<M>,
    pub message: M,
}

type TransitionHandler<M> =
    Arc<dyn Fn(Influence<M>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;
type ConnectHandler<M> = Arc<
    dyn Fn(Peer<M>, Option<serde_json::Value>) -> BoxFuture<'static, Result<(), HandlerError>>
        + Send
        + Sync,
>;
type DisconnectHandler = Arc<dyn Fn(PeerId) -> BoxFuture<'static, ()> + Send + Sync>;

struct Transition<M, S> {
    end_state: S,
    handler: TransitionHandler<M>,
}

struct PeerSlot<M, S> {
    peer: Peer<M>,
    state: S,
}

pub struct Structure<M: Protocol, S: StructureState> {
    name: &'static str,
    initial_state: S,
    transitions: HashMap<(M::Kind, Role, S), Transition<M, S>>,
    connect_handlers: HashMap<Role, ConnectHandler<M>>,
    disconnect_handlers: HashMap<Role, DisconnectHandler>,
    peers: RwLock<HashMap<PeerId, PeerSlot<M, S>>>,
}

impl<M: Protocol, S: StructureState> Structure<M, S> {
    pub fn new(name: &'static str, initial_state: S) -> Self {
        Self {
            name,
            initial_state,
            transitions: HashMap::new(),
            connect_handlers: HashMap::new(),
            disconnect_handlers: HashMap::new(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register the handler for `kind` arriving from `role` while in `start_state`.
    ///
    /// The peer moves to `end_state` once the handler returns `Ok`.
    pub fn add_transition<F, Fut>(
        &mut self,
        kind: M::Kind,
        role: Role,
        start_state: S,
        end_state: S,
        handler: F,
    ) where
        F: Fn(Influence<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: TransitionHandler<M> = Arc::new(move |influence| handler(influence).boxed());
        let replaced = self.transitions.insert(
            (kind, role, start_state),
            Transition { end_state, handler },
        );
        if replaced.is_some() {
            tracing::warn!(
                structure = self.name,
                "transition for {} from {} in {} registered twice",
                kind,
                role,
                start_state
            );
        }
    }

    /// Admit connections from `role`, running `handler` when one arrives.
    pub fn on_connect<F, Fut>(&mut self, role: Role, handler: F)
    where
        F: Fn(Peer<M>, Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: ConnectHandler<M> = Arc::new(move |peer, tag| handler(peer, tag).boxed());
        self.connect_handlers.insert(role, handler);
    }

    /// Run `handler` after a peer of `role` has been removed.
    pub fn on_disconnect<F, Fut>(&mut self, role: Role, handler: F)
    where
        F: Fn(PeerId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: DisconnectHandler = Arc::new(move |peer_id| handler(peer_id).boxed());
        self.disconnect_handlers.insert(role, handler);
    }

    /// Whether connections from `role` are admitted at all.
    pub fn accepts(&self, role: Role) -> bool {
        self.connect_handlers.contains_key(&role)
    }

    /// Admit a new connection or reject it as an unexpected source.
    pub async fn connect(
        &self,
        peer: Peer<M>,
        tag: Option<serde_json::Value>,
    ) -> Result<(), StructureError> {
        let role = peer.role();
        let Some(handler) = self.connect_handlers.get(&role) else {
            return Err(StructureError::UnexpectedSource {
                structure: self.name,
                role,
            });
        };

        let outcome = AssertUnwindSafe(handler(peer.clone(), tag))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(StructureError::Connect {
                    structure: self.name,
                    role,
                    source,
                });
            }
            Err(payload) => {
                return Err(StructureError::HandlerPanicked {
                    structure: self.name,
                    kind: "connect".to_string(),
                    reason: panic_reason(payload),
                });
            }
        }

        tracing::debug!(structure = self.name, peer = %peer.id(), %role, "peer connected");
        self.peers.write().await.insert(
            peer.id(),
            PeerSlot {
                peer,
                state: self.initial_state,
            },
        );
        Ok(())
    }

    /// Route one inbound message through the transition table.
    pub async fn dispatch(&self, peer_id: PeerId, message: M) -> Result<(), StructureError> {
        let (peer, state) = {
            let peers = self.peers.read().await;
            let slot = peers.get(&peer_id).ok_or(StructureError::UnknownPeer {
                structure: self.name,
                peer: peer_id,
            })?;
            (slot.peer.clone(), slot.state)
        };

        let kind = message.kind();
        let role = peer.role();
        let Some(transition) = self.transitions.get(&(kind, role, state)) else {
            let state_name = state.to_string();
            if let Some(reply) = message.structural_error(&state_name)
                && let Err(e) = peer.send(reply)
            {
                tracing::debug!(structure = self.name, peer = %peer_id, "could not report structural error: {}", e);
            }
            return Err(StructureError::Transition {
                structure: self.name,
                kind: kind.to_string(),
                role,
                state: state_name,
                message_json: serde_json::to_string(&message).unwrap_or_default(),
            });
        };

        let outcome = AssertUnwindSafe((transition.handler)(Influence { peer, message }))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {
                if transition.end_state != state
                    && let Some(slot) = self.peers.write().await.get_mut(&peer_id)
                {
                    slot.state = transition.end_state;
                }
                Ok(())
            }
            Ok(Err(source)) => Err(StructureError::Handler {
                structure: self.name,
                kind: kind.to_string(),
                source,
            }),
            Err(payload) => Err(StructureError::HandlerPanicked {
                structure: self.name,
                kind: kind.to_string(),
                reason: panic_reason(payload),
            }),
        }
    }

    /// Forget a peer after the transport reported it gone.
    pub async fn disconnect(&self, peer_id: PeerId) {
        let removed = self.peers.write().await.remove(&peer_id);
        let Some(slot) = removed else {
            return;
        };
        let role = slot.peer.role();
        tracing::debug!(structure = self.name, peer = %peer_id, %role, "peer disconnected");
        if let Some(handler) = self.disconnect_handlers.get(&role)
            && AssertUnwindSafe(handler(peer_id)).catch_unwind().await.is_err()
        {
            tracing::warn!(structure = self.name, peer = %peer_id, "disconnect handler panicked");
        }
    }

    /// Current state of a connected peer.
    pub async fn state(&self, peer_id: PeerId) -> Option<S> {
        self.peers.read().await.get(&peer_id).map(|slot| slot.state)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
