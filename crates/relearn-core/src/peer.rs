//! Peer identity and outbound handles.
//!
//! Every connection gets a fresh [`PeerId`] and a fixed [`Role`]. The
//! [`Peer`] handle is how handlers talk back to a connection: sending never
//! blocks, it either queues the message for the connection's writer task or
//! reports that the connection is gone or too far behind.

use crate::error::MessengerError;
use crate::message::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Messages a connection may have waiting for its writer. Further sends fail
/// with [`MessengerError::OutboxFull`] until the writer catches up.
pub const OUTBOX_CAPACITY: usize = 16;

/// Receiving end of a peer's outbox, drained by the connection's writer.
pub type Outbox<M> = mpsc::Receiver<Envelope<M>>;

/// Identifier of one logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Allocate a fresh connection identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Logical kind of a connected peer. Fixed for the lifetime of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Detector,
    Trainer,
    ImageSource,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Detector => "detector",
            Role::Trainer => "trainer",
            Role::ImageSource => "image_source",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Role::Client),
            "detector" => Ok(Role::Detector),
            "trainer" => Ok(Role::Trainer),
            "image_source" => Ok(Role::ImageSource),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

/// Error parsing a role name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct RoleParseError(String);

/// Outbound handle for one connection.
///
/// Cloning is cheap; all clones feed the same writer task.
#[derive(Debug)]
pub struct Peer<M> {
    id: PeerId,
    role: Role,
    outbox: mpsc::Sender<Envelope<M>>,
}

impl<M> Clone for Peer<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            role: self.role,
            outbox: self.outbox.clone(),
        }
    }
}

impl<M> Peer<M> {
    /// Create a handle plus the receiving end the transport drains.
    pub fn channel(id: PeerId, role: Role) -> (Self, Outbox<M>) {
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
        (Self { id, role, outbox }, rx)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue a message for this peer.
    ///
    /// Fails with [`MessengerError::ConnectionClosed`] once the connection's
    /// writer has gone away, and with [`MessengerError::OutboxFull`] while
    /// [`OUTBOX_CAPACITY`] messages are already waiting.
    pub fn send(&self, message: M) -> Result<(), MessengerError> {
        self.outbox
            .try_send(Envelope::new(self.id, message))
            .map_err(|e| match e {
                TrySendError::Full(_) => MessengerError::OutboxFull(self.id),
                TrySendError::Closed(_) => MessengerError::ConnectionClosed(self.id),
            })
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrip() {
        for role in [Role::Client, Role::Detector, Role::Trainer, Role::ImageSource] {
            let parsed: Role = role.to_string().parse().unwrap();
            assert_eq!(parsed, role);
        }
        assert!("gateway".parse::<Role>().is_err());
    }

    #[test]
    fn role_wire_names() {
        assert_eq!(
            serde_json::to_string(&Role::ImageSource).unwrap(),
            "\"image_source\""
        );
    }

    #[test]
    fn send_after_receiver_dropped_reports_closed() {
        let id = PeerId::new();
        let (peer, rx) = Peer::<u32>::channel(id, Role::Detector);
        peer.send(1).unwrap();
        drop(rx);
        assert!(peer.is_closed());
        match peer.send(2) {
            Err(MessengerError::ConnectionClosed(closed)) => assert_eq!(closed, id),
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[test]
    fn stalled_writer_fills_outbox() {
        let id = PeerId::new();
        let (peer, mut rx) = Peer::channel(id, Role::Detector);
        for i in 0..OUTBOX_CAPACITY {
            peer.send(i).unwrap();
        }
        assert!(matches!(peer.send(99), Err(MessengerError::OutboxFull(full)) if full == id));
        assert!(!peer.is_closed());

        assert_eq!(rx.try_recv().unwrap().message, 0);
        peer.send(100).unwrap();
    }

    #[test]
    fn envelope_carries_destination() {
        let id = PeerId::new();
        let (peer, mut rx) = Peer::channel(id, Role::Client);
        peer.send("hello").unwrap();
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.destination, id);
        assert_eq!(envelope.message, "hello");
    }
}
