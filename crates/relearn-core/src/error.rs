use crate::peer::{PeerId, Role};
use std::path::PathBuf;
use thiserror::Error;

/// Error returned by a transition or connect handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure sending to, or decoding from, a connection.
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("connection to peer {0} is closed")]
    ConnectionClosed(PeerId),

    /// The connection is open but not keeping up with its outbox.
    #[error("outbox for peer {0} is full")]
    OutboxFull(PeerId),

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failure raised by a peer state machine.
#[derive(Debug, Error)]
pub enum StructureError {
    /// No transition is registered for the (message type, role, state) triple.
    #[error("{structure}: no transition for {kind} from {role} in state {state}")]
    Transition {
        structure: &'static str,
        kind: String,
        role: Role,
        state: String,
        message_json: String,
    },

    #[error("{structure}: unexpected connection from source {role}")]
    UnexpectedSource {
        structure: &'static str,
        role: Role,
    },

    #[error("{structure}: message from unknown peer {peer}")]
    UnknownPeer {
        structure: &'static str,
        peer: PeerId,
    },

    #[error("{structure}: {kind} handler failed: {source}")]
    Handler {
        structure: &'static str,
        kind: String,
        #[source]
        source: HandlerError,
    },

    #[error("{structure}: {kind} handler panicked: {reason}")]
    HandlerPanicked {
        structure: &'static str,
        kind: String,
        reason: String,
    },

    #[error("{structure}: connect handler for {role} failed: {source}")]
    Connect {
        structure: &'static str,
        role: Role,
        #[source]
        source: HandlerError,
    },
}

/// Failure running an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure reading or replacing the model file.
#[derive(Debug, Error)]
pub enum ModelStoreError {
    #[error("failed to read model {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write model {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ModelStoreError {
    pub fn io_error(&self) -> &std::io::Error {
        match self {
            ModelStoreError::Read { source, .. } | ModelStoreError::Write { source, .. } => source,
        }
    }
}
