//! Core types for relearn.
//!
//! This crate provides the pieces every service shares: the message catalogs,
//! the per-peer state machine that routes inbound messages to handlers, the
//! guarded model file, and the contract with the external training and
//! detection tools. Transports live in `relearn-messenger`.

pub mod artifacts;
mod catalog;
pub mod command;
mod error;
mod message;
mod model;
mod peer;
pub mod structure;

pub use catalog::{
    ANNOTATION_EXTENSION, DetectedLabel, DetectorMessage, DetectorMessageKind, ImageUsageType,
    InvalidExtension, TrainerMessage, TrainerMessageKind, normalize_extension,
};
pub use error::{CommandError, HandlerError, MessengerError, ModelStoreError, StructureError};
pub use message::{Envelope, Handshake, Protocol};
pub use model::{ModelLease, ModelStore};
pub use peer::{OUTBOX_CAPACITY, Outbox, Peer, PeerId, Role, RoleParseError};
pub use structure::{Influence, Structure, StructureState};

/// The single state every structure in this system lives in.
///
/// The state machine supports more; no role needs them yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActiveState {
    Active,
}

impl std::fmt::Display for ActiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("active")
    }
}
