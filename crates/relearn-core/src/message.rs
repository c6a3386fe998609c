//! Wire envelope and the contract every message catalog implements.
//!
//! Messages travel as JSON objects: the envelope's `destination` sits next to
//! the catalog's `type` tag and payload fields.

use crate::peer::{PeerId, Role};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// A message addressed to one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    /// The connection the message is written to.
    pub destination: PeerId,
    #[serde(flatten)]
    pub message: M,
}

impl<M> Envelope<M> {
    pub fn new(destination: PeerId, message: M) -> Self {
        Self {
            destination,
            message,
        }
    }
}

/// First frame sent by the connecting side of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Role of the side that opened the connection.
    pub role: Role,
    /// Opaque connection tag handed to `on_connect`.
    #[serde(default)]
    pub tag: Option<serde_json::Value>,
}

/// A message catalog shared by one pair of services.
pub trait Protocol: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Payload-free discriminant used as the transition-table key.
    type Kind: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;

    /// The message returned to the sender when no transition accepts `self`
    /// in `state`. Error messages return `None`.
    fn structural_error(&self, state: &str) -> Option<Self>;
}

/// Base64 (standard alphabet) encoding for binary payload fields.
pub(crate) mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
