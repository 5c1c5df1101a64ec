//! RTM Protocol -- command types, protocol parameters, codecs.
//!
//! Many logical peers share one gateway connection per
//! (application, protocol variant). Commands carry an optional correlation
//! index; replies echo it back.

pub mod codec;
pub mod command;
pub mod params;

use serde::{Deserialize, Serialize};

pub use codec::{CommandCodec, Frame, FrameCodec, JsonCommandCodec};
pub use command::*;
pub use params::{ProtocolParams, DEFAULT_PARAMS};

/// Maximum serialized command size (sourced from the default parameter set).
pub const MAX_COMMAND_BYTES: usize = DEFAULT_PARAMS.max_command_bytes;

/// Logical peer identifier (the client id).
pub type PeerId = String;

/// Application identifier.
pub type AppId = String;

/// Command protocol variant negotiated with the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    Protobuf1,
    #[default]
    Protobuf3,
}

impl ProtocolVariant {
    /// Subprotocol string offered when the socket connects.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            ProtocolVariant::Protobuf1 => "lc.protobuf2.1",
            ProtocolVariant::Protobuf3 => "lc.protobuf2.3",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("unknown frame tag: {0}")]
    UnknownFrame(u8),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
