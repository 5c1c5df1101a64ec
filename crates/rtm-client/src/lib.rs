//! RTM client -- real-time messaging over a shared gateway connection.
//!
//! Re-exports the public modules so integration tests and the CLI can reach
//! connection, session, conversation and collaborator types.

pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod http;
pub mod message;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod session;
pub mod transport;

mod dispatch;
mod lifecycle;
mod lookup;

pub use config::ClientConfig;
pub use connection::{ConnectionEvent, ConnectionHandle, Environment};
pub use conversation::{Conversation, ConversationKind, Operation};
pub use error::{DisconnectCause, Result, RtmError};
pub use message::{Message, MessageContent, MessageStatus, MessageType, TypedMessage};
pub use registry::ConnectionRegistry;
pub use session::{
    ConversationEvent, CreateKind, CreateOptions, MessageQuery, OpenMode, QueryPolicy, SendOptions,
    Session, SessionEvent, SessionState,
};

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
