//! Client error taxonomy. Every variant maps to a `{code, reason}` pair.

use rtm_protocol::{Command, CommandBody};

pub const CODE_COMMAND_TIMEOUT: i32 = 9000;
pub const CODE_CONNECTION_LOST: i32 = 9001;
pub const CODE_CLIENT_NOT_OPEN: i32 = 9002;
pub const CODE_COMMAND_INVALID: i32 = 9003;
pub const CODE_COMMAND_TOO_LARGE: i32 = 9008;
pub const CODE_CONVERSATION_NOT_FOUND: i32 = 9100;
pub const CODE_STORAGE: i32 = 9972;
pub const CODE_NOT_FOUND: i32 = 9973;
pub const CODE_INVALID_ARGUMENT: i32 = 9974;
pub const CODE_MALFORMED_DATA: i32 = 9975;
pub const CODE_INCONSISTENCY: i32 = 9976;
pub const CODE_HTTP: i32 = 9977;

/// Server code: another device opened with the same tag.
pub const SERVER_SESSION_CONFLICT: i32 = 4111;
/// Server code: the session token is no longer accepted.
pub const SERVER_SESSION_TOKEN_EXPIRED: i32 = 4112;

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    Socket,
    AppInBackground,
    NetworkUnavailable,
    NetworkChanged,
    ClosedByLocal,
    ClosedByRemote,
}

impl DisconnectCause {
    fn reason(&self) -> &'static str {
        match self {
            DisconnectCause::Socket => "connection lost",
            DisconnectCause::AppInBackground => "connection lost: application in background",
            DisconnectCause::NetworkUnavailable => "connection lost: network unavailable",
            DisconnectCause::NetworkChanged => "connection lost: network changed",
            DisconnectCause::ClosedByLocal => "connection closed by local peer",
            DisconnectCause::ClosedByRemote => "connection closed by remote peer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RtmError {
    #[error("{}", .0.reason())]
    ConnectionLost(DisconnectCause),
    #[error("command timed out")]
    CommandTimeout,
    #[error("client not open")]
    ClientNotOpen,
    #[error("command invalid: {0}")]
    CommandInvalid(String),
    #[error("command too large: {size} bytes (max {max})")]
    CommandTooLarge { size: usize, max: usize },
    #[error("malformed data: {0}")]
    MalformedData(String),
    #[error("server error {code}: {}", .reason.as_deref().unwrap_or("unknown"))]
    Server {
        code: i32,
        reason: Option<String>,
        app_code: Option<i32>,
        app_message: Option<String>,
        detail: Option<String>,
    },
    #[error("session state conflict: {0}")]
    SessionStateConflict(String),
    #[error("local storage not opened")]
    StorageUnavailable,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("http error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, RtmError>;

impl RtmError {
    pub fn connection_lost() -> Self {
        RtmError::ConnectionLost(DisconnectCause::Socket)
    }

    pub fn code(&self) -> i32 {
        match self {
            RtmError::ConnectionLost(_) => CODE_CONNECTION_LOST,
            RtmError::CommandTimeout => CODE_COMMAND_TIMEOUT,
            RtmError::ClientNotOpen => CODE_CLIENT_NOT_OPEN,
            RtmError::CommandInvalid(_) => CODE_COMMAND_INVALID,
            RtmError::CommandTooLarge { .. } => CODE_COMMAND_TOO_LARGE,
            RtmError::MalformedData(_) => CODE_MALFORMED_DATA,
            RtmError::Server { code, .. } => *code,
            RtmError::SessionStateConflict(_) => CODE_INCONSISTENCY,
            RtmError::StorageUnavailable | RtmError::Storage(_) => CODE_STORAGE,
            RtmError::InvalidArgument(_) => CODE_INVALID_ARGUMENT,
            RtmError::ConversationNotFound => CODE_CONVERSATION_NOT_FOUND,
            RtmError::NotFound(_) => CODE_NOT_FOUND,
            RtmError::Http(_) => CODE_HTTP,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            RtmError::Server {
                reason: Some(r), ..
            } => r.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_session_token_expired(&self) -> bool {
        matches!(self, RtmError::Server { code, .. } if *code == SERVER_SESSION_TOKEN_EXPIRED)
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, RtmError::ConnectionLost(_))
    }

    /// Server error carried by a reply, if any: an `error` command, a
    /// session `closed`, or an ack with a code.
    pub fn from_reply(cmd: &Command) -> Option<RtmError> {
        match &cmd.body {
            CommandBody::Error(e) => Some(RtmError::Server {
                code: e.code,
                reason: e.reason.clone(),
                app_code: e.app_code,
                app_message: e.app_msg.clone(),
                detail: e.detail.clone(),
            }),
            CommandBody::Session(s) => s.code.map(|code| RtmError::Server {
                code,
                reason: s.reason.clone(),
                app_code: None,
                app_message: None,
                detail: s.detail.clone(),
            }),
            CommandBody::Ack(a) => a.code.map(|code| RtmError::Server {
                code,
                reason: a.reason.clone(),
                app_code: a.app_code,
                app_message: a.app_msg.clone(),
                detail: None,
            }),
            _ => None,
        }
    }
}

impl From<rtm_storage::StorageError> for RtmError {
    fn from(e: rtm_storage::StorageError) -> Self {
        RtmError::Storage(e.to_string())
    }
}

impl From<rtm_protocol::ProtocolError> for RtmError {
    fn from(e: rtm_protocol::ProtocolError) -> Self {
        RtmError::CommandInvalid(e.to_string())
    }
}

impl From<serde_json::Error> for RtmError {
    fn from(e: serde_json::Error) -> Self {
        RtmError::MalformedData(e.to_string())
    }
}
