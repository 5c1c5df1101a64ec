//! Command types exchanged with the push gateway.
//!
//! A command is a tagged union: the `body` carries the kind discriminant and
//! its kind-specific sub-message. `i` pairs an outbound command with its reply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminant of a [`CommandBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Session,
    Conv,
    Direct,
    Ack,
    Rcp,
    Read,
    Patch,
    Unread,
    Logs,
    Error,
    Goaway,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Session => "session",
            CommandKind::Conv => "conv",
            CommandKind::Direct => "direct",
            CommandKind::Ack => "ack",
            CommandKind::Rcp => "rcp",
            CommandKind::Read => "read",
            CommandKind::Patch => "patch",
            CommandKind::Unread => "unread",
            CommandKind::Logs => "logs",
            CommandKind::Error => "error",
            CommandKind::Goaway => "goaway",
        }
    }
}

/// Operation qualifier. Serialized in kebab-case, matching the
/// notification feed (`"members-joined"`, `"member-info-changed"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpType {
    // session
    Open,
    Opened,
    Close,
    Closed,
    Refresh,
    Refreshed,
    Query,
    QueryResult,
    // conversation
    Start,
    Started,
    Update,
    Updated,
    Add,
    Added,
    Remove,
    Removed,
    Joined,
    Left,
    MembersJoined,
    MembersLeft,
    MemberInfoChanged,
    Blocked,
    Unblocked,
    MembersBlocked,
    MembersUnblocked,
    Shutuped,
    Unshutuped,
    MembersShutuped,
    MembersUnshutuped,
    Mute,
    Unmute,
    // patch
    Modify,
    Modified,
}

impl OpType {
    /// Parse the notification-feed spelling of an op.
    pub fn from_feed(s: &str) -> Option<OpType> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

/// A gateway command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Correlation index, present when a reply is expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<OpType>,
    pub body: CommandBody,
}

impl Command {
    pub fn new(body: CommandBody) -> Self {
        Self {
            i: None,
            peer_id: None,
            app_id: None,
            server_ts: None,
            op: None,
            body,
        }
    }

    pub fn with_op(mut self, op: OpType) -> Self {
        self.op = Some(op);
        self
    }

    pub fn with_peer(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn kind(&self) -> CommandKind {
        self.body.kind()
    }

    /// True when `self` is `kind` with `op`.
    pub fn is(&self, kind: CommandKind, op: OpType) -> bool {
        self.kind() == kind && self.op == Some(op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "msg", rename_all = "snake_case")]
pub enum CommandBody {
    Session(SessionMessage),
    Conv(ConvMessage),
    Direct(DirectMessage),
    Ack(AckMessage),
    Rcp(RcpMessage),
    Read(ReadMessage),
    Patch(PatchMessage),
    Unread(UnreadMessage),
    Logs(LogsMessage),
    Error(ErrorMessage),
    Goaway,
}

impl CommandBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandBody::Session(_) => CommandKind::Session,
            CommandBody::Conv(_) => CommandKind::Conv,
            CommandBody::Direct(_) => CommandKind::Direct,
            CommandBody::Ack(_) => CommandKind::Ack,
            CommandBody::Rcp(_) => CommandKind::Rcp,
            CommandBody::Read(_) => CommandKind::Read,
            CommandBody::Patch(_) => CommandKind::Patch,
            CommandBody::Unread(_) => CommandKind::Unread,
            CommandBody::Logs(_) => CommandKind::Logs,
            CommandBody::Error(_) => CommandKind::Error,
            CommandBody::Goaway => CommandKind::Goaway,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ua: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    /// Reconnect flag: resume without kicking other devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_bitmap: Option<u64>,
    /// Session token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub st: Option<String>,
    /// Session token lifetime in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub st_ttl: Option<i64>,
    /// Signature, timestamp and nonce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_unread_notif_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_patch_time: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub session_peer_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub online_session_peer_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Members.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub m: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attr_modified: Option<Value>,
    /// ISO-8601 update date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udate: Option<String>,
    /// ISO-8601 creation date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transient: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_conv_ttl: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub temp_conv_ids: Vec<String>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_clause: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// JSON array of conversation objects for query results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<MemberInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_pids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_pids: Vec<FailedPids>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberInfo {
    pub pid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailedPids {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub pids: Vec<String>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Text payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// Base64 binary payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transient: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline: Option<bool>,
    /// Receipt requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r: Option<bool>,
    /// Dedup token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub will: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mention_all: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mention_pids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_msg: Option<String>,
}

/// Delivery or read receipt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcpMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadMessage {
    pub convs: Vec<ReadTuple>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadTuple {
    pub cid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchMessage {
    pub patches: Vec<PatchItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_patch_time: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchItem {
    pub cid: String,
    pub mid: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recall: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mention_all: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mention_pids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnreadMessage {
    pub convs: Vec<UnreadTuple>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notif_time: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnreadTuple {
    pub cid: String,
    pub unread: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentioned: Option<bool>,
}

/// Message history page request and reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Start timestamp and message id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_included: Option<bool>,
    /// End timestamp and message id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tt: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tt_included: Option<bool>,
    /// 1 = new to old, 2 = old to new.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogItem {
    pub msg_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bin_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mention_all: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mention_pids: Vec<String>,
}

// ============================================================================
// Error
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorMessage {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
