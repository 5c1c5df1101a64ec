//! Message model.
//!
//! Common fields live on [`Message`]; the payload is a [`MessageContent`]
//! variant. Typed payloads carry an integer tag: negative tags are built in,
//! positive tags belong to the application and decode through a
//! [`MessageTypeRegistry`].

use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rtm_protocol::{DirectMessage, LogItem, PatchItem, UnreadTuple};
use rtm_storage::{MessageRow, RowStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, RtmError};

const DEDUP_TOKEN_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    None,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// Local send progress; `MessageStatus` is derived from it plus receipts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendState {
    #[default]
    None,
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    In,
    #[default]
    Out,
}

/// Built-in typed message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Image,
    Audio,
    Video,
    Location,
    File,
    Recalled,
    Custom(i32),
}

impl MessageType {
    pub fn tag(&self) -> i32 {
        match self {
            MessageType::Text => -1,
            MessageType::Image => -2,
            MessageType::Audio => -3,
            MessageType::Video => -4,
            MessageType::Location => -5,
            MessageType::File => -6,
            MessageType::Recalled => -127,
            MessageType::Custom(tag) => *tag,
        }
    }

    pub fn from_tag(tag: i32) -> Self {
        match tag {
            -1 => MessageType::Text,
            -2 => MessageType::Image,
            -3 => MessageType::Audio,
            -4 => MessageType::Video,
            -5 => MessageType::Location,
            -6 => MessageType::File,
            -127 => MessageType::Recalled,
            other => MessageType::Custom(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Typed payload, serialized as `{"_lctype", "_lctext", "_lcattrs", "_lcfile", "_lcloc"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedMessage {
    #[serde(rename = "_lctype")]
    pub type_tag: i32,
    #[serde(rename = "_lctext", default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "_lcattrs", default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
    #[serde(rename = "_lcfile", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<Value>,
    #[serde(rename = "_lcloc", default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl TypedMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            type_tag: kind.tag(),
            text: None,
            attributes: None,
            file: None,
            location: None,
        }
    }

    pub fn kind(&self) -> MessageType {
        MessageType::from_tag(self.type_tag)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Binary(Vec<u8>),
    Typed(TypedMessage),
}

impl MessageContent {
    /// Classify a text payload: a JSON object with an integer `_lctype`
    /// is typed, anything else is plain text.
    pub fn from_text(text: String) -> Self {
        if text.starts_with('{') {
            if let Ok(typed) = serde_json::from_str::<TypedMessage>(&text) {
                return MessageContent::Typed(typed);
            }
        }
        MessageContent::Text(text)
    }

    pub(crate) fn from_wire(data: Option<&String>, bin: Option<&String>) -> Option<Self> {
        if let Some(bin) = bin {
            return base64::engine::general_purpose::STANDARD
                .decode(bin)
                .ok()
                .map(MessageContent::Binary);
        }
        data.map(|text| MessageContent::from_text(text.clone()))
    }

    /// (text, base64 binary) wire fields.
    fn to_wire(&self) -> Result<(Option<String>, Option<String>)> {
        Ok(match self {
            MessageContent::Text(text) => (Some(text.clone()), None),
            MessageContent::Binary(bytes) => (
                None,
                Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
            ),
            MessageContent::Typed(typed) => (Some(serde_json::to_string(typed)?), None),
        })
    }
}

/// Decodes an application-defined typed payload.
pub type DecodeFn =
    Arc<dyn Fn(&TypedMessage) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Positive type tag -> decode function.
#[derive(Clone, Default)]
pub struct MessageTypeRegistry {
    decoders: HashMap<i32, DecodeFn>,
}

impl MessageTypeRegistry {
    pub fn register(&mut self, tag: i32, decode: DecodeFn) -> Result<()> {
        if tag <= 0 {
            return Err(RtmError::InvalidArgument(format!(
                "custom message type tag must be positive, got {tag}"
            )));
        }
        if self.decoders.contains_key(&tag) {
            return Err(RtmError::InvalidArgument(format!(
                "message type {tag} already registered"
            )));
        }
        self.decoders.insert(tag, decode);
        Ok(())
    }

    /// Decode with the registered function, `None` when the tag is unknown.
    pub fn decode(&self, typed: &TypedMessage) -> Option<Result<Box<dyn Any + Send + Sync>>> {
        self.decoders.get(&typed.type_tag).map(|f| f(typed))
    }

    pub fn is_registered(&self, tag: i32) -> bool {
        self.decoders.contains_key(&tag)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub id: Option<String>,
    pub conversation_id: Option<String>,
    pub from_peer_id: Option<String>,
    pub sent_timestamp: Option<i64>,
    pub delivered_timestamp: Option<i64>,
    pub read_timestamp: Option<i64>,
    pub patched_timestamp: Option<i64>,
    pub content: Option<MessageContent>,
    pub mentions_all: Option<bool>,
    pub mentioned_ids: Option<Vec<String>>,
    pub transient: bool,
    pub will: bool,
    pub offline: bool,
    pub dedup_token: Option<String>,
    /// Local clock at send time, keying failed rows.
    pub sending_timestamp: Option<i64>,
    pub direction: Direction,
    pub send_state: SendState,
}

fn non_empty(ids: &[String]) -> Option<Vec<String>> {
    if ids.is_empty() {
        None
    } else {
        Some(ids.to_vec())
    }
}

pub fn new_dedup_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(DEDUP_TOKEN_LEN)
        .map(char::from)
        .collect()
}

pub(crate) fn direction_of(from: Option<&String>, local_peer: &str) -> Direction {
    match from {
        Some(from) if from != local_peer => Direction::In,
        _ => Direction::Out,
    }
}

impl Message {
    pub fn outgoing(content: MessageContent) -> Self {
        Self {
            content: Some(content),
            direction: Direction::Out,
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::outgoing(MessageContent::Text(text.into()))
    }

    pub fn status(&self) -> MessageStatus {
        match self.send_state {
            SendState::None => MessageStatus::None,
            SendState::Sending => MessageStatus::Sending,
            SendState::Failed => MessageStatus::Failed,
            SendState::Sent => {
                if self.read_timestamp.is_some() {
                    MessageStatus::Read
                } else if self.delivered_timestamp.is_some() {
                    MessageStatus::Delivered
                } else {
                    MessageStatus::Sent
                }
            }
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::In
    }

    pub fn is_recalled(&self) -> bool {
        matches!(&self.content, Some(MessageContent::Typed(t)) if t.kind() == MessageType::Recalled)
    }

    /// Position order: sent timestamp, then id. Messages lacking either
    /// sort before those that have them.
    pub fn cmp_position(&self, other: &Message) -> Ordering {
        self.sent_timestamp
            .cmp(&other.sent_timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn from_direct(direct: &DirectMessage, local_peer: &str) -> Self {
        Self {
            id: direct.id.clone(),
            conversation_id: direct.cid.clone(),
            from_peer_id: direct.from_peer_id.clone(),
            sent_timestamp: direct.timestamp,
            patched_timestamp: direct.patch_timestamp,
            content: MessageContent::from_wire(direct.msg.as_ref(), direct.bin_msg.as_ref()),
            mentions_all: direct.mention_all,
            mentioned_ids: non_empty(&direct.mention_pids),
            transient: direct.transient.unwrap_or(false),
            will: direct.will.unwrap_or(false),
            offline: direct.offline.unwrap_or(false),
            direction: direction_of(direct.from_peer_id.as_ref(), local_peer),
            send_state: SendState::Sent,
            ..Default::default()
        }
    }

    pub fn from_log(conversation_id: &str, item: &LogItem, local_peer: &str) -> Self {
        Self {
            id: Some(item.msg_id.clone()),
            conversation_id: Some(conversation_id.to_string()),
            from_peer_id: item.from.clone(),
            sent_timestamp: Some(item.timestamp),
            delivered_timestamp: item.ack_at,
            read_timestamp: item.read_at,
            patched_timestamp: item.patch_timestamp,
            content: MessageContent::from_wire(item.data.as_ref(), item.bin_msg.as_ref()),
            mentions_all: item.mention_all,
            mentioned_ids: non_empty(&item.mention_pids),
            direction: direction_of(item.from.as_ref(), local_peer),
            send_state: SendState::Sent,
            ..Default::default()
        }
    }

    pub fn from_patch(item: &PatchItem, local_peer: &str) -> Self {
        let content = if item.recall.unwrap_or(false) {
            Some(MessageContent::Typed(TypedMessage::new(MessageType::Recalled)))
        } else {
            MessageContent::from_wire(item.data.as_ref(), item.bin_msg.as_ref())
        };
        Self {
            id: Some(item.mid.clone()),
            conversation_id: Some(item.cid.clone()),
            from_peer_id: item.from.clone(),
            sent_timestamp: Some(item.timestamp),
            patched_timestamp: item.patch_timestamp,
            content,
            mentions_all: item.mention_all,
            mentioned_ids: non_empty(&item.mention_pids),
            direction: direction_of(item.from.as_ref(), local_peer),
            send_state: SendState::Sent,
            ..Default::default()
        }
    }

    /// Last message carried by an unread tuple, if it names one.
    pub fn from_unread(tuple: &UnreadTuple, local_peer: &str) -> Option<Self> {
        let (id, ts) = (tuple.mid.clone()?, tuple.timestamp?);
        Some(Self {
            id: Some(id),
            conversation_id: Some(tuple.cid.clone()),
            from_peer_id: tuple.from.clone(),
            sent_timestamp: Some(ts),
            patched_timestamp: tuple.patch_timestamp,
            content: MessageContent::from_wire(tuple.data.as_ref(), tuple.bin_msg.as_ref()),
            direction: direction_of(tuple.from.as_ref(), local_peer),
            send_state: SendState::Sent,
            ..Default::default()
        })
    }

    /// Direct command body for sending this message to `conversation_id`.
    pub fn to_direct(&self, conversation_id: &str, receipt: bool) -> Result<DirectMessage> {
        let content = self
            .content
            .as_ref()
            .ok_or_else(|| RtmError::InvalidArgument("message has no content".into()))?;
        let (msg, bin_msg) = content.to_wire()?;
        Ok(DirectMessage {
            cid: Some(conversation_id.to_string()),
            msg,
            bin_msg,
            transient: self.transient.then_some(true),
            will: self.will.then_some(true),
            r: receipt.then_some(true),
            dt: self.dedup_token.clone(),
            mention_all: self.mentions_all,
            mention_pids: self.mentioned_ids.clone().unwrap_or_default(),
            ..Default::default()
        })
    }

    /// Local store row for a sent message, `None` without id or timestamp.
    pub fn to_row(&self) -> Option<MessageRow> {
        let (content, binary) = match &self.content {
            Some(content) => match content.to_wire() {
                Ok((Some(text), _)) => (Some(text), false),
                Ok((None, bin)) => (bin, true),
                Err(_) => (None, false),
            },
            None => (None, false),
        };
        let (sent_timestamp, message_id, status) = match self.send_state {
            SendState::Failed => (
                self.sending_timestamp?,
                self.dedup_token.clone()?,
                RowStatus::Failed,
            ),
            _ => (self.sent_timestamp?, self.id.clone()?, RowStatus::Sent),
        };
        Some(MessageRow {
            conversation_id: self.conversation_id.clone()?,
            sent_timestamp,
            message_id,
            from_peer_id: self.from_peer_id.clone(),
            content,
            binary,
            delivered_timestamp: self.delivered_timestamp,
            read_timestamp: self.read_timestamp,
            patched_timestamp: self.patched_timestamp,
            mentions_all: self.mentions_all,
            mentioned_ids: self.mentioned_ids.clone(),
            status,
            breakpoint: false,
        })
    }

    pub fn from_row(row: &MessageRow, local_peer: &str) -> Self {
        let content = match (&row.content, row.binary) {
            (Some(bin), true) => MessageContent::from_wire(None, Some(bin)),
            (Some(text), false) => Some(MessageContent::from_text(text.clone())),
            (None, _) => None,
        };
        let failed = row.status == RowStatus::Failed;
        Self {
            id: (!failed).then(|| row.message_id.clone()),
            conversation_id: Some(row.conversation_id.clone()),
            from_peer_id: row.from_peer_id.clone(),
            sent_timestamp: (!failed).then_some(row.sent_timestamp),
            delivered_timestamp: row.delivered_timestamp,
            read_timestamp: row.read_timestamp,
            patched_timestamp: row.patched_timestamp,
            content,
            mentions_all: row.mentions_all,
            mentioned_ids: row.mentioned_ids.clone(),
            dedup_token: failed.then(|| row.message_id.clone()),
            sending_timestamp: failed.then_some(row.sent_timestamp),
            direction: direction_of(row.from_peer_id.as_ref(), local_peer),
            send_state: if failed {
                SendState::Failed
            } else {
                SendState::Sent
            },
            ..Default::default()
        }
    }
}
