//! Conversation state and its merge rules.
//!
//! The raw attribute map is the only stored representation; every typed
//! getter reads through it. One instance exists per conversation id per
//! session, shared as `Arc<Conversation>` and mutated in place by the
//! session task. Getters take the inner mutex briefly and may be called from
//! any thread.

use chrono::DateTime;
use rtm_storage::{ConversationRow, LocalStore};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::message::{direction_of, Message, MessageContent, SendState};

pub const TEMPORARY_ID_PREFIX: &str = "_tmp:";

pub type RawData = Map<String, Value>;

mod key {
    pub const OBJECT_ID: &str = "objectId";
    pub const UNIQUE_ID: &str = "uniqueId";
    pub const NAME: &str = "name";
    pub const CREATOR: &str = "c";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const ATTRIBUTES: &str = "attr";
    pub const MEMBERS: &str = "m";
    pub const MUTED_MEMBERS: &str = "mu";
    pub const UNIQUE: &str = "unique";
    pub const TRANSIENT: &str = "tr";
    pub const SYSTEM: &str = "sys";
    pub const JOINED: &str = "joined";
    pub const TEMPORARY: &str = "temp";
    pub const TEMPORARY_TTL: &str = "ttl";
    pub const CONV_TYPE: &str = "conv_type";
    pub const LAST_MESSAGE_TEXT: &str = "msg";
    pub const LAST_MESSAGE_BINARY: &str = "bin";
    pub const LAST_MESSAGE_ID: &str = "msg_mid";
    pub const LAST_MESSAGE_FROM: &str = "msg_from";
    pub const LAST_MESSAGE_TIMESTAMP: &str = "msg_timestamp";
    pub const LAST_MESSAGE_PATCH_TIMESTAMP: &str = "patch_timestamp";
    pub const LAST_MESSAGE_MENTION_ALL: &str = "mention_all";
    pub const LAST_MESSAGE_MENTION_PIDS: &str = "mention_pids";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind {
    Normal,
    Transient,
    System,
    Temporary,
}

impl ConversationKind {
    /// Derive the kind from raw data, falling back to the id prefix.
    pub fn derive(id: &str, raw: &RawData) -> Self {
        match raw.get(key::CONV_TYPE).and_then(Value::as_i64) {
            Some(1) => return ConversationKind::Normal,
            Some(2) => return ConversationKind::Transient,
            Some(3) => return ConversationKind::System,
            Some(4) => return ConversationKind::Temporary,
            _ => {}
        }
        let flag = |k: &str| raw.get(k).and_then(Value::as_bool).unwrap_or(false);
        if flag(key::TRANSIENT) {
            ConversationKind::Transient
        } else if flag(key::SYSTEM) {
            ConversationKind::System
        } else if flag(key::TEMPORARY) || id.starts_with(TEMPORARY_ID_PREFIX) {
            ConversationKind::Temporary
        } else {
            ConversationKind::Normal
        }
    }

    /// Temporary and transient conversations never reach the local store.
    pub fn is_persisted(&self) -> bool {
        matches!(self, ConversationKind::Normal | ConversationKind::System)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub member_id: String,
    pub role: Option<String>,
}

/// A state mutation driven by a server command or notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    RawDataMerge(RawData),
    RawDataReplace(RawData),
    Append {
        members: Vec<String>,
        udate: Option<String>,
    },
    Remove {
        members: Vec<String>,
        udate: Option<String>,
    },
    Updated {
        attr: RawData,
        attr_modified: RawData,
        udate: Option<String>,
    },
    MemberInfoChanged(MemberInfo),
    Mute {
        udate: Option<String>,
    },
    Unmute {
        udate: Option<String>,
    },
}

/// What `update_last_message` changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastMessageChange {
    pub replaced: bool,
    /// A newer message rather than an edited copy of the current one.
    pub is_new: bool,
    pub unread_changed: bool,
}

/// Unread count pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExplicitUnread {
    pub count: i64,
    pub mentioned: bool,
}

#[derive(Debug, Default)]
struct State {
    raw: RawData,
    outdated: bool,
    last_message: Option<Message>,
    unread_count: i64,
    unread_has_mention: bool,
    last_delivered_at: Option<i64>,
    last_read_at: Option<i64>,
    member_info: HashMap<String, MemberInfo>,
}

pub struct Conversation {
    id: String,
    kind: ConversationKind,
    local_peer: String,
    store: Option<Arc<dyn LocalStore>>,
    state: Mutex<State>,
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Milliseconds of a raw date: an ISO-8601 string or `{"__type":"Date","iso":...}`.
pub fn date_millis(value: &Value) -> Option<i64> {
    let iso = match value {
        Value::String(s) => s.as_str(),
        Value::Object(o) => o.get("iso")?.as_str()?,
        _ => return None,
    };
    DateTime::parse_from_rfc3339(iso)
        .ok()
        .map(|d| d.timestamp_millis())
}

fn string_list(raw: &RawData, k: &str) -> Option<Vec<String>> {
    raw.get(k)?.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

/// Set (or with `None`, remove) the value at a dotted key path, creating
/// intermediate objects.
fn set_path(root: &mut RawData, path: &[&str], value: Option<Value>) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = root;
    for part in parents {
        let entry = cursor
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        cursor = match entry.as_object_mut() {
            Some(map) => map,
            None => return,
        };
    }
    match value {
        Some(v) => {
            cursor.insert(last.to_string(), v);
        }
        None => {
            cursor.remove(*last);
        }
    }
}

fn get_path<'a>(root: &'a RawData, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut value = root.get(*first)?;
    for part in rest {
        value = value.as_object()?.get(*part)?;
    }
    Some(value)
}

/// Last message embedded in a conversation query result.
pub fn decode_last_message(id: &str, raw: &RawData, local_peer: &str) -> Option<Message> {
    let message_id = raw.get(key::LAST_MESSAGE_ID)?.as_str()?.to_string();
    let timestamp = raw.get(key::LAST_MESSAGE_TIMESTAMP).and_then(|v| {
        v.as_i64().or_else(|| date_millis(v))
    })?;
    let from = raw
        .get(key::LAST_MESSAGE_FROM)
        .and_then(Value::as_str)
        .map(str::to_string);
    let text = raw.get(key::LAST_MESSAGE_TEXT).and_then(|v| v.as_str().map(str::to_string));
    let bin = raw.get(key::LAST_MESSAGE_BINARY).and_then(|v| v.as_str().map(str::to_string));
    let content = MessageContent::from_wire(text.as_ref(), bin.as_ref());
    let direction = direction_of(from.as_ref(), local_peer);
    Some(Message {
        id: Some(message_id),
        conversation_id: Some(id.to_string()),
        from_peer_id: from,
        sent_timestamp: Some(timestamp),
        patched_timestamp: raw
            .get(key::LAST_MESSAGE_PATCH_TIMESTAMP)
            .and_then(Value::as_i64),
        content,
        mentions_all: raw
            .get(key::LAST_MESSAGE_MENTION_ALL)
            .and_then(Value::as_bool),
        mentioned_ids: string_list(raw, key::LAST_MESSAGE_MENTION_PIDS),
        direction,
        send_state: SendState::Sent,
        ..Default::default()
    })
}

/// Position order for last-message replacement; `Some(true)` for a newer
/// message, `Some(false)` for a newer edit of the same message.
///
/// Positions are only comparable when both messages carry a timestamp and
/// an id. If either side lacks one, the candidate replaces the current
/// message and counts as new.
fn supersedes(new: &Message, old: &Message) -> Option<bool> {
    let (new_ts, new_id, old_ts, old_id) = match (
        new.sent_timestamp,
        new.id.as_ref(),
        old.sent_timestamp,
        old.id.as_ref(),
    ) {
        (Some(new_ts), Some(new_id), Some(old_ts), Some(old_id)) => (new_ts, new_id, old_ts, old_id),
        _ => return Some(true),
    };
    match new_ts.cmp(&old_ts).then_with(|| new_id.cmp(old_id)) {
        Ordering::Greater => Some(true),
        Ordering::Less => None,
        Ordering::Equal => match (new.patched_timestamp, old.patched_timestamp) {
            (Some(n), Some(o)) if n > o => Some(false),
            (Some(_), None) => Some(false),
            _ => None,
        },
    }
}

impl Conversation {
    pub fn new(
        id: impl Into<String>,
        local_peer: impl Into<String>,
        raw: RawData,
        store: Option<Arc<dyn LocalStore>>,
    ) -> Arc<Self> {
        let id = id.into();
        let local_peer = local_peer.into();
        let kind = ConversationKind::derive(&id, &raw);
        let last_message = decode_last_message(&id, &raw, &local_peer);
        Arc::new(Self {
            id,
            kind,
            local_peer,
            store: if kind.is_persisted() { store } else { None },
            state: Mutex::new(State {
                raw,
                last_message,
                ..Default::default()
            }),
        })
    }

    /// Rebuild from a local store row.
    pub fn from_stored(
        stored: &rtm_storage::StoredConversation,
        local_peer: &str,
        store: Option<Arc<dyn LocalStore>>,
    ) -> Arc<Self> {
        let raw = stored.row.raw_data.as_object().cloned().unwrap_or_default();
        let conv = Self::new(stored.row.id.clone(), local_peer, raw, store);
        {
            let mut state = conv.lock();
            state.outdated = stored.row.outdated;
            if let Some(row) = &stored.last_message {
                state.last_message = Some(Message::from_row(row, local_peer));
            }
        }
        conv
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- Derived getters --

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ConversationKind {
        self.kind
    }

    pub fn raw_data(&self) -> RawData {
        self.lock().raw.clone()
    }

    fn raw_str(&self, k: &str) -> Option<String> {
        self.lock().raw.get(k).and_then(Value::as_str).map(str::to_string)
    }

    pub fn name(&self) -> Option<String> {
        self.raw_str(key::NAME)
    }

    pub fn creator(&self) -> Option<String> {
        self.raw_str(key::CREATOR)
    }

    pub fn unique_id(&self) -> Option<String> {
        self.raw_str(key::UNIQUE_ID)
    }

    pub fn is_unique(&self) -> bool {
        self.lock()
            .raw
            .get(key::UNIQUE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn members(&self) -> Option<Vec<String>> {
        string_list(&self.lock().raw, key::MEMBERS)
    }

    pub fn muted_members(&self) -> Option<Vec<String>> {
        string_list(&self.lock().raw, key::MUTED_MEMBERS)
    }

    pub fn is_muted(&self) -> bool {
        self.muted_members()
            .is_some_and(|m| m.iter().any(|p| *p == self.local_peer))
    }

    /// Only meaningful for system conversations.
    pub fn is_joined(&self) -> bool {
        self.lock()
            .raw
            .get(key::JOINED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn attributes(&self) -> Option<RawData> {
        self.lock()
            .raw
            .get(key::ATTRIBUTES)
            .and_then(Value::as_object)
            .cloned()
    }

    pub fn temporary_ttl(&self) -> Option<i64> {
        self.lock().raw.get(key::TEMPORARY_TTL).and_then(Value::as_i64)
    }

    pub fn created_at(&self) -> Option<i64> {
        self.lock().raw.get(key::CREATED_AT).and_then(date_millis)
    }

    pub fn updated_at(&self) -> Option<i64> {
        self.lock().raw.get(key::UPDATED_AT).and_then(date_millis)
    }

    pub fn is_outdated(&self) -> bool {
        self.kind != ConversationKind::Temporary && self.lock().outdated
    }

    pub fn last_message(&self) -> Option<Message> {
        self.lock().last_message.clone()
    }

    pub fn unread_count(&self) -> i64 {
        self.lock().unread_count
    }

    pub fn unread_has_mention(&self) -> bool {
        self.lock().unread_has_mention
    }

    pub fn last_delivered_at(&self) -> Option<i64> {
        self.lock().last_delivered_at
    }

    pub fn last_read_at(&self) -> Option<i64> {
        self.lock().last_read_at
    }

    pub fn member_info(&self, member_id: &str) -> Option<MemberInfo> {
        self.lock().member_info.get(member_id).cloned()
    }

    // -- Mutation --

    pub fn set_outdated(&self, outdated: bool) {
        if self.kind == ConversationKind::Temporary {
            return;
        }
        self.lock().outdated = outdated;
        if let Some(store) = &self.store {
            if let Err(e) = store.set_conversation_outdated(&self.id, outdated) {
                tracing::warn!(conversation = %self.id, "store: outdated flag not saved: {e}");
            }
        }
    }

    /// True when a member change stamped `udate` is not older than our data.
    fn accepts_update(state: &State, udate: Option<&str>) -> bool {
        let Some(new) = udate.and_then(|u| date_millis(&Value::String(u.to_string()))) else {
            return false;
        };
        let current = state
            .raw
            .get(key::UPDATED_AT)
            .or_else(|| state.raw.get(key::CREATED_AT))
            .and_then(date_millis);
        current.map_or(true, |c| new >= c)
    }

    fn stamp_updated(state: &mut State, udate: Option<String>) {
        if let Some(udate) = udate {
            state.raw.insert(key::UPDATED_AT.into(), Value::String(udate));
        }
    }

    /// Apply `op`. Returns true when state changed.
    pub fn apply(&self, op: Operation) -> bool {
        let changed = {
            let mut state = self.lock();
            self.apply_locked(&mut state, op)
        };
        if changed {
            self.save();
        }
        changed
    }

    fn apply_locked(&self, state: &mut State, op: Operation) -> bool {
        match op {
            Operation::RawDataMerge(data) => {
                for (k, v) in data {
                    state.raw.insert(k, v);
                }
                true
            }
            Operation::RawDataReplace(data) => {
                let last = decode_last_message(&self.id, &data, &self.local_peer);
                state.raw = data;
                state.outdated = false;
                if let Some(message) = last {
                    self.replace_last_message(state, &message);
                }
                true
            }
            Operation::Append { members, udate } => {
                if !self.needs_member_update(state, &members, udate.as_deref()) {
                    return false;
                }
                if self.kind == ConversationKind::System {
                    state.raw.insert(key::JOINED.into(), Value::Bool(true));
                } else {
                    let mut current = string_list(&state.raw, key::MEMBERS).unwrap_or_default();
                    for m in members {
                        if !current.contains(&m) {
                            current.push(m);
                        }
                    }
                    state.raw.insert(key::MEMBERS.into(), Value::from(current));
                }
                Self::stamp_updated(state, udate);
                true
            }
            Operation::Remove { members, udate } => {
                if !self.needs_member_update(state, &members, udate.as_deref()) {
                    return false;
                }
                if self.kind == ConversationKind::System {
                    state.raw.insert(key::JOINED.into(), Value::Bool(false));
                } else {
                    if members.contains(&self.local_peer) && self.kind != ConversationKind::Temporary {
                        state.outdated = true;
                    }
                    if let Some(mut current) = string_list(&state.raw, key::MEMBERS) {
                        current.retain(|m| !members.contains(m));
                        state.raw.insert(key::MEMBERS.into(), Value::from(current));
                    }
                    for m in &members {
                        state.member_info.remove(m);
                    }
                }
                Self::stamp_updated(state, udate);
                true
            }
            Operation::Updated {
                attr,
                attr_modified,
                udate,
            } => {
                if !Self::accepts_update(state, udate.as_deref()) {
                    return false;
                }
                for path in attr.keys() {
                    let parts: Vec<&str> = path.split('.').collect();
                    let value = get_path(&attr_modified, &parts).cloned();
                    set_path(&mut state.raw, &parts, value);
                }
                Self::stamp_updated(state, udate);
                true
            }
            Operation::MemberInfoChanged(info) => {
                state.member_info.insert(info.member_id.clone(), info);
                true
            }
            Operation::Mute { udate } => self.set_muted(state, true, udate),
            Operation::Unmute { udate } => self.set_muted(state, false, udate),
        }
    }

    fn set_muted(&self, state: &mut State, mute: bool, udate: Option<String>) -> bool {
        if !Self::accepts_update(state, udate.as_deref()) {
            return false;
        }
        let mut muted = string_list(&state.raw, key::MUTED_MEMBERS).unwrap_or_default();
        muted.retain(|p| *p != self.local_peer);
        if mute {
            muted.push(self.local_peer.clone());
        }
        state.raw.insert(key::MUTED_MEMBERS.into(), Value::from(muted));
        Self::stamp_updated(state, udate);
        true
    }

    fn needs_member_update(&self, state: &State, members: &[String], udate: Option<&str>) -> bool {
        if self.kind == ConversationKind::Transient
            || (self.kind != ConversationKind::System && members.is_empty())
        {
            return false;
        }
        Self::accepts_update(state, udate)
    }

    /// Write the conversation row through to the local store.
    pub(crate) fn save(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let row = {
            let state = self.lock();
            let created = state.raw.get(key::CREATED_AT).and_then(date_millis).unwrap_or(0);
            let updated = state
                .raw
                .get(key::UPDATED_AT)
                .and_then(date_millis)
                .unwrap_or(created);
            ConversationRow {
                id: self.id.clone(),
                raw_data: Value::Object(state.raw.clone()),
                updated_timestamp: updated,
                created_timestamp: created,
                outdated: state.outdated,
            }
        };
        if let Err(e) = store.upsert_conversation(&row) {
            tracing::warn!(conversation = %self.id, "store: conversation not saved: {e}");
        }
    }

    // -- Last message and unread --

    /// Replace the last message if `message` supersedes it. Returns
    /// `Some(is_new)` on replacement.
    fn replace_last_message(&self, state: &mut State, message: &Message) -> Option<bool> {
        if message.transient || message.will || self.kind == ConversationKind::Transient {
            return None;
        }
        let is_new = match &state.last_message {
            None => true,
            Some(old) => supersedes(message, old)?,
        };
        state.last_message = Some(message.clone());
        if let Some(store) = &self.store {
            if let Some(row) = message.to_row() {
                if let Err(e) = store.upsert_last_message(&self.id, &row) {
                    tracing::warn!(conversation = %self.id, "store: last message not cached: {e}");
                }
            }
        }
        Some(is_new)
    }

    fn mentions_local(&self, message: &Message) -> bool {
        message.mentions_all.unwrap_or(false)
            || message
                .mentioned_ids
                .as_ref()
                .is_some_and(|ids| ids.iter().any(|p| *p == self.local_peer))
    }

    /// Apply a candidate last message and the unread rule: a newer inbound
    /// message adds one unread, an explicit server count wins outright.
    pub fn update_last_message(
        &self,
        message: Option<&Message>,
        explicit: Option<ExplicitUnread>,
    ) -> LastMessageChange {
        let mut state = self.lock();
        let mut change = LastMessageChange::default();
        if let Some(message) = message {
            if let Some(is_new) = self.replace_last_message(&mut state, message) {
                change.replaced = true;
                change.is_new = is_new;
            }
        }
        match explicit {
            Some(unread) => {
                if unread.count != state.unread_count {
                    state.unread_count = unread.count;
                    state.unread_has_mention = unread.mentioned;
                    change.unread_changed = true;
                }
            }
            None => {
                let counts = change.is_new
                    && self.kind != ConversationKind::Transient
                    && message.is_some_and(Message::is_inbound);
                if counts {
                    state.unread_count += 1;
                    if message.is_some_and(|m| self.mentions_local(m)) {
                        state.unread_has_mention = true;
                    }
                    change.unread_changed = true;
                }
            }
        }
        change
    }

    /// Reset unread after a read command.
    pub fn clear_unread(&self) -> bool {
        let mut state = self.lock();
        if state.unread_count == 0 && !state.unread_has_mention {
            return false;
        }
        state.unread_count = 0;
        state.unread_has_mention = false;
        true
    }

    /// Advance the delivered or read watermark. Returns true if it moved.
    pub fn update_receipt(&self, read: bool, timestamp: i64) -> bool {
        let mut state = self.lock();
        let slot = if read {
            &mut state.last_read_at
        } else {
            &mut state.last_delivered_at
        };
        if slot.is_some_and(|t| t >= timestamp) {
            return false;
        }
        *slot = Some(timestamp);
        true
    }

    pub fn is_last_message(&self, message_id: &str, sent_timestamp: i64) -> bool {
        self.lock().last_message.as_ref().is_some_and(|m| {
            m.id.as_deref() == Some(message_id) && m.sent_timestamp == Some(sent_timestamp)
        })
    }

    pub fn local_peer(&self) -> &str {
        &self.local_peer
    }

    pub(crate) fn store(&self) -> Option<&Arc<dyn LocalStore>> {
        self.store.as_ref()
    }

    pub(crate) fn members_set(&self) -> HashSet<String> {
        self.members().unwrap_or_default().into_iter().collect()
    }
}
