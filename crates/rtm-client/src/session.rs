//! Session -- one peer's IM state machine and its public operations.
//!
//! A `Session` is a cheap handle. Lifecycle transitions (open, resume,
//! close) are owned by a lifecycle task; inbound commands and offline
//! reconciliation are applied in order by a dispatch task. Request/reply
//! operations run on the caller's task and mutate conversations in place.

use rtm_protocol::{
    Command, CommandBody, ConvMessage, LogsMessage, OpType, ProtocolVariant, ReadMessage,
    ReadTuple, SessionMessage, DEFAULT_PARAMS,
};
use rtm_storage::{
    ConversationOrder, LocalRecord, LocalStore, MessageEndpoint, MessageRange, QueryDirection,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::config::ClientConfig;
use crate::connection::ConnectionHandle;
use crate::conversation::{Conversation, ConversationKind, LastMessageChange, MemberInfo, Operation, RawData};
use crate::dispatch::{self, DispatchJob};
use crate::error::{Result, RtmError};
use crate::http::{HttpClient, SignatureProvider};
use crate::lifecycle::{self, LifecycleCommand};
use crate::lookup::{self, ConversationCache};
use crate::message::{new_dedup_token, Direction, Message, SendState};
use crate::registry::ConnectionRegistry;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Opened,
    Resuming,
    Paused,
    Closing,
}

/// How `open` treats other devices logged in with the same tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenMode {
    /// Take over the tag, kicking the other device.
    #[default]
    Forced,
    /// Resume without kicking; fails with a conflict if another device holds the tag.
    Reconnect,
}

/// Server reason attached to an edited or recalled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReason {
    pub code: i32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Joined { by: Option<String> },
    Left { by: Option<String> },
    MembersJoined { members: Vec<String>, by: Option<String> },
    MembersLeft { members: Vec<String>, by: Option<String> },
    MemberInfoChanged { info: MemberInfo, by: Option<String> },
    Blocked { by: Option<String> },
    Unblocked { by: Option<String> },
    MembersBlocked { members: Vec<String>, by: Option<String> },
    MembersUnblocked { members: Vec<String>, by: Option<String> },
    Muted { by: Option<String> },
    Unmuted { by: Option<String> },
    MembersMuted { members: Vec<String>, by: Option<String> },
    MembersUnmuted { members: Vec<String>, by: Option<String> },
    DataUpdated {
        attr: RawData,
        attr_modified: RawData,
        by: Option<String>,
    },
    LastMessageUpdated { is_new: bool },
    LastDeliveredAtUpdated,
    LastReadAtUpdated,
    UnreadCountUpdated,
    MessageReceived(Message),
    MessageDelivered {
        message_id: Option<String>,
        by: Option<String>,
        at: Option<i64>,
    },
    MessageRead {
        message_id: Option<String>,
        by: Option<String>,
        at: Option<i64>,
    },
    MessageUpdated {
        message: Message,
        reason: Option<PatchReason>,
    },
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    DidOpen,
    DidResume,
    DidPause(RtmError),
    DidClose(RtmError),
    Conversation {
        conversation: Arc<Conversation>,
        event: ConversationEvent,
    },
}

/// Options for `create_conversation`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub members: Vec<String>,
    pub kind: CreateKind,
    pub name: Option<String>,
    pub attributes: Option<RawData>,
    /// Return the existing conversation with the same member set.
    pub unique: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreateKind {
    #[default]
    Normal,
    Transient,
    Temporary {
        ttl_secs: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub receipt: bool,
    pub transient: bool,
    /// Delivered to members if the sender goes offline unexpectedly.
    pub will: bool,
}

/// Outcome of a member add/remove request.
#[derive(Debug, Clone, Default)]
pub struct MembersResult {
    pub allowed: Vec<String>,
    pub failed: Vec<(Vec<String>, RtmError)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryPolicy {
    /// Local store first; the backend when the cached page is empty or
    /// may be incomplete.
    #[default]
    Default,
    OnlyNetwork,
    OnlyCache,
}

#[derive(Debug, Clone)]
pub struct MessageQuery {
    pub start: Option<MessageEndpoint>,
    pub end: Option<MessageEndpoint>,
    pub direction: QueryDirection,
    pub limit: usize,
    pub policy: QueryPolicy,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            direction: QueryDirection::NewToOld,
            limit: 20,
            policy: QueryPolicy::Default,
        }
    }
}

pub(crate) struct SessionToken {
    pub value: String,
    pub expires_at: Instant,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// State shared by the session handle, lifecycle task and dispatch task.
pub(crate) struct SessionShared {
    pub client_id: String,
    pub app_id: String,
    pub variant: ProtocolVariant,
    pub tag: Option<String>,
    pub device_token: Option<String>,
    pub config_bitmap: u64,
    pub command_timeout: Duration,
    pub open_timeout: Duration,
    pub api_server: String,
    pub registry: ConnectionRegistry,
    pub http: Arc<dyn HttpClient>,
    pub signer: Option<Arc<dyn SignatureProvider>>,
    pub store: Option<Arc<dyn LocalStore>>,
    pub events: broadcast::Sender<SessionEvent>,
    pub conversations: ConversationCache,
    state: Mutex<SessionState>,
    connection: Mutex<Option<ConnectionHandle>>,
    token: Mutex<Option<SessionToken>>,
    record: Mutex<LocalRecord>,
    last_unread_notif_time: Mutex<Option<i64>>,
}

impl SessionShared {
    pub fn state(&self) -> SessionState {
        *guard(&self.state)
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = guard(&self.state);
        if *current != state {
            tracing::debug!(client = %self.client_id, from = ?*current, to = ?state, "session: state");
            *current = state;
        }
    }

    pub fn connection(&self) -> Option<ConnectionHandle> {
        guard(&self.connection).clone()
    }

    pub fn set_connection(&self, connection: Option<ConnectionHandle>) {
        *guard(&self.connection) = connection;
    }

    /// Connection of an opened session.
    fn opened_connection(&self) -> Result<ConnectionHandle> {
        if self.state() != SessionState::Opened {
            return Err(RtmError::ClientNotOpen);
        }
        self.connection().ok_or(RtmError::ClientNotOpen)
    }

    pub async fn request(&self, command: Command) -> Result<Command> {
        let connection = self.opened_connection()?;
        connection
            .request(&self.client_id, command, self.command_timeout)
            .await
    }

    /// Fire-and-forget send over the current connection.
    pub fn send(&self, command: Command) {
        match self.connection() {
            Some(connection) => connection.send(&self.client_id, command),
            None => tracing::debug!(client = %self.client_id, "session: send dropped, no connection"),
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_conversation(&self, conversation: &Arc<Conversation>, event: ConversationEvent) {
        self.emit(SessionEvent::Conversation {
            conversation: conversation.clone(),
            event,
        });
    }

    pub fn emit_last_message_change(&self, conversation: &Arc<Conversation>, change: LastMessageChange) {
        if change.replaced {
            self.emit_conversation(
                conversation,
                ConversationEvent::LastMessageUpdated {
                    is_new: change.is_new,
                },
            );
        }
        if change.unread_changed {
            self.emit_conversation(conversation, ConversationEvent::UnreadCountUpdated);
        }
    }

    pub fn valid_token(&self) -> Option<String> {
        guard(&self.token)
            .as_ref()
            .filter(|t| Instant::now() < t.expires_at)
            .map(|t| t.value.clone())
    }

    pub fn set_token(&self, token: Option<SessionToken>) {
        *guard(&self.token) = token;
    }

    /// Capture `st`/`st_ttl` from an open or refresh reply.
    pub fn capture_token(&self, session: &SessionMessage) -> Option<String> {
        let value = session.st.clone()?;
        let ttl = Duration::from_secs(session.st_ttl.unwrap_or(0).max(0) as u64);
        self.set_token(Some(SessionToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        }));
        Some(value)
    }

    pub fn local_record(&self) -> LocalRecord {
        *guard(&self.record)
    }

    pub fn last_unread_notif_time(&self) -> Option<i64> {
        *guard(&self.last_unread_notif_time)
    }

    pub fn advance_unread_notif_time(&self, ts: i64) {
        let mut slot = guard(&self.last_unread_notif_time);
        if slot.map_or(true, |current| ts > current) {
            *slot = Some(ts);
        }
    }

    pub fn advance_server_timestamp(&self, ts: i64) {
        self.update_record(|record| record.advance_server_timestamp(ts));
    }

    pub fn advance_patch_timestamp(&self, ts: i64) {
        self.update_record(|record| record.advance_patch_timestamp(ts));
    }

    fn update_record(&self, advance: impl FnOnce(&mut LocalRecord) -> bool) {
        let snapshot = {
            let mut record = guard(&self.record);
            if !advance(&mut record) {
                return;
            }
            *record
        };
        if let Some(store) = &self.store {
            if let Err(e) = store.write_local_record(&self.client_id, &snapshot) {
                tracing::warn!(client = %self.client_id, "store: local record not saved: {e}");
            }
        }
    }

    /// Release the connection registration and drop session-scoped state.
    pub fn release(&self) {
        if let Some(connection) = guard(&self.connection).take() {
            self.registry
                .release(connection.app_id(), connection.variant(), &self.client_id);
        }
        self.set_token(None);
    }
}

/// One peer's IM session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    lifecycle: mpsc::UnboundedSender<LifecycleCommand>,
}

impl Session {
    /// Validate the identity and spawn the session's tasks. Must be called
    /// inside a tokio runtime. Nothing connects until `open`.
    pub fn new(
        config: &ClientConfig,
        registry: ConnectionRegistry,
        store: Option<Arc<dyn LocalStore>>,
        signer: Option<Arc<dyn SignatureProvider>>,
    ) -> Result<Self> {
        config.client.validate()?;
        let client_id = config.client.client_id.clone();

        let record = match &store {
            Some(store) => store.read_local_record(&client_id).unwrap_or_else(|e| {
                tracing::warn!(client = %client_id, "store: local record unreadable: {e}");
                None
            }),
            None => None,
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(SessionShared {
            client_id,
            app_id: config.app.app_id.clone(),
            variant: config.app.protocol,
            tag: config.client.tag.clone(),
            device_token: config.client.device_token.clone(),
            config_bitmap: config.session.config_bitmap(),
            command_timeout: config.session.command_timeout(),
            open_timeout: config.session.open_timeout(),
            api_server: config.app.api_server.clone(),
            http: registry.http(),
            registry,
            signer,
            store,
            events,
            conversations: ConversationCache::default(),
            state: Mutex::new(SessionState::Closed),
            connection: Mutex::new(None),
            token: Mutex::new(None),
            record: Mutex::new(record.unwrap_or_default()),
            last_unread_notif_time: Mutex::new(None),
        });

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel::<DispatchJob>();
        tokio::spawn(dispatch::run_dispatch_loop(shared.clone(), dispatch_rx));
        let lifecycle = lifecycle::spawn(shared.clone(), dispatch_tx);

        Ok(Self { shared, lifecycle })
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn local_record(&self) -> LocalRecord {
        self.shared.local_record()
    }

    pub fn store(&self) -> Option<&Arc<dyn LocalStore>> {
        self.shared.store.as_ref()
    }

    async fn lifecycle_call(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> LifecycleCommand,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.lifecycle
            .send(make(tx))
            .map_err(|_| RtmError::SessionStateConflict("session task stopped".into()))?;
        rx.await
            .unwrap_or(Err(RtmError::SessionStateConflict("session task stopped".into())))
    }

    /// Open the session. Resolves once the gateway accepts the open command,
    /// or with an error when the open timeout elapses first.
    pub async fn open(&self, mode: OpenMode) -> Result<()> {
        self.lifecycle_call(|reply| LifecycleCommand::Open { mode, reply })
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.lifecycle_call(|reply| LifecycleCommand::Close { reply })
            .await
    }

    /// Current session token, refreshed when expired or `force` is set.
    pub async fn session_token(&self, force: bool) -> Result<String> {
        if !force {
            if let Some(token) = self.shared.valid_token() {
                return Ok(token);
            }
        }
        let session = SessionMessage {
            st: self.shared.valid_token(),
            ..Default::default()
        };
        let command = Command::new(CommandBody::Session(session)).with_op(OpType::Refresh);
        let reply = self.shared.request(command).await?;
        match &reply.body {
            CommandBody::Session(session) => self
                .shared
                .capture_token(session)
                .ok_or_else(|| RtmError::MalformedData("refresh reply without token".into())),
            _ => Err(RtmError::CommandInvalid("session refresh reply".into())),
        }
    }

    // -- Conversations --

    /// The conversation for `id`, from cache or one coalesced backend query.
    pub async fn conversation(&self, id: &str) -> Result<Arc<Conversation>> {
        lookup::resolve(&self.shared, id).await
    }

    /// Conversations for `ids`; cached ones are returned without a query.
    pub async fn conversations(&self, ids: &[String]) -> Result<Vec<Arc<Conversation>>> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in ids {
            match self.shared.conversations.get(id) {
                Some(conversation) => found.push(conversation),
                None => missing.push(id.clone()),
            }
        }
        if !missing.is_empty() {
            found.extend(lookup::query(&self.shared, &missing).await?);
        }
        Ok(found)
    }

    pub fn cached_conversation(&self, id: &str) -> Option<Arc<Conversation>> {
        self.shared.conversations.get(id)
    }

    /// Drop cached instances for `ids`, or all of them.
    pub fn evict_cached_conversations(&self, ids: Option<&[String]>) {
        self.shared.conversations.evict(ids);
    }

    /// Load stored conversations into the session cache for offline reads.
    pub fn load_stored_conversations(&self, order: ConversationOrder) -> Result<Vec<Arc<Conversation>>> {
        let store = self.shared.store.as_ref().ok_or(RtmError::StorageUnavailable)?;
        let stored = store.list_conversations(order)?;
        Ok(stored
            .iter()
            .map(|row| {
                self.shared.conversations.adopt(Conversation::from_stored(
                    row,
                    &self.shared.client_id,
                    Some(store.clone()),
                ))
            })
            .collect())
    }

    /// Delete stored conversations and evict them from the cache.
    pub fn remove_stored_conversations(&self, ids: &[String]) -> Result<()> {
        let store = self.shared.store.as_ref().ok_or(RtmError::StorageUnavailable)?;
        store.delete_conversations(ids)?;
        self.shared.conversations.evict(Some(ids));
        Ok(())
    }

    pub async fn create_conversation(&self, options: CreateOptions) -> Result<Arc<Conversation>> {
        if options.unique && options.kind != CreateKind::Normal {
            return Err(RtmError::InvalidArgument(
                "unique applies to normal conversations only".into(),
            ));
        }
        if let CreateKind::Temporary { ttl_secs: Some(ttl) } = options.kind {
            if ttl <= 0 {
                return Err(RtmError::InvalidArgument("temporary ttl must be positive".into()));
            }
        }

        let client_id = &self.shared.client_id;
        let mut members = Vec::new();
        if options.kind != CreateKind::Transient {
            members.push(client_id.clone());
            for member in &options.members {
                if !members.contains(member) {
                    members.push(member.clone());
                }
            }
        }

        let mut attr = Map::new();
        if let Some(name) = &options.name {
            attr.insert("name".into(), Value::String(name.clone()));
        }
        if let Some(attributes) = &options.attributes {
            attr.insert("attr".into(), Value::Object(attributes.clone()));
        }

        let mut message = ConvMessage {
            m: members.clone(),
            attr: (!attr.is_empty()).then(|| Value::Object(attr)),
            unique: options.unique.then_some(true),
            ..Default::default()
        };
        match options.kind {
            CreateKind::Normal => {}
            CreateKind::Transient => message.transient = Some(true),
            CreateKind::Temporary { ttl_secs } => {
                message.temp = Some(true);
                message.temp_conv_ttl = ttl_secs;
            }
        }

        let reply = self
            .shared
            .request(Command::new(CommandBody::Conv(message)).with_op(OpType::Start))
            .await?;
        let CommandBody::Conv(started) = reply.body else {
            return Err(RtmError::CommandInvalid("conversation start reply".into()));
        };
        let id = started
            .cid
            .ok_or_else(|| RtmError::MalformedData("start reply without cid".into()))?;

        let mut raw = RawData::new();
        raw.insert("objectId".into(), Value::String(id.clone()));
        raw.insert("c".into(), Value::String(client_id.clone()));
        if options.kind != CreateKind::Transient {
            raw.insert("m".into(), Value::from(members));
        }
        if let Some(cdate) = started.cdate {
            raw.insert("createdAt".into(), Value::String(cdate.clone()));
            raw.insert("updatedAt".into(), Value::String(cdate));
        }
        if let Some(name) = options.name {
            raw.insert("name".into(), Value::String(name));
        }
        if let Some(attributes) = options.attributes {
            raw.insert("attr".into(), Value::Object(attributes));
        }
        if options.unique {
            raw.insert("unique".into(), Value::Bool(true));
        }
        if let Some(unique_id) = started.unique_id {
            raw.insert("uniqueId".into(), Value::String(unique_id));
        }
        let conv_type = match options.kind {
            CreateKind::Normal => 1,
            CreateKind::Transient => {
                raw.insert("tr".into(), Value::Bool(true));
                2
            }
            CreateKind::Temporary { ttl_secs } => {
                raw.insert("temp".into(), Value::Bool(true));
                if let Some(ttl) = started.temp_conv_ttl.or(ttl_secs) {
                    raw.insert("ttl".into(), Value::from(ttl));
                }
                4
            }
        };
        raw.insert("conv_type".into(), Value::from(conv_type));

        tracing::info!(client = %client_id, conversation = %id, "session: conversation created");
        Ok(self
            .shared
            .conversations
            .upsert(&self.shared, &id, raw, Operation::RawDataMerge))
    }

    // -- Messages --

    /// Send `message` to `conversation`. On success the message carries its
    /// server id and timestamp; on failure it is marked failed and, for
    /// stored conversations, kept as a failed row for a later resend.
    pub async fn send_message(
        &self,
        conversation: &Arc<Conversation>,
        message: &mut Message,
        options: SendOptions,
    ) -> Result<()> {
        if matches!(message.send_state, SendState::Sending | SendState::Sent) {
            return Err(RtmError::InvalidArgument("message already sent".into()));
        }
        let resend = match (message.send_state, message.sending_timestamp, &message.dedup_token) {
            (SendState::Failed, Some(ts), Some(token)) => Some((ts, token.clone())),
            _ => None,
        };

        message.conversation_id = Some(conversation.id().to_string());
        message.from_peer_id = Some(self.shared.client_id.clone());
        message.direction = Direction::Out;
        message.transient = options.transient;
        message.will = options.will;
        if message.dedup_token.is_none() {
            message.dedup_token = Some(new_dedup_token());
        }
        message.sending_timestamp = Some(now_millis());
        message.send_state = SendState::Sending;

        let result = match message.to_direct(conversation.id(), options.receipt) {
            Ok(direct) => self.shared.request(Command::new(CommandBody::Direct(direct))).await,
            Err(e) => Err(e),
        };

        let ack = result.and_then(|reply| match reply.body {
            CommandBody::Ack(ack) => Ok(ack),
            _ => Err(RtmError::CommandInvalid("direct reply".into())),
        });
        let store = conversation.store();
        match ack {
            Ok(ack) => {
                message.id = ack.mid;
                message.sent_timestamp = ack.t;
                message.send_state = SendState::Sent;
                if let (Some(store), Some((ts, token))) = (store, resend) {
                    if let Err(e) = store.delete_failed_message(conversation.id(), ts, &token) {
                        tracing::warn!(conversation = %conversation.id(), "store: failed row not removed: {e}");
                    }
                }
                if !message.transient {
                    let change = conversation.update_last_message(Some(message), None);
                    self.shared.emit_last_message_change(conversation, change);
                }
                Ok(())
            }
            Err(e) => {
                message.send_state = SendState::Failed;
                if let (Some(store), false) = (store, message.transient || message.will) {
                    if let Some(row) = message.to_row() {
                        if let Err(e) = store.insert_failed_message(&row) {
                            tracing::warn!(conversation = %conversation.id(), "store: failed message not kept: {e}");
                        }
                    }
                }
                tracing::debug!(conversation = %conversation.id(), "session: send failed: {e}");
                Err(e)
            }
        }
    }

    /// Mark `conversation` read up to its last message and clear unread.
    pub fn read(&self, conversation: &Arc<Conversation>) -> Result<()> {
        let connection = self.shared.opened_connection()?;
        let last = conversation.last_message();
        let tuple = ReadTuple {
            cid: conversation.id().to_string(),
            mid: last.as_ref().and_then(|m| m.id.clone()),
            timestamp: last.as_ref().and_then(|m| m.sent_timestamp),
        };
        connection.send(
            &self.shared.client_id,
            Command::new(CommandBody::Read(ReadMessage { convs: vec![tuple] })),
        );
        if conversation.clear_unread() {
            self.shared
                .emit_conversation(conversation, ConversationEvent::UnreadCountUpdated);
        }
        Ok(())
    }

    // -- Membership --

    pub async fn add_members(
        &self,
        conversation: &Arc<Conversation>,
        members: &[String],
    ) -> Result<MembersResult> {
        self.change_members(conversation, members, true).await
    }

    pub async fn remove_members(
        &self,
        conversation: &Arc<Conversation>,
        members: &[String],
    ) -> Result<MembersResult> {
        self.change_members(conversation, members, false).await
    }

    async fn change_members(
        &self,
        conversation: &Arc<Conversation>,
        members: &[String],
        add: bool,
    ) -> Result<MembersResult> {
        if members.is_empty() {
            return Err(RtmError::InvalidArgument("member list is empty".into()));
        }
        if conversation.kind() == ConversationKind::Transient {
            return Err(RtmError::InvalidArgument(
                "transient conversations have no member list".into(),
            ));
        }
        let message = ConvMessage {
            cid: Some(conversation.id().to_string()),
            m: members.to_vec(),
            ..Default::default()
        };
        let op = if add { OpType::Add } else { OpType::Remove };
        let reply = self
            .shared
            .request(Command::new(CommandBody::Conv(message)).with_op(op))
            .await?;
        let CommandBody::Conv(result) = reply.body else {
            return Err(RtmError::CommandInvalid("member change reply".into()));
        };

        let failed: Vec<(Vec<String>, RtmError)> = result
            .failed_pids
            .into_iter()
            .map(|f| {
                let error = RtmError::Server {
                    code: f.code,
                    reason: f.reason,
                    app_code: None,
                    app_message: None,
                    detail: None,
                };
                (f.pids, error)
            })
            .collect();
        let allowed = if result.allowed_pids.is_empty() && failed.is_empty() {
            members.to_vec()
        } else {
            result.allowed_pids
        };

        if !allowed.is_empty() {
            let udate = result.udate;
            let operation = if add {
                Operation::Append {
                    members: allowed.clone(),
                    udate,
                }
            } else {
                Operation::Remove {
                    members: allowed.clone(),
                    udate,
                }
            };
            conversation.apply(operation);
        }
        Ok(MembersResult { allowed, failed })
    }

    /// Mute or unmute offline notifications of `conversation` for this peer.
    pub async fn set_muted(&self, conversation: &Arc<Conversation>, mute: bool) -> Result<()> {
        let message = ConvMessage {
            cid: Some(conversation.id().to_string()),
            ..Default::default()
        };
        let op = if mute { OpType::Mute } else { OpType::Unmute };
        let reply = self
            .shared
            .request(Command::new(CommandBody::Conv(message)).with_op(op))
            .await?;
        let udate = match reply.body {
            CommandBody::Conv(result) => result.udate,
            _ => return Err(RtmError::CommandInvalid("mute reply".into())),
        };
        conversation.apply(if mute {
            Operation::Mute { udate }
        } else {
            Operation::Unmute { udate }
        });
        Ok(())
    }

    /// Which of `ids` (1 to 20) currently have an open session.
    pub async fn query_online_clients(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() || ids.len() > DEFAULT_PARAMS.max_online_query_ids {
            return Err(RtmError::InvalidArgument(format!(
                "online query takes 1...{} ids, got {}",
                DEFAULT_PARAMS.max_online_query_ids,
                ids.len()
            )));
        }
        let session = SessionMessage {
            session_peer_ids: ids.to_vec(),
            ..Default::default()
        };
        let reply = self
            .shared
            .request(Command::new(CommandBody::Session(session)).with_op(OpType::Query))
            .await?;
        match reply.body {
            CommandBody::Session(result) => Ok(result.online_session_peer_ids),
            _ => Err(RtmError::CommandInvalid("online query reply".into())),
        }
    }

    // -- History --

    /// Messages of `conversation` in ascending position order.
    pub async fn query_messages(
        &self,
        conversation: &Arc<Conversation>,
        query: MessageQuery,
    ) -> Result<Vec<Message>> {
        let (min, max) = (DEFAULT_PARAMS.message_page_min, DEFAULT_PARAMS.message_page_max);
        if !(min..=max).contains(&query.limit) {
            return Err(RtmError::InvalidArgument(format!(
                "limit must be in {min}...{max}, got {}",
                query.limit
            )));
        }
        let range = MessageRange {
            conversation_id: conversation.id().to_string(),
            start: query.start.clone(),
            end: query.end.clone(),
            direction: query.direction,
            limit: query.limit,
        };
        let store = conversation.store();

        match (query.policy, store) {
            (QueryPolicy::OnlyCache, None) => return Err(RtmError::StorageUnavailable),
            (QueryPolicy::OnlyCache, Some(store)) => {
                let page = store.select_messages(&range)?;
                return Ok(self.rows_to_messages(&page.messages));
            }
            (QueryPolicy::Default, Some(store)) => match store.select_messages(&range) {
                Ok(page) if !page.has_breakpoint && !page.messages.is_empty() => {
                    return Ok(self.rows_to_messages(&page.messages));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(conversation = %conversation.id(), "store: history read failed: {e}");
                }
            },
            _ => {}
        }

        let messages = self.fetch_messages(conversation, &range).await?;
        if let Some(store) = store {
            let rows: Vec<_> = messages.iter().filter_map(Message::to_row).collect();
            if let Err(e) = store.insert_message_page(&rows) {
                tracing::warn!(conversation = %conversation.id(), "store: history page not cached: {e}");
            }
        }
        Ok(messages)
    }

    fn rows_to_messages(&self, rows: &[rtm_storage::MessageRow]) -> Vec<Message> {
        rows.iter()
            .map(|row| Message::from_row(row, &self.shared.client_id))
            .collect()
    }

    async fn fetch_messages(
        &self,
        conversation: &Arc<Conversation>,
        range: &MessageRange,
    ) -> Result<Vec<Message>> {
        let logs = LogsMessage {
            cid: Some(conversation.id().to_string()),
            t: range.start.as_ref().map(|e| e.sent_timestamp),
            mid: range.start.as_ref().and_then(|e| e.message_id.clone()),
            t_included: range.start.as_ref().map(|e| e.closed),
            tt: range.end.as_ref().map(|e| e.sent_timestamp),
            tmid: range.end.as_ref().and_then(|e| e.message_id.clone()),
            tt_included: range.end.as_ref().map(|e| e.closed),
            direction: Some(range.direction.wire()),
            limit: Some(range.limit as u32),
            ..Default::default()
        };
        let reply = self
            .shared
            .request(Command::new(CommandBody::Logs(logs)))
            .await?;
        let CommandBody::Logs(page) = reply.body else {
            return Err(RtmError::CommandInvalid("history reply".into()));
        };
        let mut messages: Vec<Message> = page
            .logs
            .iter()
            .map(|item| Message::from_log(conversation.id(), item, &self.shared.client_id))
            .collect();
        messages.sort_by(|a, b| a.cmp_position(b));
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_message_query() {
        let query = MessageQuery::default();
        assert_eq!(query.direction, QueryDirection::NewToOld);
        assert_eq!(query.policy, QueryPolicy::Default);
        assert!((DEFAULT_PARAMS.message_page_min..=DEFAULT_PARAMS.message_page_max).contains(&query.limit));
    }
}
