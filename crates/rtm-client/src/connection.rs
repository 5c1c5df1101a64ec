//! Connection task -- owns one gateway socket per (application, protocol
//! variant) and multiplexes logical peers over it.
//!
//! All socket I/O and correlation state live on this task. Peers talk to it
//! through a cloneable [`ConnectionHandle`]; replies come back on oneshot
//! channels and pushes on each peer's [`ConnectionEvent`] channel.
//!
//! Every reply-expecting command holds one outstanding entry that resolves
//! exactly once: with the reply, with a timeout from the 1 Hz scan, or with
//! connection-lost when the socket goes away.

use bytes::Bytes;
use rtm_protocol::{AppId, Command, CommandCodec, CommandKind, PeerId, ProtocolVariant, DEFAULT_PARAMS};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{DisconnectCause, Result, RtmError};
use crate::router::Router;
use crate::transport::{Connector, Socket, SocketEvent};

/// Upper bound on a single router lookup + socket connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Public types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Host environment as reported by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub foreground: bool,
    /// Identifier of the reachable network, `None` when unreachable.
    pub network: Option<String>,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            foreground: true,
            network: Some("default".into()),
        }
    }
}

impl Environment {
    fn permits_connect(&self) -> bool {
        self.foreground && self.network.is_some()
    }
}

/// Delivered to each registered peer.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    InConnecting,
    Connected,
    Disconnected(RtmError),
    Command(Command),
}

/// Reconnect delay after `failures` consecutive failures:
/// 0 for none, then base * 2^(n-1) capped at the max.
pub fn reconnect_backoff(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let p = &DEFAULT_PARAMS;
    let shift = (failures - 1).min(p.backoff_saturation_count);
    let secs = p
        .reconnect_backoff_base_secs
        .saturating_mul(1u64 << shift)
        .min(p.reconnect_backoff_max_secs);
    Duration::from_secs(secs)
}

// ============================================================================
// Commands (inbound to connection task)
// ============================================================================

enum ConnCommand {
    Register {
        peer: PeerId,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    },
    Unregister {
        peer: PeerId,
    },
    Send {
        peer: PeerId,
        command: Command,
        reply: Option<(oneshot::Sender<Result<Command>>, Duration)>,
    },
    SetEnvironment(Environment),
    Shutdown,
}

/// Cheap handle to a connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<ConnCommand>,
    app_id: AppId,
    variant: ProtocolVariant,
}

impl ConnectionHandle {
    /// Spawn the connection task. Nothing connects until a peer registers.
    pub fn spawn(
        app_id: AppId,
        variant: ProtocolVariant,
        connector: Arc<dyn Connector>,
        router: Arc<Router>,
        codec: Arc<dyn CommandCodec>,
        environment: Environment,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (attempt_tx, attempt_rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor {
            variant,
            connector,
            router,
            codec,
            peers: Vec::new(),
            state: ConnectionState::Disconnected,
            socket: None,
            socket_rx: None,
            attempt: None,
            generation: 0,
            attempt_tx,
            outstanding: Outstanding::default(),
            failures: 0,
            use_secondary: false,
            reconnect_at: None,
            environment,
            last_pong: None,
            ping_sent_at: None,
        };
        tokio::spawn(actor.run(rx, attempt_rx));
        tracing::debug!(app = %app_id, ?variant, "conn: task spawned");
        Self {
            tx,
            app_id,
            variant,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    /// Register `peer`; connects if needed. `events` receives `Connected`
    /// once the socket is (or already was) up.
    pub fn connect(&self, peer: &str, events: mpsc::UnboundedSender<ConnectionEvent>) {
        let _ = self.tx.send(ConnCommand::Register {
            peer: peer.to_string(),
            events,
        });
    }

    pub fn remove_peer(&self, peer: &str) {
        let _ = self.tx.send(ConnCommand::Unregister {
            peer: peer.to_string(),
        });
    }

    /// Send without expecting a reply.
    pub fn send(&self, peer: &str, command: Command) {
        let _ = self.tx.send(ConnCommand::Send {
            peer: peer.to_string(),
            command,
            reply: None,
        });
    }

    /// Send and wait for the correlated reply. Resolves exactly once.
    pub async fn request(&self, peer: &str, command: Command, timeout: Duration) -> Result<Command> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ConnCommand::Send {
                peer: peer.to_string(),
                command,
                reply: Some((reply_tx, timeout)),
            })
            .map_err(|_| RtmError::ConnectionLost(DisconnectCause::ClosedByLocal))?;
        reply_rx
            .await
            .unwrap_or(Err(RtmError::ConnectionLost(DisconnectCause::ClosedByLocal)))
    }

    pub fn set_environment(&self, environment: Environment) {
        let _ = self.tx.send(ConnCommand::SetEnvironment(environment));
    }

    /// Tear down the socket and fail every outstanding request.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ConnCommand::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// True when both handles drive the same connection task.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

// ============================================================================
// Outstanding requests
// ============================================================================

struct Pending {
    peer: PeerId,
    deadline: Instant,
    seq: u64,
    reply: oneshot::Sender<Result<Command>>,
}

/// Correlation index table with FIFO deadline order.
struct Outstanding {
    entries: HashMap<u16, Pending>,
    order: VecDeque<(u16, u64)>,
    next_index: u16,
    next_seq: u64,
}

impl Default for Outstanding {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_index: 1,
            next_seq: 0,
        }
    }
}

impl Outstanding {
    /// Next free index in 1..=max, skipping ones still outstanding.
    fn allocate(&mut self) -> Option<u16> {
        let max = DEFAULT_PARAMS.max_correlation_index;
        if self.entries.len() >= max as usize {
            return None;
        }
        loop {
            let candidate = self.next_index;
            self.next_index = if candidate >= max { 1 } else { candidate + 1 };
            if !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
    }

    fn insert(
        &mut self,
        index: u16,
        peer: PeerId,
        deadline: Instant,
        reply: oneshot::Sender<Result<Command>>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            index,
            Pending {
                peer,
                deadline,
                seq,
                reply,
            },
        );
        self.order.push_back((index, seq));
    }

    fn resolve(&mut self, index: u16) -> Option<Pending> {
        self.entries.remove(&index)
    }

    /// Remove entries whose deadline has passed, in FIFO order.
    fn expire(&mut self, now: Instant) -> Vec<Pending> {
        let entries = &mut self.entries;
        let mut expired = Vec::new();
        self.order.retain(|(index, seq)| {
            let (live, due) = match entries.get(index) {
                Some(p) if p.seq == *seq => (true, p.deadline <= now),
                _ => (false, false),
            };
            if !live {
                return false;
            }
            if due {
                if let Some(p) = entries.remove(index) {
                    expired.push(p);
                }
                return false;
            }
            true
        });
        expired
    }

    fn drain(&mut self) -> Vec<Pending> {
        self.order.clear();
        let mut all: Vec<Pending> = self.entries.drain().map(|(_, p)| p).collect();
        all.sort_by_key(|p| p.seq);
        all
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// Task
// ============================================================================

type Attempt = Result<(Box<dyn Socket>, mpsc::UnboundedReceiver<SocketEvent>)>;

struct AttemptOutcome {
    generation: u64,
    result: Attempt,
}

struct ConnectionActor {
    variant: ProtocolVariant,
    connector: Arc<dyn Connector>,
    router: Arc<Router>,
    codec: Arc<dyn CommandCodec>,
    /// Registration order; the first peer is the default route.
    peers: Vec<(PeerId, mpsc::UnboundedSender<ConnectionEvent>)>,
    state: ConnectionState,
    socket: Option<Box<dyn Socket>>,
    socket_rx: Option<mpsc::UnboundedReceiver<SocketEvent>>,
    attempt: Option<JoinHandle<()>>,
    generation: u64,
    attempt_tx: mpsc::UnboundedSender<AttemptOutcome>,
    outstanding: Outstanding,
    failures: u32,
    use_secondary: bool,
    reconnect_at: Option<Instant>,
    environment: Environment,
    last_pong: Option<Instant>,
    ping_sent_at: Option<Instant>,
}

async fn recv_socket(rx: &mut Option<mpsc::UnboundedReceiver<SocketEvent>>) -> Option<SocketEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
        mut attempt_rx: mpsc::UnboundedReceiver<AttemptOutcome>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_secs(DEFAULT_PARAMS.tick_interval_secs));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Shutdown) | None => {
                        self.shutdown();
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(outcome) = attempt_rx.recv() => {
                    self.handle_attempt(outcome).await;
                }
                event = recv_socket(&mut self.socket_rx) => {
                    self.handle_socket_event(event).await;
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.try_connect();
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
            }
        }
        tracing::debug!("conn: task stopped");
    }

    async fn handle_command(&mut self, cmd: ConnCommand) {
        match cmd {
            ConnCommand::Register { peer, events } => {
                match self.peers.iter_mut().find(|(p, _)| *p == peer) {
                    Some(entry) => entry.1 = events.clone(),
                    None => self.peers.push((peer.clone(), events.clone())),
                }
                tracing::debug!(%peer, peers = self.peers.len(), "conn: peer registered");
                match self.state {
                    ConnectionState::Connected => {
                        let _ = events.send(ConnectionEvent::Connected);
                    }
                    ConnectionState::Connecting => {
                        let _ = events.send(ConnectionEvent::InConnecting);
                    }
                    // A pending backoff keeps its deadline.
                    ConnectionState::Disconnected if self.reconnect_at.is_some() => {
                        tracing::debug!(%peer, "conn: reconnect already scheduled");
                    }
                    ConnectionState::Disconnected => self.try_connect(),
                }
            }
            ConnCommand::Unregister { peer } => {
                self.peers.retain(|(p, _)| *p != peer);
                tracing::debug!(%peer, peers = self.peers.len(), "conn: peer removed");
                if self.peers.is_empty() {
                    self.reconnect_at = None;
                    self.failures = 0;
                    if self.state != ConnectionState::Disconnected {
                        self.teardown(RtmError::ConnectionLost(DisconnectCause::ClosedByLocal));
                    }
                }
            }
            ConnCommand::Send {
                peer,
                command,
                reply,
            } => self.send_command(peer, command, reply),
            ConnCommand::SetEnvironment(environment) => self.handle_environment(environment),
            // Handled in the run loop.
            ConnCommand::Shutdown => {}
        }
    }

    fn send_command(
        &mut self,
        peer: PeerId,
        mut command: Command,
        reply: Option<(oneshot::Sender<Result<Command>>, Duration)>,
    ) {
        let fail = |reply: Option<(oneshot::Sender<Result<Command>>, Duration)>, err: RtmError| {
            match reply {
                Some((tx, _)) => {
                    let _ = tx.send(Err(err));
                }
                None => tracing::warn!("conn: dropping unsendable command: {err}"),
            }
        };

        if self.peers.len() > 1 && command.peer_id.is_none() {
            command.peer_id = Some(peer.clone());
        }
        command.i = None;
        if reply.is_some() {
            match self.outstanding.allocate() {
                Some(index) => command.i = Some(index),
                None => {
                    fail(reply, RtmError::CommandInvalid("no free correlation index".into()));
                    return;
                }
            }
        }

        let bytes = match self.codec.encode(&command) {
            Ok(bytes) => bytes,
            Err(e) => {
                fail(reply, e.into());
                return;
            }
        };
        let max = DEFAULT_PARAMS.max_command_bytes;
        if bytes.len() > max {
            fail(
                reply,
                RtmError::CommandTooLarge {
                    size: bytes.len(),
                    max,
                },
            );
            return;
        }

        let socket = match (&self.state, self.socket.as_mut()) {
            (ConnectionState::Connected, Some(socket)) => socket,
            _ => {
                fail(reply, RtmError::connection_lost());
                return;
            }
        };
        if let Err(e) = socket.send(Bytes::from(bytes)) {
            fail(reply, e);
            return;
        }

        if let (Some(index), Some((tx, timeout))) = (command.i, reply) {
            self.outstanding
                .insert(index, peer, Instant::now() + timeout, tx);
        }
    }

    fn try_connect(&mut self) {
        if self.state != ConnectionState::Disconnected
            || self.peers.is_empty()
            || !self.environment.permits_connect()
        {
            return;
        }
        self.reconnect_at = None;
        self.state = ConnectionState::Connecting;
        self.generation += 1;
        self.notify_all(ConnectionEvent::InConnecting);

        let generation = self.generation;
        let router = self.router.clone();
        let connector = self.connector.clone();
        let subprotocol = self.variant.subprotocol();
        let use_secondary = self.use_secondary;
        let attempt_tx = self.attempt_tx.clone();
        tracing::debug!(generation, use_secondary, "conn: connecting");

        self.attempt = Some(tokio::spawn(async move {
            let attempt = async {
                let table = router.route().await?;
                let url = table.endpoint(use_secondary).to_string();
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let socket = connector.connect(&url, subprotocol, events_tx).await?;
                Ok((socket, events_rx))
            };
            let result = match tokio::time::timeout(CONNECT_TIMEOUT, attempt).await {
                Ok(result) => result,
                Err(_) => Err(RtmError::CommandTimeout),
            };
            let _ = attempt_tx.send(AttemptOutcome { generation, result });
        }));
    }

    async fn handle_attempt(&mut self, outcome: AttemptOutcome) {
        if outcome.generation != self.generation || self.state != ConnectionState::Connecting {
            if let Ok((mut socket, _)) = outcome.result {
                socket.disconnect();
            }
            return;
        }
        self.attempt = None;
        match outcome.result {
            Ok((socket, events)) => {
                self.state = ConnectionState::Connected;
                self.socket = Some(socket);
                self.socket_rx = Some(events);
                self.failures = 0;
                self.last_pong = None;
                self.ping_sent_at = None;
                self.router.reset_failures().await;
                tracing::info!(peers = self.peers.len(), "conn: connected");
                self.notify_all(ConnectionEvent::Connected);
            }
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                tracing::warn!(failures = self.failures + 1, "conn: connect failed: {e}");
                self.notify_all(ConnectionEvent::Disconnected(e));
                self.record_failure().await;
            }
        }
    }

    async fn handle_socket_event(&mut self, event: Option<SocketEvent>) {
        match event {
            Some(SocketEvent::Data(bytes)) => match self.codec.decode(&bytes) {
                Ok(command) => self.dispatch_inbound(command).await,
                Err(e) => tracing::warn!("conn: undecodable frame dropped: {e}"),
            },
            Some(SocketEvent::Pong(_)) => {
                self.last_pong = Some(Instant::now());
                self.ping_sent_at = None;
            }
            Some(SocketEvent::Closed(reason)) => self.on_socket_lost(reason).await,
            None => self.on_socket_lost(None).await,
        }
    }

    async fn dispatch_inbound(&mut self, command: Command) {
        if let Some(index) = command.i {
            match self.outstanding.resolve(index) {
                Some(pending) => {
                    let result = match RtmError::from_reply(&command) {
                        Some(err) => Err(err),
                        None => Ok(command),
                    };
                    let _ = pending.reply.send(result);
                }
                None => tracing::debug!(index, "conn: reply for unknown index dropped"),
            }
            return;
        }

        if command.kind() == CommandKind::Goaway {
            tracing::info!("conn: goaway received, re-routing");
            self.router.clear().await;
            self.teardown(RtmError::ConnectionLost(DisconnectCause::ClosedByRemote));
            self.failures = 0;
            self.try_connect();
            return;
        }

        let target = match &command.peer_id {
            Some(pid) => self.peers.iter().find(|(p, _)| p == pid),
            None => self.peers.first(),
        };
        match target {
            Some((_, events)) => {
                let _ = events.send(ConnectionEvent::Command(command));
            }
            None => tracing::debug!(peer = ?command.peer_id, kind = command.kind().name(), "conn: unroutable command dropped"),
        }
    }

    async fn on_socket_lost(&mut self, reason: Option<String>) {
        if self.state != ConnectionState::Connected {
            return;
        }
        tracing::warn!(reason = reason.as_deref().unwrap_or("closed"), "conn: socket lost");
        self.teardown(RtmError::connection_lost());
        self.record_failure().await;
    }

    /// Count a failed attempt, flip endpoints and schedule the retry.
    async fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.use_secondary = !self.use_secondary;
        self.router.record_failure().await;
        if !self.peers.is_empty() && self.environment.permits_connect() {
            let delay = reconnect_backoff(self.failures);
            tracing::debug!(delay_secs = delay.as_secs(), "conn: reconnect scheduled");
            self.reconnect_at = Some(Instant::now() + delay);
        }
    }

    /// Drop the socket, fail outstanding requests and tell every peer.
    fn teardown(&mut self, err: RtmError) {
        if let Some(mut socket) = self.socket.take() {
            socket.disconnect();
        }
        self.socket_rx = None;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.last_pong = None;
        self.ping_sent_at = None;

        let pending = self.outstanding.drain();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "conn: failing outstanding requests");
        }
        for p in pending {
            let _ = p.reply.send(Err(err.clone()));
        }
        self.notify_all(ConnectionEvent::Disconnected(err));
    }

    fn handle_environment(&mut self, next: Environment) {
        let prev = std::mem::replace(&mut self.environment, next.clone());
        let active = self.state != ConnectionState::Disconnected;

        if prev.foreground && !next.foreground {
            tracing::info!("conn: application in background");
            self.reset_backoff();
            if active {
                self.teardown(RtmError::ConnectionLost(DisconnectCause::AppInBackground));
            }
            return;
        }

        match (&prev.network, &next.network) {
            (Some(_), None) => {
                tracing::info!("conn: network unavailable");
                self.reset_backoff();
                if active {
                    self.teardown(RtmError::ConnectionLost(DisconnectCause::NetworkUnavailable));
                }
            }
            (Some(a), Some(b)) if a != b => {
                tracing::info!(from = %a, to = %b, "conn: network changed");
                self.reset_backoff();
                if active {
                    self.teardown(RtmError::ConnectionLost(DisconnectCause::NetworkChanged));
                }
                self.try_connect();
            }
            _ => {
                // Foreground regained or network came back.
                if !prev.permits_connect() && next.permits_connect() {
                    self.reset_backoff();
                    self.try_connect();
                }
            }
        }
    }

    fn reset_backoff(&mut self) {
        self.failures = 0;
        self.reconnect_at = None;
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let expired = self.outstanding.expire(now);
        for p in expired {
            tracing::debug!(peer = %p.peer, "conn: request timed out");
            let _ = p.reply.send(Err(RtmError::CommandTimeout));
        }

        if self.state != ConnectionState::Connected {
            return;
        }
        let params = &DEFAULT_PARAMS;
        if let Some(sent) = self.ping_sent_at {
            if now.duration_since(sent) > Duration::from_secs(params.ping_timeout_secs) {
                self.on_socket_lost(Some("ping timeout".into())).await;
            }
            return;
        }
        let due = match self.last_pong {
            None => true,
            Some(pong) => now.duration_since(pong) > Duration::from_secs(params.ping_interval_secs),
        };
        if due {
            let sent = match self.socket.as_mut() {
                Some(socket) => socket.ping(Bytes::new()),
                None => Err(RtmError::connection_lost()),
            };
            match sent {
                Ok(()) => self.ping_sent_at = Some(now),
                Err(e) => self.on_socket_lost(Some(e.to_string())).await,
            }
        }
    }

    fn notify_all(&self, event: ConnectionEvent) {
        for (_, events) in &self.peers {
            let _ = events.send(event.clone());
        }
    }

    fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.teardown(RtmError::ConnectionLost(DisconnectCause::ClosedByLocal));
        tracing::debug!(outstanding = self.outstanding.len(), "conn: shut down");
    }
}
