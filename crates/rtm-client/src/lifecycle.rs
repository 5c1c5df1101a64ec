//! Session lifecycle task -- open, resume and close.
//!
//! Owns the session state transitions. Open and reopen commands are sent
//! from spawned tasks and their replies come back tagged with an epoch, so
//! a reply that lost the race with a timeout or a newer attempt is ignored.
//! The overall open deadline is tracked separately from the per-command
//! timeout; whichever fires first settles the pending open exactly once.

use rtm_protocol::{Command, CommandBody, CommandKind, OpType, SessionMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::connection::ConnectionEvent;
use crate::dispatch::DispatchJob;
use crate::error::{DisconnectCause, Result, RtmError};
use crate::session::{OpenMode, SessionEvent, SessionShared, SessionState};

const USER_AGENT: &str = concat!("rtm-client/", env!("CARGO_PKG_VERSION"));

pub(crate) enum LifecycleCommand {
    Open {
        mode: OpenMode,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

enum Internal {
    OpenReply { epoch: u64, result: Result<Command> },
    OpenTimeout { epoch: u64 },
    CloseReply { epoch: u64, result: Result<Command> },
}

struct LifecycleActor {
    shared: Arc<SessionShared>,
    dispatch: mpsc::UnboundedSender<DispatchJob>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    conn_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    pending_open: Option<oneshot::Sender<Result<()>>>,
    pending_close: Option<oneshot::Sender<Result<()>>>,
    mode: OpenMode,
    /// Bumped on every open/close command sent; stale replies are dropped.
    epoch: u64,
    /// Bumped on every `open` call; stale open timeouts are dropped.
    open_epoch: u64,
}

pub(crate) fn spawn(
    shared: Arc<SessionShared>,
    dispatch: mpsc::UnboundedSender<DispatchJob>,
) -> mpsc::UnboundedSender<LifecycleCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let actor = LifecycleActor {
        shared,
        dispatch,
        internal_tx,
        conn_rx: None,
        pending_open: None,
        pending_close: None,
        mode: OpenMode::default(),
        epoch: 0,
        open_epoch: 0,
    };
    tokio::spawn(actor.run(rx, internal_rx));
    tx
}

/// Build an open command: reuse a valid session token on reopen, else sign.
async fn open_command(shared: &SessionShared, reopen: bool, reconnect: bool) -> Result<Command> {
    let record = shared.local_record();
    let mut session = SessionMessage {
        ua: Some(USER_AGENT.to_string()),
        tag: shared.tag.clone(),
        device_token: shared.device_token.clone(),
        r: (reopen || reconnect).then_some(true),
        config_bitmap: Some(shared.config_bitmap),
        last_unread_notif_time: shared.last_unread_notif_time(),
        last_patch_time: record.last_patch_timestamp,
        ..Default::default()
    };
    match shared.valid_token().filter(|_| reopen) {
        Some(token) => session.st = Some(token),
        None => {
            if let Some(signer) = &shared.signer {
                let signature = signer.open_signature(&shared.client_id).await?;
                session.s = Some(signature.signature);
                session.t = Some(signature.timestamp);
                session.n = Some(signature.nonce);
            }
        }
    }
    Ok(Command::new(CommandBody::Session(session))
        .with_op(OpType::Open)
        .with_app(shared.app_id.clone())
        .with_peer(shared.client_id.clone()))
}

impl LifecycleActor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<LifecycleCommand>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(LifecycleCommand::Open { mode, reply }) => self.on_open(mode, reply),
                    Some(LifecycleCommand::Close { reply }) => self.on_close(reply),
                    None => break,
                },

                Some(internal) = internal_rx.recv() => match internal {
                    Internal::OpenReply { epoch, result } => {
                        if epoch == self.epoch {
                            self.on_open_reply(result);
                        }
                    }
                    Internal::OpenTimeout { epoch } => {
                        if epoch == self.open_epoch {
                            self.on_open_timeout();
                        }
                    }
                    Internal::CloseReply { epoch, result } => {
                        if epoch == self.epoch {
                            self.on_close_reply(result);
                        }
                    }
                },

                Some(event) = async {
                    match self.conn_rx.as_mut() {
                        Some(conn_rx) => conn_rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => self.on_connection_event(event),
            }
        }

        // Every handle dropped: leave the connection.
        if self.shared.state() != SessionState::Closed {
            self.shared.release();
            self.shared.set_state(SessionState::Closed);
        }
        tracing::debug!(client = %self.shared.client_id, "session: lifecycle task stopped");
    }

    fn on_open(&mut self, mode: OpenMode, reply: oneshot::Sender<Result<()>>) {
        let state = self.shared.state();
        if state != SessionState::Closed {
            let _ = reply.send(Err(RtmError::SessionStateConflict(format!(
                "session is {state:?}"
            ))));
            return;
        }

        let shared = &self.shared;
        let connection = match shared
            .registry
            .acquire(&shared.app_id, shared.variant, &shared.client_id)
        {
            Ok(connection) => connection,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        shared.set_connection(Some(connection.clone()));
        shared.set_state(SessionState::Opening);
        self.conn_rx = Some(conn_rx);
        self.pending_open = Some(reply);
        self.mode = mode;

        self.open_epoch += 1;
        let epoch = self.open_epoch;
        let timeout = shared.open_timeout;
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = internal_tx.send(Internal::OpenTimeout { epoch });
        });

        tracing::info!(client = %shared.client_id, ?mode, "session: opening");
        connection.connect(&shared.client_id, conn_tx);
    }

    fn on_close(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.shared.state() {
            SessionState::Opened => {
                self.shared.set_state(SessionState::Closing);
                self.pending_close = Some(reply);
                self.epoch += 1;
                let epoch = self.epoch;
                let shared = self.shared.clone();
                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = match shared.connection() {
                        Some(connection) => {
                            let command = Command::new(CommandBody::Session(SessionMessage::default()))
                                .with_op(OpType::Close);
                            connection
                                .request(&shared.client_id, command, shared.command_timeout)
                                .await
                        }
                        None => Err(RtmError::ClientNotOpen),
                    };
                    let _ = internal_tx.send(Internal::CloseReply { epoch, result });
                });
            }
            SessionState::Resuming | SessionState::Paused => {
                // No live socket to say goodbye on.
                self.finish_close();
                let _ = reply.send(Ok(()));
            }
            _ => {
                let _ = reply.send(Err(RtmError::ClientNotOpen));
            }
        }
    }

    fn on_close_reply(&mut self, result: Result<Command>) {
        if self.shared.state() != SessionState::Closing {
            return;
        }
        self.finish_close();
        if let Some(reply) = self.pending_close.take() {
            let _ = reply.send(result.map(|_| ()));
        }
    }

    /// Transition to closed and leave the connection. Bumps the epoch so
    /// any in-flight open reply is dropped.
    fn finish_close(&mut self) {
        self.epoch += 1;
        self.open_epoch += 1;
        self.conn_rx = None;
        self.shared.release();
        self.shared.set_state(SessionState::Closed);
        tracing::info!(client = %self.shared.client_id, "session: closed");
    }

    /// Closed by the server or by an unrecoverable reopen error.
    fn close_with(&mut self, error: RtmError) {
        tracing::warn!(client = %self.shared.client_id, code = error.code(), "session: closed: {error}");
        self.finish_close();
        if let Some(reply) = self.pending_open.take() {
            let _ = reply.send(Err(error.clone()));
        }
        if let Some(reply) = self.pending_close.take() {
            let _ = reply.send(Ok(()));
        }
        self.shared.emit(SessionEvent::DidClose(error));
    }

    fn send_open(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        let reopen = self.shared.state() == SessionState::Resuming;
        let reconnect = self.mode == OpenMode::Reconnect;
        let shared = self.shared.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let command = open_command(&shared, reopen, reconnect).await?;
                let connection = shared.connection().ok_or(RtmError::ClientNotOpen)?;
                connection
                    .request(&shared.client_id, command, shared.command_timeout)
                    .await
            }
            .await;
            let _ = internal_tx.send(Internal::OpenReply { epoch, result });
        });
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        let state = self.shared.state();
        match event {
            ConnectionEvent::InConnecting => {
                if matches!(state, SessionState::Opened | SessionState::Paused) {
                    self.shared.set_state(SessionState::Resuming);
                }
            }
            ConnectionEvent::Connected => match state {
                SessionState::Opening => self.send_open(),
                SessionState::Resuming | SessionState::Paused => {
                    self.shared.set_state(SessionState::Resuming);
                    self.send_open();
                }
                _ => {}
            },
            ConnectionEvent::Disconnected(error) => {
                if matches!(state, SessionState::Opened | SessionState::Resuming) {
                    self.shared.set_state(SessionState::Paused);
                    if state == SessionState::Opened {
                        self.shared.emit(SessionEvent::DidPause(error));
                    }
                }
            }
            ConnectionEvent::Command(command) => {
                if command.is(CommandKind::Session, OpType::Closed) {
                    if matches!(state, SessionState::Closed | SessionState::Closing) {
                        return;
                    }
                    let error = RtmError::from_reply(&command)
                        .unwrap_or(RtmError::ConnectionLost(DisconnectCause::ClosedByRemote));
                    self.close_with(error);
                    return;
                }
                if self.dispatch.send(DispatchJob::Inbound(command)).is_err() {
                    tracing::debug!(client = %self.shared.client_id, "session: dispatch task gone, command dropped");
                }
            }
        }
    }

    fn on_open_reply(&mut self, result: Result<Command>) {
        let state = self.shared.state();
        match (state, result) {
            (SessionState::Opening | SessionState::Resuming, Ok(reply)) => {
                self.on_opened(state, reply);
            }
            // Reconnection follows; the next Connected sends again.
            (SessionState::Opening | SessionState::Resuming | SessionState::Paused, Err(e))
                if e.is_connection_lost() =>
            {
                tracing::debug!(client = %self.shared.client_id, "session: open interrupted: {e}");
            }
            (SessionState::Opening, Err(e)) => {
                tracing::warn!(client = %self.shared.client_id, code = e.code(), "session: open failed: {e}");
                self.finish_close();
                if let Some(reply) = self.pending_open.take() {
                    let _ = reply.send(Err(e));
                }
            }
            (SessionState::Resuming, Err(RtmError::CommandTimeout)) => {
                tracing::debug!(client = %self.shared.client_id, "session: reopen timed out, retrying");
                self.send_open();
            }
            (SessionState::Resuming, Err(e)) if e.is_session_token_expired() => {
                tracing::info!(client = %self.shared.client_id, "session: token expired, signing again");
                self.shared.set_token(None);
                self.send_open();
            }
            (SessionState::Resuming, Err(e)) => self.close_with(e),
            _ => {}
        }
    }

    fn on_opened(&mut self, previous: SessionState, reply: Command) {
        if let CommandBody::Session(session) = &reply.body {
            self.shared.capture_token(session);
        }
        // A first open starts the patch mark at the server clock.
        if self.shared.local_record().last_patch_timestamp.is_none() {
            if let Some(ts) = reply.server_ts {
                self.shared.advance_patch_timestamp(ts);
            }
        }
        self.shared.set_state(SessionState::Opened);
        if previous == SessionState::Opening {
            tracing::info!(client = %self.shared.client_id, "session: opened");
            self.open_epoch += 1;
            if let Some(reply) = self.pending_open.take() {
                let _ = reply.send(Ok(()));
            }
            self.shared.emit(SessionEvent::DidOpen);
        } else {
            tracing::info!(client = %self.shared.client_id, "session: resumed");
            self.shared.emit(SessionEvent::DidResume);
        }
        if self.shared.local_record().last_server_timestamp.is_some()
            && self.dispatch.send(DispatchJob::Reconcile).is_err()
        {
            tracing::debug!(client = %self.shared.client_id, "session: dispatch task gone, reconcile skipped");
        }
    }

    fn on_open_timeout(&mut self) {
        if self.shared.state() != SessionState::Opening {
            return;
        }
        tracing::warn!(client = %self.shared.client_id, "session: open timed out");
        self.finish_close();
        if let Some(reply) = self.pending_open.take() {
            let _ = reply.send(Err(RtmError::CommandTimeout));
        }
    }
}
