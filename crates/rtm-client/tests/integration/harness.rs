//! Test harness for in-process rtm-client integration tests.
//!
//! Provides an in-memory gateway (Connector + scripted replies), a scripted
//! HTTP collaborator, a counting signer and a session builder, so sessions
//! run against the real connection and lifecycle tasks without a network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rtm_client::config::ClientConfig;
use rtm_client::http::{HttpClient, Signature, SignatureProvider};
use rtm_client::transport::{Connector, Socket, SocketEvent};
use rtm_client::{ConnectionRegistry, RtmError, Session, SessionEvent};
use rtm_protocol::{Command, CommandBody, CommandCodec, JsonCommandCodec, OpType, SessionMessage};
use rtm_storage::LocalStore;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

pub const APP_ID: &str = "test-app";
pub const API_SERVER: &str = "https://api.test";
pub const ROUTER_SERVER: &str = "https://router.test";
pub const GATEWAY_URL: &str = "mem://gateway";

/// Decides the gateway's replies to each command a client sends.
pub type Responder = Arc<dyn Fn(&Command) -> Vec<Command> + Send + Sync>;

/// Reply to `request`, echoing its correlation index and peer.
pub fn reply_to(request: &Command, body: CommandBody, op: OpType) -> Command {
    let mut reply = Command::new(body).with_op(op);
    reply.i = request.i;
    reply.peer_id = request.peer_id.clone();
    reply
}

fn session_body(command: &Command) -> Option<&SessionMessage> {
    match &command.body {
        CommandBody::Session(session) => Some(session),
        _ => None,
    }
}

/// Opens succeed with token `token-1`, closes are acknowledged, everything
/// else goes unanswered.
pub fn default_responder(command: &Command) -> Vec<Command> {
    match (&command.body, command.op) {
        (CommandBody::Session(_), Some(OpType::Open)) => vec![opened(command, "token-1")],
        (CommandBody::Session(_), Some(OpType::Close)) => vec![reply_to(
            command,
            CommandBody::Session(SessionMessage::default()),
            OpType::Closed,
        )],
        _ => Vec::new(),
    }
}

pub fn opened(request: &Command, token: &str) -> Command {
    reply_to(
        request,
        CommandBody::Session(SessionMessage {
            st: Some(token.into()),
            st_ttl: Some(3600),
            ..Default::default()
        }),
        OpType::Opened,
    )
}

/// True for a session open carrying a session token rather than a signature.
pub fn is_token_open(command: &Command) -> bool {
    command.op == Some(OpType::Open) && session_body(command).is_some_and(|s| s.st.is_some())
}

#[derive(Default)]
struct GatewayState {
    sent: Vec<Command>,
    /// Event channel of every socket handed out; the last one is live.
    sockets: Vec<mpsc::UnboundedSender<SocketEvent>>,
    attempts: Vec<Instant>,
    urls: Vec<String>,
    refuse: bool,
    pings: usize,
    mute_pongs: bool,
}

/// In-memory gateway. Every connect hands out a socket whose sends are
/// decoded, recorded and answered by the current responder.
#[derive(Clone)]
pub struct Gateway {
    state: Arc<Mutex<GatewayState>>,
    responder: Arc<Mutex<Responder>>,
}

#[allow(dead_code)]
impl Gateway {
    pub fn new() -> Self {
        let responder: Responder = Arc::new(default_responder);
        Self {
            state: Arc::new(Mutex::new(GatewayState::default())),
            responder: Arc::new(Mutex::new(responder)),
        }
    }

    pub fn respond_with(&self, responder: impl Fn(&Command) -> Vec<Command> + Send + Sync + 'static) {
        *self.responder.lock().unwrap() = Arc::new(responder);
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }

    /// Stop answering keepalive pings.
    pub fn mute_pongs(&self, mute: bool) {
        self.state.lock().unwrap().mute_pongs = mute;
    }

    pub fn sent(&self) -> Vec<Command> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_matching(&self, predicate: impl Fn(&Command) -> bool) -> Vec<Command> {
        self.sent().into_iter().filter(|c| predicate(c)).collect()
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.state.lock().unwrap().urls.clone()
    }

    pub fn socket_count(&self) -> usize {
        self.state.lock().unwrap().sockets.len()
    }

    pub fn pings(&self) -> usize {
        self.state.lock().unwrap().pings
    }

    /// Deliver an unsolicited command on the live socket.
    pub fn push(&self, command: Command) {
        let bytes = JsonCommandCodec.encode(&command).unwrap();
        if let Some(socket) = self.state.lock().unwrap().sockets.last() {
            let _ = socket.send(SocketEvent::Data(Bytes::from(bytes)));
        }
    }

    /// Drop the live socket as if the network failed.
    pub fn drop_socket(&self) {
        if let Some(socket) = self.state.lock().unwrap().sockets.last() {
            let _ = socket.send(SocketEvent::Closed(Some("connection reset".into())));
        }
    }
}

struct MemorySocket {
    gateway: Gateway,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl Socket for MemorySocket {
    fn send(&mut self, data: Bytes) -> rtm_client::Result<()> {
        let command = JsonCommandCodec.decode(&data)?;
        let responder = self.gateway.responder.lock().unwrap().clone();
        let replies = responder(&command);
        self.gateway.state.lock().unwrap().sent.push(command);
        for reply in replies {
            let bytes = JsonCommandCodec.encode(&reply)?;
            let _ = self.events.send(SocketEvent::Data(Bytes::from(bytes)));
        }
        Ok(())
    }

    fn ping(&mut self, payload: Bytes) -> rtm_client::Result<()> {
        let mut state = self.gateway.state.lock().unwrap();
        state.pings += 1;
        if !state.mute_pongs {
            let _ = self.events.send(SocketEvent::Pong(payload));
        }
        Ok(())
    }

    fn disconnect(&mut self) {}
}

#[async_trait]
impl Connector for Gateway {
    async fn connect(
        &self,
        url: &str,
        _subprotocol: &str,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> rtm_client::Result<Box<dyn Socket>> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(Instant::now());
        state.urls.push(url.to_string());
        if state.refuse {
            return Err(RtmError::connection_lost());
        }
        state.sockets.push(events.clone());
        Ok(Box::new(MemorySocket {
            gateway: self.clone(),
            events,
        }))
    }
}

/// One recorded GET.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

#[allow(dead_code)]
impl HttpRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Serves the router lookup and the offline notification feed.
pub struct ScriptedHttp {
    requests: Mutex<Vec<HttpRequest>>,
    notifications: Mutex<Value>,
}

#[allow(dead_code)]
impl ScriptedHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            notifications: Mutex::new(json!({})),
        })
    }

    pub fn set_notifications(&self, feed: Value) {
        *self.notifications.lock().unwrap() = feed;
    }

    pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(path))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> rtm_client::Result<Value> {
        self.requests.lock().unwrap().push(HttpRequest {
            url: url.to_string(),
            query: query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        });
        if url.ends_with("/v1/route") {
            return Ok(json!({"server": GATEWAY_URL, "ttl": 3600}));
        }
        if url.ends_with("/rtm/notifications") {
            return Ok(self.notifications.lock().unwrap().clone());
        }
        Err(RtmError::Http(format!("404 for {url}")))
    }

    async fn post_json(
        &self,
        url: &str,
        _headers: &[(&str, String)],
        _body: &Value,
    ) -> rtm_client::Result<Value> {
        Err(RtmError::Http(format!("404 for {url}")))
    }
}

/// Signs every open with a fresh counter value.
#[derive(Default)]
pub struct CountingSigner {
    calls: AtomicUsize,
}

impl CountingSigner {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignatureProvider for CountingSigner {
    async fn open_signature(&self, client_id: &str) -> rtm_client::Result<Signature> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Signature {
            signature: format!("sig-{client_id}-{n}"),
            timestamp: 1_700_000_000 + n as i64,
            nonce: format!("nonce-{n}"),
        })
    }
}

pub fn test_config(client_id: &str) -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.app.app_id = APP_ID.into();
    cfg.app.api_server = API_SERVER.into();
    cfg.app.router_server = ROUTER_SERVER.into();
    cfg.client.client_id = client_id.into();
    cfg.client.database = None;
    cfg.client.router_cache = None;
    cfg
}

/// Gateway, HTTP stub and registry shared by every session of one test.
pub struct TestBed {
    pub gateway: Gateway,
    pub http: Arc<ScriptedHttp>,
    pub registry: ConnectionRegistry,
    pub signer: Arc<CountingSigner>,
}

#[allow(dead_code)]
impl TestBed {
    pub fn new() -> Self {
        let gateway = Gateway::new();
        let http = ScriptedHttp::new();
        let registry = ConnectionRegistry::new(
            Arc::new(gateway.clone()),
            http.clone(),
            ROUTER_SERVER,
            None,
        );
        Self {
            gateway,
            http,
            registry,
            signer: Arc::new(CountingSigner::default()),
        }
    }

    pub fn session(&self, cfg: &ClientConfig, store: Option<Arc<dyn LocalStore>>) -> Session {
        let signer: Arc<dyn SignatureProvider> = self.signer.clone();
        Session::new(cfg, self.registry.clone(), store, Some(signer)).unwrap()
    }
}

/// Poll `predicate` until it holds, or fail after `timeout`.
pub async fn wait_until(timeout: Duration, what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        if Instant::now() > deadline {
            panic!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next session event satisfying `predicate`, or fail after `timeout`.
pub async fn next_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    predicate: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timeout waiting for session event")
}
