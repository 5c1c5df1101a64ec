//! Connection registry -- shared connections keyed by (application, protocol).
//!
//! Constructed once by the embedding application with the socket, HTTP and
//! codec collaborators, then handed to every session. Registration is
//! reference-counted by peer id; the socket is torn down when the last peer
//! releases it.

use rtm_protocol::{AppId, CommandCodec, JsonCommandCodec, PeerId, ProtocolVariant};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::{ConnectionHandle, Environment};
use crate::error::{Result, RtmError};
use crate::http::HttpClient;
use crate::router::Router;
use crate::transport::Connector;

struct Entry {
    handle: ConnectionHandle,
    peers: HashSet<PeerId>,
}

struct Inner {
    connections: HashMap<(AppId, ProtocolVariant), Entry>,
    environment: Environment,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
    connector: Arc<dyn Connector>,
    http: Arc<dyn HttpClient>,
    codec: Arc<dyn CommandCodec>,
    router_server: String,
    router_cache_dir: Option<PathBuf>,
}

impl ConnectionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        http: Arc<dyn HttpClient>,
        router_server: impl Into<String>,
        router_cache_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connections: HashMap::new(),
                environment: Environment::default(),
            })),
            connector,
            http,
            codec: Arc::new(JsonCommandCodec),
            router_server: router_server.into(),
            router_cache_dir,
        }
    }

    /// Replace the command codec used by connections created from now on.
    pub fn with_codec(mut self, codec: Arc<dyn CommandCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn http(&self) -> Arc<dyn HttpClient> {
        self.http.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded maps stay consistent across a panicking holder.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connection for (app, variant), created on first use. Rejects a peer
    /// id that is already registered on it.
    pub fn acquire(&self, app_id: &str, variant: ProtocolVariant, peer: &str) -> Result<ConnectionHandle> {
        let mut inner = self.lock();
        let key = (app_id.to_string(), variant);

        if let Some(entry) = inner.connections.get(&key) {
            if entry.handle.is_closed() {
                inner.connections.remove(&key);
            }
        }
        let environment = inner.environment.clone();
        let entry = inner.connections.entry(key).or_insert_with(|| {
            let router = Arc::new(Router::new(
                self.http.clone(),
                self.router_server.clone(),
                app_id,
                self.router_cache_dir.as_deref(),
            ));
            tracing::info!(app = %app_id, ?variant, "conn: new shared connection");
            Entry {
                handle: ConnectionHandle::spawn(
                    app_id.to_string(),
                    variant,
                    self.connector.clone(),
                    router,
                    self.codec.clone(),
                    environment,
                ),
                peers: HashSet::new(),
            }
        });

        if !entry.peers.insert(peer.to_string()) {
            return Err(RtmError::InvalidArgument(format!(
                "peer {peer} already registered on this connection"
            )));
        }
        Ok(entry.handle.clone())
    }

    /// Drop `peer`'s registration; the last release shuts the connection down.
    pub fn release(&self, app_id: &str, variant: ProtocolVariant, peer: &str) {
        let mut inner = self.lock();
        let key = (app_id.to_string(), variant);
        let Some(entry) = inner.connections.get_mut(&key) else {
            return;
        };
        if !entry.peers.remove(peer) {
            return;
        }
        entry.handle.remove_peer(peer);
        if entry.peers.is_empty() {
            entry.handle.shutdown();
            inner.connections.remove(&key);
            tracing::info!(app = %app_id, ?variant, "conn: last peer released, shut down");
        }
    }

    /// Forward an environment change to every live connection.
    pub fn set_environment(&self, environment: Environment) {
        let mut inner = self.lock();
        inner.environment = environment.clone();
        for entry in inner.connections.values() {
            entry.handle.set_environment(environment.clone());
        }
    }

    pub fn peer_count(&self, app_id: &str, variant: ProtocolVariant) -> usize {
        self.lock()
            .connections
            .get(&(app_id.to_string(), variant))
            .map_or(0, |e| e.peers.len())
    }
}
