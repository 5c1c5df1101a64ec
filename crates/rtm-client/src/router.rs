//! Router -- resolves and TTL-caches the gateway endpoint.
//!
//! The table is cached in memory and, when a cache directory is configured,
//! in a JSON file named after the application. Cache writes are best-effort.

use rtm_protocol::DEFAULT_PARAMS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Result, RtmError};
use crate::http::HttpClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterTable {
    #[serde(rename = "server")]
    pub primary: String,
    pub secondary: Option<String>,
    pub ttl_secs: i64,
    pub created_at_secs: i64,
    #[serde(default)]
    pub continuous_failure_count: u32,
}

impl RouterTable {
    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs >= self.created_at_secs.saturating_add(self.ttl_secs)
    }

    pub fn should_clear(&self, now_secs: i64) -> bool {
        self.is_expired(now_secs)
            || self.continuous_failure_count >= DEFAULT_PARAMS.router_max_failures
    }

    /// Endpoint for the next attempt.
    pub fn endpoint(&self, use_secondary: bool) -> &str {
        match (&self.secondary, use_secondary) {
            (Some(secondary), true) => secondary,
            _ => &self.primary,
        }
    }

    fn from_lookup(value: &Value, now_secs: i64) -> Result<Self> {
        let primary = value
            .get("server")
            .and_then(Value::as_str)
            .ok_or_else(|| RtmError::MalformedData("route reply missing server".into()))?;
        let ttl = value
            .get("ttl")
            .and_then(Value::as_i64)
            .ok_or_else(|| RtmError::MalformedData("route reply missing ttl".into()))?;
        Ok(Self {
            primary: primary.to_string(),
            secondary: value
                .get("secondary")
                .and_then(Value::as_str)
                .map(str::to_string),
            ttl_secs: ttl,
            created_at_secs: now_secs,
            continuous_failure_count: 0,
        })
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct Router {
    http: Arc<dyn HttpClient>,
    router_server: String,
    app_id: String,
    cache_file: Option<PathBuf>,
    table: Mutex<Option<RouterTable>>,
}

impl Router {
    /// Create a router, loading any cached table from `cache_dir`.
    pub fn new(
        http: Arc<dyn HttpClient>,
        router_server: impl Into<String>,
        app_id: impl Into<String>,
        cache_dir: Option<&Path>,
    ) -> Self {
        let app_id = app_id.into();
        let cache_file = cache_dir.map(|dir| {
            let digest = Sha256::digest(app_id.as_bytes());
            dir.join(format!("{}.json", hex::encode(&digest[..8])))
        });
        let table = cache_file.as_deref().and_then(load_table);
        Self {
            http,
            router_server: router_server.into(),
            app_id,
            cache_file,
            table: Mutex::new(table),
        }
    }

    /// Cached table if still valid, else a fresh lookup.
    pub async fn route(&self) -> Result<RouterTable> {
        let mut guard = self.table.lock().await;
        let now = now_secs();
        if let Some(table) = guard.as_ref() {
            if !table.should_clear(now) {
                return Ok(table.clone());
            }
            tracing::debug!("router: cached table stale, clearing");
            *guard = None;
            self.remove_cache();
        }

        let url = format!("{}/v1/route", self.router_server.trim_end_matches('/'));
        let query = [("appId", self.app_id.clone()), ("secure", "1".to_string())];
        let reply = self.http.get_json(&url, &query, &[]).await?;
        let table = RouterTable::from_lookup(&reply, now)?;
        tracing::info!(primary = %table.primary, ttl = table.ttl_secs, "router: table resolved");
        self.persist(&table);
        *guard = Some(table.clone());
        Ok(table)
    }

    pub async fn record_failure(&self) {
        let mut guard = self.table.lock().await;
        if let Some(table) = guard.as_mut() {
            table.continuous_failure_count += 1;
            let snapshot = table.clone();
            self.persist(&snapshot);
        }
    }

    pub async fn reset_failures(&self) {
        let mut guard = self.table.lock().await;
        if let Some(table) = guard.as_mut() {
            if table.continuous_failure_count == 0 {
                return;
            }
            table.continuous_failure_count = 0;
            let snapshot = table.clone();
            self.persist(&snapshot);
        }
    }

    /// Drop the cached table (server invalidation).
    pub async fn clear(&self) {
        *self.table.lock().await = None;
        self.remove_cache();
    }

    pub async fn cached(&self) -> Option<RouterTable> {
        self.table.lock().await.clone()
    }

    fn persist(&self, table: &RouterTable) {
        let Some(path) = &self.cache_file else {
            return;
        };
        let result = serde_json::to_vec(table)
            .map_err(std::io::Error::other)
            .and_then(|bytes| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, bytes)
            });
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), "router: cache write failed: {e}");
        }
    }

    fn remove_cache(&self) {
        if let Some(path) = &self.cache_file {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), "router: cache remove failed: {e}");
                }
            }
        }
    }
}

fn load_table(path: &Path) -> Option<RouterTable> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(table) => Some(table),
        Err(e) => {
            tracing::warn!(path = %path.display(), "router: ignoring unreadable cache: {e}");
            None
        }
    }
}
