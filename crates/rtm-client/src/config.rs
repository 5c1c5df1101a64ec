//! Configuration types for rtm-client.
//! Parsed from ~/.rtm/config.toml.

use rtm_protocol::ProtocolVariant;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, RtmError};

pub const BITMAP_PATCH_MESSAGE: u64 = 1 << 0;
pub const BITMAP_TEMPORARY_CONVERSATION_MESSAGE: u64 = 1 << 1;
pub const BITMAP_TRANSIENT_MESSAGE_ACK: u64 = 1 << 3;
pub const BITMAP_KEEP_NOTIFICATION: u64 = 1 << 4;
pub const BITMAP_PARTIAL_FAILED_MESSAGE: u64 = 1 << 5;
pub const BITMAP_OMIT_PEER_ID: u64 = 1 << 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub app: AppSection,
    pub client: ClientSection,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    pub app_id: String,
    #[serde(default)]
    pub app_key: String,
    #[serde(default = "default_api_server")]
    pub api_server: String,
    #[serde(default = "default_router_server")]
    pub router_server: String,
    #[serde(default)]
    pub protocol: ProtocolVariant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    pub client_id: String,
    pub tag: Option<String>,
    /// Local store path. No store is opened when absent.
    pub database: Option<String>,
    /// Router table cache file.
    pub router_cache: Option<String>,
    pub device_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_30")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_30")]
    pub open_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub patch_message: bool,
    #[serde(default = "default_true")]
    pub temporary_conversation_message: bool,
    #[serde(default = "default_true")]
    pub transient_message_ack: bool,
    #[serde(default = "default_true")]
    pub keep_notification: bool,
    #[serde(default = "default_true")]
    pub partial_failed_message: bool,
    #[serde(default)]
    pub omit_peer_id: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: 30,
            open_timeout_secs: 30,
            patch_message: true,
            temporary_conversation_message: true,
            transient_message_ack: true,
            keep_notification: true,
            partial_failed_message: true,
            omit_peer_id: false,
        }
    }
}

impl SessionSection {
    /// Feature bitmap sent with every open command.
    pub fn config_bitmap(&self) -> u64 {
        let mut bitmap = 0;
        for (enabled, bit) in [
            (self.patch_message, BITMAP_PATCH_MESSAGE),
            (
                self.temporary_conversation_message,
                BITMAP_TEMPORARY_CONVERSATION_MESSAGE,
            ),
            (self.transient_message_ack, BITMAP_TRANSIENT_MESSAGE_ACK),
            (self.keep_notification, BITMAP_KEEP_NOTIFICATION),
            (self.partial_failed_message, BITMAP_PARTIAL_FAILED_MESSAGE),
            (self.omit_peer_id, BITMAP_OMIT_PEER_ID),
        ] {
            if enabled {
                bitmap |= bit;
            }
        }
        bitmap
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

// Default value functions
fn default_api_server() -> String {
    "https://api.leancloud.cn".into()
}
fn default_router_server() -> String {
    "https://router-g0-push.leancloud.cn".into()
}
fn default_30() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl ClientSection {
    /// Reject identities the gateway would refuse.
    pub fn validate(&self) -> Result<()> {
        let len = self.client_id.chars().count();
        if !(1..=64).contains(&len) {
            return Err(RtmError::InvalidArgument(format!(
                "client id length must be in 1...64, got {len}"
            )));
        }
        if self.tag.as_deref() == Some("default") {
            return Err(RtmError::InvalidArgument(
                "tag \"default\" is reserved".into(),
            ));
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Load config from file, or create default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ClientConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app: AppSection {
                app_id: String::new(),
                app_key: String::new(),
                api_server: default_api_server(),
                router_server: default_router_server(),
                protocol: ProtocolVariant::default(),
            },
            client: ClientSection {
                client_id: "rtm-cli".into(),
                tag: None,
                database: Some("~/.rtm/rtm.db".into()),
                router_cache: Some("~/.rtm/router".into()),
                device_token: None,
            },
            session: SessionSection::default(),
        }
    }
}
