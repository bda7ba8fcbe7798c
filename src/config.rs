//! Call configuration.
//!
//! Defaults suit a local relay; [`CallConfig::from_env`] overlays
//! `PEER_CALL_*` environment variables on top.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::ice::{google_stun_servers, IceServerConfig};
use crate::media::MediaConstraints;

/// Default relay endpoint
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000/ws";

/// Default offer timeout in milliseconds
pub const DEFAULT_OFFER_TIMEOUT_MS: u64 = 15_000;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// Settings for one call session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket URL of the matchmaking relay
    pub relay_url: String,
    /// Our identifier; replaced by the relay's `selfId` when it sends one
    pub client_id: String,
    /// STUN/TURN servers
    pub ice_servers: Vec<IceServerConfig>,
    /// How long a local offer may stay unanswered
    pub offer_timeout_ms: u64,
    /// Answer incoming calls without waiting for the application
    pub auto_accept: bool,
    /// What to capture for a call
    pub media: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            client_id: generate_client_id(),
            ice_servers: google_stun_servers(),
            offer_timeout_ms: DEFAULT_OFFER_TIMEOUT_MS,
            auto_accept: true,
            media: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    /// Defaults with `PEER_CALL_*` environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup.
    ///
    /// Recognised keys: `PEER_CALL_RELAY_URL`, `PEER_CALL_CLIENT_ID`,
    /// `PEER_CALL_OFFER_TIMEOUT_MS`, `PEER_CALL_AUTO_ACCEPT`,
    /// `PEER_CALL_STUN_URLS` (comma separated).
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PEER_CALL_RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(id) = lookup("PEER_CALL_CLIENT_ID") {
            self.client_id = id;
        }
        if let Some(ms) = lookup("PEER_CALL_OFFER_TIMEOUT_MS") {
            self.offer_timeout_ms = ms.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "PEER_CALL_OFFER_TIMEOUT_MS",
                reason: format!("{}", e),
            })?;
        }
        if let Some(flag) = lookup("PEER_CALL_AUTO_ACCEPT") {
            self.auto_accept = parse_flag(&flag).ok_or_else(|| ConfigError::InvalidValue {
                key: "PEER_CALL_AUTO_ACCEPT",
                reason: format!("expected true/false, got '{}'", flag),
            })?;
        }
        if let Some(urls) = lookup("PEER_CALL_STUN_URLS") {
            self.ice_servers = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(IceServerConfig::stun)
                .collect();
        }
        self.validate()?;
        Ok(self)
    }

    /// Check the configuration before use
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.relay_url).map_err(|e| ConfigError::InvalidRelayUrl {
            url: self.relay_url.clone(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConfigError::InvalidRelayUrl {
                url: self.relay_url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if self.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "client_id",
                reason: "must not be empty".to_string(),
            });
        }
        if self.offer_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "offer_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if let Some(server) = self.ice_servers.iter().find(|s| !s.is_complete()) {
            return Err(ConfigError::InvalidValue {
                key: "ice_servers",
                reason: format!("incomplete server entry {:?}", server.urls),
            });
        }
        if !self.media.audio && !self.media.video {
            return Err(ConfigError::InvalidValue {
                key: "media",
                reason: "at least one of audio or video is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn generate_client_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    format!("peer-{}-{:08x}", std::process::id(), nanos)
}
