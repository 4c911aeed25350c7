//! Configuration types for peer sessions, the relay channel and ICE servers
//!
//! Keys use camelCase on the wire and in configuration files so that the
//! same document can be shared with browser clients of the relay.

use crate::candidate::{CandidatePolicy, CandidateType};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default relay endpoint
pub const DEFAULT_SERVER_URL: &str = "ws://localhost:8000/ws";

/// Per-peer session negotiation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Consecutive failed negotiations tolerated before giving up (default: 5)
    pub max_retries: u32,

    /// First retry delay in milliseconds (default: 4000)
    pub retry_base_delay_ms: u64,

    /// Upper bound on the retry delay in milliseconds (default: 20000)
    pub retry_max_delay_ms: u64,

    /// Time allowed for an offer/answer exchange to reach a connected
    /// transport, in milliseconds (default: 25000)
    pub negotiation_timeout_ms: u64,

    /// Accept/reject rules applied to inbound and outbound candidates
    pub candidate_policy: CandidatePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay_ms: 4000,
            retry_max_delay_ms: 20000,
            negotiation_timeout_ms: 25000,
            candidate_policy: CandidatePolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `max_retries` is zero
    /// - `retry_base_delay_ms` or `negotiation_timeout_ms` is zero
    /// - `retry_max_delay_ms` is smaller than `retry_base_delay_ms`
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig(
                "maxRetries must be at least 1".to_string(),
            ));
        }

        if self.retry_base_delay_ms == 0 {
            return Err(Error::InvalidConfig(
                "retryBaseDelayMs must be greater than 0".to_string(),
            ));
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "retryMaxDelayMs ({}) must not be smaller than retryBaseDelayMs ({})",
                self.retry_max_delay_ms, self.retry_base_delay_ms
            )));
        }

        if self.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "negotiationTimeoutMs must be greater than 0".to_string(),
            ));
        }

        self.candidate_policy.validate()
    }

    /// Bounded time for one negotiation attempt
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Preset for LAN or otherwise low-latency networks
    ///
    /// # Example
    ///
    /// ```
    /// use voicemesh_core::config::SessionConfig;
    ///
    /// let config = SessionConfig::aggressive();
    /// assert!(config.validate().is_ok());
    /// assert_eq!(config.negotiation_timeout_ms, 10000);
    /// ```
    pub fn aggressive() -> Self {
        Self {
            max_retries: 8,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 8000,
            negotiation_timeout_ms: 10000,
            candidate_policy: CandidatePolicy::default(),
        }
    }

    /// Preset for cellular or otherwise unstable networks
    ///
    /// Relay candidates are allowed since direct paths frequently fail there.
    pub fn conservative() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 8000,
            retry_max_delay_ms: 60000,
            negotiation_timeout_ms: 45000,
            candidate_policy: CandidatePolicy::permissive(),
        }
    }

    /// Override the retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the negotiation timeout
    pub fn with_negotiation_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.negotiation_timeout_ms = timeout_ms;
        self
    }
}

/// Relay channel connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Relay server URL (ws:// or wss://); the local identity is appended
    /// as the final path segment when connecting
    pub server_url: String,

    /// Reconnection attempts after the relay drops (default: 5)
    pub reconnect_attempts: u32,

    /// Linear reconnect delay unit in milliseconds; attempt `n` waits
    /// `n * reconnectDelayMs` (default: 3000)
    pub reconnect_delay_ms: u64,

    /// Interval between heartbeat pings in milliseconds (default: 30000)
    pub heartbeat_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 3000,
            heartbeat_interval_ms: 30000,
        }
    }
}

impl RelayConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.server_url).map_err(|e| {
            Error::InvalidConfig(format!("serverUrl {} is not a valid URL: {}", self.server_url, e))
        })?;

        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(Error::InvalidConfig(format!(
                "serverUrl must start with ws:// or wss://, got {}",
                self.server_url
            )));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeatIntervalMs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.saturating_mul(attempt as u64))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// URL for a given local identity
    pub fn endpoint_for(&self, identity: &str) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), identity)
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// ICE server configuration handed to the peer transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN servers (optional)
    pub turn_servers: Vec<TurnServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:stun3.l.google.com:19302".to_string(),
                "stun:stun4.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
        }
    }
}

impl IceConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if let Some(bad) = self.stun_servers.iter().find(|s| !s.starts_with("stun:")) {
            return Err(Error::InvalidConfig(format!(
                "STUN server URL must start with stun:, got {}",
                bad
            )));
        }

        if let Some(bad) = self
            .turn_servers
            .iter()
            .find(|t| !t.url.starts_with("turn:") && !t.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server URL must start with turn: or turns:, got {}",
                bad.url
            )));
        }

        Ok(())
    }
}

/// Complete client configuration, loadable from TOML or JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Local identity; generated at startup when absent
    pub identity: Option<String>,

    /// Room to join once the relay is connected
    pub room: Option<String>,

    /// Capture device to open (system default when absent)
    pub device: Option<String>,

    pub session: SessionConfig,
    pub relay: RelayConfig,
    pub ice: IceConfig,
}

impl ClientConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if let Some(identity) = &self.identity {
            if identity.is_empty() || identity.contains('/') {
                return Err(Error::InvalidConfig(format!(
                    "identity must be non-empty and must not contain '/', got {:?}",
                    identity
                )));
            }
        }

        if !self.ice.turn_servers.is_empty()
            && self.session.candidate_policy.denies(CandidateType::Relay)
        {
            return Err(Error::InvalidConfig(
                "turnServers are configured but candidatePolicy denies relay candidates"
                    .to_string(),
            ));
        }

        self.session.validate()?;
        self.relay.validate()?;
        self.ice.validate()
    }

    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::InvalidConfig(format!("invalid TOML: {}", e)))
    }

    /// Parse a JSON document
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from a file, choosing the format by extension (`.json` or TOML)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text)?,
            _ => Self::from_toml_str(&text)?,
        };

        config.validate()?;
        Ok(config)
    }
}
