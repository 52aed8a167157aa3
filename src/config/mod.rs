//! Configuration management for call-resilience

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading/validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Recovery timing and budget
    #[serde(default)]
    pub call: CallConfig,

    /// ICE server configuration
    #[serde(default)]
    pub ice: IceConfig,

    /// Signaling channel configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Recovery timing and retry budget for a single call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Deadline for a connection attempt to reach "connected", in ms
    #[serde(default = "default_ice_deadline_ms")]
    pub ice_deadline_ms: u64,

    /// Relay reconnection attempts before escalating to the managed relay
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long to wait for managed relay credentials, in ms (0 waits forever)
    #[serde(default = "default_escalation_timeout_ms")]
    pub escalation_timeout_ms: u64,
}

impl CallConfig {
    pub fn ice_deadline(&self) -> Duration {
        Duration::from_millis(self.ice_deadline_ms)
    }

    pub fn escalation_timeout(&self) -> Option<Duration> {
        match self.escalation_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_deadline_ms: default_ice_deadline_ms(),
            max_retries: default_max_retries(),
            escalation_timeout_ms: default_escalation_timeout_ms(),
        }
    }
}

/// A single ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// STUN/TURN settings used when building peer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server host (empty disables STUN)
    #[serde(default)]
    pub stun_host: String,

    #[serde(default = "default_stun_port")]
    pub stun_port: u16,

    /// TURN server host (required for relay-only reconnection)
    #[serde(default)]
    pub turn_host: String,

    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    /// TURN transport ("udp" or "tcp")
    #[serde(default = "default_turn_protocol")]
    pub turn_protocol: String,

    /// Use turns: instead of turn:
    #[serde(default)]
    pub turn_tls: bool,

    /// Static TURN username
    #[serde(default)]
    pub turn_username: String,

    /// Static TURN password
    #[serde(default)]
    pub turn_password: String,

    /// TURN REST shared secret; takes precedence over static credentials
    #[serde(default)]
    pub turn_shared_secret: String,

    /// Lifetime of credentials derived from the shared secret, in seconds
    #[serde(default = "default_turn_credential_ttl_secs")]
    pub turn_credential_ttl_secs: u64,

    /// Explicit ICE servers, used when no STUN/TURN host is configured
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_host: String::new(),
            stun_port: default_stun_port(),
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_protocol: default_turn_protocol(),
            turn_tls: false,
            turn_username: String::new(),
            turn_password: String::new(),
            turn_shared_secret: String::new(),
            turn_credential_ttl_secs: default_turn_credential_ttl_secs(),
            ice_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling server
    #[serde(default = "default_signaling_url")]
    pub url: String,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or env_logger filter string
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when it is absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call.ice_deadline_ms == 0 {
            return Err(ConfigError::Invalid("ICE deadline must be non-zero".into()));
        }

        if !self.ice.stun_host.is_empty() && self.ice.stun_port == 0 {
            return Err(ConfigError::Invalid("STUN port must be non-zero".into()));
        }

        if !self.ice.turn_host.is_empty() {
            if self.ice.turn_port == 0 {
                return Err(ConfigError::Invalid("TURN port must be non-zero".into()));
            }
            let protocol = self.ice.turn_protocol.to_ascii_lowercase();
            if protocol != "udp" && protocol != "tcp" {
                return Err(ConfigError::Invalid("TURN protocol must be \"udp\" or \"tcp\"".into()));
            }
            if self.ice.turn_username.is_empty() != self.ice.turn_password.is_empty() {
                return Err(ConfigError::Invalid(
                    "TURN username and password must be set together".into(),
                ));
            }
            if !self.ice.turn_shared_secret.is_empty() && self.ice.turn_credential_ttl_secs == 0 {
                return Err(ConfigError::Invalid("TURN credential TTL must be non-zero".into()));
            }
        }

        for server in &self.ice.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid("ICE server entry without URLs".into()));
            }
        }

        if !self.signaling.url.starts_with("ws://") && !self.signaling.url.starts_with("wss://") {
            return Err(ConfigError::Invalid(
                "Signaling URL must use ws:// or wss://".into(),
            ));
        }

        Ok(())
    }
}


fn default_ice_deadline_ms() -> u64 { 15_000 }
fn default_max_retries() -> u32 { 2 }
fn default_escalation_timeout_ms() -> u64 { 30_000 }
fn default_stun_port() -> u16 { 3478 }
fn default_turn_port() -> u16 { 3478 }
fn default_turn_credential_ttl_secs() -> u64 { 24 * 60 * 60 }
fn default_connect_timeout_secs() -> u64 { 10 }

fn default_turn_protocol() -> String {
    "udp".to_string()
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:8443/signaling".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
