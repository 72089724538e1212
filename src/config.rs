//! Configuration for the broker session client
//!
//! Loaded from TOML. Only `[broker]` is required; every other section falls
//! back to defaults. The bearer token is never stored in the file: `[broker]`
//! names the environment variable that holds it.

use crate::protocol::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Main client configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub outbound: OutboundSection,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Endpoint URL: ws://, wss://, tcp:// or stomp://
    pub endpoint_url: String,
    /// Environment variable containing the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Virtual host sent in CONNECT (defaults to the endpoint host)
    pub host: Option<String>,
    /// Largest accepted inbound frame
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_token_env() -> String {
    "BROKER_TOKEN".to_string()
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

/// Heart-beat intervals offered in CONNECT, in milliseconds (0 disables)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_ms")]
    pub outgoing_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub incoming_ms: u64,
    /// Missed beats tolerated before the link is declared dead
    #[serde(default = "default_tolerance")]
    pub tolerance: u32,
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_tolerance() -> u32 {
    2
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            outgoing_ms: default_heartbeat_ms(),
            incoming_ms: default_heartbeat_ms(),
            tolerance: default_tolerance(),
        }
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter fraction in [0, 1)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Consecutive failed attempts before giving up (unset = unlimited)
    pub max_attempts: Option<u32>,
    /// Time allowed from opening the transport to CONNECTED
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// Retries allowed for auth failures that are neither clearly transient
    /// nor clearly a rejected credential
    #[serde(default = "default_max_ambiguous_retries")]
    pub max_ambiguous_retries: u32,
}

fn default_max_ambiguous_retries() -> u32 {
    3
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            max_ambiguous_retries: default_max_ambiguous_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundSection {
    /// Publishes held while disconnected before the oldest is dropped
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    256
}

impl Default for OutboundSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for an endpoint, everything else defaulted
    pub fn for_endpoint(endpoint_url: impl Into<String>) -> Self {
        Self {
            broker: BrokerSection {
                endpoint_url: endpoint_url.into(),
                token_env: default_token_env(),
                host: None,
                max_frame_bytes: default_max_frame_bytes(),
            },
            heartbeat: HeartbeatSection::default(),
            reconnect: ReconnectSection::default(),
            auth: AuthSection::default(),
            outbound: OutboundSection::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.broker.max_frame_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.max_frame_bytes must be positive".to_string(),
            ));
        }
        if self.outbound.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "outbound.capacity must be positive".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_ms must be positive".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "reconnect.base_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.base_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter) {
            return Err(ConfigError::InvalidConfig(format!(
                "reconnect.jitter must be in [0, 1), got {}",
                self.reconnect.jitter
            )));
        }
        if self.reconnect.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.connect_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed endpoint. Credentials in the URL are refused so they cannot
    /// leak into proxy or access logs.
    pub fn endpoint(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.broker.endpoint_url)
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{}: {e}", self.broker.endpoint_url)))?;

        if !matches!(url.scheme(), "ws" | "wss" | "tcp" | "stomp") {
            return Err(ConfigError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidEndpoint("endpoint has no host".to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ConfigError::InvalidEndpoint(
                "endpoint must not embed credentials".to_string(),
            ));
        }
        let leaks_secret = url.query_pairs().any(|(key, _)| {
            let key = key.to_ascii_lowercase();
            ["token", "access_token", "password", "passcode", "secret", "key"]
                .iter()
                .any(|marker| key.contains(marker))
        });
        if leaks_secret {
            return Err(ConfigError::InvalidEndpoint(
                "endpoint query must not carry credentials".to_string(),
            ));
        }
        Ok(url)
    }

    /// Virtual host for CONNECT
    pub fn connect_host(&self) -> String {
        if let Some(host) = &self.broker.host {
            return host.clone();
        }
        Url::parse(&self.broker.endpoint_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// Read the bearer token from the configured environment variable
    pub fn get_token(&self) -> Result<String, ConfigError> {
        std::env::var(&self.broker.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| ConfigError::EnvVarNotFound(self.broker.token_env.clone()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
endpoint_url = "ws://localhost:15674/ws"
token_env = "TEST_BROKER_TOKEN"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
