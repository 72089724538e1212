//! Runtime settings for one session, resolved from [`ClientConfig`]

use super::backoff::ReconnectPolicy;
use crate::config::{ClientConfig, ConfigError};
use crate::protocol::{HeartBeat, DEFAULT_MAX_FRAME_BYTES};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint: Url,
    /// Virtual host for CONNECT
    pub host: String,
    /// Heart-beat offer sent in CONNECT
    pub heartbeat: HeartBeat,
    /// Missed inbound beats tolerated
    pub heartbeat_tolerance: u32,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub max_ambiguous_auth_retries: u32,
    pub outbound_capacity: usize,
    pub max_frame_bytes: usize,
}

impl SessionSettings {
    /// Defaults for `endpoint`
    pub fn new(endpoint: Url) -> Self {
        let host = endpoint.host_str().unwrap_or("localhost").to_string();
        Self {
            endpoint,
            host,
            heartbeat: HeartBeat::new(Duration::from_secs(10), Duration::from_secs(10)),
            heartbeat_tolerance: 2,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            max_ambiguous_auth_retries: 3,
            outbound_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let endpoint = config.endpoint()?;

        Ok(Self {
            host: config.connect_host(),
            heartbeat: HeartBeat::new(
                Duration::from_millis(config.heartbeat.outgoing_ms),
                Duration::from_millis(config.heartbeat.incoming_ms),
            ),
            heartbeat_tolerance: config.heartbeat.tolerance,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(config.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
                jitter: config.reconnect.jitter,
                max_attempts: config.reconnect.max_attempts,
            },
            connect_timeout: Duration::from_millis(config.reconnect.connect_timeout_ms),
            max_ambiguous_auth_retries: config.auth.max_ambiguous_retries,
            outbound_capacity: config.outbound.capacity,
            max_frame_bytes: config.broker.max_frame_bytes,
            endpoint,
        })
    }
}
