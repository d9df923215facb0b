//! Configuration types for the HubNet host

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PROTOCOL_VERSION;

/// Label of the negotiated data channel every joiner connects on
pub const DEFAULT_CHANNEL_LABEL: &str = "hubnet-web";

/// Relay-detected handshakes tolerated before the host stops renegotiating
pub const DEFAULT_RELAY_RETRY_LIMIT: u32 = 10;

/// Delay before a renegotiating channel is force-closed
pub const DEFAULT_RENEGOTIATION_CLOSE_DELAY_MS: u64 = 10_000;

/// Main configuration for a HubNet host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// WebSocket signaling relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// Host ID announced to the relay (auto-generated if None)
    pub host_id: Option<String>,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Maximum number of simultaneously registered joiners (default: 10)
    pub max_capacity: usize,

    /// Protocol version sent in the greeting and required from joiners
    pub protocol_version: String,

    /// Data channel label (default: "hubnet-web")
    pub channel_label: String,

    /// Relay-detected handshakes before a joiner is accepted anyway (default: 10)
    pub relay_retry_limit: u32,

    /// Milliseconds before a rejected channel is closed if still open (default: 10000)
    pub renegotiation_close_delay_ms: u64,

    /// Override for the codec worker cap (default: available parallelism - 2, min 1)
    pub codec_workers: Option<usize>,

    /// Milliseconds a partially received burst is kept before being discarded (default: 30000)
    pub reassembly_timeout_ms: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080/rtc".to_string(),
            host_id: None,
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            max_capacity: 10,
            protocol_version: PROTOCOL_VERSION.to_string(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            relay_retry_limit: DEFAULT_RELAY_RETRY_LIMIT,
            renegotiation_close_delay_ms: DEFAULT_RENEGOTIATION_CLOSE_DELAY_MS,
            codec_workers: None,
            reassembly_timeout_ms: 30_000,
        }
    }
}

impl HostConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `max_capacity` is zero
    /// - `protocol_version` or `channel_label` is empty
    /// - `codec_workers` is `Some(0)`
    /// - `signaling_url` is not a valid WebSocket URL
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.max_capacity == 0 {
            return Err(Error::InvalidConfig(
                "max_capacity must be at least 1".to_string(),
            ));
        }

        if self.protocol_version.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "protocol_version must not be empty".to_string(),
            ));
        }

        if self.channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "channel_label must not be empty".to_string(),
            ));
        }

        if self.codec_workers == Some(0) {
            return Err(Error::InvalidConfig(
                "codec_workers must be at least 1 when set".to_string(),
            ));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN url must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        Ok(())
    }

    /// Delay before a channel rejected for relay usage is closed
    pub fn renegotiation_close_delay(&self) -> Duration {
        Duration::from_millis(self.renegotiation_close_delay_ms)
    }

    /// Age after which partial bursts are garbage collected
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    /// Number of codec workers the pool may grow to
    pub fn codec_worker_cap(&self) -> usize {
        self.codec_workers
            .unwrap_or_else(|| num_cpus::get().saturating_sub(2))
            .max(1)
    }

    /// Set the TURN servers
    ///
    /// # Example
    ///
    /// ```
    /// use hubnet_webrtc::config::{HostConfig, TurnServerConfig};
    ///
    /// let config = HostConfig::default()
    ///     .with_turn_servers(vec![
    ///         TurnServerConfig {
    ///             url: "turn:turn.example.com:3478".to_string(),
    ///             username: "user".to_string(),
    ///             credential: "pass".to_string(),
    ///         }
    ///     ]);
    /// assert_eq!(config.turn_servers.len(), 1);
    /// ```
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the host ID announced to the relay
    pub fn with_host_id(mut self, host_id: &str) -> Self {
        self.host_id = Some(host_id.to_string());
        self
    }

    /// Set the maximum number of joiners
    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    /// Set the protocol version
    pub fn with_protocol_version(mut self, version: &str) -> Self {
        self.protocol_version = version.to_string();
        self
    }

    /// Set the relay retry limit
    pub fn with_relay_retry_limit(mut self, limit: u32) -> Self {
        self.relay_retry_limit = limit;
        self
    }

    /// Set the force-close delay for renegotiating channels
    pub fn with_renegotiation_close_delay(mut self, delay: Duration) -> Self {
        self.renegotiation_close_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Pin the codec worker cap
    pub fn with_codec_workers(mut self, workers: usize) -> Self {
        self.codec_workers = Some(workers);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_label, "hubnet-web");
        assert_eq!(config.relay_retry_limit, 10);
        assert_eq!(config.renegotiation_close_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_stun_servers_fails() {
        let mut config = HostConfig::default();
        config.stun_servers.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_fails() {
        let config = HostConfig::default().with_max_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_codec_workers_fails() {
        let config = HostConfig::default().with_codec_workers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_signaling_url_fails() {
        let mut config = HostConfig::default();
        config.signaling_url = "http://localhost:8080".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_turn_url_fails() {
        let config = HostConfig::default().with_turn_servers(vec![TurnServerConfig {
            url: "stun:turn.example.com:3478".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_codec_worker_cap() {
        assert_eq!(HostConfig::default().with_codec_workers(3).codec_worker_cap(), 3);
        assert!(HostConfig::default().codec_worker_cap() >= 1);
    }

    #[test]
    fn test_config_serialization() {
        let config = HostConfig::default().with_host_id("host-1");
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: HostConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.signaling_url, deserialized.signaling_url);
        assert_eq!(deserialized.host_id.as_deref(), Some("host-1"));
    }

    #[test]
    fn test_builder_chain() {
        let config = HostConfig::default()
            .with_max_capacity(4)
            .with_protocol_version("0.0.2")
            .with_relay_retry_limit(3)
            .with_renegotiation_close_delay(Duration::from_millis(250));
        assert!(config.validate().is_ok());
        assert_eq!(config.max_capacity, 4);
        assert_eq!(config.protocol_version, "0.0.2");
        assert_eq!(config.relay_retry_limit, 3);
        assert_eq!(config.renegotiation_close_delay_ms, 250);
    }
}
