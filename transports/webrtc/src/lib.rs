//! HubNet Web host transport and session layer
//!
//! This crate runs the host side of a HubNet Web session: it admits joiners
//! through a signaling relay, negotiates one WebRTC data channel per joiner
//! and carries the HubNet message protocol over it.
//!
//! # Features
//!
//! - **Admission**: capacity-limited joiner registry with login and username checks
//! - **Handshake**: protocol version check and TURN relay renegotiation policy
//! - **Transport**: per-channel message IDs, chunked bursts up to 20 MB
//! - **Codec pool**: bounded, lazily grown worker set for payload encoding
//! - **Liveness**: ping waves with rolling round-trip averages, keep-alives
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Joiners (browsers)                                    │
//! │  ↓ (one negotiated data channel per joiner)            │
//! │  ConnectionOrchestrator                                │
//! │  ├─ RelaySocket (signaling relay over WebSocket)       │
//! │  ├─ HandshakeController (SDP, greeting, TURN policy)   │
//! │  ├─ SessionRegistry (capacity, login, ping history)    │
//! │  └─ TransportPipeline                                  │
//! │     ├─ IdentitySequencer (per-channel message IDs)     │
//! │     ├─ ChunkFramer (hnw-burst fragments)               │
//! │     └─ CodecPool (WireCodec workers)                   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use hubnet_webrtc::HostConfig;
//!
//! let config = HostConfig::default()
//!     .with_max_capacity(30)
//!     .with_relay_retry_limit(3);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_capacity, 30);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use hubnet_webrtc::codec::JsonCodec;
//! use hubnet_webrtc::orchestrator::{ConnectionOrchestrator, JoinerInit, SessionHost};
//! use hubnet_webrtc::{HostConfig, Result};
//!
//! struct OpenSession;
//!
//! #[async_trait::async_trait]
//! impl SessionHost for OpenSession {
//!     fn password_matches(&self, _password: Option<&str>) -> bool {
//!         true
//!     }
//!
//!     async fn await_joiner_init(&self, _peer_id: &str, _username: &str) -> Result<JoinerInit> {
//!         Ok(JoinerInit {
//!             role: "student".to_string(),
//!             state: serde_json::json!({}),
//!             view: serde_json::json!({}),
//!         })
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let (host, _events) =
//!     ConnectionOrchestrator::new(HostConfig::default(), Arc::new(OpenSession), Arc::new(JsonCodec))?;
//! host.start()?;
//! host.teardown().await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod error;
pub mod id;
pub mod orchestrator;
pub mod peer;
pub mod ping;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{HostConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use orchestrator::{ConnectionOrchestrator, HostEvent, JoinerInit, SessionHost};

/// HubNet protocol version spoken by this host
pub const PROTOCOL_VERSION: &str = "0.0.1";

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }

    #[test]
    fn test_default_config_speaks_protocol_version() {
        assert_eq!(HostConfig::default().protocol_version, PROTOCOL_VERSION);
    }
}
