//! Signaling between the host and its joiners
//!
//! Negotiation messages travel over a relay WebSocket that multiplexes all
//! joiners. [`Signaler`] is the outgoing half the handshake needs;
//! [`RelaySocket`] implements it over tokio-tungstenite.

pub mod protocol;
pub mod relay;

use async_trait::async_trait;
use serde_json::Value;

pub use protocol::RelayMessage;
pub use relay::RelaySocket;

use crate::peer::SessionDescription;
use crate::Result;

/// Outgoing signaling for one or more joiners
#[async_trait]
pub trait Signaler: Send + Sync {
    async fn send_answer(&self, peer_id: &str, answer: &SessionDescription) -> Result<()>;

    /// Forward a locally gathered candidate (`RTCIceCandidateInit` JSON)
    async fn send_ice_candidate(&self, peer_id: &str, candidate: &Value) -> Result<()>;
}
