//! Joiner handshake: SDP answer, greeting, version check and relay policy
//!
//! ```text
//! OfferReceived → AnswerCreated → LocalDescriptionSet → IceGathering
//!   → DataChannelOpen → GreetingSent → AwaitingPeerHandshake
//!   → Validated | Renegotiating | Rejected
//! ```
//!
//! A joiner whose connection runs through a TURN relay is told to
//! renegotiate (`isApproved: false`) up to the retry limit, in the hope of
//! finding a direct path. Once the limit is hit the relayed connection is
//! accepted and the count starts over.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::connection::{PeerLink, SessionDescription};
use crate::channels::{ChannelEvent, Message, ReadyState};
use crate::config::HostConfig;
use crate::session::SessionRegistry;
use crate::signaling::Signaler;
use crate::transport::{ChannelHandle, SendOutcome, TransportPipeline};
use crate::{Error, Result};

/// Close code used for the renegotiation force-close
pub const NORMAL_CLOSURE: u16 = 1000;

/// Where a joiner is in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    OfferReceived,
    AnswerCreated,
    LocalDescriptionSet,
    IceGathering,
    DataChannelOpen,
    GreetingSent,
    AwaitingPeerHandshake,
    Validated,
    Renegotiating,
    Rejected,
}

/// Result of judging one completed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approve,
    /// Ask the joiner to reconnect; `attempt` counts from 1
    Renegotiate { attempt: u32 },
}

/// Relay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPolicy {
    /// Renegotiations allowed before a relayed connection is accepted
    pub retry_limit: u32,

    /// Grace period before a renegotiating channel is closed by the host
    pub close_delay: Duration,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            retry_limit: crate::config::DEFAULT_RELAY_RETRY_LIMIT,
            close_delay: Duration::from_millis(crate::config::DEFAULT_RENEGOTIATION_CLOSE_DELAY_MS),
        }
    }
}

impl RelayPolicy {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            retry_limit: config.relay_retry_limit,
            close_delay: config.renegotiation_close_delay(),
        }
    }

    /// Judge a handshake given the renegotiations already spent
    pub fn evaluate(&self, attempts: u32, relayed: bool) -> Verdict {
        if relayed && attempts < self.retry_limit {
            Verdict::Renegotiate {
                attempt: attempts + 1,
            }
        } else {
            Verdict::Approve
        }
    }
}

/// Data channel id both sides derive from the peer ID
///
/// 31-based rolling hash over the ID's code points in wrapping 32-bit
/// arithmetic, folded into `0..256`.
pub fn channel_id_for(peer_id: &str) -> u16 {
    let hash = peer_id.chars().fold(0i32, |acc, c| {
        (acc << 5).wrapping_sub(acc).wrapping_add(c as i32)
    });
    (hash.unsigned_abs() % 256) as u16
}

/// Sequencing key of a joiner's data channel
///
/// Built from the peer ID rather than [`channel_id_for`], whose 256 values
/// collide between live joiners.
pub fn channel_key(label: &str, peer_id: &str) -> String {
    format!("{}-{}", label, peer_id)
}

/// Drives each joiner from SDP offer to a validated data channel
pub struct HandshakeController {
    registry: Arc<SessionRegistry>,
    pipeline: Arc<TransportPipeline>,
    protocol_version: String,
    channel_label: String,
    policy: RelayPolicy,
    /// Renegotiations per joiner, keyed by the joiner's stable uuid; cleared on approval
    retries: Mutex<HashMap<String, u32>>,
    states: Mutex<HashMap<String, HandshakeState>>,
}

impl HandshakeController {
    pub fn new(
        config: &HostConfig,
        registry: Arc<SessionRegistry>,
        pipeline: Arc<TransportPipeline>,
    ) -> Self {
        Self {
            registry,
            pipeline,
            protocol_version: config.protocol_version.clone(),
            channel_label: config.channel_label.clone(),
            policy: RelayPolicy::from_config(config),
            retries: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RelayPolicy {
        self.policy
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn state(&self, peer_id: &str) -> Option<HandshakeState> {
        self.states.lock().get(peer_id).copied()
    }

    /// Renegotiations recorded under `key` (uuid or peer ID)
    pub fn retry_count(&self, key: &str) -> u32 {
        self.retries.lock().get(key).copied().unwrap_or(0)
    }

    /// Joiners with renegotiations still on the ledger
    pub fn tracked_retries(&self) -> usize {
        self.retries.lock().len()
    }

    /// Drop handshake state for a joiner that left
    pub fn forget(&self, peer_id: &str) {
        self.states.lock().remove(peer_id);
    }

    fn transition(&self, peer_id: &str, state: HandshakeState) {
        debug!(peer_id, ?state, "Handshake transition");
        self.states.lock().insert(peer_id.to_string(), state);
    }

    /// Answer a joiner's offer over its pre-negotiated data channel
    ///
    /// Attaches the link and channel to the joiner's session, starts
    /// forwarding local ICE candidates and sends the answer through the
    /// joiner's signaler.
    #[instrument(skip(self, link, offer), fields(peer_id = %peer_id))]
    pub async fn process_offer(
        &self,
        peer_id: &str,
        link: Arc<dyn PeerLink>,
        offer: &SessionDescription,
    ) -> Result<(ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let signaler = self
            .registry
            .signaler(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        self.transition(peer_id, HandshakeState::OfferReceived);

        let (channel, events) = link
            .create_data_channel(
                &self.channel_label,
                channel_id_for(peer_id),
                &channel_key(&self.channel_label, peer_id),
            )
            .await?;
        self.registry
            .set_networking(peer_id, Arc::clone(&link), Arc::clone(&channel))?;
        self.forward_ice_candidates(peer_id, link.as_ref(), Arc::clone(&signaler));

        link.set_remote_offer(&offer.sdp).await?;
        let answer = link.create_answer().await?;
        self.transition(peer_id, HandshakeState::AnswerCreated);

        link.set_local_description(answer).await?;
        self.transition(peer_id, HandshakeState::LocalDescriptionSet);

        let local = link
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after negotiation".to_string()))?;

        if !self.registry.contains(peer_id) {
            return Err(Error::PeerNotFound(peer_id.to_string()));
        }
        signaler.send_answer(peer_id, &local).await?;
        self.transition(peer_id, HandshakeState::IceGathering);

        info!("Answered joiner offer");
        Ok((channel, events))
    }

    fn forward_ice_candidates(&self, peer_id: &str, link: &dyn PeerLink, signaler: Arc<dyn Signaler>) {
        let mut candidates = link.ice_candidates();
        let registry = Arc::clone(&self.registry);
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(candidate) = candidates.recv().await {
                if !registry.contains(&peer_id) {
                    break;
                }

                let fingerprint = match serde_json_canonicalizer::to_string(&candidate) {
                    Ok(fingerprint) => fingerprint,
                    Err(e) => {
                        warn!(peer_id = %peer_id, "Failed to canonicalize ICE candidate: {}", e);
                        continue;
                    }
                };
                if !seen.insert(fingerprint) {
                    debug!(peer_id = %peer_id, "Skipping duplicate ICE candidate");
                    continue;
                }

                if let Err(e) = signaler.send_ice_candidate(&peer_id, &candidate).await {
                    warn!(peer_id = %peer_id, "Failed to forward ICE candidate: {}", e);
                }
            }
            debug!(peer_id = %peer_id, "ICE candidate forwarding finished");
        });
    }

    /// Send `connection-established` once the data channel opens
    pub async fn greet(&self, peer_id: &str, channel: &ChannelHandle) -> Result<SendOutcome> {
        self.transition(peer_id, HandshakeState::DataChannelOpen);

        let greeting = Message::ConnectionEstablished {
            protocol_version: self.protocol_version.clone(),
            uses_turn: None,
            uuid: None,
        };
        let outcome = self.pipeline.send(channel, greeting).await?;
        if outcome == SendOutcome::Sent {
            self.transition(peer_id, HandshakeState::GreetingSent);
            self.transition(peer_id, HandshakeState::AwaitingPeerHandshake);
        }
        Ok(outcome)
    }

    /// Judge the joiner's `connection-established` reply
    ///
    /// A protocol version mismatch fails with [`Error::VersionMismatch`]
    /// and leaves the joiner for the caller to invalidate. Otherwise the
    /// relay policy decides and `connection-validation` is sent.
    #[instrument(skip(self, channel, uuid), fields(peer_id = %peer_id))]
    pub async fn validate(
        &self,
        peer_id: &str,
        channel: &ChannelHandle,
        protocol_version: &str,
        uses_turn: Option<bool>,
        uuid: Option<&str>,
    ) -> Result<Verdict> {
        if protocol_version != self.protocol_version {
            self.transition(peer_id, HandshakeState::Rejected);
            return Err(Error::VersionMismatch {
                host: self.protocol_version.clone(),
                peer: protocol_version.to_string(),
            });
        }

        let relayed = uses_turn == Some(true) || self.stats_show_relay(peer_id).await;
        if !self.registry.contains(peer_id) {
            return Err(Error::PeerNotFound(peer_id.to_string()));
        }

        let key = uuid.unwrap_or(peer_id).to_string();
        let (verdict, count) = {
            let mut retries = self.retries.lock();
            let previous = retries.get(&key).copied().unwrap_or(0);
            let verdict = self.policy.evaluate(previous, relayed);
            let count = match verdict {
                Verdict::Approve => {
                    retries.remove(&key);
                    0
                }
                Verdict::Renegotiate { attempt } => {
                    retries.insert(key, attempt);
                    attempt
                }
            };
            (verdict, count)
        };
        self.registry.set_renegotiations(peer_id, count);

        match verdict {
            Verdict::Approve => {
                self.pipeline
                    .send(channel, Message::ConnectionValidation { is_approved: true })
                    .await?;
                self.transition(peer_id, HandshakeState::Validated);
                info!(relayed, "Connection approved");
            }
            Verdict::Renegotiate { attempt } => {
                warn!(
                    attempt,
                    limit = self.policy.retry_limit,
                    "Connection uses a TURN relay; asking joiner to renegotiate"
                );
                self.pipeline
                    .send(channel, Message::ConnectionValidation { is_approved: false })
                    .await?;
                self.transition(peer_id, HandshakeState::Renegotiating);
                self.schedule_close(peer_id, channel);
            }
        }

        Ok(verdict)
    }

    async fn stats_show_relay(&self, peer_id: &str) -> bool {
        let Some(link) = self.registry.link(peer_id) else {
            return false;
        };
        match link.stats().await {
            Ok(stats) => stats.uses_relay(),
            Err(e) => {
                warn!(peer_id, "Failed to read connection statistics: {}", e);
                false
            }
        }
    }

    fn schedule_close(&self, peer_id: &str, channel: &ChannelHandle) {
        let channel = Arc::clone(channel);
        let delay = self.policy.close_delay;
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if channel.ready_state() == ReadyState::Open {
                info!(peer_id = %peer_id, "Closing channel left open after renegotiation request");
                if let Err(e) = channel
                    .close(NORMAL_CLOSURE, "Terminated due to TURN usage")
                    .await
                {
                    warn!(peer_id = %peer_id, "Failed to close channel: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_id_hash() {
        assert_eq!(channel_id_for(""), 0);
        assert_eq!(channel_id_for("a"), 97);
        // 97 * 31 + 98 = 3105, 3105 * 31 + 99 = 96354
        assert_eq!(channel_id_for("abc"), (96354 % 256) as u16);
    }

    #[test]
    fn test_channel_id_hash_wraps() {
        let id = "f47ac10b-58cc-4372-a567-0e02b2c3d479";
        assert!(channel_id_for(id) < 256);
        assert_eq!(channel_id_for(id), channel_id_for(id));
    }

    #[test]
    fn test_colliding_channel_ids_get_distinct_keys() {
        assert_eq!(channel_id_for("a"), channel_id_for("\u{0161}"));
        assert_ne!(
            channel_key("hubnet-web", "a"),
            channel_key("hubnet-web", "\u{0161}")
        );
        assert_eq!(channel_key("hubnet-web", "a"), "hubnet-web-a");
    }

    #[test]
    fn test_direct_connection_is_always_approved() {
        let policy = RelayPolicy::default();
        assert_eq!(policy.evaluate(0, false), Verdict::Approve);
        assert_eq!(policy.evaluate(5, false), Verdict::Approve);
    }

    #[test]
    fn test_relay_retries_are_bounded() {
        let policy = RelayPolicy::default();
        let mut count = 0;
        let mut verdicts = Vec::new();
        for _ in 0..11 {
            let verdict = policy.evaluate(count, true);
            count = match verdict {
                Verdict::Approve => 0,
                Verdict::Renegotiate { attempt } => attempt,
            };
            verdicts.push(verdict);
        }

        for (i, verdict) in verdicts.iter().take(10).enumerate() {
            assert_eq!(*verdict, Verdict::Renegotiate { attempt: i as u32 + 1 });
        }
        assert_eq!(verdicts[10], Verdict::Approve);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_zero_limit_never_renegotiates() {
        let policy = RelayPolicy {
            retry_limit: 0,
            close_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.evaluate(0, true), Verdict::Approve);
    }
}
