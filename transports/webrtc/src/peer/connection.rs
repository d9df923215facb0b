//! Peer connection contract and its webrtc-rs implementation

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::candidate::{CandidatePairState, CandidateType};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::channels::{ChannelEvent, RtcDataChannel};
use crate::config::HostConfig;
use crate::transport::ChannelHandle;
use crate::{Error, Result};

/// SDP description in the browser's `{ type, sdp }` JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate type as reported by connection statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

/// One candidate pair from connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePairStat {
    pub succeeded: bool,
    pub local_candidate_id: Option<String>,
}

/// The slice of connection statistics relay detection needs
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub candidate_pairs: Vec<CandidatePairStat>,

    /// Local candidates by stats ID
    pub local_candidates: HashMap<String, CandidateKind>,
}

impl ConnectionStats {
    /// True when a succeeded pair runs through a local relay candidate
    pub fn uses_relay(&self) -> bool {
        self.candidate_pairs.iter().any(|pair| {
            pair.succeeded
                && pair
                    .local_candidate_id
                    .as_ref()
                    .and_then(|id| self.local_candidates.get(id))
                    == Some(&CandidateKind::Relay)
        })
    }
}

/// What the host needs from one joiner's peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Open the pre-negotiated data channel
    ///
    /// `key` becomes the channel's [`Channel::key`](crate::channels::Channel::key).
    async fn create_data_channel(
        &self,
        label: &str,
        id: u16,
        key: &str,
    ) -> Result<(ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>)>;

    /// Stream of locally gathered ICE candidates as `RTCIceCandidateInit` JSON
    fn ice_candidates(&self) -> mpsc::UnboundedReceiver<Value>;

    async fn set_remote_offer(&self, sdp: &str) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn local_description(&self) -> Option<SessionDescription>;

    /// Add a remote ICE candidate given as `RTCIceCandidateInit` JSON
    async fn add_ice_candidate(&self, candidate: Value) -> Result<()>;

    async fn stats(&self) -> Result<ConnectionStats>;

    async fn close(&self) -> Result<()>;
}

/// Creates one [`PeerLink`] per admitted joiner
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self, peer_id: &str) -> Result<Arc<dyn PeerLink>>;
}

/// [`PeerLink`] over a webrtc-rs `RTCPeerConnection`
pub struct RtcPeerLink {
    peer_id: String,
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    /// Create a peer connection using the configured STUN/TURN servers
    #[instrument(skip(config), fields(peer_id = %peer_id))]
    pub async fn new(peer_id: &str, config: &HostConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnectionError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::PeerConnectionError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnectionError(format!("Failed to create peer connection: {}", e))
        })?);

        let log_id = peer_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let peer_id = log_id.clone();
                Box::pin(async move {
                    debug!(peer_id = %peer_id, ?state, "Peer connection state changed");
                })
            },
        ));

        info!("Created peer connection for joiner {}", peer_id);

        Ok(Self {
            peer_id: peer_id.to_string(),
            peer_connection,
        })
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_data_channel(
        &self,
        label: &str,
        id: u16,
        key: &str,
    ) -> Result<(ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let (channel, events) =
            RtcDataChannel::negotiated(&self.peer_connection, label, id, key).await?;
        Ok((Arc::new(channel), events))
    }

    fn ice_candidates(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer_id = self.peer_id.clone();
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json().map(|init| serde_json::to_value(init)) {
                    Ok(Ok(json)) => {
                        let _ = tx.send(json);
                    }
                    Ok(Err(e)) => warn!(peer_id = %peer_id, "Failed to serialize ICE candidate: {}", e),
                    Err(e) => warn!(peer_id = %peer_id, "Failed to convert ICE candidate: {}", e),
                }
            })
        }));
        rx
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let answer = RTCSessionDescription::answer(description.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| SessionDescription {
                kind: desc.sdp_type.to_string(),
                sdp: desc.sdp,
            })
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate).map_err(|e| {
            Error::IceCandidateError(format!("Failed to parse ICE candidate: {}", e))
        })?;

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn stats(&self) -> Result<ConnectionStats> {
        let report = self.peer_connection.get_stats().await;
        let mut stats = ConnectionStats::default();

        for entry in report.reports.into_values() {
            match entry {
                StatsReportType::CandidatePair(pair) => {
                    stats.candidate_pairs.push(CandidatePairStat {
                        succeeded: matches!(pair.state, CandidatePairState::Succeeded),
                        local_candidate_id: Some(pair.local_candidate_id),
                    });
                }
                StatsReportType::LocalCandidate(candidate) => {
                    let kind = match candidate.candidate_type {
                        CandidateType::Host => CandidateKind::Host,
                        CandidateType::ServerReflexive => CandidateKind::ServerReflexive,
                        CandidateType::PeerReflexive => CandidateKind::PeerReflexive,
                        CandidateType::Relay => CandidateKind::Relay,
                        _ => CandidateKind::Unknown,
                    };
                    stats.local_candidates.insert(candidate.id, kind);
                }
                _ => {}
            }
        }

        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for joiner {}", self.peer_id);
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::PeerConnectionError(format!("Failed to close: {}", e)))
    }
}

/// Builds [`RtcPeerLink`]s from the host configuration
pub struct RtcPeerLinkFactory {
    config: HostConfig,
}

impl RtcPeerLinkFactory {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerLinkFactory for RtcPeerLinkFactory {
    async fn create(&self, peer_id: &str) -> Result<Arc<dyn PeerLink>> {
        Ok(Arc::new(RtcPeerLink::new(peer_id, &self.config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(succeeded: bool, local: &str) -> CandidatePairStat {
        CandidatePairStat {
            succeeded,
            local_candidate_id: Some(local.to_string()),
        }
    }

    #[test]
    fn test_relay_detected_on_succeeded_pair() {
        let mut stats = ConnectionStats::default();
        stats.local_candidates.insert("c1".to_string(), CandidateKind::Host);
        stats.local_candidates.insert("c2".to_string(), CandidateKind::Relay);
        stats.candidate_pairs.push(pair(false, "c1"));
        stats.candidate_pairs.push(pair(true, "c2"));
        assert!(stats.uses_relay());
    }

    #[test]
    fn test_relay_ignored_on_failed_pair() {
        let mut stats = ConnectionStats::default();
        stats.local_candidates.insert("c2".to_string(), CandidateKind::Relay);
        stats.candidate_pairs.push(pair(false, "c2"));
        assert!(!stats.uses_relay());
    }

    #[test]
    fn test_direct_connection_is_not_relay() {
        let mut stats = ConnectionStats::default();
        stats
            .local_candidates
            .insert("c1".to_string(), CandidateKind::ServerReflexive);
        stats.candidate_pairs.push(pair(true, "c1"));
        stats.candidate_pairs.push(pair(true, "missing"));
        assert!(!stats.uses_relay());
    }

    #[test]
    fn test_session_description_json_shape() {
        let answer = SessionDescription::answer("v=0");
        let json = serde_json::to_value(&answer).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "answer", "sdp": "v=0" }));
    }

    #[tokio::test]
    async fn test_rtc_peer_link_rejects_invalid_offer() {
        let link = RtcPeerLink::new("joiner-1", &HostConfig::default()).await.unwrap();
        assert!(link.local_description().await.is_none());
        assert!(link.set_remote_offer("not sdp").await.is_err());
        link.close().await.unwrap();
    }
}
