//! Joiner peer connections
//!
//! Handles the WebRTC side of each joiner: offer/answer, ICE candidate
//! exchange, the negotiated data channel and relay detection.

pub mod connection;
pub mod handshake;

pub use connection::{
    CandidateKind, CandidatePairStat, ConnectionStats, PeerLink, PeerLinkFactory, RtcPeerLink,
    RtcPeerLinkFactory, SessionDescription,
};
pub use handshake::{
    channel_id_for, channel_key, HandshakeController, HandshakeState, RelayPolicy, Verdict,
};
