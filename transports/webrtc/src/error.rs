//! Error types for the HubNet host transport

/// Result type alias using the transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in host transport operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling relay error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Joiner is not registered
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Joiner is already registered
    #[error("Peer already registered: {0}")]
    PeerAlreadyRegistered(String),

    /// Another joiner is logged in under this name
    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    /// Session is full
    #[error("Session is at capacity ({0} joiners)")]
    CapacityReached(usize),

    /// Joiner speaks a different protocol version
    #[error("Protocol version mismatch: host uses '{host}', peer uses '{peer}'")]
    VersionMismatch {
        /// Version spoken by this host
        host: String,
        /// Version announced by the joiner
        peer: String,
    },

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Encode/decode failed inside the codec (including worker panics)
    #[error("Codec failure: {0}")]
    CodecFailure(String),

    /// Codec pool has been shut down
    #[error("Codec pool is shut down")]
    PoolShutDown,

    /// Encoded payload would need more fragments than the wire allows
    #[error("Message too large: {fragments} fragments of {fragment_size} bytes exceeds {limit} bytes")]
    MessageTooLarge {
        /// Fragments the payload would need
        fragments: usize,
        /// Bytes per fragment
        fragment_size: usize,
        /// Byte ceiling for one message
        limit: usize,
    },

    /// Inconsistent or out-of-range burst fragment
    #[error("Malformed burst: {0}")]
    MalformedBurst(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not occur in normal operation)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_) | Error::WebSocketError(_) | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerAlreadyRegistered(_)
                | Error::UsernameTaken(_)
                | Error::VersionMismatch { .. }
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::DataChannelError(_)
        )
    }

    /// Check if retrying the same operation can never succeed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::MessageTooLarge { .. } | Error::PoolShutDown | Error::VersionMismatch { .. }
        )
    }
}
