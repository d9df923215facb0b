//! Message transport between the host and its channels

pub mod pipeline;

pub use pipeline::{
    BroadcastStats, ChannelHandle, InboundQueue, SendOutcome, TransportPipeline,
    PEER_RETRY_DELAY, SOCKET_RETRY_DELAY,
};
