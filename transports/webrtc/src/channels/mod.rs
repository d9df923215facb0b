//! Channel abstraction shared by data channels and plain sockets

pub mod data_channel;
pub mod messages;

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

pub use data_channel::{ChannelEvent, RtcDataChannel};
pub use messages::{Envelope, Message};

use crate::Result;

/// Readiness of a channel, mirroring the browser `readyState` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Transport behind a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Negotiated WebRTC data channel; payloads go through the codec
    Peer,
    /// WebSocket; payloads are JSON text
    Socket,
}

/// One unit handed to a channel's `send`
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw payload bytes
    pub fn into_bytes(self) -> Bytes {
        match self {
            Frame::Text(text) => Bytes::from(text),
            Frame::Binary(bytes) => bytes,
        }
    }
}

/// Anything the host can push frames through
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable key used for ID sequencing, e.g. `hubnet-web-42`
    fn key(&self) -> &str;

    fn kind(&self) -> ChannelKind;

    fn ready_state(&self) -> ReadyState;

    async fn send(&self, frame: Frame) -> Result<()>;

    async fn close(&self, code: u16, reason: &str) -> Result<()>;

    /// Bytes queued but not yet handed to the network
    async fn buffered_amount(&self) -> usize;
}

/// Sink notified of every frame the host sends
pub trait SendObserver: Send + Sync {
    fn on_send(&self, channel_key: &str, bytes: usize);
}

/// Byte counters for outgoing traffic
#[derive(Debug, Default)]
pub struct BandwidthMonitor {
    total: AtomicU64,
    since_report: AtomicU64,
}

impl BandwidthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes sent since the host started
    pub fn get_bandwidth(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Bytes sent since the previous call
    pub fn get_new_send(&self) -> u64 {
        self.since_report.swap(0, Ordering::Relaxed)
    }
}

impl SendObserver for BandwidthMonitor {
    fn on_send(&self, _channel_key: &str, bytes: usize) {
        self.total.fetch_add(bytes as u64, Ordering::Relaxed);
        self.since_report.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
