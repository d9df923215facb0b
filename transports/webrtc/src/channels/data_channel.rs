//! WebRTC data channel adapter
//!
//! Wraps a negotiated `RTCDataChannel` as a [`Channel`] and turns its
//! open/message/close callbacks into a [`ChannelEvent`] stream.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use super::{Channel, ChannelKind, Frame, ReadyState};
use crate::{Error, Result};

/// Lifecycle and traffic of one data channel, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Close,
}

/// [`Channel`] backed by a webrtc-rs data channel
pub struct RtcDataChannel {
    key: String,
    rtc_channel: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    /// Create a pre-negotiated, ordered data channel on `peer_connection`
    ///
    /// Both sides open the channel with the same `id`, so no in-band
    /// announcement is exchanged. `key` names the channel for ID sequencing
    /// and must be unique among live channels.
    pub async fn negotiated(
        peer_connection: &RTCPeerConnection,
        label: &str,
        id: u16,
        key: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(id),
            ..Default::default()
        };

        let rtc_channel = peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        let channel = Self {
            key: key.to_string(),
            rtc_channel,
        };
        let events = channel.forward_events();
        Ok((channel, events))
    }

    fn forward_events(&self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (events, receiver) = mpsc::unbounded_channel();

        let tx = events.clone();
        let key = self.key.clone();
        self.rtc_channel.on_open(Box::new(move || {
            let tx = tx.clone();
            let key = key.clone();
            Box::pin(async move {
                debug!("Data channel '{}' opened", key);
                let _ = tx.send(ChannelEvent::Open);
            })
        }));

        let tx = events.clone();
        self.rtc_channel.on_message(Box::new(move |msg| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Message(msg.data));
            })
        }));

        let tx = events;
        let key = self.key.clone();
        self.rtc_channel.on_close(Box::new(move || {
            let tx = tx.clone();
            let key = key.clone();
            Box::pin(async move {
                debug!("Data channel '{}' closed", key);
                let _ = tx.send(ChannelEvent::Close);
            })
        }));

        let key = self.key.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            let key = key.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", key, err);
            })
        }));

        receiver
    }
}

#[async_trait]
impl Channel for RtcDataChannel {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Peer
    }

    fn ready_state(&self) -> ReadyState {
        match self.rtc_channel.ready_state() {
            RTCDataChannelState::Open => ReadyState::Open,
            RTCDataChannelState::Closing => ReadyState::Closing,
            RTCDataChannelState::Closed => ReadyState::Closed,
            _ => ReadyState::Connecting,
        }
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        let result = match frame {
            Frame::Binary(bytes) => self.rtc_channel.send(&bytes).await,
            Frame::Text(text) => self.rtc_channel.send_text(text).await,
        };
        result
            .map(|_| ())
            .map_err(|e| Error::DataChannelError(format!("Failed to send on '{}': {}", self.key, e)))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        // Data channels carry no close code; keep it for the log only
        debug!(channel = %self.key, code, reason, "Closing data channel");
        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close '{}': {}", self.key, e)))
    }

    async fn buffered_amount(&self) -> usize {
        self.rtc_channel.buffered_amount().await
    }
}
