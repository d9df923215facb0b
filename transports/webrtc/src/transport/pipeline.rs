//! Send/receive path shared by every channel
//!
//! Outbound messages wait for their channel to open, take the next ID for
//! that channel (unless out-of-band), then go out as JSON text on sockets
//! or through the codec pool on data channels. Bursts are encoded once,
//! split into fragments and fanned out to every destination.
//!
//! Inbound payloads pass through an [`InboundQueue`] per channel, which
//! decodes them in arrival order and stitches burst fragments back
//! together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::channels::{Channel, ChannelKind, Envelope, Frame, Message, ReadyState, SendObserver};
use crate::chunk::{self, Fragment, Reassembler};
use crate::codec::CodecPool;
use crate::id::IdentitySequencer;
use crate::{Error, Result};

/// Retry delay while a data channel is still connecting
pub const PEER_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Retry delay while a socket is still connecting
pub const SOCKET_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Shared handle to a channel
pub type ChannelHandle = Arc<dyn Channel>;

/// What happened to one send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Destination was closing or closed; nothing was sent
    Dropped,
}

/// Fan-out summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Destinations targeted
    pub total: usize,

    /// Destinations that received every frame
    pub sent: usize,

    /// Destinations skipped or failed
    pub dropped: usize,

    /// Fragments per destination (1 for plain sends)
    pub fragments: usize,

    /// Wall time for the whole fan-out
    pub total_duration_ms: u64,
}

impl BroadcastStats {
    fn tally(outcomes: &[SendOutcome], fragments: usize, started: Instant) -> Self {
        let sent = outcomes.iter().filter(|o| **o == SendOutcome::Sent).count();
        Self {
            total: outcomes.len(),
            sent,
            dropped: outcomes.len() - sent,
            fragments,
            total_duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Outbound façade over the ID sequencer, codec pool and send observer
pub struct TransportPipeline {
    ids: Arc<IdentitySequencer>,
    pool: Arc<CodecPool>,
    observer: Arc<dyn SendObserver>,
}

impl TransportPipeline {
    pub fn new(
        ids: Arc<IdentitySequencer>,
        pool: Arc<CodecPool>,
        observer: Arc<dyn SendObserver>,
    ) -> Self {
        Self {
            ids,
            pool,
            observer,
        }
    }

    pub fn pool(&self) -> &Arc<CodecPool> {
        &self.pool
    }

    /// Send one message, waiting while the channel is still connecting
    pub async fn send(&self, channel: &ChannelHandle, message: Message) -> Result<SendOutcome> {
        if !await_open(channel.as_ref(), message.type_name()).await {
            return Ok(SendOutcome::Dropped);
        }

        let envelope = if message.is_oob() {
            Envelope::bare(message)
        } else {
            Envelope::with_id(self.ids.next(channel.key()), message)
        };
        self.deliver(channel, envelope).await
    }

    /// Send one message to several channels; failures are logged per channel
    pub async fn send_all(&self, channels: &[ChannelHandle], message: Message) -> BroadcastStats {
        let started = Instant::now();
        let sends = channels.iter().map(|channel| {
            let message = message.clone();
            async move {
                match self.send(channel, message).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(channel = channel.key(), error = %err, "Failed to send message");
                        SendOutcome::Dropped
                    }
                }
            }
        });
        let outcomes = join_all(sends).await;
        BroadcastStats::tally(&outcomes, 1, started)
    }

    /// Encode once, chunk, and send every fragment to every destination
    ///
    /// IDs are taken for all destinations before anything is encoded. A
    /// payload over the size ceiling fails with [`Error::MessageTooLarge`]
    /// and nothing is sent.
    pub async fn send_burst(
        &self,
        message: Message,
        destinations: &[ChannelHandle],
    ) -> Result<BroadcastStats> {
        let started = Instant::now();
        let type_name = message.type_name();
        let targets: Vec<(&ChannelHandle, u64)> = destinations
            .iter()
            .map(|channel| (channel, self.ids.next(channel.key())))
            .collect();

        let payload = self.pool.encode(Envelope::bare(message)).await?;
        let fragments = chunk::split(&payload)?;
        debug!(
            message_type = type_name,
            bytes = payload.len(),
            fragments = fragments.len(),
            destinations = targets.len(),
            "Sending burst"
        );

        let sends = targets
            .iter()
            .map(|(channel, id)| self.send_fragments(channel, *id, &fragments, type_name));
        let outcomes = join_all(sends).await;

        Ok(BroadcastStats::tally(&outcomes, fragments.len(), started))
    }

    async fn send_fragments(
        &self,
        channel: &ChannelHandle,
        id: u64,
        fragments: &[Fragment],
        type_name: &str,
    ) -> SendOutcome {
        for fragment in fragments {
            if !await_open(channel.as_ref(), type_name).await {
                return SendOutcome::Dropped;
            }

            let (index, full_length) = fragment.wire_position();
            let burst = Message::HnwBurst {
                index,
                full_length,
                parcel: fragment.payload.clone(),
            };
            match self.deliver(channel, Envelope::with_id(id, burst)).await {
                Ok(SendOutcome::Sent) => {}
                Ok(SendOutcome::Dropped) => return SendOutcome::Dropped,
                Err(err) => {
                    warn!(
                        channel = channel.key(),
                        message_type = type_name,
                        error = %err,
                        "Failed to send burst fragment"
                    );
                    return SendOutcome::Dropped;
                }
            }
        }
        SendOutcome::Sent
    }

    async fn deliver(&self, channel: &ChannelHandle, envelope: Envelope) -> Result<SendOutcome> {
        let type_name = envelope.type_name().to_string();
        let frame = match channel.kind() {
            ChannelKind::Socket => Frame::Text(envelope.to_json()?),
            ChannelKind::Peer => Frame::Binary(Bytes::from(self.pool.encode(envelope).await?)),
        };

        // The channel may have closed while the payload was being encoded
        if channel.ready_state() != ReadyState::Open {
            warn!(
                channel = channel.key(),
                message_type = %type_name,
                "Cannot send message, because the connection closed during encoding"
            );
            return Ok(SendOutcome::Dropped);
        }

        let bytes = frame.len();
        channel.send(frame).await?;
        self.observer.on_send(channel.key(), bytes);
        Ok(SendOutcome::Sent)
    }

    /// Forget the ID sequence of a channel that is gone for good
    pub fn forget_channel(&self, channel: &ChannelHandle) {
        self.ids.retire(channel.key());
    }

    /// Create the inbound queue for a newly opened channel
    pub fn inbound_queue(&self, reassembly_timeout: Duration) -> InboundQueue {
        InboundQueue {
            pool: Arc::clone(&self.pool),
            reassembler: Reassembler::new(reassembly_timeout),
        }
    }
}

/// Wait until `channel` is open; false when it is closing or closed
async fn await_open(channel: &dyn Channel, type_name: &str) -> bool {
    loop {
        match channel.ready_state() {
            ReadyState::Open => return true,
            ReadyState::Connecting => {
                let delay = match channel.kind() {
                    ChannelKind::Peer => PEER_RETRY_DELAY,
                    ChannelKind::Socket => SOCKET_RETRY_DELAY,
                };
                tokio::time::sleep(delay).await;
            }
            ReadyState::Closing | ReadyState::Closed => {
                warn!(
                    channel = channel.key(),
                    message_type = type_name,
                    "Cannot send message over connection, because it is already closed"
                );
                return false;
            }
        }
    }
}

/// Ordered decoder for one channel's incoming payloads
pub struct InboundQueue {
    pool: Arc<CodecPool>,
    reassembler: Reassembler,
}

impl InboundQueue {
    /// Decode one payload
    ///
    /// Returns `Ok(None)` while a burst is still incomplete. A completed
    /// burst yields its inner message, carrying the burst's ID.
    pub async fn accept(&mut self, payload: Bytes) -> Result<Option<Envelope>> {
        for stale in self.reassembler.gc() {
            warn!(id = stale, "Discarding incomplete burst");
        }

        let envelope = self.pool.decode(payload).await?;
        let (index, full_length, parcel) = match envelope.message {
            Message::HnwBurst {
                index,
                full_length,
                parcel,
            } => (index, full_length, parcel),
            _ => return Ok(Some(envelope)),
        };

        let id = envelope
            .id
            .ok_or_else(|| Error::MalformedBurst("burst fragment has no id".to_string()))?;
        let fragment = Fragment::from_wire(index, full_length, parcel)?;
        let Some(whole) = self.reassembler.push(id, fragment)? else {
            return Ok(None);
        };

        let mut inner = self.pool.decode(Bytes::from(whole)).await?;
        inner.id = Some(id);
        Ok(Some(inner))
    }

    /// Bursts still waiting for fragments
    pub fn pending(&self) -> usize {
        self.reassembler.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::BandwidthMonitor;
    use crate::codec::{JsonCodec, Role, WireCodec};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct RecordingChannel {
        key: String,
        kind: ChannelKind,
        state: Mutex<ReadyState>,
        sent: Mutex<Vec<Frame>>,
    }

    impl RecordingChannel {
        fn new(key: &str, kind: ChannelKind, state: ReadyState) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                kind,
                state: Mutex::new(state),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn envelopes(&self) -> Vec<Envelope> {
            self.sent
                .lock()
                .iter()
                .map(|frame| JsonCodec.decode(&frame.clone().into_bytes()).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn key(&self) -> &str {
            &self.key
        }

        fn kind(&self) -> ChannelKind {
            self.kind
        }

        fn ready_state(&self) -> ReadyState {
            *self.state.lock()
        }

        async fn send(&self, frame: Frame) -> Result<()> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) -> Result<()> {
            *self.state.lock() = ReadyState::Closed;
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            0
        }
    }

    fn pipeline() -> (TransportPipeline, Arc<BandwidthMonitor>) {
        let monitor = Arc::new(BandwidthMonitor::new());
        let pool = Arc::new(CodecPool::new(Arc::new(JsonCodec), Role::Host, 2));
        let pipeline = TransportPipeline::new(
            Arc::new(IdentitySequencer::new()),
            pool,
            Arc::clone(&monitor) as Arc<dyn SendObserver>,
        );
        (pipeline, monitor)
    }

    #[tokio::test]
    async fn test_in_band_sends_get_increasing_ids() {
        let (pipeline, monitor) = pipeline();
        let channel = RecordingChannel::new("hubnet-web-1", ChannelKind::Peer, ReadyState::Open);
        let handle: ChannelHandle = channel.clone();

        for text in ["a", "b", "c"] {
            let outcome = pipeline
                .send(&handle, Message::Chat { message: text.to_string() })
                .await
                .unwrap();
            assert_eq!(outcome, SendOutcome::Sent);
        }
        pipeline.send(&handle, Message::KeepAlive).await.unwrap();

        let ids: Vec<_> = channel.envelopes().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3), None]);
        assert!(monitor.get_bandwidth() > 0);
    }

    #[tokio::test]
    async fn test_socket_gets_json_text() {
        let (pipeline, _) = pipeline();
        let socket = RecordingChannel::new("relay", ChannelKind::Socket, ReadyState::Open);
        let handle: ChannelHandle = socket.clone();

        pipeline.send(&handle, Message::ByeBye).await.unwrap();
        assert_eq!(
            socket.sent.lock()[0],
            Frame::Text(r#"{"type":"bye-bye"}"#.to_string())
        );
        assert_eq!(pipeline.pool().worker_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_drops() {
        let (pipeline, monitor) = pipeline();
        let channel = RecordingChannel::new("hubnet-web-2", ChannelKind::Peer, ReadyState::Closed);
        let handle: ChannelHandle = channel.clone();

        let outcome = pipeline.send(&handle, Message::KeepAlive).await.unwrap();
        assert_eq!(outcome, SendOutcome::Dropped);
        assert!(channel.sent.lock().is_empty());
        assert_eq!(monitor.get_bandwidth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connecting_channel_is_retried() {
        let (pipeline, _) = pipeline();
        let channel =
            RecordingChannel::new("hubnet-web-3", ChannelKind::Peer, ReadyState::Connecting);
        let handle: ChannelHandle = channel.clone();

        let opener = Arc::clone(&channel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            *opener.state.lock() = ReadyState::Open;
        });

        let outcome = pipeline.send(&handle, Message::LoginSuccessful).await.unwrap();
        assert_eq!(outcome, SendOutcome::Sent);
        assert_eq!(channel.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_burst_reaches_every_destination_with_own_id() {
        let (pipeline, _) = pipeline();
        let a = RecordingChannel::new("hubnet-web-a", ChannelKind::Peer, ReadyState::Open);
        let b = RecordingChannel::new("hubnet-web-b", ChannelKind::Peer, ReadyState::Open);
        let a_handle: ChannelHandle = a.clone();
        let b_handle: ChannelHandle = b.clone();

        // Advance b's sequence so the two destinations disagree
        pipeline.send(&b_handle, Message::LoginSuccessful).await.unwrap();

        let state = serde_json::Value::String("x".repeat(6000));
        let message = Message::InitialModel {
            role: "student".to_string(),
            token: "t".to_string(),
            state,
            view: serde_json::Value::Null,
        };
        let stats = pipeline
            .send_burst(message.clone(), &[a_handle, b_handle])
            .await
            .unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.sent, 2);
        assert!(stats.fragments > 1);

        let a_ids: Vec<_> = a.envelopes().iter().map(|e| e.id).collect();
        assert_eq!(a_ids, vec![Some(1); stats.fragments]);
        let b_ids: Vec<_> = b.envelopes().iter().skip(1).map(|e| e.id).collect();
        assert_eq!(b_ids, vec![Some(2); stats.fragments]);

        // Feed a's frames back through an inbound queue
        let mut queue = pipeline.inbound_queue(Duration::from_secs(30));
        let mut delivered = Vec::new();
        for frame in a.sent.lock().clone() {
            if let Some(envelope) = queue.accept(frame.into_bytes()).await.unwrap() {
                delivered.push(envelope);
            }
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message, message);
        assert_eq!(delivered[0].id, Some(1));
    }

    #[tokio::test]
    async fn test_small_burst_uses_compact_form() {
        let (pipeline, _) = pipeline();
        let channel = RecordingChannel::new("hubnet-web-c", ChannelKind::Peer, ReadyState::Open);
        let handle: ChannelHandle = channel.clone();

        pipeline
            .send_burst(Message::Relay { payload: serde_json::json!({ "x": 1 }) }, &[handle])
            .await
            .unwrap();

        let sent = channel.envelopes();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].message,
            Message::HnwBurst { index: None, full_length: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_oversized_burst_sends_nothing() {
        let (pipeline, _) = pipeline();
        let channel = RecordingChannel::new("hubnet-web-d", ChannelKind::Peer, ReadyState::Open);
        let handle: ChannelHandle = channel.clone();

        let huge = Message::Relay {
            payload: serde_json::Value::String("y".repeat(chunk::MAX_MESSAGE_BYTES)),
        };
        let err = pipeline.send_burst(huge, &[handle]).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
        assert!(channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_plain_message_passes_through() {
        let (pipeline, _) = pipeline();
        let mut queue = pipeline.inbound_queue(Duration::from_secs(30));
        let bytes = Bytes::from_static(br#"{"type":"chat","message":"yo","id":4}"#);

        let envelope = queue.accept(bytes).await.unwrap().unwrap();
        assert_eq!(envelope.id, Some(4));
        assert_eq!(envelope.message, Message::Chat { message: "yo".to_string() });
        assert_eq!(queue.pending(), 0);
    }
}
