//! HubNet host test harness
//!
//! Drives a real [`ConnectionOrchestrator`] through in-memory doubles:
//! - `MockChannel` records every frame the host sends
//! - `MockPeerLink` stands in for a WebRTC peer connection and lets a test
//!   open the channel and push joiner messages into it
//! - `RecordingSignaler` captures answers and forwarded ICE candidates
//! - `ScriptedSession` checks passwords and counts initial-model requests
//!
//! Basic usage pattern:
//!
//! 1. Create a `HostHarness` with a `HostConfig`
//! 2. Admit joiners with `harness.connect_joiner()`
//! 3. Push joiner messages with `MockPeerLink::deliver()`
//! 4. Wait on outbound messages or host events
//! 5. Call `harness.host.teardown()` to clean up

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hubnet_webrtc::channels::{
    Channel, ChannelEvent, ChannelKind, Envelope, Frame, Message, ReadyState,
};
use hubnet_webrtc::chunk::{Fragment, Reassembler};
use hubnet_webrtc::codec::{JsonCodec, WireCodec};
use hubnet_webrtc::orchestrator::{ConnectionOrchestrator, HostEvent, JoinerInit, SessionHost};
use hubnet_webrtc::peer::{
    CandidateKind, CandidatePairStat, ConnectionStats, PeerLink, PeerLinkFactory,
    SessionDescription,
};
use hubnet_webrtc::signaling::{RelayMessage, Signaler};
use hubnet_webrtc::transport::ChannelHandle;
use hubnet_webrtc::{Error, HostConfig, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// How long a test waits for something asynchronous before failing
pub const WAIT: Duration = Duration::from_secs(3);

/// Password accepted by [`ScriptedSession`]
pub const PASSWORD: &str = "open-sesame";

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,hubnet_webrtc=debug")
        .try_init();
}

// ============================================================================
// Channel double
// ============================================================================

/// Data channel that records what the host sends
pub struct MockChannel {
    key: String,
    state: Mutex<ReadyState>,
    sent: Mutex<Vec<Frame>>,
    closes: Mutex<Vec<(u16, String)>>,
}

impl MockChannel {
    pub fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            state: Mutex::new(ReadyState::Connecting),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: ReadyState) {
        *self.state.lock() = state;
    }

    pub fn closes(&self) -> Vec<(u16, String)> {
        self.closes.lock().clone()
    }

    pub fn frame_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Every message received so far, bursts reassembled, with its ID
    pub fn envelopes(&self) -> Vec<Envelope> {
        let frames = self.sent.lock().clone();
        let mut reassembler = Reassembler::default();
        let mut envelopes = Vec::new();

        for frame in frames {
            let envelope = JsonCodec
                .decode(&frame.into_bytes())
                .expect("host sent an undecodable frame");
            match envelope.message {
                Message::HnwBurst {
                    index,
                    full_length,
                    parcel,
                } => {
                    let id = envelope.id.expect("burst without id");
                    let fragment = Fragment::from_wire(index, full_length, parcel)
                        .expect("malformed burst fragment");
                    if let Some(whole) = reassembler.push(id, fragment).expect("bad burst") {
                        let mut inner = JsonCodec.decode(&whole).expect("undecodable burst");
                        inner.id = Some(id);
                        envelopes.push(inner);
                    }
                }
                _ => envelopes.push(envelope),
            }
        }
        envelopes
    }

    pub fn messages(&self) -> Vec<Message> {
        self.envelopes().into_iter().map(|e| e.message).collect()
    }

    /// Wait until a received message matches `predicate`
    pub async fn wait_for<F>(&self, what: &str, predicate: F) -> Message
    where
        F: Fn(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(found) = self.messages().into_iter().find(|m| predicate(m)) {
                return found;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {} on {}; got {:?}", what, self.key, self.messages());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until `count` messages match `predicate`, returning all of them
    pub async fn wait_for_count<F>(&self, what: &str, count: usize, predicate: F) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let found: Vec<Message> = self.messages().into_iter().filter(|m| predicate(m)).collect();
            if found.len() >= count {
                return found;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "timed out waiting for {} x{} on {}; got {:?}",
                    what,
                    count,
                    self.key,
                    self.messages()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Peer
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if *self.state.lock() != ReadyState::Open {
            return Err(Error::DataChannelError(format!("{} is not open", self.key)));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        self.closes.lock().push((code, reason.to_string()));
        *self.state.lock() = ReadyState::Closed;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        0
    }
}

// ============================================================================
// Peer link double
// ============================================================================

/// Peer connection stand-in driven by the test
pub struct MockPeerLink {
    relayed: bool,
    channel: Mutex<Option<Arc<MockChannel>>>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    candidates: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    local: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<Value>>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl MockPeerLink {
    pub fn new(relayed: bool) -> Arc<Self> {
        Arc::new(Self {
            relayed,
            channel: Mutex::new(None),
            events: Mutex::new(None),
            candidates: Mutex::new(None),
            local: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn channel(&self) -> Arc<MockChannel> {
        self.channel.lock().clone().expect("no data channel created yet")
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<Value> {
        self.remote_candidates.lock().clone()
    }

    fn push_event(&self, event: ChannelEvent) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(event);
        }
    }

    /// Open the data channel
    pub fn open(&self) {
        self.channel().set_state(ReadyState::Open);
        self.push_event(ChannelEvent::Open);
    }

    /// Send a message from the joiner, numbering it like a joiner would
    pub fn deliver(&self, message: Message) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = Envelope::with_id(id, message).to_json().expect("unserializable message");
        self.deliver_raw(json.as_bytes());
    }

    pub fn deliver_raw(&self, payload: &[u8]) {
        self.push_event(ChannelEvent::Message(Bytes::copy_from_slice(payload)));
    }

    /// Report a locally gathered ICE candidate
    pub fn gather(&self, candidate: Value) {
        if let Some(candidates) = self.candidates.lock().as_ref() {
            let _ = candidates.send(candidate);
        }
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn create_data_channel(
        &self,
        _label: &str,
        _id: u16,
        key: &str,
    ) -> Result<(ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let channel = MockChannel::new(key);
        let (events, receiver) = mpsc::unbounded_channel();
        *self.channel.lock() = Some(Arc::clone(&channel));
        *self.events.lock() = Some(events);
        Ok((channel as ChannelHandle, receiver))
    }

    fn ice_candidates(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.candidates.lock() = Some(tx);
        rx
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<()> {
        if sdp.starts_with("v=0") {
            Ok(())
        } else {
            Err(Error::SdpError(format!("unparseable offer: {}", sdp)))
        }
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<()> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<ConnectionStats> {
        let mut stats = ConnectionStats::default();
        let kind = if self.relayed {
            CandidateKind::Relay
        } else {
            CandidateKind::Host
        };
        stats.local_candidates.insert("local-1".to_string(), kind);
        stats.candidate_pairs.push(CandidatePairStat {
            succeeded: true,
            local_candidate_id: Some("local-1".to_string()),
        });
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let channel = self.channel.lock().clone();
        if let Some(channel) = channel {
            channel.set_state(ReadyState::Closed);
            self.push_event(ChannelEvent::Close);
        }
        Ok(())
    }
}

/// Hands out [`MockPeerLink`]s and remembers them by peer ID
#[derive(Default)]
pub struct MockLinkFactory {
    relayed: AtomicBool,
    links: Mutex<HashMap<String, Arc<MockPeerLink>>>,
}

impl MockLinkFactory {
    pub fn set_relayed(&self, relayed: bool) {
        self.relayed.store(relayed, Ordering::SeqCst);
    }

    pub fn link(&self, peer_id: &str) -> Arc<MockPeerLink> {
        self.links
            .lock()
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("no link created for {}", peer_id))
    }
}

#[async_trait]
impl PeerLinkFactory for MockLinkFactory {
    async fn create(&self, peer_id: &str) -> Result<Arc<dyn PeerLink>> {
        let link = MockPeerLink::new(self.relayed.load(Ordering::SeqCst));
        self.links.lock().insert(peer_id.to_string(), Arc::clone(&link));
        Ok(link)
    }
}

// ============================================================================
// Signaling and session doubles
// ============================================================================

#[derive(Default)]
pub struct RecordingSignaler {
    pub answers: Mutex<Vec<(String, SessionDescription)>>,
    pub candidates: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl Signaler for RecordingSignaler {
    async fn send_answer(&self, peer_id: &str, answer: &SessionDescription) -> Result<()> {
        self.answers.lock().push((peer_id.to_string(), answer.clone()));
        Ok(())
    }

    async fn send_ice_candidate(&self, peer_id: &str, candidate: &Value) -> Result<()> {
        self.candidates.lock().push((peer_id.to_string(), candidate.clone()));
        Ok(())
    }
}

/// Session with a fixed password whose initial model echoes the username
#[derive(Default)]
pub struct ScriptedSession {
    pub init_requests: AtomicUsize,
}

#[async_trait]
impl SessionHost for ScriptedSession {
    fn password_matches(&self, password: Option<&str>) -> bool {
        password == Some(PASSWORD)
    }

    async fn await_joiner_init(&self, _peer_id: &str, username: &str) -> Result<JoinerInit> {
        self.init_requests.fetch_add(1, Ordering::SeqCst);
        Ok(JoinerInit {
            role: "student".to_string(),
            state: json!({ "username": username, "ticks": 0 }),
            view: json!({ "patches": [0, 0, 0] }),
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct HostHarness {
    pub host: Arc<ConnectionOrchestrator>,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
    pub signaler: Arc<RecordingSignaler>,
    pub factory: Arc<MockLinkFactory>,
    pub session: Arc<ScriptedSession>,
}

impl HostHarness {
    pub fn new(config: HostConfig) -> Self {
        init_logging();
        let session = Arc::new(ScriptedSession::default());
        let (host, events) = ConnectionOrchestrator::new(
            config,
            Arc::clone(&session) as Arc<dyn SessionHost>,
            Arc::new(JsonCodec),
        )
        .expect("valid host config");
        host.start().expect("host starts once");

        Self {
            host,
            events,
            signaler: Arc::new(RecordingSignaler::default()),
            factory: Arc::new(MockLinkFactory::default()),
            session,
        }
    }

    pub fn default_host() -> Self {
        Self::new(HostConfig::default().with_codec_workers(2))
    }

    /// Feed one relay message through the host
    pub async fn relay(&self, message: RelayMessage) -> Result<Option<RelayMessage>> {
        let signaler: Arc<dyn Signaler> = Arc::clone(&self.signaler) as Arc<dyn Signaler>;
        self.host
            .handle_relay_message(message, &signaler, self.factory.as_ref())
            .await
    }

    /// Admit a joiner, answer its offer and open its channel
    pub async fn connect_joiner(&self, peer_id: &str) -> Arc<MockPeerLink> {
        let reply = self
            .relay(RelayMessage::JoinerHello {
                joiner_id: peer_id.to_string(),
            })
            .await
            .expect("joiner admitted");
        assert_eq!(reply, None, "joiner {} was turned away", peer_id);

        self.relay(RelayMessage::JoinerOffer {
            joiner_id: peer_id.to_string(),
            offer: SessionDescription::offer("v=0 offer"),
        })
        .await
        .expect("offer answered");

        let link = self.factory.link(peer_id);
        link.open();
        link.channel()
            .wait_for("greeting", |m| matches!(m, Message::ConnectionEstablished { .. }))
            .await;
        link
    }

    /// Connect, log in and wait for the initial model
    pub async fn join(&self, peer_id: &str, username: &str) -> Arc<MockPeerLink> {
        let link = self.connect_joiner(peer_id).await;
        link.deliver(Message::Login {
            username: Some(username.to_string()),
            password: Some(PASSWORD.to_string()),
        });
        link.channel()
            .wait_for("initial model", |m| matches!(m, Message::InitialModel { .. }))
            .await;
        self.wait_until("joiner initialized", || {
            self.host.registry().is_initialized(peer_id)
        })
        .await;
        link
    }

    /// Next host event matching `predicate`, skipping the rest
    pub async fn expect_event<F>(&mut self, what: &str, predicate: F) -> HostEvent
    where
        F: Fn(&HostEvent) -> bool,
    {
        let result = tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if predicate(&event) => return event,
                    Some(_) => continue,
                    None => panic!("host event stream closed"),
                }
            }
        })
        .await;
        result.unwrap_or_else(|_| panic!("timed out waiting for event: {}", what))
    }

    pub async fn wait_until<F>(&self, what: &str, condition: F)
    where
        F: Fn() -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting until {}", what);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
