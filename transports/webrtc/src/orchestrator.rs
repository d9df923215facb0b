//! HubNet host connection orchestrator
//!
//! Owns the registry, transport pipeline and handshake controller, and
//! wires them to joiner traffic:
//!
//! - admission and SDP offers arrive from signaling
//! - every channel feeds decoded messages into one dispatcher task, which
//!   applies their effects in order
//! - periodic jobs report the peer count, keep channels alive and measure
//!   round trips until [`ConnectionOrchestrator::teardown`]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::channels::{
    BandwidthMonitor, ChannelEvent, Envelope, Message, ReadyState, SendObserver,
};
use crate::codec::{CodecPool, Role, WireCodec};
use crate::config::HostConfig;
use crate::id::IdentitySequencer;
use crate::peer::handshake::NORMAL_CLOSURE;
use crate::peer::{HandshakeController, PeerLink, PeerLinkFactory, SessionDescription};
use crate::session::{SessionEntry, SessionRegistry, UNKNOWN_USERNAME};
use crate::signaling::{RelayMessage, RelaySocket, Signaler};
use crate::transport::{BroadcastStats, ChannelHandle, TransportPipeline};
use crate::{Error, Result};

/// Peer-count status period
pub const STATUS_INTERVAL: Duration = Duration::from_millis(1_000);

/// Keep-alive period
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(30_000);

/// Ping wave period
pub const PING_INTERVAL: Duration = Duration::from_millis(2_000);

/// Close reason sent to every channel on teardown
pub const TEARDOWN_REASON: &str = "Terminating unneeded sockets...";

/// What the embedding session supplies for a newly logged-in joiner
#[derive(Debug, Clone, PartialEq)]
pub struct JoinerInit {
    pub role: String,
    pub state: Value,
    pub view: Value,
}

/// The simulation side of the host
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Check a login password; `None` when the joiner sent none
    fn password_matches(&self, password: Option<&str>) -> bool;

    /// Build the joiner's initial model once it has logged in
    async fn await_joiner_init(&self, peer_id: &str, username: &str) -> Result<JoinerInit>;
}

/// Observable host activity
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Joiners with an open channel
    PeerCount(usize),

    LoggedIn { peer_id: String, username: String },

    Chat { peer_id: String, username: String, message: String },

    /// Round trip of a ping the joiner answered
    PingMeasured { peer_id: String, millis: u64 },

    Relay { peer_id: String, payload: Value },

    /// A message type the host does not handle
    UnknownMessage { peer_id: String, message_type: String },

    /// Text meant for the host operator
    Notice(String),

    Disconnected { peer_id: String },
}

/// One decoded message on its way to the dispatcher
struct Inbound {
    peer_id: String,
    channel: ChannelHandle,
    envelope: Envelope,
}

/// Host-side connection management for a HubNet session
pub struct ConnectionOrchestrator {
    config: HostConfig,
    registry: Arc<SessionRegistry>,
    pipeline: Arc<TransportPipeline>,
    handshake: Arc<HandshakeController>,
    bandwidth: Arc<BandwidthMonitor>,
    host: Arc<dyn SessionHost>,
    events: mpsc::UnboundedSender<HostEvent>,
    inbound: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    shutdown: broadcast::Sender<()>,
    jobs: Mutex<Vec<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl ConnectionOrchestrator {
    /// Build a host from `config`
    ///
    /// Host events are delivered on the returned receiver. Nothing runs
    /// until [`start`](Self::start) is called.
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid.
    pub fn new(
        config: HostConfig,
        host: Arc<dyn SessionHost>,
        codec: Arc<dyn WireCodec>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<HostEvent>)> {
        config.validate()?;

        info!(
            max_capacity = config.max_capacity,
            protocol_version = %config.protocol_version,
            "Creating HubNet host"
        );

        let pool = Arc::new(CodecPool::new(codec, Role::Host, config.codec_worker_cap()));
        let bandwidth = Arc::new(BandwidthMonitor::new());
        let pipeline = Arc::new(TransportPipeline::new(
            Arc::new(IdentitySequencer::new()),
            pool,
            Arc::clone(&bandwidth) as Arc<dyn SendObserver>,
        ));
        let registry = Arc::new(SessionRegistry::new(config.max_capacity));
        let handshake = Arc::new(HandshakeController::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&pipeline),
        ));

        let (events, events_rx) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);

        let orchestrator = Arc::new(Self {
            config,
            registry,
            pipeline,
            handshake,
            bandwidth,
            host,
            events,
            inbound,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown,
            jobs: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        });
        Ok((orchestrator, events_rx))
    }

    /// Start the dispatcher and the periodic jobs
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let inbound = self
            .inbound_rx
            .lock()
            .take()
            .ok_or_else(|| Error::InternalError("Host already started".to_string()))?;

        let mut jobs = vec![tokio::spawn(Arc::clone(self).run_dispatcher(inbound))];

        jobs.push(self.spawn_periodic("status", STATUS_INTERVAL, |host| async move {
            host.emit(HostEvent::PeerCount(host.registry.get_num_active()));
        }));

        jobs.push(self.spawn_periodic("keep-alive", KEEP_ALIVE_INTERVAL, |host| async move {
            // Only open channels; a send would otherwise park on a connecting one
            let channels: Vec<ChannelHandle> = host
                .registry
                .get_all_channels()
                .into_iter()
                .filter(|channel| channel.ready_state() == ReadyState::Open)
                .collect();
            host.pipeline.send_all(&channels, Message::KeepAlive).await;
        }));

        jobs.push(self.spawn_periodic("ping", PING_INTERVAL, |host| async move {
            host.send_ping_wave().await;
        }));

        self.jobs.lock().extend(jobs);
        info!("HubNet host started");
        Ok(())
    }

    fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, job: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let host = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => job(Arc::clone(&host)).await,
                }
            }
            debug!(job = name, "Periodic job stopped");
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<TransportPipeline> {
        &self.pipeline
    }

    pub fn handshake(&self) -> &Arc<HandshakeController> {
        &self.handshake
    }

    /// Total bytes sent to joiners
    pub fn get_bandwidth(&self) -> u64 {
        self.bandwidth.get_bandwidth()
    }

    /// Bytes sent since the previous call
    pub fn get_new_send(&self) -> u64 {
        self.bandwidth.get_new_send()
    }

    pub async fn get_buffered_amounts(&self) -> Vec<(String, usize)> {
        self.registry.get_buffered_amounts().await
    }

    pub fn update_fullness(&self, max_capacity: usize) {
        self.registry.update_fullness(max_capacity);
    }

    fn emit(&self, event: HostEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn notice(&self, text: String) {
        warn!("{}", text);
        self.emit(HostEvent::Notice(text));
    }

    // ------------------------------------------------------------------
    // Admission and negotiation
    // ------------------------------------------------------------------

    /// Admit a joiner announced by signaling
    ///
    /// # Errors
    ///
    /// [`Error::CapacityReached`] when the session is full, or
    /// [`Error::PeerAlreadyRegistered`] for a known peer ID.
    pub fn accept_joiner(&self, peer_id: &str, signaler: Arc<dyn Signaler>) -> Result<()> {
        if self.registry.is_at_capacity() {
            return Err(Error::CapacityReached(self.registry.max_capacity()));
        }
        self.registry.register(peer_id, signaler)?;
        self.pipeline.pool().notify_client_connect();
        Ok(())
    }

    /// Answer an admitted joiner's offer and start pumping its channel
    pub async fn process_offer(
        self: &Arc<Self>,
        peer_id: &str,
        link: Arc<dyn PeerLink>,
        offer: &SessionDescription,
    ) -> Result<()> {
        match self.handshake.process_offer(peer_id, Arc::clone(&link), offer).await {
            Ok((channel, events)) => {
                tokio::spawn(Arc::clone(self).pump_channel(peer_id.to_string(), channel, events));
                Ok(())
            }
            Err(e) => {
                warn!(peer_id, "Negotiation failed: {}", e);
                if let Err(close_err) = link.close().await {
                    debug!(peer_id, "Failed to close peer link: {}", close_err);
                }
                if let Some(mut entry) = self.registry.unregister(peer_id) {
                    entry.link = None;
                    self.release(entry).await;
                }
                Err(e)
            }
        }
    }

    /// Hand a remote ICE candidate to the joiner's peer link
    pub async fn add_remote_ice_candidate(&self, peer_id: &str, candidate: Value) -> Result<()> {
        let link = self
            .registry
            .link(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        link.add_ice_candidate(candidate).await
    }

    async fn pump_channel(
        self: Arc<Self>,
        peer_id: String,
        channel: ChannelHandle,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let mut queue = self.pipeline.inbound_queue(self.config.reassembly_timeout());

        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => {
                    if !self.registry.contains(&peer_id) {
                        continue;
                    }
                    if let Err(e) = self.handshake.greet(&peer_id, &channel).await {
                        warn!(peer_id = %peer_id, "Failed to send greeting: {}", e);
                    }
                }
                ChannelEvent::Message(payload) => match queue.accept(payload).await {
                    Ok(Some(envelope)) => {
                        let inbound = Inbound {
                            peer_id: peer_id.clone(),
                            channel: Arc::clone(&channel),
                            envelope,
                        };
                        if self.inbound.send(inbound).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(peer_id = %peer_id, "Dropping undecodable message: {}", e),
                },
                ChannelEvent::Close => {
                    self.disown(&peer_id).await;
                    break;
                }
            }
        }

        debug!(peer_id = %peer_id, "Channel pump finished");
    }

    /// Forget a joiner that left or whose channel closed
    pub async fn disown(&self, peer_id: &str) {
        if let Some(entry) = self.registry.unregister(peer_id) {
            self.release(entry).await;
        }
    }

    async fn release(&self, entry: SessionEntry) {
        let peer_id = entry.peer_id;
        self.handshake.forget(&peer_id);
        if let Some(channel) = &entry.channel {
            self.pipeline.forget_channel(channel);
        }
        self.pipeline.pool().notify_client_disconnect();

        if let Some(link) = entry.link {
            if let Err(e) = link.close().await {
                debug!(peer_id = %peer_id, "Failed to close peer link: {}", e);
            }
        }

        self.emit(HostEvent::Disconnected { peer_id });
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    async fn run_dispatcher(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                next = inbound.recv() => match next {
                    Some(message) => self.dispatch(message).await,
                    None => break,
                },
            }
        }
        debug!("Dispatcher stopped");
    }

    async fn dispatch(self: &Arc<Self>, inbound: Inbound) {
        let Inbound {
            peer_id,
            channel,
            envelope,
        } = inbound;

        if !self.registry.contains(&peer_id) {
            debug!(peer_id = %peer_id, "Ignoring message from departed joiner");
            return;
        }

        let Envelope {
            message,
            unrecognized,
            ..
        } = envelope;

        match message {
            Message::ConnectionEstablished {
                protocol_version,
                uses_turn,
                uuid,
            } => {
                self.on_peer_handshake(&peer_id, &channel, &protocol_version, uses_turn, uuid.as_deref())
                    .await;
            }
            Message::Login { username, password } => {
                self.on_login(&peer_id, &channel, username, password).await;
            }
            Message::Chat { message } => self.on_chat(&peer_id, message).await,
            Message::Pong { id } => {
                if let Some(millis) = self.registry.pong(&peer_id, id) {
                    self.emit(HostEvent::PingMeasured { peer_id, millis });
                }
            }
            Message::Ping { id, .. } => {
                if let Err(e) = self.pipeline.send(&channel, Message::Pong { id }).await {
                    warn!(peer_id = %peer_id, "Failed to answer ping: {}", e);
                }
            }
            Message::Relay { payload } => self.emit(HostEvent::Relay { peer_id, payload }),
            Message::ByeBye => self.disown(&peer_id).await,
            Message::KeepAlive => {}
            Message::Unknown => {
                let message_type = unrecognized.unwrap_or_else(|| "unknown".to_string());
                warn!(peer_id = %peer_id, message_type = %message_type, "Unknown channel event type");
                self.emit(HostEvent::UnknownMessage {
                    peer_id,
                    message_type,
                });
            }
            other => {
                warn!(
                    peer_id = %peer_id,
                    message_type = other.type_name(),
                    "Unexpected message type from joiner"
                );
                self.emit(HostEvent::UnknownMessage {
                    peer_id,
                    message_type: other.type_name().to_string(),
                });
            }
        }
    }

    async fn on_peer_handshake(
        &self,
        peer_id: &str,
        channel: &ChannelHandle,
        protocol_version: &str,
        uses_turn: Option<bool>,
        uuid: Option<&str>,
    ) {
        match self
            .handshake
            .validate(peer_id, channel, protocol_version, uses_turn, uuid)
            .await
        {
            Ok(_) => {}
            Err(Error::VersionMismatch { host, peer }) => {
                if let Some(entry) = self.registry.invalidate(peer_id) {
                    self.release(entry).await;
                }
                self.notice(format!(
                    "HubNet protocol version mismatch!  You are using protocol version '{}', \
                     while client '{}' is using version '{}'.  To ensure that you and the client \
                     are using the same version of HubNet Web, all parties should clear their \
                     browser cache and refresh the page.  The offending client has been disconnected.",
                    host, peer_id, peer
                ));
            }
            Err(Error::PeerNotFound(_)) => {
                debug!(peer_id, "Joiner left during handshake validation");
            }
            Err(e) => warn!(peer_id, "Handshake validation failed: {}", e),
        }
    }

    async fn on_login(
        self: &Arc<Self>,
        peer_id: &str,
        channel: &ChannelHandle,
        username: Option<String>,
        password: Option<String>,
    ) {
        let username = username.filter(|name| !name.is_empty());
        let reply = match username.as_deref() {
            None => Message::NoUsernameGiven,
            Some(name) if !self.registry.username_is_unique(peer_id, name) => {
                Message::UsernameAlreadyTaken
            }
            Some(_) if !self.host.password_matches(password.as_deref()) => {
                Message::IncorrectPassword
            }
            Some(name) => match self.registry.log_in(peer_id, name) {
                Ok(()) => Message::LoginSuccessful,
                Err(Error::UsernameTaken(_)) => Message::UsernameAlreadyTaken,
                Err(e) => {
                    debug!(peer_id, "Login for departed joiner: {}", e);
                    return;
                }
            },
        };

        let accepted = reply == Message::LoginSuccessful;
        if !accepted {
            info!(peer_id, reply = reply.type_name(), "Rejected login");
        }
        if let Err(e) = self.pipeline.send(channel, reply).await {
            warn!(peer_id, "Failed to send login reply: {}", e);
        }

        if let (true, Some(username)) = (accepted, username) {
            info!(peer_id, username = %username, "Joiner logged in");
            self.emit(HostEvent::LoggedIn {
                peer_id: peer_id.to_string(),
                username: username.clone(),
            });
            tokio::spawn(Arc::clone(self).initialize_joiner(peer_id.to_string(), username));
        }
    }

    async fn initialize_joiner(self: Arc<Self>, peer_id: String, username: String) {
        let init = match self.host.await_joiner_init(&peer_id, &username).await {
            Ok(init) => init,
            Err(e) => {
                warn!(peer_id = %peer_id, "Failed to build initial model: {}", e);
                return;
            }
        };

        if !self.registry.contains(&peer_id) {
            debug!(peer_id = %peer_id, "Joiner left before its initial model was ready");
            return;
        }

        let model = Message::InitialModel {
            role: init.role,
            token: peer_id.clone(),
            state: init.state,
            view: init.view,
        };
        match self.narrowcast(&peer_id, model).await {
            Ok(Some(_)) => {}
            Ok(None) => warn!(peer_id = %peer_id, "No open channel for initial model"),
            Err(e) => warn!(peer_id = %peer_id, "Failed to send initial model: {}", e),
        }
        self.registry.set_initialized(&peer_id);
    }

    async fn on_chat(&self, peer_id: &str, message: String) {
        let username = self
            .registry
            .lookup_username(peer_id)
            .unwrap_or_else(|| UNKNOWN_USERNAME.to_string());

        self.emit(HostEvent::Chat {
            peer_id: peer_id.to_string(),
            username: username.clone(),
            message: message.clone(),
        });

        let recipients: Vec<ChannelHandle> = self
            .registry
            .get_open_channels()
            .into_iter()
            .filter(|(id, _)| id != peer_id)
            .map(|(_, channel)| channel)
            .collect();
        self.pipeline
            .send_all(&recipients, Message::ChatRelay { message, username })
            .await;
    }

    async fn send_ping_wave(&self) {
        let pings = self.registry.start_new_ping_wave();
        let sends = pings.into_iter().map(|ping| async move {
            let message = Message::Ping {
                id: ping.token,
                last_ping: ping.last_ping,
            };
            if let Err(e) = self.pipeline.send(&ping.channel, message).await {
                warn!(peer_id = %ping.peer_id, "Failed to send ping: {}", e);
            }
        });
        join_all(sends).await;
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Burst a message to every initialized joiner
    pub async fn broadcast(&self, message: Message) -> Result<BroadcastStats> {
        let channels: Vec<ChannelHandle> = self
            .registry
            .get_open_channels()
            .into_iter()
            .map(|(_, channel)| channel)
            .collect();
        self.pipeline.send_burst(message, &channels).await
    }

    /// Burst a message to one joiner, initialized or not
    ///
    /// Returns `Ok(None)` when the joiner has no open channel.
    pub async fn narrowcast(&self, peer_id: &str, message: Message) -> Result<Option<BroadcastStats>> {
        match self.registry.get_open_channel_by_id(peer_id, true) {
            Some(channel) => Ok(Some(self.pipeline.send_burst(message, &[channel]).await?)),
            None => Ok(None),
        }
    }

    /// Host-originated chat to every initialized joiner
    pub async fn send_chat(&self, message: &str) -> BroadcastStats {
        let channels: Vec<ChannelHandle> = self
            .registry
            .get_open_channels()
            .into_iter()
            .map(|(_, channel)| channel)
            .collect();
        self.pipeline
            .send_all(
                &channels,
                Message::Chat {
                    message: message.to_string(),
                },
            )
            .await
    }

    /// Say goodbye to every joiner and stop all background work
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Tearing down HubNet host");

        let _ = self.shutdown.send(());
        for job in self.jobs.lock().drain(..) {
            job.abort();
        }

        let channels = self.registry.get_all_channels();
        let farewells = channels.iter().map(|channel| async move {
            if channel.ready_state() == ReadyState::Open {
                if let Err(e) = self.pipeline.send(channel, Message::ByeBye).await {
                    warn!(channel = channel.key(), "Failed to send bye-bye: {}", e);
                }
            }
            if let Err(e) = channel.close(NORMAL_CLOSURE, TEARDOWN_REASON).await {
                warn!(channel = channel.key(), "Failed to close channel: {}", e);
            }
        });
        join_all(farewells).await;

        self.pipeline.pool().shutdown().await;
        info!("HubNet host teardown complete");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Relay signaling
    // ------------------------------------------------------------------

    /// Apply one relay message, returning the reply to send back, if any
    pub async fn handle_relay_message(
        self: &Arc<Self>,
        message: RelayMessage,
        signaler: &Arc<dyn Signaler>,
        factory: &dyn PeerLinkFactory,
    ) -> Result<Option<RelayMessage>> {
        match message {
            RelayMessage::JoinerHello { joiner_id } => {
                match self.accept_joiner(&joiner_id, Arc::clone(signaler)) {
                    Ok(()) => Ok(None),
                    Err(Error::CapacityReached(max)) => {
                        info!(joiner_id = %joiner_id, max, "Turning joiner away, hub is full");
                        Ok(Some(RelayMessage::HubFull { joiner_id }))
                    }
                    Err(e) => Err(e),
                }
            }
            RelayMessage::JoinerOffer { joiner_id, offer } => {
                if !self.registry.contains(&joiner_id) {
                    return Err(Error::PeerNotFound(joiner_id));
                }
                let link = factory.create(&joiner_id).await?;
                self.process_offer(&joiner_id, link, &offer).await?;
                Ok(None)
            }
            RelayMessage::JoinerIceCandidate {
                joiner_id,
                candidate,
            } => {
                self.add_remote_ice_candidate(&joiner_id, candidate).await?;
                Ok(None)
            }
            RelayMessage::JoinerGone { joiner_id } => {
                self.disown(&joiner_id).await;
                Ok(None)
            }
            other => {
                warn!(message = ?other, "Unexpected relay message");
                Ok(None)
            }
        }
    }

    /// Serve joiners arriving through the relay until teardown
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignalingError`] when the relay connection drops.
    pub async fn serve_relay(
        self: &Arc<Self>,
        socket: Arc<RelaySocket>,
        mut inbox: mpsc::UnboundedReceiver<RelayMessage>,
        factory: Arc<dyn PeerLinkFactory>,
    ) -> Result<()> {
        let signaler: Arc<dyn Signaler> = Arc::clone(&socket) as Arc<dyn Signaler>;
        let mut shutdown = self.shutdown.subscribe();

        let host_id = self
            .config
            .host_id
            .clone()
            .unwrap_or_else(|| format!("host-{}", uuid::Uuid::new_v4()));
        info!(host_id = %host_id, "Announcing host to relay");
        socket.send_message(&RelayMessage::HostHello {
            host_id: Some(host_id),
            protocol_version: self.config.protocol_version.clone(),
        })?;

        loop {
            let message = tokio::select! {
                _ = shutdown.recv() => {
                    socket.close(NORMAL_CLOSURE, TEARDOWN_REASON)?;
                    return Ok(());
                }
                message = inbox.recv() => match message {
                    Some(message) => message,
                    None => {
                        return Err(Error::SignalingError(format!(
                            "Relay connection to {} closed",
                            socket.url()
                        )))
                    }
                },
            };

            let joiner_id = message.joiner_id().map(str::to_string);
            match self.handle_relay_message(message, &signaler, factory.as_ref()).await {
                Ok(Some(reply)) => socket.send_message(&reply)?,
                Ok(None) => {}
                Err(e) => warn!(joiner_id = ?joiner_id, "Failed to handle relay message: {}", e),
            }
        }
    }
}
