//! Joiner session bookkeeping
//!
//! One [`SessionEntry`] per admitted joiner, keyed by peer ID. The registry
//! owns admission (capacity), login state, networking handles and each
//! joiner's ping history. Every mutation happens under a single lock; no
//! lock is held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::channels::ReadyState;
use crate::peer::PeerLink;
use crate::ping::PingTracker;
use crate::signaling::Signaler;
use crate::transport::ChannelHandle;
use crate::{Error, Result};

/// Attribution used for chat from a joiner that never logged in
pub const UNKNOWN_USERNAME: &str = "???";

/// Everything the host knows about one joiner
pub struct SessionEntry {
    pub peer_id: String,
    pub username: Option<String>,
    pub signaler: Arc<dyn Signaler>,
    pub link: Option<Arc<dyn PeerLink>>,
    pub channel: Option<ChannelHandle>,
    pub ping: PingTracker,
    /// Relay renegotiations attempted on the current connection chain
    pub renegotiations: u32,
    /// Set once `initial-model` has been sent
    pub initialized: bool,
}

impl SessionEntry {
    fn new(peer_id: String, signaler: Arc<dyn Signaler>) -> Self {
        Self {
            peer_id,
            username: None,
            signaler,
            link: None,
            channel: None,
            ping: PingTracker::new(),
            renegotiations: 0,
            initialized: false,
        }
    }

    fn open_channel(&self) -> Option<&ChannelHandle> {
        self.channel
            .as_ref()
            .filter(|channel| channel.ready_state() == ReadyState::Open)
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("peer_id", &self.peer_id)
            .field("username", &self.username)
            .field("has_link", &self.link.is_some())
            .field("channel", &self.channel.as_ref().map(|c| c.key().to_string()))
            .field("renegotiations", &self.renegotiations)
            .field("initialized", &self.initialized)
            .finish()
    }
}

/// A ping the host should send now
pub struct PingRequest {
    pub peer_id: String,
    pub channel: ChannelHandle,
    pub token: u64,
    /// Rolling average of this joiner's recent round trips
    pub last_ping: Option<u64>,
}

/// Admitted joiners and their session state
pub struct SessionRegistry {
    entries: RwLock<HashMap<String, SessionEntry>>,
    max_capacity: AtomicUsize,
    ping_tokens: AtomicU64,
}

impl SessionRegistry {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_capacity: AtomicUsize::new(max_capacity),
            ping_tokens: AtomicU64::new(0),
        }
    }

    /// Admit a joiner, taking one capacity slot until it is unregistered
    pub fn register(&self, peer_id: &str, signaler: Arc<dyn Signaler>) -> Result<()> {
        let mut entries = self.entries.write();

        let max = self.max_capacity.load(Ordering::Acquire);
        if entries.len() >= max {
            return Err(Error::CapacityReached(max));
        }
        if entries.contains_key(peer_id) {
            return Err(Error::PeerAlreadyRegistered(peer_id.to_string()));
        }

        info!(peer_id, "Registering joiner");
        entries.insert(
            peer_id.to_string(),
            SessionEntry::new(peer_id.to_string(), signaler),
        );
        Ok(())
    }

    /// Attach the peer connection and data channel
    pub fn set_networking(
        &self,
        peer_id: &str,
        link: Arc<dyn PeerLink>,
        channel: ChannelHandle,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        entry.link = Some(link);
        entry.channel = Some(channel);
        Ok(())
    }

    pub fn is_at_capacity(&self) -> bool {
        self.entries.read().len() >= self.max_capacity.load(Ordering::Acquire)
    }

    /// Change the capacity; joiners already admitted keep their slots
    pub fn update_fullness(&self, max_capacity: usize) {
        debug!(max_capacity, "Updating session capacity");
        self.max_capacity.store(max_capacity, Ordering::Release);
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity.load(Ordering::Acquire)
    }

    /// Record `username` for a joiner
    ///
    /// The uniqueness check and the write happen under one lock, so two
    /// concurrent logins cannot both claim a name.
    pub fn log_in(&self, peer_id: &str, username: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries
            .values()
            .any(|entry| entry.peer_id != peer_id && entry.username.as_deref() == Some(username))
        {
            return Err(Error::UsernameTaken(username.to_string()));
        }
        let entry = entries
            .get_mut(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;
        entry.username = Some(username.to_string());
        Ok(())
    }

    /// True when no other joiner is logged in as `username`
    pub fn username_is_unique(&self, peer_id: &str, username: &str) -> bool {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.peer_id != peer_id)
            .all(|entry| entry.username.as_deref() != Some(username))
    }

    pub fn lookup_username(&self, peer_id: &str) -> Option<String> {
        self.entries
            .read()
            .get(peer_id)
            .and_then(|entry| entry.username.clone())
    }

    pub fn set_initialized(&self, peer_id: &str) -> bool {
        match self.entries.write().get_mut(peer_id) {
            Some(entry) => {
                entry.initialized = true;
                true
            }
            None => false,
        }
    }

    pub fn is_initialized(&self, peer_id: &str) -> bool {
        self.entries
            .read()
            .get(peer_id)
            .map(|entry| entry.initialized)
            .unwrap_or(false)
    }

    /// Record the relay retry count mirrored from the handshake
    pub fn set_renegotiations(&self, peer_id: &str, count: u32) {
        if let Some(entry) = self.entries.write().get_mut(peer_id) {
            entry.renegotiations = count;
        }
    }

    /// Remove a joiner that left
    pub fn unregister(&self, peer_id: &str) -> Option<SessionEntry> {
        let entry = self.entries.write().remove(peer_id);
        if entry.is_some() {
            info!(peer_id, "Unregistered joiner");
        }
        entry
    }

    /// Remove a joiner that broke the protocol
    pub fn invalidate(&self, peer_id: &str) -> Option<SessionEntry> {
        let entry = self.entries.write().remove(peer_id);
        if entry.is_some() {
            warn!(peer_id, "Invalidated joiner");
        }
        entry
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.read().contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn signaler(&self, peer_id: &str) -> Option<Arc<dyn Signaler>> {
        self.entries
            .read()
            .get(peer_id)
            .map(|entry| Arc::clone(&entry.signaler))
    }

    pub fn link(&self, peer_id: &str) -> Option<Arc<dyn PeerLink>> {
        self.entries.read().get(peer_id).and_then(|entry| entry.link.clone())
    }

    /// Open channels of initialized joiners
    pub fn get_open_channels(&self) -> Vec<(String, ChannelHandle)> {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.initialized)
            .filter_map(|entry| {
                entry
                    .open_channel()
                    .map(|channel| (entry.peer_id.clone(), Arc::clone(channel)))
            })
            .collect()
    }

    /// The joiner's channel if open; `ignore_init` skips the initialized check
    pub fn get_open_channel_by_id(&self, peer_id: &str, ignore_init: bool) -> Option<ChannelHandle> {
        let entries = self.entries.read();
        let entry = entries.get(peer_id)?;
        if !ignore_init && !entry.initialized {
            return None;
        }
        entry.open_channel().cloned()
    }

    /// The joiner's channel in any state
    pub fn get_any_channel_by_id(&self, peer_id: &str) -> Option<ChannelHandle> {
        self.entries
            .read()
            .get(peer_id)
            .and_then(|entry| entry.channel.clone())
    }

    /// Every attached channel regardless of state
    pub fn get_all_channels(&self) -> Vec<ChannelHandle> {
        self.entries
            .read()
            .values()
            .filter_map(|entry| entry.channel.clone())
            .collect()
    }

    /// Bytes queued on each attached channel
    pub async fn get_buffered_amounts(&self) -> Vec<(String, usize)> {
        let channels: Vec<(String, ChannelHandle)> = self
            .entries
            .read()
            .values()
            .filter_map(|entry| {
                entry
                    .channel
                    .as_ref()
                    .map(|channel| (entry.peer_id.clone(), Arc::clone(channel)))
            })
            .collect();

        let mut amounts = Vec::with_capacity(channels.len());
        for (peer_id, channel) in channels {
            amounts.push((peer_id, channel.buffered_amount().await));
        }
        amounts
    }

    /// Joiners whose channel is open
    pub fn get_num_active(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.open_channel().is_some())
            .count()
    }

    /// Match a pong against the joiner's outstanding ping
    ///
    /// Returns the round trip in milliseconds.
    pub fn pong(&self, peer_id: &str, token: u64) -> Option<u64> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(peer_id)?;
        let millis = entry.ping.pong(token);
        if millis.is_none() {
            debug!(peer_id, token, "Ignoring pong for a ping that is not in flight");
        }
        millis
    }

    /// Start a ping to every joiner with an open channel
    pub fn start_new_ping_wave(&self) -> Vec<PingRequest> {
        let mut entries = self.entries.write();
        entries
            .values_mut()
            .filter_map(|entry| {
                let channel = Arc::clone(entry.open_channel()?);
                let token = self.ping_tokens.fetch_add(1, Ordering::Relaxed);
                entry.ping.record_ping(token);
                Some(PingRequest {
                    peer_id: entry.peer_id.clone(),
                    channel,
                    token,
                    last_ping: entry.ping.average(),
                })
            })
            .collect()
    }
}
