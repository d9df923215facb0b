//! Burst framing: splitting encoded payloads into fragments and back

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::{Error, Result};

/// Payload bytes per fragment
pub const FRAGMENT_SIZE: usize = 2400;

/// Ceiling on `fragments * FRAGMENT_SIZE` for one message
pub const MAX_MESSAGE_BYTES: usize = 20_000_000;

/// Largest fragment count a message may declare
pub const MAX_FRAGMENTS: usize = MAX_MESSAGE_BYTES / FRAGMENT_SIZE;

/// Default age after which an incomplete burst is dropped
pub const DEFAULT_GC_TIMEOUT: Duration = Duration::from_secs(30);

/// One piece of a burst
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: usize,
    pub full_length: usize,
    pub payload: Vec<u8>,
}

impl Fragment {
    /// Build a fragment from wire fields, restoring the compact micro-burst form
    ///
    /// A burst with neither `index` nor `fullLength` is a whole message in
    /// one fragment. Supplying only one of the two is malformed.
    pub fn from_wire(
        index: Option<usize>,
        full_length: Option<usize>,
        payload: Vec<u8>,
    ) -> Result<Self> {
        let (index, full_length) = match (index, full_length) {
            (None, None) => (0, 1),
            (Some(index), Some(full_length)) => (index, full_length),
            _ => {
                return Err(Error::MalformedBurst(
                    "burst carries only one of index and fullLength".to_string(),
                ))
            }
        };

        if full_length == 0 {
            return Err(Error::MalformedBurst("fullLength cannot be zero".to_string()));
        }
        if index >= full_length {
            return Err(Error::MalformedBurst(format!(
                "fragment index {} out of range for fullLength {}",
                index, full_length
            )));
        }
        if full_length > MAX_FRAGMENTS {
            return Err(too_large(full_length));
        }

        Ok(Self {
            index,
            full_length,
            payload,
        })
    }

    /// Whether this fragment can be sent in the compact form
    pub fn is_whole(&self) -> bool {
        self.full_length == 1
    }

    /// Wire fields `(index, fullLength)`, omitted for whole messages
    pub fn wire_position(&self) -> (Option<usize>, Option<usize>) {
        if self.is_whole() {
            (None, None)
        } else {
            (Some(self.index), Some(self.full_length))
        }
    }
}

fn too_large(fragments: usize) -> Error {
    Error::MessageTooLarge {
        fragments,
        fragment_size: FRAGMENT_SIZE,
        limit: MAX_MESSAGE_BYTES,
    }
}

/// Split an encoded payload into ordered fragments
///
/// An empty payload still yields one empty fragment. Fails with
/// [`Error::MessageTooLarge`] before producing anything when the payload
/// needs more than [`MAX_FRAGMENTS`] fragments.
pub fn split(payload: &[u8]) -> Result<Vec<Fragment>> {
    let count = payload.len().div_ceil(FRAGMENT_SIZE).max(1);
    if count * FRAGMENT_SIZE > MAX_MESSAGE_BYTES {
        return Err(too_large(count));
    }

    if payload.is_empty() {
        return Ok(vec![Fragment {
            index: 0,
            full_length: 1,
            payload: Vec::new(),
        }]);
    }

    Ok(payload
        .chunks(FRAGMENT_SIZE)
        .enumerate()
        .map(|(index, chunk)| Fragment {
            index,
            full_length: count,
            payload: chunk.to_vec(),
        })
        .collect())
}

#[derive(Debug)]
struct PartialBurst {
    started: Instant,
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
}

/// Collects fragments per burst ID until a message is complete
///
/// One reassembler serves one channel, so IDs only need to be unique per
/// channel.
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<u64, PartialBurst>,
    timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_GC_TIMEOUT)
    }
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            partials: HashMap::new(),
            timeout,
        }
    }

    /// Add a fragment; returns the full payload once the last piece arrives
    ///
    /// Duplicates are ignored. A fragment whose `full_length` disagrees with
    /// earlier ones discards the whole burst.
    pub fn push(&mut self, id: u64, fragment: Fragment) -> Result<Option<Vec<u8>>> {
        let Fragment {
            index,
            full_length,
            payload,
        } = fragment;

        if full_length == 1 {
            self.partials.remove(&id);
            return Ok(Some(payload));
        }

        let partial = self.partials.entry(id).or_insert_with(|| PartialBurst {
            started: Instant::now(),
            parts: vec![None; full_length],
            received: 0,
        });

        if partial.parts.len() != full_length {
            let expected = partial.parts.len();
            self.partials.remove(&id);
            return Err(Error::MalformedBurst(format!(
                "burst {} changed fullLength from {} to {}",
                id, expected, full_length
            )));
        }

        let slot = &mut partial.parts[index];
        if slot.is_none() {
            *slot = Some(payload);
            partial.received += 1;
        } else {
            debug!(id, index, "Ignoring duplicate burst fragment");
        }

        if partial.received < full_length {
            return Ok(None);
        }

        let done = self.partials.remove(&id).map(|partial| {
            partial
                .parts
                .into_iter()
                .flatten()
                .flatten()
                .collect::<Vec<u8>>()
        });
        Ok(done)
    }

    /// Drop bursts older than the timeout, returning their IDs
    pub fn gc(&mut self) -> Vec<u64> {
        let timeout = self.timeout;
        let mut dropped = Vec::new();
        self.partials.retain(|id, partial| {
            let expired = partial.started.elapsed() > timeout;
            if expired {
                dropped.push(*id);
            }
            !expired
        });
        dropped
    }

    /// Bursts still waiting for fragments
    pub fn pending(&self) -> usize {
        self.partials.len()
    }
}
