//! Payload codecs and the worker pool that runs them

pub mod pool;

pub use pool::{CodecPool, Role, SlotState};

use crate::channels::Envelope;
use crate::Result;

/// Two-way translation between envelopes and data channel payloads
///
/// Implementations run on blocking worker threads and must not touch the
/// async runtime.
pub trait WireCodec: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// JSON wire format (UTF-8 bytes of the flattened envelope object)
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&envelope.to_value()?)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        Envelope::from_value(serde_json::from_slice(bytes)?)
    }
}
