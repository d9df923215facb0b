//! Per-joiner session state

pub mod registry;

pub use registry::{PingRequest, SessionEntry, SessionRegistry, UNKNOWN_USERNAME};
