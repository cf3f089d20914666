//! Convoy Protocol
//!
//! Shared types exchanged between Convoy, the task host that drives the
//! agentic session, the UI panels attached to it, and peer instances on the
//! broker. Everything is serialized as JSON.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod host;
pub mod peer;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use host::{HostMessage, WebviewMessage};
pub use peer::{BroadcastAction, EnvelopeType, PeerEnvelope};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch, the timestamp unit used on every wire.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
