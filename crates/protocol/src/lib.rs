//! FolioChat Protocol
//!
//! Shared types for communication between the FolioChat server and clients.
//! These types are serialized as JSON text frames over WebSocket.

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as an RFC 3339 UTC timestamp
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
