//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::ProtocolError;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// New turn input
    UserMessage {
        content: String,
        #[serde(default)]
        is_mobile: bool,
    },

    /// Liveness ping
    Heartbeat,
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
