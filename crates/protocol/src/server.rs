//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Idle-state placeholder text shown before the first turn
    ConversationQuote {
        quote: String,
    },

    // Turn lifecycle
    MessageReceived {
        message: ChatMessage,
    },
    AiResponse {
        message: ChatMessage,
    },
    AiResponseChunk {
        content: String,
        /// Monotonic position within the current answer. Older servers omit it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u64>,
    },
    AiResponseComplete,

    // Liveness
    HeartbeatAck {
        timestamp: String,
    },

    // Errors
    Error {
        error: String,
        /// Set when the error answers a `user_message` that was refused
        /// instead of acknowledged. Such a message never gets an answer.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        rejected: bool,
    },
}

impl ServerMessage {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            rejected: false,
        }
    }

    /// Refusal of a `user_message`, sent in place of `message_received`.
    pub fn rejected(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            rejected: true,
        }
    }

    /// Frames that end a turn on the client
    pub fn is_turn_terminal(&self) -> bool {
        matches!(
            self,
            ServerMessage::AiResponse { .. }
                | ServerMessage::AiResponseComplete
                | ServerMessage::Error {
                    rejected: false,
                    ..
                }
        )
    }
}
