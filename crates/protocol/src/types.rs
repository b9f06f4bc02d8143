//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Ai,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderType::User => "user",
            SenderType::Ai => "ai",
        }
    }
}

/// A message in the conversation, as carried by `message_received` and `ai_response`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    pub content: String,
    #[serde(default = "default_sender")]
    pub sender_type: SenderType,
    pub timestamp: String,
}

fn default_sender() -> SenderType {
    SenderType::Ai
}

impl ChatMessage {
    pub fn new(sender_type: SenderType, content: impl Into<String>) -> Self {
        Self {
            id: crate::new_id(),
            content: content.into(),
            sender_type,
            timestamp: crate::timestamp_now(),
        }
    }
}

/// Lifecycle of one user-message-to-answer exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    InFlight,
    Delivered,
    Failed,
}

impl TurnStatus {
    /// Delivered and failed turns no longer block the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStatus::Delivered | TurnStatus::Failed)
    }
}

/// Why a frame could not be decoded
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message content required")]
    EmptyContent,

    #[error("message exceeds maximum length of {max} characters")]
    TooLong { max: usize },
}

/// Count whitespace-separated words
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Trim and bound user-supplied content.
pub fn validate_user_content(content: &str, max_chars: usize) -> Result<&str, ProtocolError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyContent);
    }
    if trimmed.chars().count() > max_chars {
        return Err(ProtocolError::TooLong { max: max_chars });
    }
    Ok(trimmed)
}
