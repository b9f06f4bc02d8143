//! FolioChat Responder
//!
//! The retrieval-augmented responder and the collaborator contracts it
//! consumes. Retrieval and generation are black boxes behind the
//! [`Retriever`] and [`Generator`] traits; every way they can fail is
//! folded into [`ResponderError`] so callers only ever see a `Result`.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod corpus;
pub mod echo;
pub mod openai;
pub mod rag;

pub use corpus::{CorpusRetriever, Document};
pub use echo::EchoGenerator;
pub use openai::OpenAiGenerator;
pub use rag::{ResponderRequest, RetrievalAugmentedResponder};

/// Errors that can occur while producing an answer
#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("Responder timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("Malformed provider output: {0}")]
    MalformedOutput(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResponderError {
    /// Human-readable cause for the `error` wire frame. Never leaks provider bodies.
    pub fn user_message(&self) -> String {
        match self {
            ResponderError::Timeout(_) => {
                "The assistant took too long to answer. Please try again.".to_string()
            }
            ResponderError::RateLimited(_) => {
                "The assistant is busy right now. Please try again in a moment.".to_string()
            }
            ResponderError::Retrieval(_) => {
                "I couldn't look up the portfolio just now. Please try again.".to_string()
            }
            ResponderError::Provider(_)
            | ResponderError::MalformedOutput(_)
            | ResponderError::Http(_)
            | ResponderError::Json(_)
            | ResponderError::Io(_) => {
                "Something went wrong while generating an answer. Please try again.".to_string()
            }
        }
    }
}

/// One ranked piece of retrieved portfolio content
#[derive(Debug, Clone, PartialEq)]
pub struct ContextChunk {
    pub title: String,
    pub content: String,
    pub score: f32,
}

/// Speaker of a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A prior message in the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Fully assembled input for a generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPrompt {
    pub system: String,
    pub history: Vec<HistoryEntry>,
    pub context: Vec<ContextChunk>,
    /// Final user turn, with retrieved context and hints already folded in
    pub user: String,
}

/// Ranked retrieval over the owner's documents
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ContextChunk>, ResponderError>;
}

/// Text generation backend.
///
/// Fragments are streamed through `chunk_tx` as they arrive; the full text is
/// returned once generation finishes. A closed `chunk_tx` is not an error.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: GenerationPrompt,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, ResponderError>;
}
