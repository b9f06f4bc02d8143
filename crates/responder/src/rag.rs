//! Retrieval-augmented responder
//!
//! Retrieves context for the visitor's question, folds it into the prompt
//! together with the conversation history and per-request hints, and hands
//! the result to the configured generator.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    ContextChunk, GenerationPrompt, Generator, HistoryEntry, ResponderError, Retriever,
};

const MOBILE_HINT: &str = "[MOBILE CONTEXT: The visitor is on a phone. Keep the answer to 2-3 short lines, or a short list of concise bullet points.]";

/// One invocation of the responder
#[derive(Debug, Clone, Default)]
pub struct ResponderRequest {
    pub message: String,
    pub history: Vec<HistoryEntry>,
    pub is_mobile: bool,
    /// Conversation-starter quote the visitor saw on arrival
    pub quote: Option<String>,
}

pub struct RetrievalAugmentedResponder {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    retrieval_k: usize,
    system_prompt: String,
}

impl RetrievalAugmentedResponder {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        retrieval_k: usize,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            retriever,
            generator,
            retrieval_k,
            system_prompt: system_prompt.into(),
        }
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    /// Produce a grounded answer. Fragments stream through `chunk_tx`; the
    /// assembled answer is returned.
    pub async fn respond(
        &self,
        request: ResponderRequest,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, ResponderError> {
        let context = self
            .retriever
            .retrieve(&request.message, self.retrieval_k)
            .await?;

        info!(
            component = "responder",
            event = "responder.context.retrieved",
            generator = self.generator.name(),
            chunks = context.len(),
            history = request.history.len(),
            "Retrieved portfolio context"
        );

        let prompt = build_prompt(&self.system_prompt, &request, context);
        debug!(
            component = "responder",
            event = "responder.prompt.built",
            prompt_chars = prompt.user.chars().count(),
        );

        self.generator.generate(prompt, chunk_tx).await
    }
}

/// Assemble the generation prompt. Retrieved context only decorates the
/// current turn; history carries the raw messages.
pub fn build_prompt(
    system: &str,
    request: &ResponderRequest,
    context: Vec<ContextChunk>,
) -> GenerationPrompt {
    let mut user = if context.is_empty() {
        request.message.clone()
    } else {
        let mut block = String::from("Relevant portfolio content:\n");
        for chunk in &context {
            block.push_str(&format!("- {}: {}\n", chunk.title, chunk.content));
        }
        format!("{block}\nUser message: {}", request.message)
    };

    if request.is_mobile {
        user.push_str("\n\n");
        user.push_str(MOBILE_HINT);
    }

    if let Some(quote) = request.quote.as_deref().filter(|q| !q.trim().is_empty()) {
        user.push_str(&format!(
            "\n\nNote: the visitor saw this conversation starter quote when they arrived: \"{quote}\". \
             If they ask about \"the quote\", this is the one they mean. Otherwise do not bring it up."
        ));
    }

    GenerationPrompt {
        system: system.to_string(),
        history: request.history.clone(),
        context,
        user,
    }
}
