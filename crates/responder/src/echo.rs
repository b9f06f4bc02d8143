//! Offline generator used when no provider key is configured.
//!
//! Summarises the retrieved context deterministically and streams it word
//! by word, which is enough to exercise the whole delivery pipeline.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{GenerationPrompt, Generator, ResponderError};

#[derive(Debug, Default)]
pub struct EchoGenerator;

impl EchoGenerator {
    fn compose(prompt: &GenerationPrompt) -> String {
        if prompt.context.is_empty() {
            return "I don't have anything in the portfolio about that yet. \
                    Try asking about a project or a past role."
                .to_string();
        }
        let mut answer = String::from("Here's what the portfolio says:");
        for chunk in &prompt.context {
            answer.push_str(&format!(" {}: {}", chunk.title, chunk.content.trim()));
        }
        answer
    }
}

#[async_trait]
impl Generator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(
        &self,
        prompt: GenerationPrompt,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, ResponderError> {
        let answer = Self::compose(&prompt);
        for word in answer.split_inclusive(' ') {
            if chunk_tx.send(word.to_string()).await.is_err() {
                break;
            }
        }
        Ok(answer)
    }
}
