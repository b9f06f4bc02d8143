//! OpenAI-compatible chat completions generator.
//!
//! Works against any endpoint speaking the `/chat/completions` streaming
//! protocol, including Gemini's OpenAI-compatible surface.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::{GenerationPrompt, Generator, ResponderError};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn convert_err(err: reqwest::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Interrupted, err.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct MessageRequest {
    role: String,
    content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<MessageRequest>,
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: CompletionDelta,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ResponderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn messages(prompt: &GenerationPrompt) -> Vec<MessageRequest> {
        let mut messages = Vec::with_capacity(prompt.history.len() + 2);
        if !prompt.system.is_empty() {
            messages.push(MessageRequest {
                role: "system".to_string(),
                content: prompt.system.clone(),
            });
        }
        messages.extend(prompt.history.iter().map(|entry| MessageRequest {
            role: entry.role.as_str().to_string(),
            content: entry.content.clone(),
        }));
        messages.push(MessageRequest {
            role: "user".to_string(),
            content: prompt.user.clone(),
        });
        messages
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: GenerationPrompt,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, ResponderError> {
        let req = CompletionRequest {
            model: self.model.clone(),
            messages: Self::messages(&prompt),
            stream: true,
        };

        let res = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = res.status();
        if status.as_u16() == 429 {
            let body = res.text().await.unwrap_or_default();
            return Err(ResponderError::RateLimited(body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(
                component = "openai",
                event = "openai.request.failed",
                status = status.as_u16(),
                "Completion request failed"
            );
            return Err(ResponderError::Provider(format!("{status}: {body}")));
        }

        let stream = res.bytes_stream().map_err(convert_err);
        let mut lines = StreamReader::new(stream).lines();
        let mut answer = String::new();
        let mut receiver_open = true;

        while let Some(line) = lines.next_line().await? {
            // `event:` fields and `:` keep-alive comments carry no delta.
            let Some(payload) = line.trim().strip_prefix("data:").map(str::trim) else {
                continue;
            };
            if payload.is_empty() {
                continue;
            }
            if payload == "[DONE]" {
                break;
            }

            let chunk: CompletionChunk = serde_json::from_str(payload)
                .map_err(|e| ResponderError::MalformedOutput(e.to_string()))?;
            let Some(text) = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
            else {
                continue;
            };
            if text.is_empty() {
                continue;
            }

            answer.push_str(&text);
            if receiver_open && chunk_tx.send(text).await.is_err() {
                debug!(
                    component = "openai",
                    event = "openai.stream.receiver_closed",
                    "Chunk receiver dropped, collecting remainder"
                );
                receiver_open = false;
            }
        }

        if answer.trim().is_empty() {
            return Err(ResponderError::MalformedOutput(
                "empty completion".to_string(),
            ));
        }

        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HistoryEntry;

    fn prompt() -> GenerationPrompt {
        GenerationPrompt {
            system: "You answer questions about a portfolio.".to_string(),
            history: vec![HistoryEntry::assistant("Hello!")],
            context: vec![],
            user: "What did you build?".to_string(),
        }
    }

    fn generator(url: &str) -> OpenAiGenerator {
        OpenAiGenerator::new(
            format!("{url}/v1"),
            "abc",
            "gpt-4o-mini",
            Duration::from_secs(5),
        )
        .expect("client")
    }

    #[test]
    fn messages_include_system_history_and_user() {
        let messages = OpenAiGenerator::messages(&prompt());
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "assistant", "user"]);
    }

    #[tokio::test]
    async fn streams_deltas_and_returns_full_text() {
        let body = [
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo, "}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"world"}}]}"#,
            "data: [DONE]",
        ]
        .join("\n\n");

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer abc")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let (tx, mut rx) = mpsc::channel(16);
        let answer = generator(&server.url())
            .generate(prompt(), tx)
            .await
            .expect("generate");

        mock.assert_async().await;
        assert_eq!(answer, "Hello, world");

        let mut chunks = vec![];
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["Hel", "lo, ", "world"]);
    }

    #[tokio::test]
    async fn skips_event_fields_and_keep_alive_comments() {
        let body = [
            ": keep-alive",
            "event: message",
            r#"data: {"choices":[{"delta":{"content":"Built "}}]}"#,
            ": ping",
            "event: message",
            r#"data: {"choices":[{"delta":{"content":"Lumen"}}]}"#,
            "data: [DONE]",
        ]
        .join("\n\n");

        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let (tx, _rx) = mpsc::channel(16);
        let answer = generator(&server.url())
            .generate(prompt(), tx)
            .await
            .expect("generate");
        assert_eq!(answer, "Built Lumen");
    }

    #[tokio::test]
    async fn maps_429_to_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let (tx, _rx) = mpsc::channel(16);
        let result = generator(&server.url()).generate(prompt(), tx).await;
        assert!(matches!(result, Err(ResponderError::RateLimited(body)) if body == "slow down"));
    }

    #[tokio::test]
    async fn maps_server_error_to_provider() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .create_async()
            .await;

        let (tx, _rx) = mpsc::channel(16);
        let result = generator(&server.url()).generate(prompt(), tx).await;
        assert!(matches!(result, Err(ResponderError::Provider(_))));
    }

    #[tokio::test]
    async fn garbage_stream_is_malformed_output() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body("data: {not json}\n\n")
            .create_async()
            .await;

        let (tx, _rx) = mpsc::channel(16);
        let result = generator(&server.url()).generate(prompt(), tx).await;
        assert!(matches!(result, Err(ResponderError::MalformedOutput(_))));
    }
}
