//! Server configuration: CLI flags plus an optional TOML file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::info;

use foliochat_responder::openai::DEFAULT_BASE_URL;

#[derive(Debug, Parser)]
#[command(
    name = "foliochat-server",
    version,
    about = "Streams retrieval-grounded portfolio answers over WebSocket"
)]
pub struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "FOLIOCHAT_BIND", default_value = "127.0.0.1:4000")]
    pub bind: SocketAddr,

    /// Data directory (database, logs, config). Defaults to ~/.foliochat
    #[arg(long, env = "FOLIOCHAT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// TOML config file. Defaults to <data_dir>/config.toml
    #[arg(long, env = "FOLIOCHAT_CONFIG")]
    pub config: Option<PathBuf>,

    /// API key for the OpenAI-compatible provider. Without one, answers come from the offline echo generator.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub openai_base_url: String,

    #[arg(long, env = "FOLIOCHAT_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,

    /// JSON file of portfolio documents to retrieve from
    #[arg(long, env = "FOLIOCHAT_CORPUS")]
    pub corpus: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Stream chunks (`ai_response_chunk` + `ai_response_complete`) instead of one `ai_response`
    pub stream_responses: bool,
    pub responder_timeout_secs: u64,
    pub retrieval_k: usize,
    /// Prior messages handed to the responder
    pub history_turns: usize,
    pub max_message_chars: usize,
    /// Messages that may wait behind the in-flight turn
    pub max_queued_turns: usize,
    pub daily_point_limit: u32,
    pub on_topic_cost: u32,
    pub off_topic_cost: u32,
    pub greeting: String,
    pub system_prompt: String,
    pub quotes: Vec<String>,
    pub safety_patterns: Vec<String>,
    pub safety_message: String,
    pub rate_limited_message: String,
    pub rate_limit_exempt: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_responses: true,
            responder_timeout_secs: 25,
            retrieval_k: 5,
            history_turns: 10,
            max_message_chars: 2000,
            max_queued_turns: 2,
            daily_point_limit: 100,
            on_topic_cost: 1,
            off_topic_cost: 10,
            greeting: "Hi! Ask me anything about the projects and work in this portfolio."
                .to_string(),
            system_prompt: "You are the assistant on a personal portfolio site. Answer questions \
                about the owner's projects, work history and skills using only the portfolio \
                content provided with each message. If the content does not cover the question, \
                say so briefly and suggest something the visitor could ask instead. Keep answers \
                short and conversational."
                .to_string(),
            quotes: vec![
                "The city was quiet. Too quiet for a Tuesday.".to_string(),
                "Every case starts with a question. Yours is next.".to_string(),
                "She walked in with a portfolio and a problem.".to_string(),
            ],
            safety_patterns: vec![
                r"ignore (all |any )?(previous|prior) instructions".to_string(),
                r"system prompt".to_string(),
                r"\bjailbreak\b".to_string(),
            ],
            safety_message: "I'm here to talk about the work in this portfolio. \
                Ask me about a project or a past role."
                .to_string(),
            rate_limited_message: "We've covered a lot today! Come back tomorrow if you have \
                more questions about the work here."
                .to_string(),
            rate_limit_exempt: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(
                component = "config",
                event = "config.defaults",
                path = %path.display(),
                "No config file, using defaults"
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        info!(
            component = "config",
            event = "config.loaded",
            path = %path.display(),
            stream_responses = config.stream_responses,
            max_queued_turns = config.max_queued_turns,
            "Loaded config file"
        );
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        if config.max_queued_turns == 0 {
            anyhow::bail!("max_queued_turns must be at least 1");
        }
        Ok(config)
    }

    pub fn responder_timeout(&self) -> Duration {
        Duration::from_secs(self.responder_timeout_secs)
    }
}
