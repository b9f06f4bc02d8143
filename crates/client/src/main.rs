//! FolioChat terminal client
//!
//! Reads questions from stdin and renders answers the way the web chat
//! surface does: the answer types itself out, and dissolves when the next
//! question goes out.

use std::time::Duration;

use clap::Parser;
use console::{style, Term};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use foliochat_client::{
    connect, ChannelConfig, ClientConfig, ClientHandle, ClientParts, SurfaceCommand,
    SurfaceEvent, ViewState,
};

const WORD_DELAY: Duration = Duration::from_millis(35);
const DISSOLVE_ANIMATION: Duration = Duration::from_millis(300);

#[derive(Debug, Parser)]
#[command(name = "foliochat", version, about = "Chat with a FolioChat portfolio from the terminal")]
struct ClientArgs {
    /// Chat WebSocket endpoint
    #[arg(long, env = "FOLIOCHAT_URL", default_value = "ws://127.0.0.1:4000/ws/chat")]
    url: String,

    /// Stable visitor identity. A random one is generated when omitted.
    #[arg(long, env = "FOLIOCHAT_VISITOR_ID")]
    visitor_id: Option<String>,

    /// Resume a specific conversation
    #[arg(long)]
    conversation_id: Option<String>,

    /// Ask for shorter, mobile-sized answers
    #[arg(long)]
    mobile: bool,

    #[arg(long, value_name = "MS")]
    display_floor_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    dissolve_delay_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    answer_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    dissolve_timeout_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    cooldown_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    reconnect_delay_ms: Option<u64>,

    #[arg(long)]
    max_words: Option<usize>,
}

impl ClientArgs {
    fn client_config(&self) -> ClientConfig {
        let visitor_id = self
            .visitor_id
            .clone()
            .unwrap_or_else(foliochat_protocol::new_id);
        let mut channel = ChannelConfig::new(self.url.clone(), visitor_id);
        channel.conversation_id = self.conversation_id.clone();
        if let Some(ms) = self.reconnect_delay_ms {
            channel.reconnect_delay = Duration::from_millis(ms);
        }

        let mut config = ClientConfig::new(channel);
        config.is_mobile = self.mobile;
        let timing = &mut config.coordinator;
        if let Some(ms) = self.display_floor_ms {
            timing.display_floor = Duration::from_millis(ms);
        }
        if let Some(ms) = self.dissolve_delay_ms {
            timing.dissolve_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.answer_timeout_ms {
            timing.answer_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.dissolve_timeout_ms {
            timing.dissolve_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.cooldown_ms {
            config.gate.cooldown = Duration::from_millis(ms);
        }
        if let Some(max) = self.max_words {
            config.gate.max_words = max;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();
    init_tracing();

    let config = args.client_config();
    let term = Term::stdout();
    term.write_line(&format!(
        "{} {}",
        style("foliochat").bold(),
        style(format!("visitor {}", config.channel.visitor_id)).dim()
    ))?;

    let ClientParts {
        handle,
        view,
        surface,
        task,
    } = connect(config);

    tokio::spawn(render_surface(surface, handle.clone(), term.clone()));
    tokio::spawn(render_status(view, term.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            break;
        }
        if line.is_empty() {
            continue;
        }
        if handle.submit(line).await.is_err() {
            break;
        }
    }

    handle.close().await;
    task.await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("FOLIOCHAT_LOG_FILTER")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn render_surface(
    mut surface: mpsc::Receiver<SurfaceCommand>,
    handle: ClientHandle,
    term: Term,
) {
    while let Some(command) = surface.recv().await {
        let event = match command {
            SurfaceCommand::Emerge { turn, text } => {
                for word in text.split_inclusive(' ') {
                    let _ = term.write_str(&style(word).cyan().to_string());
                    tokio::time::sleep(WORD_DELAY).await;
                }
                let _ = term.write_line("");
                SurfaceEvent::EmergenceComplete { turn }
            }
            SurfaceCommand::Dissolve => {
                let _ = term.write_line(&style("  ~").dim().to_string());
                tokio::time::sleep(DISSOLVE_ANIMATION).await;
                SurfaceEvent::DissolveComplete
            }
        };
        if handle.surface(event).await.is_err() {
            break;
        }
    }
}

async fn render_status(mut view: watch::Receiver<ViewState>, term: Term) {
    let mut last = ViewState::default();
    loop {
        let current = view.borrow_and_update().clone();

        if current.quote != last.quote {
            if let Some(quote) = &current.quote {
                let _ = term.write_line(&style(quote).italic().dim().to_string());
            }
        }
        if current.connected != last.connected {
            let line = if current.connected {
                style("connected").green()
            } else {
                style("disconnected, retrying").red()
            };
            let _ = term.write_line(&line.to_string());
        }
        if current.notice != last.notice {
            if let Some(notice) = &current.notice {
                let _ = term.write_line(&style(notice).yellow().to_string());
            }
        }
        if current.pending != last.pending {
            if let Some(pending) = &current.pending {
                let _ = term.write_line(&style(format!("(held: {pending})")).dim().to_string());
            }
        }
        last = current;

        if view.changed().await.is_err() {
            break;
        }
    }
}
