//! FolioChat Server
//!
//! Answers portfolio visitors' questions with retrieval-grounded,
//! streamed responses over one WebSocket per page session.

mod config;
mod content_safety;
mod logging;
mod migration_runner;
mod paths;
mod persistence;
mod quotes;
mod rate_limit;
mod session;
mod session_actor;
mod session_command;
mod state;
mod transcript;
mod transition;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use foliochat_responder::{
    CorpusRetriever, EchoGenerator, Generator, OpenAiGenerator, Retriever,
    RetrievalAugmentedResponder,
};

use crate::config::{ServerArgs, ServerConfig};
use crate::logging::init_logging;
use crate::migration_runner::{open_connection, run_migrations};
use crate::paths::DataDir;
use crate::persistence::{create_persistence_channel, PersistenceWriter};
use crate::state::{SessionRegistry, TurnServices};
use crate::transcript::messages_handler;
use crate::websocket::{stats_handler, ws_chat_handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    let data_dir = DataDir::resolve(args.data_dir.as_deref())?;
    data_dir.ensure_dirs()?;
    let logging = init_logging(&data_dir.log_dir())?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %data_dir.root().display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting FolioChat server"
    );

    let config_path = args.config.clone().unwrap_or_else(|| data_dir.config_path());
    let config = ServerConfig::load(&config_path)?;

    let db_path = data_dir.db_path();
    {
        let mut conn = open_connection(&db_path)?;
        run_migrations(&mut conn)?;
    }

    let (persist_tx, persist_rx) = create_persistence_channel();
    let writer = tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

    let responder = Arc::new(build_responder(&args, &config)?);
    let services = Arc::new(TurnServices::new(config, responder, persist_tx));
    let registry = Arc::new(SessionRegistry::new(services, db_path));

    let app = router(registry.clone());

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %args.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    drop(registry);
    if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
        warn!(
            component = "server",
            event = "server.shutdown.persist_pending",
            "Persistence writer still busy at shutdown"
        );
    }
    info!(component = "server", event = "server.stopped", "Server stopped");

    Ok(())
}

fn build_responder(
    args: &ServerArgs,
    config: &ServerConfig,
) -> anyhow::Result<RetrievalAugmentedResponder> {
    let retriever: Arc<dyn Retriever> = match &args.corpus {
        Some(path) => Arc::new(CorpusRetriever::from_path(path)?),
        None => {
            warn!(
                component = "server",
                event = "server.corpus.missing",
                "No --corpus given, answers will have no portfolio context"
            );
            Arc::new(CorpusRetriever::from_documents(Vec::new()))
        }
    };

    let generator: Arc<dyn Generator> = match args.openai_api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Arc::new(OpenAiGenerator::new(
            args.openai_base_url.clone(),
            key,
            args.model.clone(),
            Duration::from_secs(10),
        )?),
        _ => {
            warn!(
                component = "server",
                event = "server.generator.offline",
                "No API key configured, using the offline echo generator"
            );
            Arc::new(EchoGenerator)
        }
    };

    info!(
        component = "server",
        event = "server.responder.ready",
        generator = generator.name(),
        retrieval_k = config.retrieval_k,
    );

    Ok(RetrievalAugmentedResponder::new(
        retriever,
        generator,
        config.retrieval_k,
        config.system_prompt.clone(),
    ))
}

pub(crate) fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/ws/chat", get(ws_chat_handler))
        .route("/ws/stats", get(stats_handler))
        .route("/conversations/{conversation_id}/messages", get(messages_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(registry)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(
            component = "server",
            event = "server.shutdown.signal",
            "Shutdown signal received"
        );
    }
}
