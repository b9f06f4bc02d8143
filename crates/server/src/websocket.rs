//! WebSocket handling

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use foliochat_protocol::{
    timestamp_now, validate_user_content, ChatMessage, ClientMessage, SenderType, ServerMessage,
};

use crate::config::ServerConfig;
use crate::persistence::PersistCommand;
use crate::session::VisitorSession;
use crate::session_actor::{SessionActorHandle, SubmitError};
use crate::state::SessionRegistry;
use crate::transition::TurnState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Frames queued for the socket writer task
pub(crate) enum OutboundMessage {
    /// Serialized as a JSON text frame
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// Query parameters for `/ws/chat`
#[derive(Debug, Deserialize, Default)]
pub struct ChatQuery {
    #[serde(default)]
    pub visitor_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

fn normalize_non_empty(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// WebSocket upgrade handler for `/ws/chat`
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ChatQuery>,
    State(registry): State<Arc<SessionRegistry>>,
) -> Response {
    let Some(visitor_id) = normalize_non_empty(query.visitor_id) else {
        warn!(
            component = "websocket",
            event = "ws.upgrade.rejected",
            reason = "missing_visitor_id",
            "Rejected upgrade without visitor_id"
        );
        return (StatusCode::BAD_REQUEST, "visitor_id query parameter required").into_response();
    };
    let conversation_id = normalize_non_empty(query.conversation_id);

    ws.on_upgrade(move |socket| handle_socket(socket, registry, visitor_id, conversation_id))
}

/// `GET /ws/stats`
pub async fn stats_handler(State(registry): State<Arc<SessionRegistry>>) -> impl IntoResponse {
    Json(registry.stats())
}

/// One page session: open the conversation, run the actor, pump frames until close.
async fn handle_socket(
    socket: WebSocket,
    registry: Arc<SessionRegistry>,
    visitor_id: String,
    requested_conversation: Option<String>,
) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    registry.connection_opened();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        visitor_id = %visitor_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(100);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let services = registry.services().clone();
    let opened = match registry
        .open_conversation(&visitor_id, requested_conversation.as_deref())
        .await
    {
        Ok(opened) => opened,
        Err(e) => {
            error!(
                component = "websocket",
                event = "ws.conversation.open_failed",
                connection_id = conn_id,
                visitor_id = %visitor_id,
                error = %e,
                "Failed to open conversation"
            );
            send_json(
                &outbound_tx,
                ServerMessage::error("Could not start a conversation. Please reconnect."),
            )
            .await;
            drop(outbound_tx);
            let _ = send_task.await;
            registry.connection_closed();
            return;
        }
    };
    let conversation_id = opened.conversation_id.clone();

    let quote = services.quotes.pick();
    if let Some(quote) = &quote {
        send_json(
            &outbound_tx,
            ServerMessage::ConversationQuote {
                quote: quote.clone(),
            },
        )
        .await;
    }

    let session = VisitorSession::new(
        conn_id,
        visitor_id.clone(),
        quote,
        TurnState::new(
            opened.conversation_id,
            opened.history,
            services.config.history_turns,
        ),
    );
    let actor = SessionActorHandle::spawn(
        session,
        services.clone(),
        outbound_tx.clone(),
        services.config.max_queued_turns,
    );
    registry.register(actor.clone());

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg = match ClientMessage::from_json(msg.as_str()) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(msg.as_str(), 240),
                    "Failed to parse client message"
                );
                send_json(&outbound_tx, ServerMessage::error(format!("Invalid message: {e}")))
                    .await;
                continue;
            }
        };

        handle_client_message(client_msg, &outbound_tx, &actor, &services.config, conn_id).await;
    }

    registry.remove_session(&visitor_id, conn_id);
    actor.shutdown();
    if registry
        .persist()
        .send(PersistCommand::ConversationDisconnect {
            id: conversation_id.clone(),
            at: timestamp_now(),
        })
        .await
        .is_err()
    {
        warn!(
            component = "websocket",
            event = "ws.persist_closed",
            connection_id = conn_id,
            "Persistence channel closed"
        );
    }
    registry.connection_closed();

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        visitor_id = %visitor_id,
        conversation_id = %conversation_id,
        "WebSocket connection closed"
    );
    send_task.abort();
    registry
        .release_conversation(&visitor_id, &conversation_id)
        .await;
}

/// Dispatch one decoded client frame.
async fn handle_client_message(
    msg: ClientMessage,
    client_tx: &mpsc::Sender<OutboundMessage>,
    actor: &SessionActorHandle,
    config: &ServerConfig,
    conn_id: u64,
) {
    match msg {
        ClientMessage::Heartbeat => {
            send_json(
                client_tx,
                ServerMessage::HeartbeatAck {
                    timestamp: timestamp_now(),
                },
            )
            .await;
        }

        ClientMessage::UserMessage { content, is_mobile } => {
            let text = match validate_user_content(&content, config.max_message_chars) {
                Ok(text) => text.to_string(),
                Err(e) => {
                    debug!(
                        component = "websocket",
                        event = "ws.message.invalid",
                        connection_id = conn_id,
                        error = %e,
                    );
                    send_json(client_tx, ServerMessage::rejected(capitalize(&e.to_string())))
                        .await;
                    return;
                }
            };

            match actor.try_reserve() {
                Ok(slot) => {
                    let message = ChatMessage::new(SenderType::User, text);
                    send_json(
                        client_tx,
                        ServerMessage::MessageReceived {
                            message: message.clone(),
                        },
                    )
                    .await;
                    slot.submit(message, is_mobile);
                }
                Err(SubmitError::Busy) => {
                    info!(
                        component = "websocket",
                        event = "ws.message.queue_full",
                        connection_id = conn_id,
                        "Turn queue full, message rejected"
                    );
                    send_json(
                        client_tx,
                        ServerMessage::rejected(
                            "Still answering your previous messages. Please wait a moment.",
                        ),
                    )
                    .await;
                }
                Err(SubmitError::Closed) => {
                    send_json(
                        client_tx,
                        ServerMessage::rejected("Conversation closed. Please reconnect."),
                    )
                    .await;
                }
            }
        }
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Queue a frame; a closed socket is not an error here.
async fn send_json(tx: &mpsc::Sender<OutboundMessage>, msg: ServerMessage) {
    let _ = tx.send(OutboundMessage::Json(msg)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::router;
    use crate::state::test_support::{harness, Harness, Script};

    async fn serve(h: &Harness) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(h.registry.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{addr}")
    }

    type Socket =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn recv(socket: &mut Socket) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
                .await
                .expect("frame in time")
                .expect("socket open")
                .expect("frame ok");
            if let WsMessage::Text(text) = frame {
                return ServerMessage::from_json(text.as_str()).expect("server frame");
            }
        }
    }

    async fn send(socket: &mut Socket, msg: &ClientMessage) {
        socket
            .send(WsMessage::Text(msg.to_json().unwrap().into()))
            .await
            .unwrap();
    }

    fn quiet_config() -> ServerConfig {
        ServerConfig {
            quotes: vec!["The city was quiet.".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_visitor_id_is_rejected_before_upgrade() {
        let h = harness(quiet_config(), vec![]);
        let base = serve(&h).await;
        let err = tokio_tungstenite::connect_async(format!("{base}/ws/chat"))
            .await
            .expect_err("upgrade must fail");
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), StatusCode::BAD_REQUEST)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_turn_over_the_socket() {
        let h = harness(
            quiet_config(),
            vec![Script::Stream(vec!["Hel", "lo, ", "world"])],
        );
        let base = serve(&h).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("{base}/ws/chat?visitor_id=v1"))
            .await
            .unwrap();

        assert_eq!(
            recv(&mut socket).await,
            ServerMessage::ConversationQuote {
                quote: "The city was quiet.".to_string()
            }
        );

        send(&mut socket, &ClientMessage::Heartbeat).await;
        assert!(matches!(
            recv(&mut socket).await,
            ServerMessage::HeartbeatAck { .. }
        ));

        send(
            &mut socket,
            &ClientMessage::UserMessage {
                content: "What did you build at your last job?".to_string(),
                is_mobile: false,
            },
        )
        .await;

        assert!(matches!(
            recv(&mut socket).await,
            ServerMessage::MessageReceived { .. }
        ));
        let mut answer = String::new();
        loop {
            match recv(&mut socket).await {
                ServerMessage::AiResponseChunk { content, .. } => answer.push_str(&content),
                ServerMessage::AiResponseComplete => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(answer, "Hello, world");
    }

    fn user_message(content: &str) -> ClientMessage {
        ClientMessage::UserMessage {
            content: content.to_string(),
            is_mobile: false,
        }
    }

    #[tokio::test]
    async fn queued_message_is_acknowledged_while_the_first_is_answered() {
        let config = ServerConfig {
            responder_timeout_secs: 20,
            max_queued_turns: 1,
            ..quiet_config()
        };
        let h = harness(config, vec![Script::Hang, Script::Hang]);
        let base = serve(&h).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("{base}/ws/chat?visitor_id=v1"))
            .await
            .unwrap();
        recv(&mut socket).await;

        send(&mut socket, &user_message("first")).await;
        match recv(&mut socket).await {
            ServerMessage::MessageReceived { message } => assert_eq!(message.content, "first"),
            other => panic!("unexpected frame {other:?}"),
        }
        let actor = h.registry.get_session("v1").expect("session registered");
        while !actor.snapshot().in_flight {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Acknowledged long before the first turn's 20 s timeout.
        send(&mut socket, &user_message("second")).await;
        match recv(&mut socket).await {
            ServerMessage::MessageReceived { message } => assert_eq!(message.content, "second"),
            other => panic!("unexpected frame {other:?}"),
        }

        send(&mut socket, &user_message("third")).await;
        assert!(matches!(
            recv(&mut socket).await,
            ServerMessage::Error { rejected: true, .. }
        ));
    }

    #[tokio::test]
    async fn garbage_and_invalid_messages_keep_the_channel() {
        let h = harness(quiet_config(), vec![]);
        let base = serve(&h).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("{base}/ws/chat?visitor_id=v1"))
            .await
            .unwrap();
        recv(&mut socket).await;

        socket
            .send(WsMessage::Text("{not json".to_string().into()))
            .await
            .unwrap();
        assert!(matches!(
            recv(&mut socket).await,
            ServerMessage::Error { .. }
        ));

        send(
            &mut socket,
            &ClientMessage::UserMessage {
                content: "   ".to_string(),
                is_mobile: false,
            },
        )
        .await;
        assert_eq!(
            recv(&mut socket).await,
            ServerMessage::rejected("Message content required")
        );

        send(&mut socket, &ClientMessage::Heartbeat).await;
        assert!(matches!(
            recv(&mut socket).await,
            ServerMessage::HeartbeatAck { .. }
        ));
    }

    #[tokio::test]
    async fn stats_reflect_open_sessions() {
        let h = harness(quiet_config(), vec![]);
        let base = serve(&h).await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("{base}/ws/chat?visitor_id=v1"))
            .await
            .unwrap();
        recv(&mut socket).await;
        // The ack is produced by the read loop, which only starts once the actor is registered.
        send(&mut socket, &ClientMessage::Heartbeat).await;
        recv(&mut socket).await;

        let stats = h.registry.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.active_conversations, 1);
        assert!(h.registry.get_session("v1").is_some());
    }
}
