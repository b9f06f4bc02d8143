//! Client side of the chat WebSocket.
//!
//! `ConnectionChannel::open` spawns a task that owns the socket. It
//! reconnects after a fixed delay whenever the connection drops, sends a
//! heartbeat on an interval, and reports everything it sees as
//! `ChannelEvent`s on the returned receiver.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use foliochat_protocol::{ClientMessage, ProtocolError, ServerMessage};

const OUTBOUND_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Chat endpoint, e.g. `ws://127.0.0.1:4000/ws/chat`
    pub url: String,
    pub visitor_id: String,
    pub conversation_id: Option<String>,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>, visitor_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            visitor_id: visitor_id.into(),
            conversation_id: None,
            reconnect_delay: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    pub fn connect_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{}{separator}visitor_id={}",
            self.url,
            urlencoding::encode(&self.visitor_id)
        );
        if let Some(conversation_id) = &self.conversation_id {
            url.push_str("&conversation_id=");
            url.push_str(&urlencoding::encode(conversation_id));
        }
        url
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected,
    Message(ServerMessage),
    /// A frame that did not decode; the connection stays up
    ProtocolError(String),
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("not connected")]
    NotConnected,
    #[error("outbound queue is full")]
    Full,
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Cloneable sending side of an open channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    outbound: mpsc::Sender<String>,
    connected: watch::Receiver<bool>,
    close: Arc<watch::Sender<bool>>,
}

impl ChannelHandle {
    pub fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let json = message.to_json()?;
        self.outbound.try_send(json).map_err(|e| match e {
            TrySendError::Full(_) => ChannelError::Full,
            TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Stop reconnecting and close the socket.
    pub fn close(&self) {
        self.close.send_replace(true);
    }
}

pub struct ConnectionChannel;

impl ConnectionChannel {
    pub fn open(config: ChannelConfig) -> (ChannelHandle, mpsc::Receiver<ChannelEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (close_tx, close_rx) = watch::channel(false);

        tokio::spawn(run_channel(
            config,
            outbound_rx,
            events_tx,
            connected_tx,
            close_rx,
        ));

        let handle = ChannelHandle {
            outbound: outbound_tx,
            connected: connected_rx,
            close: Arc::new(close_tx),
        };
        (handle, events_rx)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    Dropped,
    Closed,
}

async fn run_channel(
    config: ChannelConfig,
    mut outbound_rx: mpsc::Receiver<String>,
    events_tx: mpsc::Sender<ChannelEvent>,
    connected_tx: watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) {
    let url = config.connect_url();
    let mut attempt: u64 = 0;

    loop {
        if *close_rx.borrow() {
            break;
        }
        attempt += 1;

        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = close_rx.changed() => break,
        };

        match connected {
            Ok((socket, _response)) => {
                info!(
                    component = "channel",
                    event = "channel.connected",
                    attempt,
                    visitor_id = %config.visitor_id,
                );
                attempt = 0;
                connected_tx.send_replace(true);
                if events_tx.send(ChannelEvent::Connected).await.is_err() {
                    break;
                }

                let exit = pump(
                    socket,
                    &mut outbound_rx,
                    &events_tx,
                    &mut close_rx,
                    config.heartbeat_interval,
                )
                .await;

                connected_tx.send_replace(false);
                let mut dropped = 0usize;
                while outbound_rx.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    warn!(
                        component = "channel",
                        event = "channel.outbound.dropped",
                        dropped,
                        "Unsent frames discarded on disconnect"
                    );
                }
                if events_tx.send(ChannelEvent::Disconnected).await.is_err()
                    || exit == PumpExit::Closed
                {
                    break;
                }
                info!(
                    component = "channel",
                    event = "channel.disconnected",
                    retry_in_ms = config.reconnect_delay.as_millis() as u64,
                );
            }
            Err(e) => {
                warn!(
                    component = "channel",
                    event = "channel.connect.failed",
                    attempt,
                    error = %e,
                    retry_in_ms = config.reconnect_delay.as_millis() as u64,
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = close_rx.changed() => break,
        }
    }

    connected_tx.send_replace(false);
    debug!(component = "channel", event = "channel.stopped");
}

async fn pump(
    socket: Socket,
    outbound_rx: &mut mpsc::Receiver<String>,
    events_tx: &mpsc::Sender<ChannelEvent>,
    close_rx: &mut watch::Receiver<bool>,
    heartbeat_interval: Duration,
) -> PumpExit {
    let (mut sink, mut source) = socket.split();
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let event = match ServerMessage::from_json(text.as_str()) {
                        Ok(message) => ChannelEvent::Message(message),
                        Err(e) => {
                            warn!(
                                component = "channel",
                                event = "channel.frame.invalid",
                                error = %e,
                            );
                            ChannelEvent::ProtocolError(e.to_string())
                        }
                    };
                    if events_tx.send(event).await.is_err() {
                        let _ = sink.close().await;
                        return PumpExit::Closed;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        component = "channel",
                        event = "channel.closed_by_server",
                        reason = frame.as_ref().map(|f| f.reason.as_str()).unwrap_or(""),
                    );
                    return PumpExit::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(
                        component = "channel",
                        event = "channel.read.failed",
                        error = %e,
                    );
                    return PumpExit::Dropped;
                }
                None => return PumpExit::Dropped,
            },

            Some(json) = outbound_rx.recv() => {
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!(
                        component = "channel",
                        event = "channel.write.failed",
                        error = %e,
                    );
                    return PumpExit::Dropped;
                }
            }

            _ = heartbeat.tick() => {
                let json = match ClientMessage::Heartbeat.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(component = "channel", event = "channel.heartbeat.encode_failed", error = %e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!(
                        component = "channel",
                        event = "channel.heartbeat.failed",
                        error = %e,
                    );
                    return PumpExit::Dropped;
                }
            }

            _ = close_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return PumpExit::Closed;
            }
        }
    }
}
