//! Client driver.
//!
//! One task owns the coordinator, the gate and the dispatcher. It selects
//! over channel events, surface completions, UI commands and the next
//! timer deadline, executes the resulting effects, and publishes a
//! `ViewState` snapshot after every step.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use foliochat_protocol::ClientMessage;

use crate::channel::{ChannelConfig, ChannelError, ChannelEvent, ChannelHandle, ConnectionChannel};
use crate::coordinator::{
    AnimationPhase, CoordinatorConfig, Effect, Input, TimerKind, TurnCoordinator, TurnId,
};
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::gate::{GateConfig, GateOutcome, RateGate};

const COMMAND_CAPACITY: usize = 64;
const SURFACE_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub channel: ChannelConfig,
    pub coordinator: CoordinatorConfig,
    pub gate: GateConfig,
    /// Forwarded with every message so answers come back shorter
    pub is_mobile: bool,
}

impl ClientConfig {
    pub fn new(channel: ChannelConfig) -> Self {
        Self {
            channel,
            coordinator: CoordinatorConfig::default(),
            gate: GateConfig::default(),
            is_mobile: false,
        }
    }
}

/// Everything a front end needs to render the chat.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewState {
    pub phase: AnimationPhase,
    pub connected: bool,
    pub quote: Option<String>,
    /// Answer currently on the surface
    pub displayed: Option<String>,
    /// Message held by the gate
    pub pending: Option<String>,
    pub notice: Option<String>,
}

/// Animation requests for the chat surface. The surface reports back
/// through `ClientHandle::surface`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceCommand {
    Emerge { turn: TurnId, text: String },
    Dissolve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// Echoes the `turn` of the `Emerge` command that finished
    EmergenceComplete { turn: TurnId },
    DissolveComplete,
    TypingStarted,
    TypingStopped,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client stopped")]
    Stopped,
}

#[derive(Debug)]
enum ClientCommand {
    Submit(String),
    Surface(SurfaceEvent),
    Close,
}

/// Cloneable handle passed to UI code.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<ClientCommand>,
}

impl ClientHandle {
    pub async fn submit(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.commands
            .send(ClientCommand::Submit(text.into()))
            .await
            .map_err(|_| ClientError::Stopped)
    }

    pub async fn surface(&self, event: SurfaceEvent) -> Result<(), ClientError> {
        self.commands
            .send(ClientCommand::Surface(event))
            .await
            .map_err(|_| ClientError::Stopped)
    }

    pub async fn close(&self) {
        let _ = self.commands.send(ClientCommand::Close).await;
    }
}

/// Where outgoing messages go. `ChannelHandle` in production.
pub trait Outbound: Send + 'static {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError>;
    fn close(&self);
}

impl Outbound for ChannelHandle {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        ChannelHandle::send(self, message)
    }

    fn close(&self) {
        ChannelHandle::close(self)
    }
}

pub struct ClientParts {
    pub handle: ClientHandle,
    pub view: watch::Receiver<ViewState>,
    pub surface: mpsc::Receiver<SurfaceCommand>,
    pub task: JoinHandle<()>,
}

/// Open the channel and start the driver.
pub fn connect(config: ClientConfig) -> ClientParts {
    let (channel, events) = ConnectionChannel::open(config.channel.clone());
    spawn_driver(channel, events, config)
}

pub fn spawn_driver<O: Outbound>(
    outbound: O,
    events: mpsc::Receiver<ChannelEvent>,
    config: ClientConfig,
) -> ClientParts {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (surface_tx, surface_rx) = mpsc::channel(SURFACE_CAPACITY);
    let (view_tx, view_rx) = watch::channel(ViewState::default());

    let driver = Driver {
        outbound,
        is_mobile: config.is_mobile,
        coordinator: TurnCoordinator::new(config.coordinator),
        gate: RateGate::new(config.gate),
        dispatcher: Dispatcher::new(),
        timers: HashMap::new(),
        view: ViewState::default(),
        view_tx,
        surface_tx,
    };
    let task = tokio::spawn(driver.run(events, command_rx));

    ClientParts {
        handle: ClientHandle {
            commands: command_tx,
        },
        view: view_rx,
        surface: surface_rx,
        task,
    }
}

struct Driver<O> {
    outbound: O,
    is_mobile: bool,
    coordinator: TurnCoordinator,
    gate: RateGate,
    dispatcher: Dispatcher,
    timers: HashMap<TimerKind, (u64, Instant)>,
    view: ViewState,
    view_tx: watch::Sender<ViewState>,
    surface_tx: mpsc::Sender<SurfaceCommand>,
}

impl<O: Outbound> Driver<O> {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<ChannelEvent>,
        mut commands: mpsc::Receiver<ClientCommand>,
    ) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_channel_event(event),
                    None => {
                        debug!(component = "client", event = "client.channel.ended");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(ClientCommand::Submit(text)) => self.on_submit(text),
                    Some(ClientCommand::Surface(event)) => self.on_surface(event),
                    Some(ClientCommand::Close) | None => {
                        info!(component = "client", event = "client.closing");
                        self.outbound.close();
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline();
                }
            }
            self.publish();
        }
        self.view.connected = false;
        self.publish();
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .values()
            .map(|(_, at)| *at)
            .chain(self.gate.next_deadline())
            .min()
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        let now = Instant::now();
        match event {
            ChannelEvent::Connected => {
                self.view.connected = true;
                self.view.notice = None;
            }
            ChannelEvent::Disconnected => {
                self.view.connected = false;
                self.dispatcher.reset();
                self.step(Input::ChannelLost, now);
            }
            ChannelEvent::ProtocolError(error) => {
                self.view.notice = Some(format!("Unreadable message from the server: {error}"));
            }
            ChannelEvent::Message(message) => match self.dispatcher.dispatch(message) {
                Dispatch::Quote(quote) => self.view.quote = Some(quote),
                Dispatch::Acknowledged => self.step(Input::MessageReceived, now),
                Dispatch::Answer(text) => self.step(Input::AnswerReady { text }, now),
                Dispatch::Failed(error) => self.step(Input::TurnFailed { error }, now),
                Dispatch::Rejected(error) => self.step(Input::TurnRejected { error }, now),
                Dispatch::HeartbeatAck => {
                    trace!(component = "client", event = "client.heartbeat.ack");
                }
                Dispatch::Ignored => {}
            },
        }
    }

    fn on_submit(&mut self, text: String) {
        let now = Instant::now();
        self.view.notice = None;
        match self.gate.try_send(&text, now) {
            GateOutcome::Accepted(text) => self.step(Input::Submit { text }, now),
            GateOutcome::Queued => {
                debug!(component = "client", event = "client.submit.held");
            }
            GateOutcome::Rejected(reason) => self.view.notice = Some(reason.to_string()),
        }
    }

    fn on_surface(&mut self, event: SurfaceEvent) {
        let input = match event {
            SurfaceEvent::EmergenceComplete { turn } => Input::EmergenceComplete { turn },
            SurfaceEvent::DissolveComplete => Input::DissolveComplete,
            SurfaceEvent::TypingStarted => Input::TypingStarted,
            SurfaceEvent::TypingStopped => Input::TypingStopped,
        };
        self.step(input, Instant::now());
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        let due: Vec<(TimerKind, u64)> = self
            .timers
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(timer, (generation, _))| (*timer, *generation))
            .collect();
        for (timer, generation) in due {
            self.timers.remove(&timer);
            self.step(Input::TimerFired { timer, generation }, now);
        }

        if let Some(text) = self.gate.poll(now) {
            debug!(component = "client", event = "client.pending.released");
            self.step(Input::Submit { text }, now);
        }
    }

    fn step(&mut self, input: Input, now: Instant) {
        let effects = self.coordinator.handle(input, now);
        let mut unsent = None;
        for effect in effects {
            if let Some(turn) = self.apply(effect, now) {
                unsent = Some(turn);
            }
        }
        // Feed the failure back only after the whole batch has been applied.
        if let Some(turn) = unsent {
            self.step(Input::SendFailed { turn }, now);
        }
    }

    /// Returns the turn id when a `Send` could not go out.
    fn apply(&mut self, effect: Effect, now: Instant) -> Option<TurnId> {
        match effect {
            Effect::Send { turn, text } => {
                let message = ClientMessage::UserMessage {
                    content: text,
                    is_mobile: self.is_mobile,
                };
                if let Err(e) = self.outbound.send(message) {
                    warn!(
                        component = "client",
                        event = "client.send.failed",
                        turn,
                        error = %e,
                    );
                    self.gate.send_failed();
                    return Some(turn);
                }
            }
            Effect::StartEmergence { turn, text } => {
                self.view.displayed = Some(text.clone());
                self.to_surface(SurfaceCommand::Emerge { turn, text });
            }
            Effect::StartDissolve => self.to_surface(SurfaceCommand::Dissolve),
            Effect::ClearSurface => self.view.displayed = None,
            Effect::ScheduleTimer {
                timer,
                generation,
                at,
            } => {
                self.timers.insert(timer, (generation, at));
            }
            Effect::ShowNotice(notice) => self.view.notice = Some(notice),
            Effect::PhaseChanged(phase) => self.view.phase = phase,
            Effect::TurnSettled { .. } => self.gate.turn_settled(now),
        }
        None
    }

    fn to_surface(&self, command: SurfaceCommand) {
        if let Err(e) = self.surface_tx.try_send(command) {
            warn!(
                component = "client",
                event = "client.surface.dropped",
                error = %e,
            );
        }
    }

    fn publish(&mut self) {
        self.view.pending = self.gate.pending().map(str::to_string);
        let view = &self.view;
        self.view_tx.send_if_modified(|current| {
            if current == view {
                false
            } else {
                *current = view.clone();
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use foliochat_protocol::{ChatMessage, SenderType, ServerMessage};

    use crate::coordinator::{ANSWER_TIMEOUT_NOTICE, NOT_SENT_NOTICE};

    struct FakeOutbound {
        sent: mpsc::UnboundedSender<ClientMessage>,
        connected: Arc<AtomicBool>,
    }

    impl Outbound for FakeOutbound {
        fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(ChannelError::NotConnected);
            }
            self.sent.send(message).map_err(|_| ChannelError::Closed)
        }

        fn close(&self) {}
    }

    struct Rig {
        parts: ClientParts,
        events: mpsc::Sender<ChannelEvent>,
        sent: mpsc::UnboundedReceiver<ClientMessage>,
        connected: Arc<AtomicBool>,
    }

    fn rig(is_mobile: bool) -> Rig {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(64);
        let connected = Arc::new(AtomicBool::new(true));
        let outbound = FakeOutbound {
            sent: sent_tx,
            connected: connected.clone(),
        };
        let mut config = ClientConfig::new(ChannelConfig::new("ws://unused", "visitor-1"));
        config.is_mobile = is_mobile;
        Rig {
            parts: spawn_driver(outbound, events_rx, config),
            events: events_tx,
            sent: sent_rx,
            connected,
        }
    }

    impl Rig {
        async fn server(&self, message: ServerMessage) {
            self.events
                .send(ChannelEvent::Message(message))
                .await
                .expect("driver alive");
        }

        async fn wait_view(&mut self, check: impl FnMut(&ViewState) -> bool) {
            self.parts.view.wait_for(check).await.expect("view");
        }

        async fn next_sent(&mut self) -> String {
            match self.sent.recv().await.expect("message sent") {
                ClientMessage::UserMessage { content, .. } => content,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    fn ack() -> ServerMessage {
        ServerMessage::MessageReceived {
            message: ChatMessage::new(SenderType::User, "q"),
        }
    }

    fn chunk(content: &str, index: u64) -> ServerMessage {
        ServerMessage::AiResponseChunk {
            content: content.to_string(),
            index: Some(index),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn streamed_answer_emerges_after_the_display_floor() {
        let mut rig = rig(true);
        rig.events.send(ChannelEvent::Connected).await.expect("send");
        rig.server(ServerMessage::ConversationQuote {
            quote: "Rain on the window.".to_string(),
        })
        .await;
        rig.wait_view(|v| v.connected && v.quote.as_deref() == Some("Rain on the window."))
            .await;

        rig.parts
            .handle
            .submit("What did you build at your last job?")
            .await
            .expect("submit");
        let sent_at = Instant::now();
        match rig.sent.recv().await.expect("sent") {
            ClientMessage::UserMessage { content, is_mobile } => {
                assert_eq!(content, "What did you build at your last job?");
                assert!(is_mobile);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        rig.server(ack()).await;
        rig.wait_view(|v| v.phase == AnimationPhase::Receiving).await;
        for (i, part) in ["Hel", "lo, ", "world"].iter().enumerate() {
            rig.server(chunk(part, i as u64)).await;
        }
        rig.server(ServerMessage::AiResponseComplete).await;

        let command = rig.parts.surface.recv().await.expect("surface command");
        assert_eq!(
            command,
            SurfaceCommand::Emerge {
                turn: 1,
                text: "Hello, world".to_string()
            }
        );
        assert!(Instant::now() - sent_at >= Duration::from_millis(1200));
        rig.wait_view(|v| {
            v.phase == AnimationPhase::Responding && v.displayed.as_deref() == Some("Hello, world")
        })
        .await;

        rig.parts
            .handle
            .surface(SurfaceEvent::EmergenceComplete { turn: 1 })
            .await
            .expect("surface event");
        rig.wait_view(|v| v.phase == AnimationPhase::Idle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn held_message_goes_out_after_the_cooldown_and_dissolves_the_answer() {
        let mut rig = rig(false);
        rig.events.send(ChannelEvent::Connected).await.expect("send");

        rig.parts.handle.submit("one").await.expect("submit");
        assert_eq!(rig.next_sent().await, "one");
        rig.server(ack()).await;
        rig.server(ServerMessage::AiResponse {
            message: ChatMessage::new(SenderType::Ai, "first"),
        })
        .await;
        rig.wait_view(|v| v.phase == AnimationPhase::Receiving).await;
        let answered_at = Instant::now();

        rig.parts.handle.submit("two").await.expect("submit");
        rig.parts.handle.submit("three").await.expect("submit");
        rig.wait_view(|v| v.pending.as_deref() == Some("three")).await;

        assert_eq!(
            rig.parts.surface.recv().await,
            Some(SurfaceCommand::Emerge {
                turn: 1,
                text: "first".to_string()
            })
        );

        assert_eq!(rig.next_sent().await, "three");
        assert!(Instant::now() - answered_at >= Duration::from_millis(1500));
        rig.wait_view(|v| v.pending.is_none()).await;

        assert_eq!(rig.parts.surface.recv().await, Some(SurfaceCommand::Dissolve));
        rig.wait_view(|v| v.phase == AnimationPhase::Dissolving).await;
        rig.parts
            .handle
            .surface(SurfaceEvent::DissolveComplete)
            .await
            .expect("surface event");
        rig.wait_view(|v| v.displayed.is_none() && v.phase == AnimationPhase::Sending)
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_disconnected_shows_a_notice_and_frees_the_gate() {
        let mut rig = rig(false);
        rig.connected.store(false, Ordering::SeqCst);

        rig.parts.handle.submit("hello?").await.expect("submit");
        rig.wait_view(|v| v.notice.as_deref() == Some(NOT_SENT_NOTICE)).await;
        assert_eq!(rig.parts.view.borrow().phase, AnimationPhase::Idle);

        rig.connected.store(true, Ordering::SeqCst);
        rig.events.send(ChannelEvent::Connected).await.expect("send");
        rig.parts.handle.submit("hello again").await.expect("submit");
        assert_eq!(rig.next_sent().await, "hello again");
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_turn_times_out_to_idle() {
        let mut rig = rig(false);
        rig.events.send(ChannelEvent::Connected).await.expect("send");
        rig.parts.handle.submit("anyone there?").await.expect("submit");
        assert_eq!(rig.next_sent().await, "anyone there?");

        rig.wait_view(|v| v.notice.as_deref() == Some(ANSWER_TIMEOUT_NOTICE))
            .await;
        assert_eq!(rig.parts.view.borrow().phase, AnimationPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn local_rejection_never_reaches_the_channel() {
        let mut rig = rig(false);
        rig.events.send(ChannelEvent::Connected).await.expect("send");
        rig.parts.handle.submit("   ").await.expect("submit");
        rig.wait_view(|v| v.notice.as_deref() == Some("Type a message first."))
            .await;

        rig.parts.handle.close().await;
        rig.parts.task.await.expect("driver exits");
        assert!(rig.sent.recv().await.is_none());
    }
}
