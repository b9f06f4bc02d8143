//! Turn coordinator.
//!
//! Decides when an answer may appear on the chat surface and when the
//! previous one dissolves. Pure and clock-parameterised: every call takes
//! `now` and returns effects for the driver to execute. Timers are effects
//! too, tagged with a generation so a timer that was re-armed or cancelled
//! is ignored when it finally fires.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

pub type TurnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnimationPhase {
    #[default]
    Idle,
    Typing,
    Sending,
    Receiving,
    Responding,
    Dissolving,
}

impl AnimationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnimationPhase::Idle => "idle",
            AnimationPhase::Typing => "typing",
            AnimationPhase::Sending => "sending",
            AnimationPhase::Receiving => "receiving",
            AnimationPhase::Responding => "responding",
            AnimationPhase::Dissolving => "dissolving",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    DisplayFloor,
    DissolveDelay,
    AnswerTimeout,
    DissolveTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Minimum time between sending and the answer starting to appear
    pub display_floor: Duration,
    /// Pause between a new submit and dissolving the displayed answer
    pub dissolve_delay: Duration,
    pub answer_timeout: Duration,
    /// Proceed as if the surface finished dissolving after this long
    pub dissolve_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            display_floor: Duration::from_millis(1200),
            dissolve_delay: Duration::from_millis(150),
            answer_timeout: Duration::from_secs(30),
            dissolve_timeout: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A message that already passed the gate
    Submit { text: String },
    TypingStarted,
    TypingStopped,
    MessageReceived,
    AnswerReady { text: String },
    TurnFailed { error: String },
    /// The server refused a message instead of acknowledging it
    TurnRejected { error: String },
    /// The channel refused the `Send` effect for this turn
    SendFailed { turn: TurnId },
    /// The surface finished typing out the answer for `turn`
    EmergenceComplete { turn: TurnId },
    DissolveComplete,
    TimerFired { timer: TimerKind, generation: u64 },
    ChannelLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send { turn: TurnId, text: String },
    StartEmergence { turn: TurnId, text: String },
    StartDissolve,
    /// The surface is empty again (dissolve finished or timed out)
    ClearSurface,
    ScheduleTimer {
        timer: TimerKind,
        generation: u64,
        at: Instant,
    },
    ShowNotice(String),
    PhaseChanged(AnimationPhase),
    /// The turn will not be answered any further; the gate may start its cool-down
    TurnSettled { turn: TurnId, delivered: bool },
}

pub const ANSWER_TIMEOUT_NOTICE: &str = "No answer arrived in time. Please try again.";
pub const CHANNEL_LOST_NOTICE: &str = "Connection lost. Reconnecting...";
pub const NOT_SENT_NOTICE: &str = "Not connected. Your message was not sent.";

#[derive(Debug)]
struct OutstandingTurn {
    id: TurnId,
    sent_at: Instant,
    acknowledged: bool,
    /// Superseded by a newer submit or timed out; its answer is discarded
    abandoned: bool,
}

#[derive(Debug)]
struct BufferedAnswer {
    turn: TurnId,
    text: String,
    sent_at: Instant,
}

#[derive(Debug)]
pub struct TurnCoordinator {
    config: CoordinatorConfig,
    phase: AnimationPhase,
    typing: bool,
    outstanding: VecDeque<OutstandingTurn>,
    next_turn: TurnId,
    buffered: Option<BufferedAnswer>,
    shown: Option<TurnId>,
    emerging: bool,
    dissolving: bool,
    dissolve_pending: bool,
    timers: HashMap<TimerKind, (u64, Instant)>,
    next_generation: u64,
}

impl TurnCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            phase: AnimationPhase::Idle,
            typing: false,
            outstanding: VecDeque::new(),
            next_turn: 1,
            buffered: None,
            shown: None,
            emerging: false,
            dissolving: false,
            dissolve_pending: false,
            timers: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn phase(&self) -> AnimationPhase {
        self.phase
    }

    pub fn displayed_turn(&self) -> Option<TurnId> {
        self.shown
    }

    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        match input {
            Input::Submit { text } => self.submit(text, now, &mut fx),
            Input::TypingStarted => self.typing = true,
            Input::TypingStopped => self.typing = false,
            Input::MessageReceived => {
                if let Some(turn) = self.outstanding.iter_mut().find(|t| !t.acknowledged) {
                    turn.acknowledged = true;
                }
            }
            Input::AnswerReady { text } => self.answer_ready(text, now, &mut fx),
            Input::TurnFailed { error } => self.turn_failed(error, &mut fx),
            Input::TurnRejected { error } => self.turn_rejected(error, &mut fx),
            Input::SendFailed { turn } => {
                self.outstanding.retain(|t| t.id != turn);
                if !self.has_live_turn() {
                    self.cancel(TimerKind::AnswerTimeout);
                }
                fx.push(Effect::ShowNotice(NOT_SENT_NOTICE.to_string()));
            }
            Input::EmergenceComplete { turn } => {
                if self.emerging && self.shown == Some(turn) {
                    self.emerging = false;
                } else {
                    debug!(
                        component = "coordinator",
                        event = "coordinator.emergence.stale",
                        turn,
                        shown = ?self.shown,
                    );
                }
            }
            Input::DissolveComplete => {
                if self.dissolving {
                    self.finish_dissolve(now, &mut fx);
                } else {
                    debug!(
                        component = "coordinator",
                        event = "coordinator.dissolve.stale",
                        "Dissolve completion with no active dissolve"
                    );
                }
            }
            Input::TimerFired { timer, generation } => {
                self.timer_fired(timer, generation, now, &mut fx)
            }
            Input::ChannelLost => self.channel_lost(&mut fx),
        }

        let phase = self.derived_phase();
        if phase != self.phase {
            debug!(
                component = "coordinator",
                event = "coordinator.phase.changed",
                from = self.phase.as_str(),
                to = phase.as_str(),
            );
            self.phase = phase;
            fx.push(Effect::PhaseChanged(phase));
        }
        fx
    }

    fn submit(&mut self, text: String, now: Instant, fx: &mut Vec<Effect>) {
        for turn in self.outstanding.iter_mut().filter(|t| !t.abandoned) {
            debug!(
                component = "coordinator",
                event = "coordinator.turn.superseded",
                turn = turn.id,
            );
            turn.abandoned = true;
        }
        if let Some(buffered) = self.buffered.take() {
            debug!(
                component = "coordinator",
                event = "coordinator.answer.superseded",
                turn = buffered.turn,
            );
            self.cancel(TimerKind::DisplayFloor);
        }

        let id = self.next_turn;
        self.next_turn += 1;
        self.outstanding.push_back(OutstandingTurn {
            id,
            sent_at: now,
            acknowledged: false,
            abandoned: false,
        });
        fx.push(Effect::Send { turn: id, text });
        self.schedule(TimerKind::AnswerTimeout, now + self.config.answer_timeout, fx);

        if self.shown.is_some() && !self.dissolving && !self.dissolve_pending {
            self.dissolve_pending = true;
            self.schedule(TimerKind::DissolveDelay, now + self.config.dissolve_delay, fx);
        }
    }

    fn answer_ready(&mut self, text: String, now: Instant, fx: &mut Vec<Effect>) {
        let Some(turn) = self.outstanding.pop_front() else {
            debug!(
                component = "coordinator",
                event = "coordinator.answer.stray",
                "Answer with no outstanding turn"
            );
            return;
        };
        if turn.abandoned {
            debug!(
                component = "coordinator",
                event = "coordinator.answer.discarded",
                turn = turn.id,
            );
            return;
        }

        if !self.has_live_turn() {
            self.cancel(TimerKind::AnswerTimeout);
        }
        fx.push(Effect::TurnSettled {
            turn: turn.id,
            delivered: true,
        });
        self.buffered = Some(BufferedAnswer {
            turn: turn.id,
            text,
            sent_at: turn.sent_at,
        });
        self.try_present(now, fx);
    }

    fn turn_failed(&mut self, error: String, fx: &mut Vec<Effect>) {
        match self.outstanding.pop_front() {
            Some(turn) if turn.abandoned => {
                debug!(
                    component = "coordinator",
                    event = "coordinator.failure.discarded",
                    turn = turn.id,
                );
            }
            Some(turn) => {
                if !self.has_live_turn() {
                    self.cancel(TimerKind::AnswerTimeout);
                }
                fx.push(Effect::TurnSettled {
                    turn: turn.id,
                    delivered: false,
                });
                fx.push(Effect::ShowNotice(error));
            }
            None => fx.push(Effect::ShowNotice(error)),
        }
    }

    /// Acks and rejections arrive in send order, so a rejection belongs to
    /// the oldest turn not yet acknowledged.
    fn turn_rejected(&mut self, error: String, fx: &mut Vec<Effect>) {
        let Some(position) = self.outstanding.iter().position(|t| !t.acknowledged) else {
            fx.push(Effect::ShowNotice(error));
            return;
        };
        let Some(turn) = self.outstanding.remove(position) else {
            return;
        };
        if turn.abandoned {
            debug!(
                component = "coordinator",
                event = "coordinator.rejection.discarded",
                turn = turn.id,
            );
            return;
        }
        if !self.has_live_turn() {
            self.cancel(TimerKind::AnswerTimeout);
        }
        fx.push(Effect::TurnSettled {
            turn: turn.id,
            delivered: false,
        });
        fx.push(Effect::ShowNotice(error));
    }

    fn timer_fired(&mut self, timer: TimerKind, generation: u64, now: Instant, fx: &mut Vec<Effect>) {
        let current = self.timers.get(&timer).map(|(armed, _)| *armed);
        if current != Some(generation) {
            debug!(
                component = "coordinator",
                event = "coordinator.timer.stale",
                timer = ?timer,
                generation,
            );
            return;
        }
        self.timers.remove(&timer);

        match timer {
            TimerKind::DisplayFloor => self.try_present(now, fx),
            TimerKind::DissolveDelay => {
                if self.dissolve_pending && self.shown.is_some() {
                    self.start_dissolve(now, fx);
                } else {
                    self.dissolve_pending = false;
                }
            }
            TimerKind::DissolveTimeout => {
                if self.dissolving {
                    warn!(
                        component = "coordinator",
                        event = "coordinator.dissolve.timeout",
                        "Surface never reported dissolve completion"
                    );
                    self.finish_dissolve(now, fx);
                }
            }
            TimerKind::AnswerTimeout => {
                let mut last_live = None;
                for turn in self.outstanding.iter_mut().filter(|t| !t.abandoned) {
                    turn.abandoned = true;
                    last_live = Some(turn.id);
                }
                if let Some(turn) = last_live {
                    warn!(
                        component = "coordinator",
                        event = "coordinator.answer.timeout",
                        turn,
                    );
                    fx.push(Effect::TurnSettled {
                        turn,
                        delivered: false,
                    });
                    fx.push(Effect::ShowNotice(ANSWER_TIMEOUT_NOTICE.to_string()));
                }
            }
        }
    }

    fn channel_lost(&mut self, fx: &mut Vec<Effect>) {
        let last_live = self
            .outstanding
            .iter()
            .filter(|t| !t.abandoned)
            .map(|t| t.id)
            .last();
        self.outstanding.clear();
        self.cancel(TimerKind::AnswerTimeout);
        if let Some(turn) = last_live {
            fx.push(Effect::TurnSettled {
                turn,
                delivered: false,
            });
            fx.push(Effect::ShowNotice(CHANNEL_LOST_NOTICE.to_string()));
        }
    }

    /// Show the buffered answer if the surface is free and the floor has passed.
    fn try_present(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        let Some(sent_at) = self.buffered.as_ref().map(|b| b.sent_at) else {
            return;
        };
        if self.dissolving || self.dissolve_pending {
            return;
        }
        if self.shown.is_some() {
            self.start_dissolve(now, fx);
            return;
        }

        let floor_at = sent_at + self.config.display_floor;
        if now < floor_at {
            if self.timers.get(&TimerKind::DisplayFloor).map(|(_, at)| *at) != Some(floor_at) {
                self.schedule(TimerKind::DisplayFloor, floor_at, fx);
            }
            return;
        }

        let Some(buffered) = self.buffered.take() else {
            return;
        };
        self.cancel(TimerKind::DisplayFloor);
        self.shown = Some(buffered.turn);
        self.emerging = true;
        fx.push(Effect::StartEmergence {
            turn: buffered.turn,
            text: buffered.text,
        });
    }

    fn start_dissolve(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        self.dissolve_pending = false;
        self.cancel(TimerKind::DissolveDelay);
        self.dissolving = true;
        self.emerging = false;
        fx.push(Effect::StartDissolve);
        self.schedule(TimerKind::DissolveTimeout, now + self.config.dissolve_timeout, fx);
    }

    fn finish_dissolve(&mut self, now: Instant, fx: &mut Vec<Effect>) {
        self.dissolving = false;
        self.shown = None;
        self.cancel(TimerKind::DissolveTimeout);
        fx.push(Effect::ClearSurface);
        self.try_present(now, fx);
    }

    fn schedule(&mut self, timer: TimerKind, at: Instant, fx: &mut Vec<Effect>) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.timers.insert(timer, (generation, at));
        fx.push(Effect::ScheduleTimer {
            timer,
            generation,
            at,
        });
    }

    fn cancel(&mut self, timer: TimerKind) {
        self.timers.remove(&timer);
    }

    fn has_live_turn(&self) -> bool {
        self.outstanding.iter().any(|t| !t.abandoned)
    }

    fn derived_phase(&self) -> AnimationPhase {
        if self.dissolving {
            return AnimationPhase::Dissolving;
        }
        if self.emerging {
            return AnimationPhase::Responding;
        }
        if let Some(turn) = self.outstanding.iter().rev().find(|t| !t.abandoned) {
            return if turn.acknowledged {
                AnimationPhase::Receiving
            } else {
                AnimationPhase::Sending
            };
        }
        if self.buffered.is_some() {
            return AnimationPhase::Receiving;
        }
        if self.typing {
            AnimationPhase::Typing
        } else {
            AnimationPhase::Idle
        }
    }
}
