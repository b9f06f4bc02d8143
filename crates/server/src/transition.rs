//! Pure turn transition function
//!
//! All turn bookkeeping for a visitor session lives here as a pure,
//! synchronous function: `transition(state, input, now) -> (state, effects)`.
//! No IO, no async, no locking. The session actor executes the effects.

use foliochat_protocol::{ChatMessage, SenderType, ServerMessage, TurnStatus};
use foliochat_responder::HistoryEntry;

use crate::persistence::PersistCommand;

// ---------------------------------------------------------------------------
// TurnPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TurnPhase {
    #[default]
    Idle,
    InFlight {
        turn_id: String,
        user_content: String,
        chunks_sent: u64,
    },
}

impl TurnPhase {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TurnPhase::InFlight { .. })
    }
}

// ---------------------------------------------------------------------------
// TurnState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TurnState {
    pub conversation_id: String,
    pub phase: TurnPhase,
    pub last_status: Option<TurnStatus>,
    pub turn_count: u64,
    /// Delivered exchanges, oldest first, bounded by `history_limit`
    pub history: Vec<HistoryEntry>,
    pub history_limit: usize,
}

impl TurnState {
    pub fn new(
        conversation_id: impl Into<String>,
        history: Vec<HistoryEntry>,
        history_limit: usize,
    ) -> Self {
        let mut state = Self {
            conversation_id: conversation_id.into(),
            history,
            history_limit,
            ..Default::default()
        };
        state.trim_history();
        state
    }

    fn trim_history(&mut self) {
        if self.history.len() > self.history_limit {
            let excess = self.history.len() - self.history_limit;
            self.history.drain(..excess);
        }
    }
}

// ---------------------------------------------------------------------------
// Input / Effect
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    /// The actor took a user message off its mailbox. The message was
    /// acknowledged to the client when it entered the mailbox.
    MessageAccepted { message: ChatMessage },
    /// One streamed fragment from the responder
    ResponseChunk { content: String },
    /// The answer is final. `streamed` picks chunk framing over a single `ai_response`.
    ResponseCompleted {
        message_id: String,
        content: String,
        streamed: bool,
    },
    ResponseFailed { error: String },
}

#[derive(Debug, Clone)]
pub enum Effect {
    Emit(Box<ServerMessage>),
    Persist(Box<PersistCommand>),
}

// ---------------------------------------------------------------------------
// transition
// ---------------------------------------------------------------------------

pub fn transition(mut state: TurnState, input: Input, now: &str) -> (TurnState, Vec<Effect>) {
    let cid = state.conversation_id.clone();
    let mut effects: Vec<Effect> = Vec::new();

    match input {
        Input::MessageAccepted { message } => {
            if state.phase.is_in_flight() {
                effects.push(emit(ServerMessage::rejected(
                    "Still answering your previous message. Please wait a moment.",
                )));
                return (state, effects);
            }

            state.turn_count += 1;
            state.last_status = Some(TurnStatus::InFlight);
            state.phase = TurnPhase::InFlight {
                turn_id: message.id.clone(),
                user_content: message.content.clone(),
                chunks_sent: 0,
            };

            effects.push(persist(PersistCommand::MessageAppend {
                conversation_id: cid.clone(),
                message,
            }));
            effects.push(persist(PersistCommand::ConversationTouch {
                id: cid,
                last_message_at: now.to_string(),
            }));
        }

        Input::ResponseChunk { content } => {
            if let TurnPhase::InFlight { chunks_sent, .. } = &mut state.phase {
                if !content.is_empty() {
                    effects.push(emit(ServerMessage::AiResponseChunk {
                        content,
                        index: Some(*chunks_sent),
                    }));
                    *chunks_sent += 1;
                }
            }
        }

        Input::ResponseCompleted {
            message_id,
            content,
            streamed,
        } => {
            let TurnPhase::InFlight {
                user_content,
                chunks_sent,
                ..
            } = std::mem::take(&mut state.phase)
            else {
                return (state, effects);
            };

            let message = ChatMessage {
                id: message_id,
                content: content.clone(),
                sender_type: SenderType::Ai,
                timestamp: now.to_string(),
            };
            effects.push(persist(PersistCommand::MessageAppend {
                conversation_id: cid.clone(),
                message: message.clone(),
            }));
            effects.push(persist(PersistCommand::ConversationTouch {
                id: cid,
                last_message_at: now.to_string(),
            }));

            if streamed {
                if chunks_sent == 0 && !content.is_empty() {
                    effects.push(emit(ServerMessage::AiResponseChunk {
                        content: content.clone(),
                        index: Some(0),
                    }));
                }
                effects.push(emit(ServerMessage::AiResponseComplete));
            } else {
                effects.push(emit(ServerMessage::AiResponse { message }));
            }

            state.history.push(HistoryEntry::user(user_content));
            state.history.push(HistoryEntry::assistant(content));
            state.trim_history();
            state.last_status = Some(TurnStatus::Delivered);
        }

        Input::ResponseFailed { error } => {
            if !state.phase.is_in_flight() {
                return (state, effects);
            }
            state.phase = TurnPhase::Idle;
            state.last_status = Some(TurnStatus::Failed);
            effects.push(emit(ServerMessage::error(error)));
        }
    }

    (state, effects)
}

fn emit(msg: ServerMessage) -> Effect {
    Effect::Emit(Box::new(msg))
}

fn persist(cmd: PersistCommand) -> Effect {
    Effect::Persist(Box::new(cmd))
}
