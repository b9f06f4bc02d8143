//! Routes incoming server frames and assembles streamed answers.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use foliochat_protocol::ServerMessage;

/// What a server frame means to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Quote(String),
    /// The server accepted the oldest unacknowledged turn
    Acknowledged,
    /// A complete answer, either a single response or the assembled stream
    Answer(String),
    Failed(String),
    /// The server refused the oldest unacknowledged turn
    Rejected(String),
    HeartbeatAck,
    /// Partial chunk or stray frame; nothing to act on yet
    Ignored,
}

/// Concatenates the chunks of one answer.
///
/// Indexed chunks are ordered by index and a repeated index is dropped.
/// Chunks without an index are appended in arrival order after the
/// indexed ones.
#[derive(Debug, Default)]
pub struct AnswerAssembler {
    indexed: BTreeMap<u64, String>,
    unindexed: String,
}

impl AnswerAssembler {
    pub fn push(&mut self, content: &str, index: Option<u64>) {
        match index {
            Some(index) => {
                if self.indexed.contains_key(&index) {
                    debug!(
                        component = "dispatcher",
                        event = "dispatcher.chunk.duplicate",
                        index,
                    );
                    return;
                }
                self.indexed.insert(index, content.to_string());
            }
            None => self.unindexed.push_str(content),
        }
    }

    /// The assembled answer; leaves the assembler empty for the next one.
    pub fn take(&mut self) -> String {
        let mut text: String = std::mem::take(&mut self.indexed).into_values().collect();
        text.push_str(&self.unindexed);
        self.unindexed.clear();
        text
    }

    pub fn clear(&mut self) {
        self.indexed.clear();
        self.unindexed.clear();
    }
}

/// Turns server frames into client events.
///
/// Acknowledgements arrive as soon as the server queues a message, so one
/// may land in the middle of an earlier answer's stream. Chunks always
/// belong to the oldest acknowledged turn that has not ended yet.
#[derive(Debug, Default)]
pub struct Dispatcher {
    assembler: AnswerAssembler,
    /// Acknowledged turns still waiting for their terminal frame
    awaiting: usize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget partial answers, e.g. after the connection dropped.
    pub fn reset(&mut self) {
        self.assembler.clear();
        self.awaiting = 0;
    }

    pub fn dispatch(&mut self, message: ServerMessage) -> Dispatch {
        match message {
            ServerMessage::ConversationQuote { quote } => Dispatch::Quote(quote),
            ServerMessage::MessageReceived { .. } => {
                self.awaiting += 1;
                Dispatch::Acknowledged
            }
            ServerMessage::AiResponseChunk { content, index } => {
                if self.awaiting == 0 {
                    trace!(
                        component = "dispatcher",
                        event = "dispatcher.chunk.late",
                        "Chunk with no open turn ignored"
                    );
                } else {
                    self.assembler.push(&content, index);
                }
                Dispatch::Ignored
            }
            ServerMessage::AiResponseComplete => {
                if self.awaiting == 0 {
                    return Dispatch::Ignored;
                }
                self.awaiting -= 1;
                Dispatch::Answer(self.assembler.take())
            }
            ServerMessage::AiResponse { message } => {
                self.end_turn();
                Dispatch::Answer(message.content)
            }
            ServerMessage::HeartbeatAck { .. } => Dispatch::HeartbeatAck,
            ServerMessage::Error {
                error,
                rejected: true,
            } => Dispatch::Rejected(error),
            ServerMessage::Error { error, .. } => {
                self.end_turn();
                Dispatch::Failed(error)
            }
        }
    }

    fn end_turn(&mut self) {
        self.awaiting = self.awaiting.saturating_sub(1);
        self.assembler.clear();
    }
}
