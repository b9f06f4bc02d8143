//! Commands sent to a session actor from the websocket handler.

use foliochat_protocol::ChatMessage;
#[cfg(test)]
use tokio::sync::oneshot;

#[cfg(test)]
use crate::session::SessionSnapshot;

pub enum SessionCommand {
    /// Run one turn. Already validated, trimmed and acknowledged.
    UserMessage {
        message: ChatMessage,
        is_mobile: bool,
    },

    /// Current snapshot, answered once every earlier command has been processed
    #[cfg(test)]
    GetSnapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },

    /// Stop after the current turn
    Shutdown,
}
