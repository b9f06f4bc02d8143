//! Per-visitor session state
//!
//! A `VisitorSession` lives for one WebSocket connection. Turn bookkeeping
//! is delegated to `TurnState`; readers outside the actor use the
//! lock-free `SessionSnapshot`.

use std::sync::Arc;

use arc_swap::ArcSwap;
use foliochat_protocol::TurnStatus;

use crate::transition::TurnState;

/// Read-only view published by the actor after every command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub visitor_id: String,
    pub conversation_id: String,
    pub in_flight: bool,
    pub last_status: Option<TurnStatus>,
    pub turn_count: u64,
}

pub struct VisitorSession {
    pub connection_id: u64,
    pub visitor_id: String,
    /// Quote shown to the visitor on connect, passed to the responder as context
    pub quote: Option<String>,
    pub turn: TurnState,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl VisitorSession {
    pub fn new(
        connection_id: u64,
        visitor_id: impl Into<String>,
        quote: Option<String>,
        turn: TurnState,
    ) -> Self {
        let visitor_id = visitor_id.into();
        let snapshot = Arc::new(ArcSwap::from_pointee(Self::build_snapshot(
            &visitor_id,
            &turn,
        )));
        Self {
            connection_id,
            visitor_id,
            quote,
            turn,
            snapshot,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.turn.conversation_id
    }

    pub fn snapshot_arc(&self) -> Arc<ArcSwap<SessionSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub fn refresh_snapshot(&self) {
        self.snapshot
            .store(Arc::new(Self::build_snapshot(&self.visitor_id, &self.turn)));
    }

    fn build_snapshot(visitor_id: &str, turn: &TurnState) -> SessionSnapshot {
        SessionSnapshot {
            visitor_id: visitor_id.to_string(),
            conversation_id: turn.conversation_id.clone(),
            in_flight: turn.phase.is_in_flight(),
            last_status: turn.last_status,
            turn_count: turn.turn_count,
        }
    }
}
