//! Shared server state
//!
//! `TurnServices` bundles everything a session actor needs to answer a turn.
//! `SessionRegistry` is the only cross-connection structure: it holds actor
//! handles keyed by visitor and resolves which conversation a new
//! connection continues.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use foliochat_protocol::{new_id, timestamp_now, ChatMessage, SenderType};
use foliochat_responder::{HistoryEntry, RetrievalAugmentedResponder};

use crate::config::ServerConfig;
use crate::content_safety::ContentSafety;
use crate::persistence::{
    conversation_exists, find_conversation, load_recent_messages, PersistCommand,
};
use crate::quotes::QuoteBook;
use crate::rate_limit::PointBudget;
use crate::session_actor::SessionActorHandle;

pub struct TurnServices {
    pub config: ServerConfig,
    pub responder: Arc<RetrievalAugmentedResponder>,
    pub safety: ContentSafety,
    pub budget: PointBudget,
    pub quotes: QuoteBook,
    pub persist_tx: mpsc::Sender<PersistCommand>,
}

impl TurnServices {
    pub fn new(
        config: ServerConfig,
        responder: Arc<RetrievalAugmentedResponder>,
        persist_tx: mpsc::Sender<PersistCommand>,
    ) -> Self {
        let safety = ContentSafety::new(&config.safety_patterns, config.safety_message.clone());
        let budget = PointBudget::new(
            config.daily_point_limit,
            config.on_topic_cost,
            config.off_topic_cost,
            &config.rate_limit_exempt,
        );
        let quotes = QuoteBook::new(&config.quotes);
        info!(
            component = "registry",
            event = "registry.services.ready",
            safety_patterns = safety.pattern_count(),
            stream_responses = config.stream_responses,
            max_queued_turns = config.max_queued_turns,
        );
        Self {
            config,
            responder,
            safety,
            budget,
            quotes,
            persist_tx,
        }
    }
}

/// Conversation a connection continues, with the history handed to the responder
#[derive(Debug, Clone)]
pub struct OpenedConversation {
    pub conversation_id: String,
    pub history: Vec<HistoryEntry>,
    pub resumed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_connections: usize,
    pub active_conversations: usize,
    pub turns_in_flight: usize,
}

pub struct SessionRegistry {
    services: Arc<TurnServices>,
    db_path: PathBuf,
    sessions: DashMap<String, SessionActorHandle>,
    /// visitor_id -> conversation_id, covers writes not yet flushed
    conversations: DashMap<String, String>,
    connections: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(services: Arc<TurnServices>, db_path: PathBuf) -> Self {
        Self {
            services,
            db_path,
            sessions: DashMap::new(),
            conversations: DashMap::new(),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn services(&self) -> &Arc<TurnServices> {
        &self.services
    }

    pub fn persist(&self) -> &mpsc::Sender<PersistCommand> {
        &self.services.persist_tx
    }

    /// Resolve the conversation for a new connection: the requested one if it
    /// belongs to the visitor, else the visitor's latest, else a new one.
    pub async fn open_conversation(
        &self,
        visitor_id: &str,
        requested: Option<&str>,
    ) -> anyhow::Result<OpenedConversation> {
        let cached = self.conversations.get(visitor_id).map(|c| c.clone());
        let existing = match requested {
            Some(req) if cached.as_deref() == Some(req) => Some(req.to_string()),
            Some(req) => self.lookup(visitor_id, Some(req)).await?,
            None => None,
        };
        let existing = match existing {
            Some(id) => Some(id),
            None => match cached {
                Some(id) => Some(id),
                None => self.lookup(visitor_id, None).await?,
            },
        };

        let resumed = existing.is_some();
        let conversation_id = existing.unwrap_or_else(new_id);
        let history_turns = self.services.config.history_turns;

        let mut history: Vec<HistoryEntry> = if resumed {
            let db_path = self.db_path.clone();
            let id = conversation_id.clone();
            tokio::task::spawn_blocking(move || load_recent_messages(&db_path, &id, history_turns))
                .await??
                .into_iter()
                .map(|m| match m.sender_type {
                    SenderType::User => HistoryEntry::user(m.content),
                    SenderType::Ai => HistoryEntry::assistant(m.content),
                })
                .collect()
        } else {
            Vec::new()
        };
        if history.is_empty() && !self.services.config.greeting.trim().is_empty() {
            history.push(HistoryEntry::assistant(self.services.config.greeting.clone()));
        }

        if self
            .persist()
            .send(PersistCommand::ConversationCreate {
                id: conversation_id.clone(),
                visitor_id: visitor_id.to_string(),
                started_at: timestamp_now(),
            })
            .await
            .is_err()
        {
            warn!(
                component = "registry",
                event = "registry.persist_closed",
                conversation_id = %conversation_id,
                "Persistence channel closed"
            );
        }
        self.conversations
            .insert(visitor_id.to_string(), conversation_id.clone());

        info!(
            component = "registry",
            event = "registry.conversation.opened",
            visitor_id = %visitor_id,
            conversation_id = %conversation_id,
            resumed = resumed,
            history = history.len(),
            "Conversation opened"
        );

        Ok(OpenedConversation {
            conversation_id,
            history,
            resumed,
        })
    }

    async fn lookup(
        &self,
        visitor_id: &str,
        requested: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let db_path = self.db_path.clone();
        let visitor_id = visitor_id.to_string();
        let requested = requested.map(str::to_string);
        let found = tokio::task::spawn_blocking(move || {
            find_conversation(&db_path, &visitor_id, requested.as_deref())
        })
        .await??;
        Ok(found)
    }

    pub fn register(&self, handle: SessionActorHandle) {
        if let Some(previous) = self.sessions.insert(handle.visitor_id.clone(), handle) {
            info!(
                component = "registry",
                event = "registry.session.replaced",
                visitor_id = %previous.visitor_id,
                previous_connection_id = previous.connection_id,
                "Visitor opened a second connection"
            );
        }
    }

    /// Remove the visitor's session if it still belongs to `connection_id`.
    pub fn remove_session(&self, visitor_id: &str, connection_id: u64) -> Option<SessionActorHandle> {
        self.sessions
            .remove_if(visitor_id, |_, handle| handle.connection_id == connection_id)
            .map(|(_, handle)| handle)
    }

    /// Forget the cached conversation for a visitor that went away, once
    /// everything written for it is on disk. Later connections find it
    /// through the database. Kept if the visitor reconnected meanwhile.
    pub async fn release_conversation(&self, visitor_id: &str, conversation_id: &str) {
        let done = Arc::new(Notify::new());
        if self
            .persist()
            .send(PersistCommand::Barrier { done: done.clone() })
            .await
            .is_err()
        {
            return;
        }
        done.notified().await;

        if self.sessions.contains_key(visitor_id) {
            return;
        }
        let released = self
            .conversations
            .remove_if(visitor_id, |_, cached| cached == conversation_id)
            .is_some();
        debug!(
            component = "registry",
            event = "registry.conversation.released",
            visitor_id = %visitor_id,
            conversation_id = %conversation_id,
            released,
        );
    }

    /// Last `limit` stored messages, oldest first. `None` if the
    /// conversation was never stored.
    pub async fn transcript(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Option<Vec<ChatMessage>>> {
        let db_path = self.db_path.clone();
        let id = conversation_id.to_string();
        let found = tokio::task::spawn_blocking(move || -> Result<_, rusqlite::Error> {
            if !conversation_exists(&db_path, &id)? {
                return Ok(None);
            }
            load_recent_messages(&db_path, &id, limit).map(Some)
        })
        .await??;
        Ok(found)
    }

    #[cfg(test)]
    pub fn get_session(&self, visitor_id: &str) -> Option<SessionActorHandle> {
        self.sessions.get(visitor_id).map(|h| h.clone())
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_connections: self.connections.load(Ordering::Relaxed),
            active_conversations: self.sessions.len(),
            turns_in_flight: self
                .sessions
                .iter()
                .filter(|entry| entry.value().snapshot().in_flight)
                .count(),
        }
    }
}
