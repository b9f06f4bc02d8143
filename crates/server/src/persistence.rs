//! Conversation storage: batched SQLite writes and a few blocking reads.
//!
//! Uses `spawn_blocking` for async-safe SQLite access.
//! Writes are batched; reads used on connect go through their own connection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use foliochat_protocol::{ChatMessage, SenderType};

use crate::migration_runner::open_connection;

/// Writes produced by sessions and the registry
#[derive(Debug, Clone)]
pub enum PersistCommand {
    /// Create a conversation (no-op if it already exists)
    ConversationCreate {
        id: String,
        visitor_id: String,
        started_at: String,
    },

    /// Bump `last_message_at` and mark active again
    ConversationTouch { id: String, last_message_at: String },

    /// Visitor's socket went away
    ConversationDisconnect { id: String, at: String },

    /// Append a message
    MessageAppend {
        conversation_id: String,
        message: ChatMessage,
    },

    /// Notifies `done` once every earlier command is committed
    Barrier { done: Arc<Notify> },
}

/// Drains `PersistCommand`s and commits them in batches.
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(64),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run until every sender is dropped, then flush what is left.
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.started",
            db_path = %self.db_path.display(),
            "PersistenceWriter started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(PersistCommand::Barrier { done }) => {
                            self.flush().await;
                            done.notify_one();
                        }
                        Some(cmd) => {
                            self.batch.push(cmd);
                            if self.batch.len() >= self.batch_size {
                                self.flush().await;
                            }
                        }
                        None => break,
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        self.flush().await;
        info!(
            component = "persistence",
            event = "persistence.stopped",
            "PersistenceWriter stopped"
        );
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    commands = count,
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.join_failed",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

/// One transaction per batch. Runs on the blocking pool.
fn flush_batch(db_path: &Path, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open_connection(db_path)?;
    let count = batch.len();
    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!(
                component = "persistence",
                event = "persistence.command_failed",
                error = %e,
                "Failed to execute command"
            );
        }
    }

    tx.commit()?;
    Ok(count)
}

fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::ConversationCreate {
            id,
            visitor_id,
            started_at,
        } => {
            conn.execute(
                "INSERT INTO conversations (id, visitor_id, status, started_at, last_message_at)
                 VALUES (?1, ?2, 'active', ?3, ?3)
                 ON CONFLICT(id) DO UPDATE SET status = 'active', disconnected_at = NULL",
                params![id, visitor_id, started_at],
            )?;
        }

        PersistCommand::ConversationTouch {
            id,
            last_message_at,
        } => {
            conn.execute(
                "UPDATE conversations SET last_message_at = ?1, status = 'active' WHERE id = ?2",
                params![last_message_at, id],
            )?;
        }

        PersistCommand::ConversationDisconnect { id, at } => {
            conn.execute(
                "UPDATE conversations SET status = 'disconnected', disconnected_at = ?1 WHERE id = ?2",
                params![at, id],
            )?;
        }

        PersistCommand::MessageAppend {
            conversation_id,
            message,
        } => {
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), -1) + 1 FROM messages WHERE conversation_id = ?",
                params![conversation_id],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_type, content, timestamp, sequence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    conversation_id,
                    message.sender_type.as_str(),
                    message.content,
                    message.timestamp,
                    seq,
                ],
            )?;
        }

        // Handled by the writer loop before batching.
        PersistCommand::Barrier { done } => done.notify_one(),
    }

    Ok(())
}

pub fn conversation_exists(db_path: &Path, id: &str) -> Result<bool, rusqlite::Error> {
    if !db_path.exists() {
        return Ok(false);
    }
    let conn = open_connection(db_path)?;
    let found = conn
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1",
            params![id],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Resolve which stored conversation a visitor should continue.
///
/// A requested id is honoured only when it belongs to the visitor. Without
/// one, the visitor's most recently active conversation is returned.
pub fn find_conversation(
    db_path: &Path,
    visitor_id: &str,
    requested: Option<&str>,
) -> Result<Option<String>, rusqlite::Error> {
    if !db_path.exists() {
        return Ok(None);
    }
    let conn = open_connection(db_path)?;

    if let Some(requested) = requested {
        return conn
            .query_row(
                "SELECT id FROM conversations WHERE id = ?1 AND visitor_id = ?2",
                params![requested, visitor_id],
                |row| row.get(0),
            )
            .optional();
    }

    conn.query_row(
        "SELECT id FROM conversations WHERE visitor_id = ?1
         ORDER BY last_message_at DESC LIMIT 1",
        params![visitor_id],
        |row| row.get(0),
    )
    .optional()
}

/// Last `limit` messages of a conversation, oldest first.
pub fn load_recent_messages(
    db_path: &Path,
    conversation_id: &str,
    limit: usize,
) -> Result<Vec<ChatMessage>, rusqlite::Error> {
    if !db_path.exists() || limit == 0 {
        return Ok(Vec::new());
    }
    let conn = open_connection(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT id, sender_type, content, timestamp FROM messages
         WHERE conversation_id = ?1
         ORDER BY sequence DESC LIMIT ?2",
    )?;

    let mut messages: Vec<ChatMessage> = stmt
        .query_map(params![conversation_id, limit as i64], |row| {
            let sender: String = row.get(1)?;
            Ok(ChatMessage {
                id: row.get(0)?,
                sender_type: if sender == "user" {
                    SenderType::User
                } else {
                    SenderType::Ai
                },
                content: row.get(2)?,
                timestamp: row.get(3)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    messages.reverse();
    Ok(messages)
}

/// Channel feeding the writer task.
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1000)
}
