pub mod migrations;
pub mod models;
pub mod queries;

use anyhow::Result;
use parley_types::{ConversationKey, Message};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::info;
use uuid::Uuid;

/// Durable, append-only log of every accepted message, one ordered log per
/// conversation.
///
/// Callers on the delivery path log failures and carry on; a store error
/// never blocks live delivery.
pub trait HistoryStore: Send + Sync {
    fn append_message(&self, message: &Message) -> Result<()>;

    /// Store voice-note metadata and its payload together, exactly once.
    fn append_audio_note(&self, message: &Message, payload: &[u8]) -> Result<()>;

    /// Whole conversation in insertion order.
    fn load(&self, conversation: &ConversationKey) -> Result<Vec<Message>>;

    /// The most recent `limit` messages, oldest first.
    fn load_recent(&self, conversation: &ConversationKey, limit: usize) -> Result<Vec<Message>> {
        let mut all = self.load(conversation)?;
        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }

    /// A single message by id, text or voice note.
    fn find_message(&self, id: &Uuid) -> Result<Option<Message>>;

    fn load_audio_payload(&self, id: &Uuid) -> Result<Option<Vec<u8>>>;
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        // Every write is a single statement or transaction, so a poisoned
        // lock still guards a consistent connection.
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }
}
