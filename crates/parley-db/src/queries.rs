use crate::models::{BODY_AUDIO, BODY_TEXT, MessageRow};
use crate::{Database, HistoryStore};
use anyhow::{Result, anyhow};
use chrono::DateTime;
use parley_types::{ConversationKey, Message, MessageBody, TargetKind};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

const SELECT_COLUMNS: &str =
    "SELECT id, sender, target, target_kind, body_kind, content, duration_secs, size, created_at
     FROM messages";

impl HistoryStore for Database {
    fn append_message(&self, message: &Message) -> Result<()> {
        self.with_conn(|conn| insert_message(conn, message))?;
        debug!("Stored message {} in {}", message.id, message.conversation().storage_key());
        Ok(())
    }

    fn append_audio_note(&self, message: &Message, payload: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            insert_message(&tx, message)?;
            tx.execute(
                "INSERT INTO audio_payloads (message_id, data) VALUES (?1, ?2)",
                rusqlite::params![message.id.to_string(), payload],
            )?;
            tx.commit()?;
            Ok(())
        })?;
        debug!("Stored audio note {} ({} bytes)", message.id, payload.len());
        Ok(())
    }

    fn load(&self, conversation: &ConversationKey) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_conversation(conn, &conversation.storage_key(), None))
    }

    fn load_recent(&self, conversation: &ConversationKey, limit: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(|conn| query_conversation(conn, &conversation.storage_key(), Some(limit)))
    }

    fn find_message(&self, id: &Uuid) -> Result<Option<Message>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                [id.to_string()],
                read_row,
            )
            .optional()
            .map_err(Into::into)
        })?;
        row.map(MessageRow::into_message).transpose()
    }

    fn load_audio_payload(&self, id: &Uuid) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT data FROM audio_payloads WHERE message_id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
        })
    }
}

fn insert_message(conn: &Connection, message: &Message) -> Result<()> {
    let (body_kind, content, duration_secs, size) = match &message.body {
        MessageBody::Text(content) => (BODY_TEXT, Some(content.as_str()), None, None),
        MessageBody::Audio { duration_secs, size } => {
            (BODY_AUDIO, None, Some(*duration_secs), Some(*size as i64))
        }
    };

    conn.execute(
        "INSERT INTO messages
            (id, conversation, sender, target, target_kind, body_kind, content, duration_secs, size, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            message.id.to_string(),
            message.conversation().storage_key(),
            message.sender,
            message.target,
            message.kind.as_str(),
            body_kind,
            content,
            duration_secs,
            size,
            message.created_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

/// Rows of one conversation, oldest first. With a limit only the most
/// recent rows are returned.
fn query_conversation(conn: &Connection, key: &str, limit: Option<i64>) -> Result<Vec<Message>> {
    let rows = match limit {
        None => {
            let mut stmt =
                conn.prepare(&format!("{} WHERE conversation = ?1 ORDER BY seq ASC", SELECT_COLUMNS))?;
            let rows = stmt
                .query_map([key], read_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        }
        Some(limit) => {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE conversation = ?1 ORDER BY seq DESC LIMIT ?2",
                SELECT_COLUMNS
            ))?;
            let mut rows = stmt
                .query_map(rusqlite::params![key, limit], read_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.reverse();
            rows
        }
    };

    rows.into_iter().map(MessageRow::into_message).collect()
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender: row.get(1)?,
        target: row.get(2)?,
        target_kind: row.get(3)?,
        body_kind: row.get(4)?,
        content: row.get(5)?,
        duration_secs: row.get(6)?,
        size: row.get(7)?,
        created_at: row.get(8)?,
    })
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let id = Uuid::parse_str(&self.id)?;
        let kind = TargetKind::parse(&self.target_kind)
            .ok_or_else(|| anyhow!("Unknown target kind '{}' on message {}", self.target_kind, self.id))?;
        let created_at = DateTime::from_timestamp_millis(self.created_at)
            .ok_or_else(|| anyhow!("Timestamp out of range on message {}", self.id))?;

        let body = match self.body_kind.as_str() {
            BODY_TEXT => MessageBody::Text(self.content.unwrap_or_default()),
            BODY_AUDIO => MessageBody::Audio {
                duration_secs: self.duration_secs.unwrap_or(0),
                size: self.size.unwrap_or(0).max(0) as u64,
            },
            other => return Err(anyhow!("Unknown body kind '{}' on message {}", other, self.id)),
        };

        Ok(Message {
            id,
            sender: self.sender,
            target: self.target,
            kind,
            body,
            created_at,
        })
    }
}
