use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS messages (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            conversation    TEXT NOT NULL,
            sender          TEXT NOT NULL,
            target          TEXT NOT NULL,
            target_kind     TEXT NOT NULL,
            body_kind       TEXT NOT NULL,
            content         TEXT,
            duration_secs   INTEGER,
            size            INTEGER,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation, seq);

        CREATE TABLE IF NOT EXISTS audio_payloads (
            message_id  TEXT PRIMARY KEY REFERENCES messages(id),
            data        BLOB NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
