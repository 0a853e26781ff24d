use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL UNIQUE,
            full_name       TEXT NOT NULL,
            email           TEXT NOT NULL UNIQUE,
            password        TEXT NOT NULL,
            profile_picture TEXT,
            verified        INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS private_messages (
            id          TEXT PRIMARY KEY,
            sender_id   TEXT NOT NULL REFERENCES users(id),
            receiver_id TEXT NOT NULL REFERENCES users(id),
            reply_to    TEXT REFERENCES private_messages(id) ON DELETE SET NULL,
            chat_text   TEXT,
            post_id     TEXT,
            is_read     INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_private_messages_pair
            ON private_messages(sender_id, receiver_id, created_at);

        CREATE TABLE IF NOT EXISTS private_messages_attachment (
            id          TEXT PRIMARY KEY,
            chat_id     TEXT NOT NULL REFERENCES private_messages(id) ON DELETE CASCADE,
            file_name   TEXT NOT NULL,
            media_type  TEXT NOT NULL,
            size        INTEGER NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_private_messages_attachment_chat
            ON private_messages_attachment(chat_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
