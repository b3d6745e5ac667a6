use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;

pub fn run(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Direct two-party threads. The participant pair is stored
        -- canonicalized (lo < hi) with a UNIQUE constraint, so concurrent
        -- first-contact resolves to a single row.
        CREATE TABLE IF NOT EXISTS threads (
            id              TEXT PRIMARY KEY,
            participant_lo  TEXT NOT NULL REFERENCES users(id),
            participant_hi  TEXT NOT NULL REFERENCES users(id),
            last_seq        INTEGER NOT NULL DEFAULT 0,
            last_message_id TEXT,
            last_message_at TEXT,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at      TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(participant_lo, participant_hi)
        );

        -- seq is assigned under the same transaction that advances
        -- threads.last_seq; UNIQUE(thread_id, seq) makes per-thread
        -- ordering strict under concurrent senders.
        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            thread_id   TEXT NOT NULL REFERENCES threads(id),
            sender_id   TEXT NOT NULL REFERENCES users(id),
            seq         INTEGER NOT NULL,
            body        TEXT NOT NULL,
            attachments TEXT NOT NULL DEFAULT '[]',
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(thread_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, seq);

        CREATE TABLE IF NOT EXISTS notifications (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            message     TEXT NOT NULL,
            category    TEXT NOT NULL,
            status      TEXT NOT NULL DEFAULT 'unread'
                        CHECK (status IN ('unread', 'read')),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_user
            ON notifications(user_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
