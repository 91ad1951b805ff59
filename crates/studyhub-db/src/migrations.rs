use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Timestamps are stored as microseconds since the Unix epoch so that the
/// message ordering key compares as an integer.
pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL,
            display_name    TEXT,
            avatar_url      TEXT,
            updated_at      INTEGER NOT NULL
        );

        -- One row per unordered pair; user_a < user_b always
        CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            pair_key            TEXT NOT NULL UNIQUE,
            user_a              TEXT NOT NULL,
            user_b              TEXT NOT NULL,
            last_message_id     TEXT,
            last_message_at     INTEGER,
            pinned_message_id   TEXT,
            created_at          INTEGER NOT NULL,
            CHECK (user_a < user_b)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_user_a
            ON conversations(user_a, last_message_at);
        CREATE INDEX IF NOT EXISTS idx_conversations_user_b
            ON conversations(user_b, last_message_at);

        CREATE TABLE IF NOT EXISTS messages (
            id                      TEXT PRIMARY KEY,
            conversation_id         TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            sender_id               TEXT NOT NULL,
            created_at              INTEGER NOT NULL,
            body_kind               TEXT NOT NULL CHECK (body_kind IN ('text', 'image', 'file')),
            content                 TEXT,
            image_url               TEXT,
            image_key               TEXT,
            file_url                TEXT,
            file_key                TEXT,
            file_name               TEXT,
            reply_to_id             TEXT,
            reply_to_content        TEXT,
            reply_to_sender         TEXT,
            edited                  INTEGER NOT NULL DEFAULT 0,
            deleted_for_everyone    INTEGER NOT NULL DEFAULT 0,
            pinned                  INTEGER NOT NULL DEFAULT 0,
            UNIQUE (conversation_id, created_at)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  INTEGER NOT NULL,
            PRIMARY KEY (message_id, user_id, emoji)
        );

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            read_at     INTEGER NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id              TEXT PRIMARY KEY,
            recipient_id    TEXT NOT NULL,
            actor_id        TEXT,
            kind            TEXT NOT NULL
                CHECK (kind IN ('fulfillment', 'featured', 'milestone', 'system')),
            message         TEXT NOT NULL,
            link            TEXT,
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_recipient
            ON notifications(recipient_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
