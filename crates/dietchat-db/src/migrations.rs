use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- users, clients and diets are owned by the record-management system;
        -- only the columns this service reads are declared here.
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            role        TEXT NOT NULL CHECK (role IN ('client', 'dietitian'))
        );

        CREATE TABLE IF NOT EXISTS clients (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            user_id         TEXT REFERENCES users(id),
            dietitian_id    TEXT REFERENCES users(id)
        );

        CREATE TABLE IF NOT EXISTS diets (
            id          TEXT PRIMARY KEY,
            client_id   TEXT NOT NULL REFERENCES clients(id)
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            client_id       TEXT NOT NULL REFERENCES clients(id),
            diet_id         TEXT NOT NULL REFERENCES diets(id),
            sender_id       TEXT NOT NULL REFERENCES users(id),
            sender_role     TEXT NOT NULL,
            content         TEXT NOT NULL,
            meal_tag_id     TEXT,
            created_at      TEXT NOT NULL,
            is_read         INTEGER NOT NULL DEFAULT 0,
            read_at         TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(client_id, diet_id, id);

        CREATE TABLE IF NOT EXISTS message_photos (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id  INTEGER NOT NULL REFERENCES messages(id),
            image_data  TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            expires_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_message_photos_message
            ON message_photos(message_id);

        CREATE TABLE IF NOT EXISTS presence (
            user_id         TEXT NOT NULL,
            client_id       TEXT NOT NULL,
            diet_id         TEXT NOT NULL,
            is_active       INTEGER NOT NULL,
            source          TEXT NOT NULL,
            last_active_at  TEXT NOT NULL,
            PRIMARY KEY (user_id, client_id, diet_id)
        );

        CREATE TABLE IF NOT EXISTS device_tokens (
            user_id     TEXT PRIMARY KEY REFERENCES users(id),
            token       TEXT NOT NULL,
            platform    TEXT,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS web_push_subscriptions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id     TEXT NOT NULL REFERENCES users(id),
            endpoint    TEXT NOT NULL UNIQUE,
            p256dh      TEXT NOT NULL,
            auth        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_web_push_user
            ON web_push_subscriptions(user_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
