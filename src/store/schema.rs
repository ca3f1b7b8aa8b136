//! SQLite schema.
//!
//! Timestamps are stored as Unix milliseconds (`INTEGER`). Pending and
//! archived messages share a column layout so rows can be mapped by the same
//! code.

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Create all tables (fresh database).
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY,
    password_hash TEXT NOT NULL,
    display_name TEXT NOT NULL,
    last_seen INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS friends (
    owner TEXT NOT NULL,
    friend TEXT NOT NULL,
    added_at INTEGER NOT NULL,
    PRIMARY KEY (owner, friend)
);

CREATE TABLE IF NOT EXISTS push_subscriptions (
    username TEXT PRIMARY KEY,
    endpoint TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    sender_display_name TEXT NOT NULL,
    recipient TEXT NOT NULL,
    kind TEXT NOT NULL,
    body TEXT,
    image_payload TEXT,
    reply_to TEXT,
    sent_at TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS archived_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    sender_display_name TEXT NOT NULL,
    recipient TEXT NOT NULL,
    kind TEXT NOT NULL,
    body TEXT,
    image_payload TEXT,
    reply_to TEXT,
    sent_at TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_recipient ON pending_messages(recipient, id);
CREATE INDEX IF NOT EXISTS idx_pending_created ON pending_messages(created_at);
CREATE INDEX IF NOT EXISTS idx_archived_pair ON archived_messages(sender, recipient);
"#;
