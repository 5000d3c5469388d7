//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `containers`, `memberships` and
//! `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (profiles)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    display_name TEXT,
    username     TEXT,
    avatar_url   TEXT,
    created_at   TEXT NOT NULL                -- RFC-3339, microseconds, UTC
);

-- ----------------------------------------------------------------
-- Containers (conversations and channels)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS containers (
    id         TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    kind       TEXT NOT NULL,                 -- 'direct' | 'channel'
    title      TEXT,
    avatar_url TEXT,
    created_at TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Memberships
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS memberships (
    container_id TEXT NOT NULL,               -- FK -> containers(id)
    user_id      TEXT NOT NULL,               -- FK -> users(id)
    muted        INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    archived     INTEGER NOT NULL DEFAULT 0,
    pinned       INTEGER NOT NULL DEFAULT 0,
    last_read_at TEXT,
    joined_at    TEXT NOT NULL,

    PRIMARY KEY (container_id, user_id),
    FOREIGN KEY (container_id) REFERENCES containers(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_memberships_user ON memberships(user_id);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    container_id TEXT NOT NULL,               -- FK -> containers(id)
    author_id    TEXT NOT NULL,               -- FK -> users(id)
    body         TEXT,
    media_url    TEXT,
    media_kind   TEXT,
    reply_to     TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    edited       INTEGER NOT NULL DEFAULT 0,
    pinned       INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (container_id) REFERENCES containers(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_container_ts
    ON messages(container_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
