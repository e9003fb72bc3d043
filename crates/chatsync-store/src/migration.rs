//! Database schema migrations for SQLite.
//!
//! Each migration transforms the schema from version N-1 to N and is
//! recorded in `schema_migrations`.

use chatsync_core::now_millis;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 3;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<u32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema {} is newer than supported {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;
        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }
        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        3 => apply_v3(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// v1: messages and chats.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            plaintext TEXT,                   -- NULL when undecryptable
            ciphertext BLOB NOT NULL,
            nonce BLOB NOT NULL,              -- 12 bytes
            sender_id TEXT NOT NULL,
            sender_commitment TEXT NOT NULL,
            timestamp INTEGER NOT NULL,       -- wall clock, Unix ms
            lamport_counter INTEGER NOT NULL,
            lamport_node TEXT NOT NULL,
            vector BLOB NOT NULL,             -- CBOR VectorClock
            status TEXT NOT NULL,
            reply_to TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            undecryptable INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE chats (
            id TEXT PRIMARY KEY,
            name TEXT,
            avatar TEXT,
            participants BLOB NOT NULL,       -- CBOR set of node ids
            vector BLOB NOT NULL,             -- CBOR VectorClock
            last_message_time INTEGER NOT NULL DEFAULT 0,
            unread_count INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_messages_chat_order
            ON messages(chat_id, timestamp, lamport_counter, lamport_node, id);
        CREATE INDEX idx_chats_activity ON chats(last_message_time);
        "#,
    )?;
    Ok(())
}

/// v2: ledger outbox and saved logical clocks.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE outbox (
            message_id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT
        );

        CREATE TABLE clocks (
            node_id TEXT PRIMARY KEY,
            lamport INTEGER NOT NULL,
            vector BLOB NOT NULL
        );

        CREATE INDEX idx_outbox_created ON outbox(created_at);
        "#,
    )?;
    Ok(())
}

/// v3: local clear watermark on chats.
fn apply_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "ALTER TABLE chats ADD COLUMN cleared_before INTEGER NOT NULL DEFAULT 0;",
    )?;
    Ok(())
}
