//! SQLite implementation of the Persistence trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{de::DeserializeOwned, Serialize};

use chatsync_core::{
    ChatId, ChatState, DeliveryStatus, LamportStamp, Message, MessageId, NodeId, Nonce,
    VectorClock,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{ClockSnapshot, InsertResult, OutboxEntry, Persistence};

const MESSAGE_COLUMNS: &str = "id, chat_id, plaintext, ciphertext, nonce, sender_id, \
     sender_commitment, timestamp, lamport_counter, lamport_node, vector, status, reply_to, \
     version, undecryptable";

const CHAT_COLUMNS: &str =
    "id, name, avatar, participants, vector, last_message_time, unread_count, cleared_before, version";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path, running migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Raw message columns, decoded outside the rusqlite row callback.
struct MessageRow {
    id: String,
    chat_id: String,
    plaintext: Option<String>,
    ciphertext: Vec<u8>,
    nonce: Vec<u8>,
    sender_id: String,
    sender_commitment: String,
    timestamp: i64,
    lamport_counter: i64,
    lamport_node: String,
    vector: Vec<u8>,
    status: String,
    reply_to: Option<String>,
    version: i64,
    undecryptable: bool,
}

impl MessageRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            chat_id: row.get("chat_id")?,
            plaintext: row.get("plaintext")?,
            ciphertext: row.get("ciphertext")?,
            nonce: row.get("nonce")?,
            sender_id: row.get("sender_id")?,
            sender_commitment: row.get("sender_commitment")?,
            timestamp: row.get("timestamp")?,
            lamport_counter: row.get("lamport_counter")?,
            lamport_node: row.get("lamport_node")?,
            vector: row.get("vector")?,
            status: row.get("status")?,
            reply_to: row.get("reply_to")?,
            version: row.get("version")?,
            undecryptable: row.get("undecryptable")?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let nonce = Nonce::try_from(self.nonce.as_slice())
            .map_err(|_| StoreError::InvalidData(format!("bad nonce on message {}", self.id)))?;
        let status = DeliveryStatus::parse(&self.status)
            .ok_or_else(|| StoreError::InvalidData(format!("bad status {:?}", self.status)))?;

        Ok(Message {
            id: MessageId::new(self.id),
            chat_id: ChatId::new(self.chat_id),
            plaintext: self.plaintext,
            ciphertext: Bytes::from(self.ciphertext),
            nonce,
            sender_id: NodeId::new(self.sender_id),
            sender_commitment: self.sender_commitment,
            timestamp: self.timestamp,
            lamport: LamportStamp::new(self.lamport_counter as u64, NodeId::new(self.lamport_node)),
            vector: decode(&self.vector)?,
            status,
            reply_to: self.reply_to.map(MessageId::new),
            version: self.version as u64,
            undecryptable: self.undecryptable,
        })
    }
}

struct ChatRow {
    id: String,
    name: Option<String>,
    avatar: Option<String>,
    participants: Vec<u8>,
    vector: Vec<u8>,
    last_message_time: i64,
    unread_count: i64,
    cleared_before: i64,
    version: i64,
}

impl ChatRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            avatar: row.get("avatar")?,
            participants: row.get("participants")?,
            vector: row.get("vector")?,
            last_message_time: row.get("last_message_time")?,
            unread_count: row.get("unread_count")?,
            cleared_before: row.get("cleared_before")?,
            version: row.get("version")?,
        })
    }

    fn into_chat(self) -> Result<ChatState> {
        let participants: BTreeSet<NodeId> = decode(&self.participants)?;
        Ok(ChatState {
            id: ChatId::new(self.id),
            name: self.name,
            avatar: self.avatar,
            participants,
            vector: decode(&self.vector)?,
            last_message_time: self.last_message_time,
            unread_count: self.unread_count.max(0) as u32,
            cleared_before: self.cleared_before,
            version: self.version as u64,
        })
    }
}

fn insert_message(conn: &Connection, message: &Message) -> Result<InsertResult> {
    let vector = encode(&message.vector)?;
    let changed = conn.execute(
        &format!(
            "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO NOTHING",
            MESSAGE_COLUMNS
        ),
        params![
            message.id.as_str(),
            message.chat_id.as_str(),
            message.plaintext,
            message.ciphertext.as_ref(),
            message.nonce.as_bytes().as_slice(),
            message.sender_id.as_str(),
            message.sender_commitment,
            message.timestamp,
            message.lamport.counter as i64,
            message.lamport.node_id.as_str(),
            vector,
            message.status.as_str(),
            message.reply_to.as_ref().map(|id| id.as_str()),
            message.version as i64,
            message.undecryptable,
        ],
    )?;

    Ok(if changed == 0 {
        InsertResult::AlreadyExists
    } else {
        InsertResult::Inserted
    })
}

fn insert_outbox(conn: &Connection, entry: &OutboxEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO outbox (message_id, chat_id, created_at, attempts, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(message_id) DO NOTHING",
        params![
            entry.message_id.as_str(),
            entry.chat_id.as_str(),
            entry.created_at,
            entry.attempts,
            entry.last_error,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn get_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>> {
        let chat_id = chat_id.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages WHERE chat_id = ?1
                 ORDER BY timestamp, lamport_counter, lamport_node, id",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![chat_id.as_str()], MessageRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(MessageRow::into_message).collect()
        })
        .await
    }

    async fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let id = id.clone();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                    params![id.as_str()],
                    MessageRow::read,
                )
                .optional()?;
            row.map(MessageRow::into_message).transpose()
        })
        .await
    }

    async fn add_message(&self, message: &Message) -> Result<InsertResult> {
        let message = message.clone();
        self.blocking(move |conn| insert_message(conn, &message)).await
    }

    async fn update_message(&self, message: &Message) -> Result<()> {
        let message = message.clone();
        self.blocking(move |conn| {
            let vector = encode(&message.vector)?;
            let changed = conn.execute(
                "UPDATE messages SET
                    chat_id = ?2, plaintext = ?3, ciphertext = ?4, nonce = ?5, sender_id = ?6,
                    sender_commitment = ?7, timestamp = ?8, lamport_counter = ?9,
                    lamport_node = ?10, vector = ?11, status = ?12, reply_to = ?13,
                    version = ?14, undecryptable = ?15
                 WHERE id = ?1",
                params![
                    message.id.as_str(),
                    message.chat_id.as_str(),
                    message.plaintext,
                    message.ciphertext.as_ref(),
                    message.nonce.as_bytes().as_slice(),
                    message.sender_id.as_str(),
                    message.sender_commitment,
                    message.timestamp,
                    message.lamport.counter as i64,
                    message.lamport.node_id.as_str(),
                    vector,
                    message.status.as_str(),
                    message.reply_to.as_ref().map(|id| id.as_str()),
                    message.version as i64,
                    message.undecryptable,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("message {}", message.id)));
            }
            Ok(())
        })
        .await
    }

    async fn remove_message(&self, id: &MessageId) -> Result<bool> {
        let id = id.clone();
        self.blocking(move |conn| {
            let removed = conn.execute("DELETE FROM messages WHERE id = ?1", params![id.as_str()])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn add_outgoing(&self, message: &Message, entry: &OutboxEntry) -> Result<InsertResult> {
        let message = message.clone();
        let entry = entry.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let result = insert_message(&tx, &message)?;
            if result == InsertResult::Inserted {
                insert_outbox(&tx, &entry)?;
            }
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn get_chats(&self) -> Result<Vec<ChatState>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM chats ORDER BY last_message_time DESC, id",
                CHAT_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], ChatRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ChatRow::into_chat).collect()
        })
        .await
    }

    async fn get_chat(&self, id: &ChatId) -> Result<Option<ChatState>> {
        let id = id.clone();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM chats WHERE id = ?1", CHAT_COLUMNS),
                    params![id.as_str()],
                    ChatRow::read,
                )
                .optional()?;
            row.map(ChatRow::into_chat).transpose()
        })
        .await
    }

    async fn update_chat(&self, chat: &ChatState) -> Result<()> {
        let chat = chat.clone();
        self.blocking(move |conn| {
            let participants = encode(&chat.participants)?;
            let vector = encode(&chat.vector)?;
            conn.execute(
                &format!(
                    "INSERT INTO chats ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        avatar = excluded.avatar,
                        participants = excluded.participants,
                        vector = excluded.vector,
                        last_message_time = excluded.last_message_time,
                        unread_count = excluded.unread_count,
                        cleared_before = excluded.cleared_before,
                        version = excluded.version",
                    CHAT_COLUMNS
                ),
                params![
                    chat.id.as_str(),
                    chat.name,
                    chat.avatar,
                    participants,
                    vector,
                    chat.last_message_time,
                    chat.unread_count as i64,
                    chat.cleared_before,
                    chat.version as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn clear_chat(&self, id: &ChatId) -> Result<usize> {
        let id = id.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM messages WHERE chat_id = ?1", params![id.as_str()])?;
            tx.execute("DELETE FROM outbox WHERE chat_id = ?1", params![id.as_str()])?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn enqueue_outbox(&self, entry: &OutboxEntry) -> Result<()> {
        let entry = entry.clone();
        self.blocking(move |conn| insert_outbox(conn, &entry)).await
    }

    async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, chat_id, created_at, attempts, last_error
                 FROM outbox ORDER BY created_at, message_id",
            )?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(OutboxEntry {
                        message_id: MessageId::new(row.get::<_, String>(0)?),
                        chat_id: ChatId::new(row.get::<_, String>(1)?),
                        created_at: row.get(2)?,
                        attempts: row.get(3)?,
                        last_error: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn record_outbox_failure(&self, id: &MessageId, error: &str) -> Result<()> {
        let id = id.clone();
        let error = error.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE outbox SET attempts = attempts + 1, last_error = ?2 WHERE message_id = ?1",
                params![id.as_str(), error],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_outbox(&self, id: &MessageId) -> Result<()> {
        let id = id.clone();
        self.blocking(move |conn| {
            conn.execute("DELETE FROM outbox WHERE message_id = ?1", params![id.as_str()])?;
            Ok(())
        })
        .await
    }

    async fn load_clock(&self, node: &NodeId) -> Result<Option<ClockSnapshot>> {
        let node = node.clone();
        self.blocking(move |conn| {
            let row: Option<(i64, Vec<u8>)> = conn
                .query_row(
                    "SELECT lamport, vector FROM clocks WHERE node_id = ?1",
                    params![node.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            row.map(|(lamport, vector)| {
                Ok(ClockSnapshot {
                    lamport: lamport as u64,
                    vector: decode::<VectorClock>(&vector)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn save_clock(&self, node: &NodeId, snapshot: &ClockSnapshot) -> Result<()> {
        let node = node.clone();
        let snapshot = snapshot.clone();
        self.blocking(move |conn| {
            let vector = encode(&snapshot.vector)?;
            conn.execute(
                "INSERT INTO clocks (node_id, lamport, vector) VALUES (?1, ?2, ?3)
                 ON CONFLICT(node_id) DO UPDATE SET lamport = excluded.lamport, vector = excluded.vector",
                params![node.as_str(), snapshot.lamport as i64, vector],
            )?;
            Ok(())
        })
        .await
    }
}
