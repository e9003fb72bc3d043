//! Dual-channel transport abstraction.
//!
//! Two implementations share [`TransportChannel`]:
//!
//! - [`PushChannel`]: duplex and persistent, wrapping a [`PushSocket`]
//!   collaborator. Probed once before first connect and reconnected with
//!   bounded, increasing delays after a drop.
//! - [`PullChannel`]: request/response. `send` is a no-op and inbound
//!   events are the deltas the poll loop fetched.
//!
//! Push payloads are JSON with hex-encoded binary fields.

use async_trait::async_trait;
use bytes::Bytes;
use chatsync_core::{now_millis, ChatId, Identity, NodeId, Nonce};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breaker::{ChannelHealth, CircuitState};
use crate::config::PushConfig;
use crate::error::{Result, SyncError};
use crate::ledger::LedgerRecord;

/// Push event names on the wire.
pub mod event_names {
    pub const MESSAGE_NEW: &str = "message:new";
    pub const CHAT_STATE: &str = "chat:state";
    pub const TYPING: &str = "typing";
    pub const PRESENCE: &str = "presence";
}

/// Which implementation a channel is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportKind {
    Push,
    Pull,
}

/// Transport mode chosen for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportMode {
    /// Push channel connected, polling as a safety net.
    Push,
    /// Push unavailable; polling only for the rest of the session.
    PullOnly,
}

/// Decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message { chat_id: ChatId, record: LedgerRecord },
    ChatState { chat_id: ChatId, record: LedgerRecord },
    Typing { chat_id: ChatId, node_id: NodeId, typing: bool },
    Presence { node_id: NodeId, online: bool },
    /// Records fetched by a poll cycle.
    Delta { chat_id: ChatId, records: Vec<LedgerRecord> },
    Disconnected { reason: String },
    Reconnected,
    /// Reconnects exhausted; the channel stays down for the session.
    Unavailable { reason: String },
}

/// Callback for inbound events. Must not block.
pub type EventHandler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Uniform contract for push and pull transports.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self, identity: &Identity) -> Result<()>;

    async fn disconnect(&self);

    async fn send(&self, event: &str, payload: Bytes) -> Result<()>;

    async fn on_event(&self, handler: EventHandler);

    async fn is_available(&self) -> bool;

    /// Start receiving events for a chat.
    async fn subscribe(&self, _chat_id: &ChatId) -> Result<()> {
        Ok(())
    }

    async fn unsubscribe(&self, _chat_id: &ChatId) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> ChannelHealth;
}

/// Probe the push channel once and pick the session's mode.
pub async fn select_transport(push: Option<&Arc<dyn TransportChannel>>) -> TransportMode {
    match push {
        Some(push) if push.is_available().await => TransportMode::Push,
        Some(_) => {
            warn!("push channel unavailable, falling back to pull-only");
            TransportMode::PullOnly
        }
        None => TransportMode::PullOnly,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

/// JSON payload encoding for push events.
pub mod wire {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct RecordPayload {
        chat_id: String,
        ciphertext: String,
        nonce: String,
        sender_commitment: String,
        timestamp: i64,
    }

    #[derive(Serialize, Deserialize)]
    struct TypingPayload {
        chat_id: String,
        node_id: String,
        typing: bool,
    }

    #[derive(Serialize, Deserialize)]
    struct PresencePayload {
        node_id: String,
        online: bool,
    }

    fn to_json<T: Serialize>(value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))
    }

    fn from_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(|e| SyncError::InvalidPayload(e.to_string()))
    }

    /// Encode a sealed record for `message:new` or `chat:state`.
    pub fn encode_record(chat_id: &ChatId, record: &LedgerRecord) -> Result<Bytes> {
        to_json(&RecordPayload {
            chat_id: chat_id.to_string(),
            ciphertext: hex::encode(&record.ciphertext),
            nonce: record.nonce.to_hex(),
            sender_commitment: record.sender_commitment.clone(),
            timestamp: record.timestamp,
        })
    }

    pub fn encode_typing(chat_id: &ChatId, node_id: &NodeId, typing: bool) -> Result<Bytes> {
        to_json(&TypingPayload {
            chat_id: chat_id.to_string(),
            node_id: node_id.to_string(),
            typing,
        })
    }

    pub fn encode_presence(node_id: &NodeId, online: bool) -> Result<Bytes> {
        to_json(&PresencePayload {
            node_id: node_id.to_string(),
            online,
        })
    }

    fn decode_record(payload: &[u8]) -> Result<(ChatId, LedgerRecord)> {
        let p: RecordPayload = from_json(payload)?;
        let ciphertext =
            hex::decode(&p.ciphertext).map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
        let nonce = Nonce::from_hex(&p.nonce)?;
        Ok((
            ChatId::new(p.chat_id),
            LedgerRecord {
                ciphertext: Bytes::from(ciphertext),
                nonce,
                sender_commitment: p.sender_commitment,
                timestamp: p.timestamp,
            },
        ))
    }

    /// Decode a named push frame.
    pub fn decode(event: &str, payload: &[u8]) -> Result<ChannelEvent> {
        match event {
            event_names::MESSAGE_NEW => {
                let (chat_id, record) = decode_record(payload)?;
                Ok(ChannelEvent::Message { chat_id, record })
            }
            event_names::CHAT_STATE => {
                let (chat_id, record) = decode_record(payload)?;
                Ok(ChannelEvent::ChatState { chat_id, record })
            }
            event_names::TYPING => {
                let p: TypingPayload = from_json(payload)?;
                Ok(ChannelEvent::Typing {
                    chat_id: ChatId::new(p.chat_id),
                    node_id: NodeId::new(p.node_id),
                    typing: p.typing,
                })
            }
            event_names::PRESENCE => {
                let p: PresencePayload = from_json(payload)?;
                Ok(ChannelEvent::Presence {
                    node_id: NodeId::new(p.node_id),
                    online: p.online,
                })
            }
            other => Err(SyncError::InvalidPayload(format!("unknown event {:?}", other))),
        }
    }

    /// Chat a payload is addressed to, if any. Used for room routing.
    pub fn chat_of(payload: &[u8]) -> Option<ChatId> {
        let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
        value.get("chat_id")?.as_str().map(ChatId::from)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Push
// ─────────────────────────────────────────────────────────────────────────────

/// A raw frame on the push socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketFrame {
    pub event: String,
    pub payload: Bytes,
}

/// The external duplex socket the push channel wraps.
#[async_trait]
pub trait PushSocket: Send + Sync {
    /// Cheap reachability check.
    async fn probe(&self) -> Result<()>;

    /// Open a session; inbound frames arrive on the returned receiver,
    /// which closes when the connection drops.
    async fn open(&self, node_id: &NodeId) -> Result<mpsc::Receiver<SocketFrame>>;

    async fn close(&self);

    async fn emit(&self, event: &str, payload: Bytes) -> Result<()>;

    async fn join(&self, chat_id: &ChatId) -> Result<()>;

    async fn leave(&self, chat_id: &ChatId) -> Result<()>;

    async fn heartbeat(&self) -> Result<()>;
}

struct PushState {
    probed: Option<bool>,
    gave_up: bool,
    reader: Option<JoinHandle<()>>,
    health: ChannelHealth,
}

struct PushInner {
    socket: Arc<dyn PushSocket>,
    config: PushConfig,
    handlers: RwLock<Vec<EventHandler>>,
    rooms: Mutex<BTreeSet<ChatId>>,
    state: Mutex<PushState>,
}

/// Persistent push channel.
pub struct PushChannel {
    inner: Arc<PushInner>,
}

impl PushChannel {
    pub fn new(socket: Arc<dyn PushSocket>, config: PushConfig) -> Self {
        let health = ChannelHealth::new(config.reconnect_base_delay);
        Self {
            inner: Arc::new(PushInner {
                socket,
                config,
                handlers: RwLock::new(Vec::new()),
                rooms: Mutex::new(BTreeSet::new()),
                state: Mutex::new(PushState {
                    probed: None,
                    gave_up: false,
                    reader: None,
                    health,
                }),
            }),
        }
    }
}

impl PushInner {
    async fn dispatch(&self, event: ChannelEvent) {
        for handler in self.handlers.read().await.iter() {
            handler(event.clone());
        }
    }

    async fn rejoin_rooms(&self) {
        for chat_id in self.rooms.lock().await.iter() {
            if let Err(e) = self.socket.join(chat_id).await {
                warn!(chat = %chat_id, error = %e, "failed to rejoin room");
            }
        }
    }

    fn reconnect_delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config.reconnect_base_delay.saturating_mul(factor)
    }

    /// Bounded reconnect with doubling delays. `None` once attempts are
    /// exhausted.
    async fn reconnect(&self, node_id: &NodeId) -> Option<mpsc::Receiver<SocketFrame>> {
        for attempt in 1..=self.config.reconnect_attempts {
            let delay = self.reconnect_delay(attempt);
            self.state.lock().await.health.current_delay = delay;
            tokio::time::sleep(delay).await;

            match self.socket.open(node_id).await {
                Ok(rx) => {
                    info!(attempt, "push channel reconnected");
                    {
                        let mut state = self.state.lock().await;
                        state.health.connected = true;
                        state.health.consecutive_failures = 0;
                        state.health.current_delay = self.config.reconnect_base_delay;
                        state.health.last_activity = Some(now_millis());
                    }
                    self.rejoin_rooms().await;
                    return Some(rx);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "push reconnect failed");
                    self.state.lock().await.health.consecutive_failures += 1;
                }
            }
        }
        None
    }

    async fn read_loop(self: Arc<Self>, mut rx: mpsc::Receiver<SocketFrame>, node_id: NodeId) {
        loop {
            let period = self.config.heartbeat_interval;
            let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

            let reason = loop {
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => {
                            self.state.lock().await.health.last_activity = Some(now_millis());
                            match wire::decode(&frame.event, &frame.payload) {
                                Ok(event) => self.dispatch(event).await,
                                Err(e) => warn!(event = %frame.event, error = %e, "dropping malformed push frame"),
                            }
                        }
                        None => break "socket closed".to_string(),
                    },
                    _ = heartbeat.tick() => {
                        if let Err(e) = self.socket.heartbeat().await {
                            break format!("heartbeat failed: {}", e);
                        }
                    }
                }
            };

            warn!(%reason, "push channel dropped");
            self.state.lock().await.health.connected = false;
            self.dispatch(ChannelEvent::Disconnected {
                reason: reason.clone(),
            })
            .await;

            match self.reconnect(&node_id).await {
                Some(next) => {
                    rx = next;
                    self.dispatch(ChannelEvent::Reconnected).await;
                }
                None => {
                    {
                        let mut state = self.state.lock().await;
                        state.gave_up = true;
                        state.health.circuit = CircuitState::Open;
                    }
                    let reason = format!(
                        "gave up after {} reconnect attempts",
                        self.config.reconnect_attempts
                    );
                    warn!(%reason, "push channel unavailable for this session");
                    self.dispatch(ChannelEvent::Unavailable { reason }).await;
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl TransportChannel for PushChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    async fn connect(&self, identity: &Identity) -> Result<()> {
        if !self.is_available().await {
            return Err(SyncError::TransportUnavailable("push probe failed".into()));
        }

        let node_id = identity.node_id();
        let rx = self.inner.socket.open(&node_id).await.map_err(|e| {
            SyncError::Transport(format!("push connect failed: {}", e))
        })?;
        self.inner.rejoin_rooms().await;

        let mut state = self.inner.state.lock().await;
        if let Some(old) = state.reader.take() {
            old.abort();
        }
        state.health.connected = true;
        state.health.last_activity = Some(now_millis());
        state.reader = Some(tokio::spawn(self.inner.clone().read_loop(rx, node_id)));
        debug!("push channel connected");
        Ok(())
    }

    async fn disconnect(&self) {
        let reader = {
            let mut state = self.inner.state.lock().await;
            state.health.connected = false;
            state.reader.take()
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        self.inner.socket.close().await;
    }

    async fn send(&self, event: &str, payload: Bytes) -> Result<()> {
        if !self.inner.state.lock().await.health.connected {
            return Err(SyncError::Transport("push channel not connected".into()));
        }
        self.inner.socket.emit(event, payload).await
    }

    async fn on_event(&self, handler: EventHandler) {
        self.inner.handlers.write().await.push(handler);
    }

    /// Probes at most once per session; the answer is cached.
    async fn is_available(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.gave_up {
            return false;
        }
        if let Some(available) = state.probed {
            return available;
        }

        let probe = tokio::time::timeout(self.inner.config.probe_timeout, self.inner.socket.probe());
        let available = match probe.await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "push probe failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?self.inner.config.probe_timeout, "push probe timed out");
                false
            }
        };
        state.probed = Some(available);
        if !available {
            state.health.circuit = CircuitState::Open;
        }
        available
    }

    async fn subscribe(&self, chat_id: &ChatId) -> Result<()> {
        let inserted = self.inner.rooms.lock().await.insert(chat_id.clone());
        let connected = self.inner.state.lock().await.health.connected;
        if inserted && connected {
            self.inner.socket.join(chat_id).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, chat_id: &ChatId) -> Result<()> {
        let removed = self.inner.rooms.lock().await.remove(chat_id);
        let connected = self.inner.state.lock().await.health.connected;
        if removed && connected {
            self.inner.socket.leave(chat_id).await?;
        }
        Ok(())
    }

    async fn health(&self) -> ChannelHealth {
        self.inner.state.lock().await.health.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pull
// ─────────────────────────────────────────────────────────────────────────────

/// Request/response channel fed by the poll loop.
pub struct PullChannel {
    handlers: RwLock<Vec<EventHandler>>,
    health: Mutex<ChannelHealth>,
}

impl PullChannel {
    pub fn new(base_delay: std::time::Duration) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            health: Mutex::new(ChannelHealth::new(base_delay)),
        }
    }

    /// Hand fetched records to subscribers as a synthetic delta event.
    pub async fn deliver(&self, chat_id: &ChatId, records: &[LedgerRecord]) {
        self.health.lock().await.last_activity = Some(now_millis());
        let handlers = self.handlers.read().await;
        if handlers.is_empty() {
            return;
        }
        let event = ChannelEvent::Delta {
            chat_id: chat_id.clone(),
            records: records.to_vec(),
        };
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

#[async_trait]
impl TransportChannel for PullChannel {
    fn kind(&self) -> TransportKind {
        TransportKind::Pull
    }

    async fn connect(&self, _identity: &Identity) -> Result<()> {
        self.health.lock().await.connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        self.health.lock().await.connected = false;
    }

    async fn send(&self, event: &str, _payload: Bytes) -> Result<()> {
        debug!(event, "pull channel ignores send");
        Ok(())
    }

    async fn on_event(&self, handler: EventHandler) {
        self.handlers.write().await.push(handler);
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn health(&self) -> ChannelHealth {
        self.health.lock().await.clone()
    }
}

/// An in-memory push server for tests and local simulations.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct Client {
        tx: mpsc::Sender<SocketFrame>,
        rooms: HashSet<ChatId>,
    }

    #[derive(Default)]
    struct HubInner {
        unreachable: AtomicBool,
        refuse_open: AtomicBool,
        next_id: AtomicU64,
        clients: Mutex<HashMap<u64, Client>>,
    }

    /// Routes frames between connected sockets by room.
    #[derive(Default, Clone)]
    pub struct MemoryPushHub {
        inner: Arc<HubInner>,
    }

    impl MemoryPushHub {
        pub fn new() -> Self {
            Self::default()
        }

        /// A new client socket attached to this hub.
        pub fn socket(&self) -> Arc<MemoryPushSocket> {
            Arc::new(MemoryPushSocket {
                hub: self.inner.clone(),
                id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            })
        }

        /// Probes and heartbeats fail while unreachable.
        pub fn set_reachable(&self, reachable: bool) {
            self.inner.unreachable.store(!reachable, Ordering::SeqCst);
        }

        /// Refuse new sessions without failing probes.
        pub fn refuse_connections(&self, refuse: bool) {
            self.inner.refuse_open.store(refuse, Ordering::SeqCst);
        }

        /// Drop every open session.
        pub async fn drop_all(&self) {
            self.inner.clients.lock().await.clear();
        }

        pub async fn connected_clients(&self) -> usize {
            self.inner.clients.lock().await.len()
        }
    }

    /// One client's socket.
    pub struct MemoryPushSocket {
        hub: Arc<HubInner>,
        id: u64,
    }

    impl MemoryPushSocket {
        fn reachable(&self) -> bool {
            !self.hub.unreachable.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushSocket for MemoryPushSocket {
        async fn probe(&self) -> Result<()> {
            if self.reachable() {
                Ok(())
            } else {
                Err(SyncError::TransportUnavailable("hub unreachable".into()))
            }
        }

        async fn open(&self, _node_id: &NodeId) -> Result<mpsc::Receiver<SocketFrame>> {
            if !self.reachable() || self.hub.refuse_open.load(Ordering::SeqCst) {
                return Err(SyncError::Transport("connection refused".into()));
            }
            let (tx, rx) = mpsc::channel(256);
            self.hub.clients.lock().await.insert(
                self.id,
                Client {
                    tx,
                    rooms: HashSet::new(),
                },
            );
            Ok(rx)
        }

        async fn close(&self) {
            self.hub.clients.lock().await.remove(&self.id);
        }

        async fn emit(&self, event: &str, payload: Bytes) -> Result<()> {
            let clients = self.hub.clients.lock().await;
            if !clients.contains_key(&self.id) {
                return Err(SyncError::Transport("not connected".into()));
            }
            let room = wire::chat_of(&payload);
            for (id, client) in clients.iter() {
                if *id == self.id {
                    continue;
                }
                let member = room.as_ref().map_or(true, |r| client.rooms.contains(r));
                if member {
                    let frame = SocketFrame {
                        event: event.to_string(),
                        payload: payload.clone(),
                    };
                    // A full or closed client queue drops the frame.
                    let _ = client.tx.try_send(frame);
                }
            }
            Ok(())
        }

        async fn join(&self, chat_id: &ChatId) -> Result<()> {
            match self.hub.clients.lock().await.get_mut(&self.id) {
                Some(client) => {
                    client.rooms.insert(chat_id.clone());
                    Ok(())
                }
                None => Err(SyncError::Transport("not connected".into())),
            }
        }

        async fn leave(&self, chat_id: &ChatId) -> Result<()> {
            if let Some(client) = self.hub.clients.lock().await.get_mut(&self.id) {
                client.rooms.remove(chat_id);
            }
            Ok(())
        }

        async fn heartbeat(&self) -> Result<()> {
            let connected = self.hub.clients.lock().await.contains_key(&self.id);
            if self.reachable() && connected {
                Ok(())
            } else {
                Err(SyncError::Transport("heartbeat lost".into()))
            }
        }
    }
}
