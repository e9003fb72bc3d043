//! The sync engine.
//!
//! Polls the ledger for every registered chat, merges what it finds into
//! local storage, and folds in push traffic as it arrives.
//!
//! ```text
//!   push event ──> ingest(chat) ──┐
//!                                 ├──> resolver ──> store ──> SyncEvent
//!   driver ──> run_cycle ──> ingest(chat) ──┘
//!     ^             │
//!     └── next_at ──┘   poll interval | backoff delay | breaker cool-down
//! ```
//!
//! At most one poll cycle runs at a time. Requests that arrive while a
//! cycle is in flight coalesce into a single follow-up cycle. Push traffic
//! never waits for the poll schedule; it is merged immediately under the
//! chat's write lock and schedules one follow-up poll as a safety net.

use chatsync_core::{
    ChatId, ChatState, ConflictResolver, DeliveryStatus, Identity, LamportStamp, LogicalClock,
    Message, MessageId, NodeId, SealedContent, VectorClock,
};
use chatsync_crypto::{ChatKey, CryptoBox};
use chatsync_store::{ClockSnapshot, InsertResult, Persistence};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::breaker::{Backoff, ChannelHealth, CircuitBreaker, CircuitState};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{CycleReport, SyncEvent};
use crate::ledger::{Ledger, LedgerRecord};
use crate::transport::{
    select_transport, ChannelEvent, EventHandler, PullChannel, TransportChannel, TransportMode,
};

/// Collaborators the engine is built from.
pub struct EngineParts {
    pub identity: Identity,
    pub store: Arc<dyn Persistence>,
    pub ledger: Arc<dyn Ledger>,
    pub crypto: Arc<dyn CryptoBox>,
    /// Push transport, if the host has one. Without it the engine runs
    /// pull-only.
    pub push: Option<Arc<dyn TransportChannel>>,
}

/// Per-chat write locks.
///
/// Every read-modify-write of a chat's stored messages or state happens
/// under that chat's lock.
#[derive(Default)]
pub struct ChatLocks {
    locks: Mutex<HashMap<ChatId, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock(&self, chat_id: &ChatId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(chat_id.clone())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

/// Snapshot of the engine for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub running: bool,
    /// A poll cycle is in flight.
    pub syncing: bool,
    pub mode: TransportMode,
    pub circuit: CircuitState,
    pub consecutive_failures: u32,
    pub current_delay: Duration,
    pub cycles: u64,
    pub registered_chats: usize,
    pub pull: ChannelHealth,
    pub push: Option<ChannelHealth>,
}

#[derive(Debug, Default)]
struct Schedule {
    running: bool,
    /// Bumped on every start and stop so a stale driver can tell it has
    /// been replaced.
    generation: u64,
    next_at: Option<Instant>,
    follow_up: bool,
    in_flight: bool,
}

enum Opened {
    Message(Message),
    State(ChatState),
    Undecryptable(Message),
}

struct Inner {
    config: SyncConfig,
    identity: Identity,
    node_id: NodeId,
    store: Arc<dyn Persistence>,
    ledger: Arc<dyn Ledger>,
    crypto: Arc<dyn CryptoBox>,
    push: Option<Arc<dyn TransportChannel>>,
    pull: Arc<PullChannel>,
    resolver: ConflictResolver,
    clock: Arc<Mutex<LogicalClock>>,
    locks: Arc<ChatLocks>,
    chats: RwLock<BTreeSet<ChatId>>,
    schedule: Mutex<Schedule>,
    wake: Notify,
    cycle_gate: Mutex<()>,
    breaker: Mutex<CircuitBreaker>,
    backoff: Mutex<Backoff>,
    mode: Mutex<TransportMode>,
    cycles: AtomicU64,
    events: broadcast::Sender<SyncEvent>,
    push_rx: Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    push_worker: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps local chat state converged with the ledger.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Build an engine, restoring the node's logical clock from storage.
    pub async fn open(parts: EngineParts, config: SyncConfig) -> Result<Self> {
        let node_id = parts.identity.node_id();
        let clock = match parts.store.load_clock(&node_id).await? {
            Some(snapshot) => {
                debug!(lamport = snapshot.lamport, "restored logical clock");
                LogicalClock::restore(node_id.clone(), snapshot.lamport, snapshot.vector)
            }
            None => LogicalClock::new(node_id.clone()),
        };

        let (push_tx, push_rx) = mpsc::unbounded_channel();
        if let Some(push) = &parts.push {
            let handler: EventHandler = Arc::new(move |event| {
                let _ = push_tx.send(event);
            });
            push.on_event(handler).await;
        }

        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Inner {
            pull: Arc::new(PullChannel::new(config.backoff.base)),
            breaker: Mutex::new(CircuitBreaker::new(config.breaker.clone())),
            backoff: Mutex::new(Backoff::new(config.backoff.clone())),
            config,
            identity: parts.identity,
            node_id,
            store: parts.store,
            ledger: parts.ledger,
            crypto: parts.crypto,
            push: parts.push,
            resolver: ConflictResolver::new(),
            clock: Arc::new(Mutex::new(clock)),
            locks: Arc::new(ChatLocks::default()),
            chats: RwLock::new(BTreeSet::new()),
            schedule: Mutex::new(Schedule::default()),
            wake: Notify::new(),
            cycle_gate: Mutex::new(()),
            mode: Mutex::new(TransportMode::PullOnly),
            cycles: AtomicU64::new(0),
            events,
            push_rx: Mutex::new(push_rx),
            push_worker: Mutex::new(None),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Pick a transport and start polling. The first cycle runs at once.
    /// A second call while running does nothing.
    pub async fn start(&self) {
        let inner = &self.inner;
        let generation = {
            let mut schedule = inner.schedule.lock().await;
            if schedule.running {
                debug!("sync engine already running");
                return;
            }
            schedule.running = true;
            schedule.generation += 1;
            schedule.follow_up = true;
            schedule.next_at = None;
            schedule.generation
        };

        if let Err(e) = inner.pull.connect(&inner.identity).await {
            warn!(error = %e, "pull channel failed to connect");
        }
        let mode = inner.connect_push().await;
        *inner.mode.lock().await = mode;

        if mode == TransportMode::Push {
            let worker = tokio::spawn(inner.clone().push_worker());
            if let Some(old) = inner.push_worker.lock().await.replace(worker) {
                old.abort();
            }
        }
        tokio::spawn(inner.clone().drive(generation));
        info!(node = %inner.node_id, ?mode, "sync engine started");
    }

    /// Stop polling and tear down transports. A cycle already in flight is
    /// allowed to finish; no new one starts.
    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut schedule = inner.schedule.lock().await;
            if !schedule.running {
                return;
            }
            schedule.running = false;
            schedule.generation += 1;
            schedule.next_at = None;
            schedule.follow_up = false;
        }
        inner.wake.notify_one();

        if let Some(worker) = inner.push_worker.lock().await.take() {
            worker.abort();
        }
        let mode = std::mem::replace(&mut *inner.mode.lock().await, TransportMode::PullOnly);
        if let (TransportMode::Push, Some(push)) = (mode, &inner.push) {
            push.disconnect().await;
        }
        inner.pull.disconnect().await;
        info!(node = %inner.node_id, "sync engine stopped");
    }

    /// Run a cycle as soon as possible. Calls made while a cycle is in
    /// flight collapse into one follow-up. Ignored while stopped.
    pub async fn sync_now(&self) {
        self.inner.request_cycle(None).await;
    }

    /// Clear the breaker and backoff, then poll immediately if running.
    pub async fn reset(&self) {
        self.inner.breaker.lock().await.reset();
        self.inner.backoff.lock().await.reset();
        info!("sync breaker and backoff reset");
        self.inner.request_cycle(None).await;
    }

    /// Run one poll cycle now, outside the schedule. Waits for any cycle
    /// already in flight.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.inner.run_cycle().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chats
    // ─────────────────────────────────────────────────────────────────────────

    /// Include a chat in polling and push subscriptions.
    pub async fn register_chat(&self, chat_id: ChatId) {
        let inserted = self.inner.chats.write().await.insert(chat_id.clone());
        if !inserted {
            return;
        }
        if let Some(push) = self.inner.active_push().await {
            if let Err(e) = push.subscribe(&chat_id).await {
                warn!(chat = %chat_id, error = %e, "push subscribe failed");
            }
        }
        debug!(chat = %chat_id, "chat registered");
    }

    pub async fn unregister_chat(&self, chat_id: &ChatId) {
        let removed = self.inner.chats.write().await.remove(chat_id);
        if !removed {
            return;
        }
        if let Some(push) = self.inner.active_push().await {
            if let Err(e) = push.unsubscribe(chat_id).await {
                warn!(chat = %chat_id, error = %e, "push unsubscribe failed");
            }
        }
    }

    pub async fn registered_chats(&self) -> Vec<ChatId> {
        self.inner.chats.read().await.iter().cloned().collect()
    }

    /// Merge records for one chat as if they had just been fetched.
    pub async fn ingest(&self, chat_id: &ChatId, records: Vec<LedgerRecord>) -> Result<CycleReport> {
        self.inner.ingest(chat_id, records).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shared state for the orchestrator
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Broadcast an event to every subscriber.
    pub fn publish(&self, event: SyncEvent) {
        self.inner.emit(event);
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.inner.store
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.inner.ledger
    }

    pub fn crypto(&self) -> &Arc<dyn CryptoBox> {
        &self.inner.crypto
    }

    pub fn locks(&self) -> &Arc<ChatLocks> {
        &self.inner.locks
    }

    pub fn clock(&self) -> &Arc<Mutex<LogicalClock>> {
        &self.inner.clock
    }

    /// Advance the logical clock for a local event and persist it.
    pub async fn tick(&self) -> Result<(LamportStamp, VectorClock)> {
        let (stamp, vector, snapshot) = {
            let mut clock = self.inner.clock.lock().await;
            let (stamp, vector) = clock.tick();
            let snapshot = ClockSnapshot {
                lamport: clock.lamport(),
                vector: clock.vector().clone(),
            };
            (stamp, vector, snapshot)
        };
        self.inner.store.save_clock(&self.inner.node_id, &snapshot).await?;
        Ok((stamp, vector))
    }

    /// The pull channel. Handlers registered on it see every batch a poll
    /// cycle fetches, before it is merged.
    pub fn pull_channel(&self) -> Arc<PullChannel> {
        self.inner.pull.clone()
    }

    /// The push channel, when the session is in push mode.
    pub async fn active_push(&self) -> Option<Arc<dyn TransportChannel>> {
        self.inner.active_push().await
    }

    pub async fn mode(&self) -> TransportMode {
        *self.inner.mode.lock().await
    }

    pub async fn health(&self) -> EngineHealth {
        let inner = &self.inner;
        let (running, syncing) = {
            let schedule = inner.schedule.lock().await;
            (schedule.running, schedule.in_flight)
        };
        let (circuit, consecutive_failures) = {
            let breaker = inner.breaker.lock().await;
            (breaker.state(), breaker.consecutive_failures())
        };
        let current_delay = inner.backoff.lock().await.current_delay();

        let mut pull = inner.pull.health().await;
        pull.circuit = circuit;
        pull.consecutive_failures = consecutive_failures;
        pull.current_delay = current_delay;

        let push = match &inner.push {
            Some(push) => Some(push.health().await),
            None => None,
        };

        EngineHealth {
            running,
            syncing,
            mode: *inner.mode.lock().await,
            circuit,
            consecutive_failures,
            current_delay,
            cycles: inner.cycles.load(Ordering::SeqCst),
            registered_chats: inner.chats.read().await.len(),
            pull,
            push,
        }
    }
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn active_push(&self) -> Option<Arc<dyn TransportChannel>> {
        match *self.mode.lock().await {
            TransportMode::Push => self.push.clone(),
            TransportMode::PullOnly => None,
        }
    }

    async fn connect_push(&self) -> TransportMode {
        let push = match &self.push {
            Some(push) => push,
            None => return TransportMode::PullOnly,
        };
        if select_transport(Some(push)).await == TransportMode::PullOnly {
            return TransportMode::PullOnly;
        }
        if let Err(e) = push.connect(&self.identity).await {
            warn!(error = %e, "push connect failed, falling back to pull-only");
            return TransportMode::PullOnly;
        }
        for chat_id in self.chats.read().await.iter() {
            if let Err(e) = push.subscribe(chat_id).await {
                warn!(chat = %chat_id, error = %e, "push subscribe failed");
            }
        }
        TransportMode::Push
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// `None` runs a cycle as soon as possible, `Some(delay)` no later than
    /// `delay` from now.
    async fn request_cycle(&self, delay: Option<Duration>) {
        {
            let mut schedule = self.schedule.lock().await;
            if !schedule.running {
                debug!("sync engine not running, cycle request ignored");
                return;
            }
            match delay {
                None => schedule.follow_up = true,
                Some(delay) => {
                    let at = Instant::now() + delay;
                    schedule.next_at = Some(schedule.next_at.map_or(at, |next| next.min(at)));
                }
            }
        }
        self.wake.notify_one();
    }

    async fn drive(self: Arc<Self>, generation: u64) {
        loop {
            let wait = {
                let mut schedule = self.schedule.lock().await;
                if !schedule.running || schedule.generation != generation {
                    break;
                }
                if schedule.follow_up {
                    None
                } else {
                    match schedule.next_at {
                        Some(at) if at <= Instant::now() => None,
                        other => Some(other),
                    }
                }
            };

            if let Some(deadline) = wait {
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {}
                            _ = self.wake.notified() => {}
                        }
                    }
                    None => self.wake.notified().await,
                }
                continue;
            }

            {
                let mut schedule = self.schedule.lock().await;
                schedule.follow_up = false;
                schedule.next_at = None;
                schedule.in_flight = true;
            }

            let outcome = self.run_cycle().await;
            let next = self.next_deadline(&outcome).await;

            let mut schedule = self.schedule.lock().await;
            schedule.in_flight = false;
            if schedule.generation == generation {
                schedule.next_at = Some(schedule.next_at.map_or(next, |at| at.min(next)));
            }
        }
        debug!(generation, "sync driver exited");
    }

    async fn next_deadline(&self, outcome: &Result<CycleReport>) -> Instant {
        let now = Instant::now();
        let err = match outcome {
            Ok(_) => return now + self.config.poll_interval,
            Err(e) => e,
        };
        if let Some(at) = self.breaker.lock().await.retry_at() {
            return at;
        }
        if err.is_fetch_failure() {
            now + self.backoff.lock().await.current_delay()
        } else {
            now + self.config.poll_interval
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Poll cycle
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_cycle(&self) -> Result<CycleReport> {
        let _gate = self.cycle_gate.lock().await;
        self.cycles.fetch_add(1, Ordering::SeqCst);
        self.emit(SyncEvent::SyncStart);

        if !self.breaker.lock().await.allow_request() {
            debug!("circuit breaker open, skipping fetch");
            self.emit(SyncEvent::SyncError {
                message: SyncError::BreakerOpen.to_string(),
            });
            return Err(SyncError::BreakerOpen);
        }

        let chats: Vec<ChatId> = self.chats.read().await.iter().cloned().collect();
        let mut report = CycleReport {
            chats: chats.len(),
            ..CycleReport::default()
        };

        for chat_id in &chats {
            let records = match self.fetch(chat_id).await {
                Ok(records) => records,
                Err(e) => {
                    self.breaker.lock().await.record_failure();
                    let delay = self.backoff.lock().await.record_failure();
                    warn!(chat = %chat_id, error = %e, ?delay, "ledger fetch failed");
                    self.emit(SyncEvent::SyncError {
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            };

            self.pull.deliver(chat_id, &records).await;
            match self.ingest(chat_id, records).await {
                Ok(merged) => report.absorb(&merged),
                Err(e) => {
                    warn!(chat = %chat_id, error = %e, "merge failed");
                    self.emit(SyncEvent::SyncError {
                        message: e.to_string(),
                    });
                }
            }
        }

        self.breaker.lock().await.record_success();
        self.backoff.lock().await.reset();
        debug!(
            chats = report.chats,
            new = report.new_messages,
            duplicates = report.duplicates,
            "sync cycle complete"
        );
        self.emit(SyncEvent::SyncSuccess(report.clone()));
        Ok(report)
    }

    async fn fetch(&self, chat_id: &ChatId) -> Result<Vec<LedgerRecord>> {
        match tokio::time::timeout(self.config.fetch_timeout, self.ledger.query(chat_id)).await {
            Ok(result) => result.map_err(SyncError::into_fetch_failure),
            Err(_) => Err(SyncError::Timeout(format!(
                "ledger query for {} exceeded {:?}",
                chat_id, self.config.fetch_timeout
            ))),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Merge
    // ─────────────────────────────────────────────────────────────────────────

    async fn ingest(&self, chat_id: &ChatId, records: Vec<LedgerRecord>) -> Result<CycleReport> {
        let _guard = self.locks.lock(chat_id).await;
        let key = self.crypto.derive_key(chat_id, &self.identity).await?;

        let mut incoming = Vec::new();
        let mut states = Vec::new();
        // Placeholder ids of records that open now.
        let mut opened = BTreeSet::new();
        let mut report = CycleReport::default();
        for record in records {
            let placeholder_id = MessageId::for_undecryptable(&record.nonce, &record.ciphertext);
            match self.open_record(chat_id, &key, record).await {
                Opened::Message(message) => {
                    opened.insert(placeholder_id);
                    incoming.push(message);
                }
                Opened::State(state) => {
                    opened.insert(placeholder_id);
                    states.push(state);
                }
                Opened::Undecryptable(message) => {
                    report.undecryptable += 1;
                    incoming.push(message);
                }
            }
        }

        let mut chat = self
            .store
            .get_chat(chat_id)
            .await?
            .unwrap_or_else(|| ChatState::new(chat_id.clone()));
        incoming.retain(|m| !chat.is_cleared(m));

        let mut local = self.store.get_messages(chat_id).await?;
        let before = chat.clone();
        let recovered = self.drop_recovered(&mut local, &opened).await?;
        if recovered > 0 {
            debug!(chat = %chat_id, recovered, "replacing placeholders of records that now open");
        }
        let resolution = self.resolver.resolve_messages(&local, &incoming);
        if resolution.report.is_conflict() {
            info!(
                chat = %chat_id,
                strategy = %resolution.report.strategy,
                affected = ?resolution.report.affected,
                "resolved concurrent message updates"
            );
        }
        report.duplicates = resolution.report.duplicates;
        report.conflicts = resolution.report.conflicts;

        let existing: HashMap<&MessageId, &Message> = local.iter().map(|m| (&m.id, m)).collect();
        let mut fresh = Vec::new();
        for merged in resolution.merged {
            match existing.get(&merged.id) {
                None => {
                    if self.store.add_message(&merged).await? == InsertResult::Inserted {
                        fresh.push(merged);
                    }
                }
                Some(before) if **before != merged => {
                    self.store.update_message(&merged).await?;
                    if before.status != merged.status {
                        self.on_status_change(before, &merged).await?;
                    }
                }
                Some(_) => {}
            }
        }

        if !fresh.is_empty() {
            self.observe(&fresh).await?;
        }
        report.new_messages = fresh.len();

        chat.apply_new_messages(fresh.iter(), &self.node_id);
        for remote in &states {
            if same_replicated_state(&chat, remote) {
                continue;
            }
            let resolution = self.resolver.resolve_group_state(&chat, remote);
            if resolution.report.is_conflict() {
                info!(
                    chat = %chat_id,
                    conflict = ?resolution.report.conflict_type,
                    "merged concurrent chat state"
                );
                report.conflicts += 1;
            }
            // Unread, recency and the clear watermark are local facts; a
            // dominating remote copy must not erase them.
            let unread = chat.unread_count;
            let last_message_time = chat.last_message_time;
            let cleared_before = chat.cleared_before;
            chat = resolution.merged;
            chat.unread_count = unread;
            chat.last_message_time = chat.last_message_time.max(last_message_time);
            chat.cleared_before = cleared_before;
        }

        if !fresh.is_empty() {
            self.emit(SyncEvent::NewMessages {
                chat_id: chat_id.clone(),
                messages: fresh,
            });
        }
        if chat != before {
            self.store.update_chat(&chat).await?;
            self.emit(SyncEvent::ChatUpdated { chat });
        }
        Ok(report)
    }

    /// Delete stored placeholders whose record has since opened, so the
    /// decrypted copy replaces them. Returns how many were dropped.
    async fn drop_recovered(
        &self,
        local: &mut Vec<Message>,
        opened: &BTreeSet<MessageId>,
    ) -> Result<usize> {
        let mut dropped = 0;
        for message in local.iter().filter(|m| m.undecryptable && opened.contains(&m.id)) {
            if self.store.remove_message(&message.id).await? {
                dropped += 1;
            }
        }
        if dropped > 0 {
            local.retain(|m| !(m.undecryptable && opened.contains(&m.id)));
        }
        Ok(dropped)
    }

    async fn open_record(&self, chat_id: &ChatId, key: &ChatKey, record: LedgerRecord) -> Opened {
        let plaintext = match self.crypto.decrypt(&record.ciphertext, &record.nonce, key).await {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(chat = %chat_id, error = %e, "keeping undecryptable record");
                return Opened::Undecryptable(placeholder(chat_id, record));
            }
        };

        match SealedContent::from_bytes(&plaintext) {
            Ok(SealedContent::Message(envelope)) if &envelope.chat_id == chat_id => {
                let status = if envelope.sender_id == self.node_id {
                    DeliveryStatus::Sent
                } else {
                    DeliveryStatus::Delivered
                };
                Opened::Message(envelope.into_message(
                    record.ciphertext,
                    record.nonce,
                    record.sender_commitment,
                    status,
                ))
            }
            Ok(SealedContent::ChatState(state)) if &state.id == chat_id => Opened::State(state),
            Ok(other) => {
                warn!(chat = %chat_id, sealed_for = %other.chat_id(), "record sealed for another chat");
                Opened::Undecryptable(placeholder(chat_id, record))
            }
            Err(e) => {
                warn!(chat = %chat_id, error = %e, "sealed content failed to decode");
                Opened::Undecryptable(placeholder(chat_id, record))
            }
        }
    }

    async fn on_status_change(&self, before: &Message, after: &Message) -> Result<()> {
        let confirmed = matches!(
            after.status,
            DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Read
        );
        if after.is_from(&self.node_id) && confirmed {
            self.store.remove_outbox(&after.id).await?;
            debug!(message = %after.id, "own message confirmed on ledger");
        }
        debug!(
            message = %after.id,
            from = before.status.as_str(),
            to = after.status.as_str(),
            "status advanced by merge"
        );
        self.emit(SyncEvent::StatusChanged {
            chat_id: after.chat_id.clone(),
            message_id: after.id.clone(),
            status: after.status,
        });
        Ok(())
    }

    /// Fold each newly seen stamp into the local clock once.
    async fn observe(&self, fresh: &[Message]) -> Result<()> {
        let snapshot = {
            let mut clock = self.clock.lock().await;
            for message in fresh.iter().filter(|m| !m.undecryptable) {
                clock.observe(&message.lamport, &message.vector);
            }
            ClockSnapshot {
                lamport: clock.lamport(),
                vector: clock.vector().clone(),
            }
        };
        self.store.save_clock(&self.node_id, &snapshot).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Push
    // ─────────────────────────────────────────────────────────────────────────

    async fn push_worker(self: Arc<Self>) {
        let mut rx = self.push_rx.lock().await;
        while let Some(event) = rx.recv().await {
            self.handle_push_event(event).await;
        }
    }

    async fn handle_push_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message { chat_id, record } | ChannelEvent::ChatState { chat_id, record } => {
                if !self.chats.read().await.contains(&chat_id) {
                    debug!(chat = %chat_id, "push record for unregistered chat");
                    return;
                }
                if let Err(e) = self.ingest(&chat_id, vec![record]).await {
                    warn!(chat = %chat_id, error = %e, "push merge failed");
                    self.emit(SyncEvent::SyncError {
                        message: e.to_string(),
                    });
                }
                self.request_cycle(Some(self.config.push_follow_up)).await;
            }
            ChannelEvent::Typing {
                chat_id,
                node_id,
                typing,
            } => self.emit(SyncEvent::Typing {
                chat_id,
                node_id,
                typing,
            }),
            ChannelEvent::Presence { node_id, online } => {
                self.emit(SyncEvent::Presence { node_id, online })
            }
            ChannelEvent::Disconnected { reason } => {
                self.emit(SyncEvent::ConnectionLost { reason });
            }
            ChannelEvent::Reconnected => {
                self.emit(SyncEvent::ConnectionRestored);
                self.request_cycle(None).await;
            }
            ChannelEvent::Unavailable { reason } => {
                warn!(%reason, "push channel gone for this session, polling only");
                *self.mode.lock().await = TransportMode::PullOnly;
            }
            ChannelEvent::Delta { chat_id, .. } => {
                debug!(chat = %chat_id, "delta on push channel ignored");
            }
        }
    }
}

/// Whether a remote chat state carries nothing new: same history and the
/// same replicated fields.
fn same_replicated_state(local: &ChatState, remote: &ChatState) -> bool {
    local.vector == remote.vector
        && local.name == remote.name
        && local.avatar == remote.avatar
        && local.participants == remote.participants
}

/// Local stand-in for a record that failed to open. Kept so history stays
/// complete. Once the record opens, `ingest` replaces it with the real
/// message.
fn placeholder(chat_id: &ChatId, record: LedgerRecord) -> Message {
    let sender_id = NodeId::new(record.sender_commitment.clone());
    Message {
        id: MessageId::for_undecryptable(&record.nonce, &record.ciphertext),
        chat_id: chat_id.clone(),
        plaintext: None,
        lamport: LamportStamp::new(0, sender_id.clone()),
        vector: VectorClock::new(),
        sender_id,
        sender_commitment: record.sender_commitment,
        timestamp: record.timestamp,
        ciphertext: record.ciphertext,
        nonce: record.nonce,
        status: DeliveryStatus::Delivered,
        reply_to: None,
        version: 0,
        undecryptable: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushConfig;
    use crate::ledger::memory::MemoryLedger;
    use crate::transport::memory::MemoryPushHub;
    use crate::transport::{event_names, wire, PushChannel};
    use bytes::Bytes;
    use chatsync_core::{MessageEnvelope, Nonce};
    use chatsync_crypto::ChaChaBox;
    use chatsync_store::{MemoryStore, OutboxEntry};
    use tokio::time::sleep;

    const SECRET: [u8; 32] = [7; 32];
    const LOCAL_SEED: u8 = 1;
    const PEER_SEED: u8 = 2;

    struct Harness {
        engine: SyncEngine,
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        crypto: Arc<ChaChaBox>,
        chat: ChatId,
    }

    async fn harness(config: SyncConfig, push: Option<Arc<dyn TransportChannel>>) -> Harness {
        let h = keyless_harness(config, push).await;
        h.crypto.set_group_secret(h.chat.clone(), SECRET).await;
        h
    }

    /// An engine that has not been given the group secret yet.
    async fn keyless_harness(
        config: SyncConfig,
        push: Option<Arc<dyn TransportChannel>>,
    ) -> Harness {
        let _ = tracing_subscriber::fmt::try_init();
        let chat: ChatId = "group".into();
        let crypto = Arc::new(ChaChaBox::new());
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryLedger::new());

        let engine = SyncEngine::open(
            EngineParts {
                identity: Identity::from_seed(&[LOCAL_SEED; 32]),
                store: store.clone(),
                ledger: ledger.clone(),
                crypto: crypto.clone(),
                push,
            },
            config,
        )
        .await
        .unwrap();
        engine.register_chat(chat.clone()).await;

        Harness {
            engine,
            store,
            ledger,
            crypto,
            chat,
        }
    }

    /// A ledger that is reachable but rejects every query at the
    /// transport level.
    #[derive(Default)]
    struct ResettingLedger {
        queries: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Ledger for ResettingLedger {
        async fn submit(&self, _chat_id: &ChatId, _record: &LedgerRecord) -> Result<String> {
            Err(SyncError::Transport("connection reset".into()))
        }

        async fn query(&self, _chat_id: &ChatId) -> Result<Vec<LedgerRecord>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Transport("connection reset".into()))
        }
    }

    async fn sealed(
        chat: &ChatId,
        seed: u8,
        id: &str,
        counter: u64,
        body: &str,
    ) -> (LedgerRecord, MessageEnvelope) {
        let identity = Identity::from_seed(&[seed; 32]);
        let node = identity.node_id();
        let envelope = MessageEnvelope {
            id: id.into(),
            chat_id: chat.clone(),
            body: body.into(),
            sender_id: node.clone(),
            sent_at: 1_000 + counter as i64,
            lamport: LamportStamp::new(counter, node.clone()),
            vector: VectorClock::from_entries([(node, counter)]),
            reply_to: None,
        };
        let record = seal(chat, &identity, SealedContent::Message(envelope.clone())).await;
        (record, envelope)
    }

    async fn seal(chat: &ChatId, identity: &Identity, content: SealedContent) -> LedgerRecord {
        let crypto = ChaChaBox::new();
        crypto.set_group_secret(chat.clone(), SECRET).await;
        let key = crypto.derive_key(chat, identity).await.unwrap();
        let sealed = crypto
            .encrypt(&content.to_bytes().unwrap(), &key)
            .await
            .unwrap();
        LedgerRecord {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            sender_commitment: identity.commitment(),
            timestamp: 1_000,
        }
    }

    async fn remote(chat: &ChatId, id: &str, counter: u64, body: &str) -> LedgerRecord {
        sealed(chat, PEER_SEED, id, counter, body).await.0
    }

    fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn push_channel(hub: &MemoryPushHub) -> Arc<dyn TransportChannel> {
        Arc::new(PushChannel::new(hub.socket(), PushConfig::default()))
    }

    #[tokio::test]
    async fn test_cycle_merges_and_deduplicates() {
        let h = harness(SyncConfig::default(), None).await;
        let mut events = h.engine.subscribe();
        h.ledger.insert(&h.chat, remote(&h.chat, "m1", 1, "hello").await).await;
        h.ledger.insert(&h.chat, remote(&h.chat, "m2", 2, "again").await).await;

        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.new_messages, 2);
        assert_eq!(report.chats, 1);

        let again = h.engine.run_cycle().await.unwrap();
        assert_eq!(again.new_messages, 0);
        assert_eq!(again.duplicates, 2);

        let stored = h.store.get_messages(&h.chat).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|m| m.status == DeliveryStatus::Delivered));
        assert_eq!(stored[0].plaintext.as_deref(), Some("hello"));

        let chat = h.store.get_chat(&h.chat).await.unwrap().unwrap();
        assert_eq!(chat.unread_count, 2);

        let events = drain(&mut events);
        assert_eq!(events.first(), Some(&SyncEvent::SyncStart));
        let new_batches = events
            .iter()
            .filter(|e| matches!(e, SyncEvent::NewMessages { .. }))
            .count();
        assert_eq!(new_batches, 1);
    }

    #[tokio::test]
    async fn test_remote_stamps_advance_local_clock() {
        let h = harness(SyncConfig::default(), None).await;
        h.ledger.insert(&h.chat, remote(&h.chat, "m1", 41, "x").await).await;
        h.engine.run_cycle().await.unwrap();

        let (stamp, _) = h.engine.tick().await.unwrap();
        assert!(stamp.counter > 41);

        let saved = h
            .store
            .load_clock(h.engine.node_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.lamport, stamp.counter);
    }

    #[tokio::test]
    async fn test_undecryptable_record_is_kept() {
        let h = harness(SyncConfig::default(), None).await;
        h.ledger
            .insert(
                &h.chat,
                LedgerRecord {
                    ciphertext: Bytes::from_static(b"not a valid ciphertext at all"),
                    nonce: Nonce::from_bytes([9; 12]),
                    sender_commitment: "stranger".into(),
                    timestamp: 500,
                },
            )
            .await;
        h.ledger.insert(&h.chat, remote(&h.chat, "m1", 1, "readable").await).await;

        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.undecryptable, 1);
        assert_eq!(report.new_messages, 2);

        let stored = h.store.get_messages(&h.chat).await.unwrap();
        let ghost = stored.iter().find(|m| m.undecryptable).unwrap();
        assert_eq!(ghost.plaintext, None);
        assert_eq!(ghost.sender_id, NodeId::new("stranger"));

        let chat = h.store.get_chat(&h.chat).await.unwrap().unwrap();
        assert_eq!(chat.unread_count, 1);
        assert!(!chat.participants.contains(&NodeId::new("stranger")));

        let again = h.engine.run_cycle().await.unwrap();
        assert_eq!(again.new_messages, 0);
    }

    #[tokio::test]
    async fn test_own_message_confirmed_by_ledger() {
        let h = harness(SyncConfig::default(), None).await;
        let mut events = h.engine.subscribe();
        let (record, envelope) = sealed(&h.chat, LOCAL_SEED, "mine", 1, "hi").await;
        let local = envelope.into_message(
            record.ciphertext.clone(),
            record.nonce,
            record.sender_commitment.clone(),
            DeliveryStatus::Sending,
        );
        h.store
            .add_outgoing(&local, &OutboxEntry::new(&local, 1_000))
            .await
            .unwrap();
        h.ledger.insert(&h.chat, record).await;

        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.new_messages, 0);

        let stored = h.store.get_message(&local.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Sent);
        assert!(h.store.pending_outbox().await.unwrap().is_empty());
        assert!(drain(&mut events).iter().any(|e| matches!(
            e,
            SyncEvent::StatusChanged {
                status: DeliveryStatus::Sent,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_chat_state_record_merges_metadata() {
        let h = harness(SyncConfig::default(), None).await;
        let peer = Identity::from_seed(&[PEER_SEED; 32]);
        let mut state = ChatState::new(h.chat.clone())
            .with_name("Team")
            .with_participants([peer.node_id()]);
        state.vector.increment(&peer.node_id());
        state.unread_count = 9;
        h.ledger
            .insert(&h.chat, seal(&h.chat, &peer, SealedContent::chat_state(&state)).await)
            .await;
        h.ledger.insert(&h.chat, remote(&h.chat, "m1", 1, "x").await).await;

        h.engine.run_cycle().await.unwrap();

        let chat = h.store.get_chat(&h.chat).await.unwrap().unwrap();
        assert_eq!(chat.name.as_deref(), Some("Team"));
        assert!(chat.participants.contains(&peer.node_id()));
        assert_eq!(chat.unread_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_five_failures() {
        let h = harness(SyncConfig::default(), None).await;
        h.ledger.set_offline(true);
        h.engine.start().await;

        // Attempts at t = 0, 1, 3, 7, 15 (backoff 1, 2, 4, 8).
        sleep(Duration::from_millis(14_500)).await;
        assert_eq!(h.ledger.query_count(), 4);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.ledger.query_count(), 5);
        assert_eq!(h.engine.health().await.circuit, CircuitState::Open);

        // Open until t = 75.
        sleep(Duration::from_secs(59)).await;
        assert_eq!(h.ledger.query_count(), 5);

        h.ledger.set_offline(false);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.ledger.query_count(), 6);
        let health = h.engine.health().await;
        assert_eq!(health.circuit, CircuitState::Closed);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.current_delay, Duration::from_secs(1));
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let h = harness(SyncConfig::default(), None).await;
        h.ledger.set_offline(true);
        h.engine.start().await;

        sleep(Duration::from_millis(75_500)).await;
        assert_eq!(h.ledger.query_count(), 6);
        assert_eq!(h.engine.health().await.circuit, CircuitState::Open);

        sleep(Duration::from_secs(59)).await;
        assert_eq!(h.ledger.query_count(), 6);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.ledger.query_count(), 7);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_open_breaker() {
        let h = harness(SyncConfig::default(), None).await;
        h.ledger.set_offline(true);
        h.engine.start().await;
        sleep(Duration::from_millis(15_500)).await;
        assert_eq!(h.engine.health().await.circuit, CircuitState::Open);

        h.ledger.set_offline(false);
        h.engine.reset().await;
        sleep(Duration::from_millis(10)).await;
        assert_eq!(h.ledger.query_count(), 6);
        assert_eq!(h.engine.health().await.circuit, CircuitState::Closed);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_now_coalesces_while_in_flight() {
        let h = harness(SyncConfig::default(), None).await;
        h.ledger.set_latency(Some(Duration::from_secs(1))).await;
        h.engine.start().await;

        sleep(Duration::from_millis(100)).await;
        assert!(h.engine.health().await.syncing);
        for _ in 0..3 {
            h.engine.sync_now().await;
        }

        // First cycle ends at t = 1, the single follow-up at t = 2.
        sleep(Duration::from_millis(2_400)).await;
        assert_eq!(h.ledger.query_count(), 2);
        assert_eq!(h.ledger.max_concurrent_queries(), 1);

        // Then back on the regular interval.
        sleep(Duration::from_secs(4)).await;
        assert_eq!(h.ledger.query_count(), 2);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(h.ledger.query_count(), 3);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_run_cycle_is_single_flight() {
        let h = harness(SyncConfig::default(), None).await;
        h.ledger.set_latency(Some(Duration::from_secs(1))).await;

        let a = h.engine.clone();
        let b = h.engine.clone();
        let (ra, rb) = tokio::join!(a.run_cycle(), b.run_cycle());
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(h.ledger.query_count(), 2);
        assert_eq!(h.ledger.max_concurrent_queries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_counts_as_failure() {
        let config = SyncConfig {
            fetch_timeout: Duration::from_secs(2),
            ..SyncConfig::default()
        };
        let h = harness(config, None).await;
        h.ledger.set_latency(Some(Duration::from_secs(5))).await;

        let err = h.engine.run_cycle().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert_eq!(h.engine.health().await.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_polling() {
        let h = harness(SyncConfig::default(), None).await;
        h.engine.start().await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.ledger.query_count(), 1);

        h.engine.stop().await;
        h.engine.sync_now().await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(h.ledger.query_count(), 1);
        assert!(!h.engine.health().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_merges_immediately_with_one_follow_up() {
        let hub = MemoryPushHub::new();
        let h = harness(SyncConfig::default(), Some(push_channel(&hub))).await;
        h.engine.start().await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.engine.mode().await, TransportMode::Push);
        assert_eq!(h.ledger.query_count(), 1);

        let peer = PushChannel::new(hub.socket(), PushConfig::default());
        peer.connect(&Identity::from_seed(&[PEER_SEED; 32]))
            .await
            .unwrap();
        for (i, id) in ["p1", "p2", "p3"].into_iter().enumerate() {
            let record = remote(&h.chat, id, i as u64 + 1, "pushed").await;
            let payload = wire::encode_record(&h.chat, &record).unwrap();
            peer.send(event_names::MESSAGE_NEW, payload).await.unwrap();
        }

        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.store.get_messages(&h.chat).await.unwrap().len(), 3);
        assert_eq!(h.ledger.query_count(), 1);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.ledger.query_count(), 2);
        sleep(Duration::from_secs(3)).await;
        assert_eq!(h.ledger.query_count(), 2);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_during_poll_stores_one_copy() {
        let hub = MemoryPushHub::new();
        let h = harness(SyncConfig::default(), Some(push_channel(&hub))).await;
        let record = remote(&h.chat, "race", 1, "both ways").await;
        h.ledger.insert(&h.chat, record.clone()).await;
        h.ledger.set_latency(Some(Duration::from_secs(1))).await;
        let mut events = h.engine.subscribe();

        h.engine.start().await;
        let peer = PushChannel::new(hub.socket(), PushConfig::default());
        peer.connect(&Identity::from_seed(&[PEER_SEED; 32]))
            .await
            .unwrap();
        sleep(Duration::from_millis(500)).await;
        let payload = wire::encode_record(&h.chat, &record).unwrap();
        peer.send(event_names::MESSAGE_NEW, payload).await.unwrap();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.get_messages(&h.chat).await.unwrap().len(), 1);
        let announced: usize = drain(&mut events)
            .iter()
            .map(|e| match e {
                SyncEvent::NewMessages { messages, .. } => messages.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(announced, 1);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_push_falls_back_to_pull() {
        let hub = MemoryPushHub::new();
        hub.set_reachable(false);
        let h = harness(SyncConfig::default(), Some(push_channel(&hub))).await;
        h.ledger.insert(&h.chat, remote(&h.chat, "m1", 1, "x").await).await;

        h.engine.start().await;
        sleep(Duration::from_secs(4)).await;
        assert_eq!(h.engine.mode().await, TransportMode::PullOnly);
        assert_eq!(h.store.get_messages(&h.chat).await.unwrap().len(), 1);
        h.engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_drop_reports_connection_events() {
        let hub = MemoryPushHub::new();
        let h = harness(SyncConfig::default(), Some(push_channel(&hub))).await;
        let mut events = h.engine.subscribe();
        h.engine.start().await;
        sleep(Duration::from_millis(100)).await;

        hub.drop_all().await;
        sleep(Duration::from_secs(1)).await;

        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::ConnectionLost { .. })));
        assert!(events.contains(&SyncEvent::ConnectionRestored));
        assert_eq!(h.engine.mode().await, TransportMode::Push);
        h.engine.stop().await;
    }

    #[tokio::test]
    async fn test_extreme_remote_stamp_does_not_stall_sync() {
        let h = harness(SyncConfig::default(), None).await;
        h.ledger
            .insert(&h.chat, remote(&h.chat, "huge", u64::MAX, "far future").await)
            .await;

        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.new_messages, 1);
        let (stamp, _) = h.engine.tick().await.unwrap();
        assert_eq!(stamp.counter, u64::MAX);

        // Later records still merge.
        h.ledger.insert(&h.chat, remote(&h.chat, "after", 3, "still here").await).await;
        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.new_messages, 1);
        assert_eq!(h.engine.clock().lock().await.lamport(), u64::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_from_ledger_backs_off() {
        let ledger = Arc::new(ResettingLedger::default());
        let engine = SyncEngine::open(
            EngineParts {
                identity: Identity::from_seed(&[LOCAL_SEED; 32]),
                store: Arc::new(MemoryStore::new()),
                ledger: ledger.clone(),
                crypto: Arc::new(ChaChaBox::new()),
                push: None,
            },
            SyncConfig::default(),
        )
        .await
        .unwrap();
        engine.register_chat("group".into()).await;

        let err = engine.run_cycle().await.unwrap_err();
        assert!(err.is_fetch_failure());
        engine.reset().await;
        let queries = || ledger.queries.load(Ordering::SeqCst);
        let before = queries();

        // Attempts at t = 0, 1, 3, 7, 15, same as an unreachable ledger.
        engine.start().await;
        sleep(Duration::from_millis(500)).await;
        assert_eq!(queries() - before, 1);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(queries() - before, 2);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(queries() - before, 3);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(queries() - before, 4);
        sleep(Duration::from_secs(7)).await;
        assert_eq!(queries() - before, 4);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(queries() - before, 5);

        let health = engine.health().await;
        assert_eq!(health.circuit, CircuitState::Open);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_late_key_replaces_placeholder() {
        let h = keyless_harness(SyncConfig::default(), None).await;
        h.ledger.insert(&h.chat, remote(&h.chat, "m1", 1, "sealed early").await).await;

        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.undecryptable, 1);
        let stored = h.store.get_messages(&h.chat).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].undecryptable);
        assert_eq!(h.store.get_chat(&h.chat).await.unwrap().unwrap().unread_count, 0);

        h.crypto.set_group_secret(h.chat.clone(), SECRET).await;
        let report = h.engine.run_cycle().await.unwrap();
        assert_eq!(report.undecryptable, 0);
        assert_eq!(report.new_messages, 1);

        let stored = h.store.get_messages(&h.chat).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, MessageId::from("m1"));
        assert_eq!(stored[0].plaintext.as_deref(), Some("sealed early"));
        assert_eq!(h.store.get_chat(&h.chat).await.unwrap().unwrap().unread_count, 1);

        let again = h.engine.run_cycle().await.unwrap();
        assert_eq!(again.new_messages, 0);
        assert_eq!(h.store.get_messages(&h.chat).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pull_channel_sees_fetched_deltas() {
        let h = harness(SyncConfig::default(), None).await;
        let record = remote(&h.chat, "m1", 1, "hello").await;
        h.ledger.insert(&h.chat, record.clone()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: EventHandler = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        h.engine.pull_channel().on_event(handler).await;

        h.engine.run_cycle().await.unwrap();
        assert_eq!(
            rx.try_recv().ok(),
            Some(ChannelEvent::Delta {
                chat_id: h.chat.clone(),
                records: vec![record],
            })
        );
        assert!(h.engine.health().await.pull.last_activity.is_some());
    }

    #[tokio::test]
    async fn test_clock_restored_on_open() {
        let store = Arc::new(MemoryStore::new());
        let identity = Identity::from_seed(&[LOCAL_SEED; 32]);
        store
            .save_clock(
                &identity.node_id(),
                &ClockSnapshot {
                    lamport: 12,
                    vector: VectorClock::from_entries([(identity.node_id(), 12)]),
                },
            )
            .await
            .unwrap();

        let engine = SyncEngine::open(
            EngineParts {
                identity,
                store,
                ledger: Arc::new(MemoryLedger::new()),
                crypto: Arc::new(ChaChaBox::new()),
                push: None,
            },
            SyncConfig::default(),
        )
        .await
        .unwrap();
        let (stamp, _) = engine.tick().await.unwrap();
        assert_eq!(stamp.counter, 13);
    }
}
