//! The Messenger: the send path and public surface of chatsync.
//!
//! Sends are optimistic. A message is sealed, stamped and stored with
//! status `Sending` before `send_message` returns; ledger submission and
//! push fan-out happen afterwards and never undo the local write. Every
//! send also leaves an outbox entry that is only removed once the ledger
//! has accepted the record, so failed submissions are retried rather than
//! lost.

use std::time::Duration;

use chatsync_core::{
    now_millis, ChatId, ChatState, DeliveryStatus, Message, MessageEnvelope, MessageId, NodeId,
    SealedContent,
};
use chatsync_crypto::CryptoBox;
use chatsync_store::{OutboxEntry, Persistence};
use chatsync_sync::{
    event_names, wire, EngineHealth, EngineParts, Ledger, LedgerRecord, SyncConfig, SyncEngine,
    SyncEvent, TransactionId, TransportChannel,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{MessengerError, Result};

/// Configuration for the Messenger.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Sync engine configuration.
    pub sync: SyncConfig,
    /// Bound on a single ledger submission.
    pub submit_timeout: Duration,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            submit_timeout: Duration::from_secs(15),
        }
    }
}

/// The main Messenger struct.
///
/// Provides a unified API for:
/// - Sending messages and tracking their delivery status
/// - Retrying failed ledger submissions
/// - Creating and editing chats
/// - Reading local state
/// - Driving and observing the sync engine
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Messenger {
    engine: SyncEngine,
    submit_timeout: Duration,
}

impl Messenger {
    /// Open a messenger and register every stored chat for sync.
    pub async fn open(parts: EngineParts, config: MessengerConfig) -> Result<Self> {
        let engine = SyncEngine::open(parts, config.sync).await?;
        for chat in engine.store().get_chats().await? {
            engine.register_chat(chat.id).await;
        }
        Ok(Self {
            engine,
            submit_timeout: config.submit_timeout,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn node_id(&self) -> &NodeId {
        self.engine.node_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start syncing and resubmit anything left in the outbox.
    pub async fn start(&self) {
        self.engine.start().await;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.flush_outbox().await {
                warn!(error = %e, "outbox flush on start failed");
            }
        });
    }

    pub async fn stop(&self) {
        self.engine.stop().await;
    }

    pub async fn sync_now(&self) {
        self.engine.sync_now().await;
    }

    pub async fn reset(&self) {
        self.engine.reset().await;
    }

    pub async fn health(&self) -> EngineHealth {
        self.engine.health().await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Send Path
    // ─────────────────────────────────────────────────────────────────────────

    /// Send a message.
    ///
    /// Returns once the message is durable locally with status `Sending`.
    /// An `anonymous` send publishes a salted sender commitment that the
    /// ledger cannot link to this identity.
    pub async fn send_message(
        &self,
        chat_id: &ChatId,
        text: &str,
        anonymous: bool,
        reply_to: Option<MessageId>,
    ) -> Result<Message> {
        let identity = self.engine.identity();
        let key = self.engine.crypto().derive_key(chat_id, identity).await?;
        let (lamport, vector) = self.engine.tick().await?;
        let sent_at = now_millis();

        let envelope = MessageEnvelope {
            id: MessageId::generate(),
            chat_id: chat_id.clone(),
            body: text.to_string(),
            sender_id: self.node_id().clone(),
            sent_at,
            lamport,
            vector,
            reply_to,
        };
        let sealed = self
            .engine
            .crypto()
            .encrypt(&SealedContent::Message(envelope.clone()).to_bytes()?, &key)
            .await?;
        let commitment = if anonymous {
            identity.anonymous_commitment()
        } else {
            identity.commitment()
        };
        let message =
            envelope.into_message(sealed.ciphertext, sealed.nonce, commitment, DeliveryStatus::Sending);

        {
            let _guard = self.engine.locks().lock(chat_id).await;
            let store = self.engine.store();
            store
                .add_outgoing(&message, &OutboxEntry::new(&message, sent_at))
                .await?;
            let mut chat = store
                .get_chat(chat_id)
                .await?
                .unwrap_or_else(|| ChatState::new(chat_id.clone()));
            chat.apply_new_messages([&message], self.node_id());
            store.update_chat(&chat).await?;
        }
        self.engine.register_chat(chat_id.clone()).await;

        debug!(chat = %chat_id, message = %message.id, anonymous, "message stored");
        self.spawn_delivery(message.clone());
        Ok(message)
    }

    /// Move a failed message back to `Sending` and submit it again.
    pub async fn retry_message(&self, id: &MessageId) -> Result<Message> {
        let message = self.reset_to_sending(id).await?;
        self.spawn_delivery(message.clone());
        Ok(message)
    }

    /// Resubmit every pending outbox entry, oldest first. Returns how many
    /// the ledger accepted.
    pub async fn flush_outbox(&self) -> Result<usize> {
        let store = self.engine.store();
        let pending = store.pending_outbox().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut accepted = 0;
        for entry in pending {
            let message = match store.get_message(&entry.message_id).await? {
                Some(message) => message,
                None => {
                    store.remove_outbox(&entry.message_id).await?;
                    continue;
                }
            };
            let message = match message.status {
                DeliveryStatus::Failed => self.reset_to_sending(&message.id).await?,
                DeliveryStatus::Sending => message,
                // Confirmed by a merge since the entry was written.
                _ => {
                    store.remove_outbox(&message.id).await?;
                    continue;
                }
            };
            debug!(message = %message.id, attempts = entry.attempts, "resubmitting from outbox");
            if self.deliver(message).await {
                accepted += 1;
            }
        }
        info!(accepted, "outbox flushed");
        Ok(accepted)
    }

    fn spawn_delivery(&self, message: Message) {
        let this = self.clone();
        tokio::spawn(async move {
            this.deliver(message).await;
        });
    }

    /// Fan out to push, then submit to the ledger. Returns whether the
    /// ledger accepted the record.
    async fn deliver(&self, message: Message) -> bool {
        let record = LedgerRecord {
            ciphertext: message.ciphertext.clone(),
            nonce: message.nonce,
            sender_commitment: message.sender_commitment.clone(),
            timestamp: message.timestamp,
        };
        self.push_record(event_names::MESSAGE_NEW, &message.chat_id, &record)
            .await;

        match self.submit(&message.chat_id, &record).await {
            Ok(tx) => {
                info!(message = %message.id, %tx, "ledger accepted message");
                if let Err(e) = self.confirm_sent(&message).await {
                    warn!(message = %message.id, error = %e, "failed to record confirmation");
                }
                true
            }
            Err(reason) => {
                warn!(message = %message.id, %reason, "ledger submit failed");
                if let Err(e) = self.fail_delivery(&message, &reason).await {
                    warn!(message = %message.id, error = %e, "failed to record submit failure");
                }
                self.engine.publish(SyncEvent::SyncError { message: reason });
                false
            }
        }
    }

    async fn submit(
        &self,
        chat_id: &ChatId,
        record: &LedgerRecord,
    ) -> std::result::Result<TransactionId, String> {
        let submit = self.engine.ledger().submit(chat_id, record);
        match tokio::time::timeout(self.submit_timeout, submit).await {
            Ok(Ok(tx)) => Ok(tx),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("ledger submit exceeded {:?}", self.submit_timeout)),
        }
    }

    /// Best effort; the ledger path covers anything push drops.
    async fn push_record(&self, event: &str, chat_id: &ChatId, record: &LedgerRecord) {
        let push = match self.engine.active_push().await {
            Some(push) => push,
            None => return,
        };
        match wire::encode_record(chat_id, record) {
            Ok(payload) => {
                if let Err(e) = push.send(event, payload).await {
                    debug!(chat = %chat_id, error = %e, "push send failed");
                }
            }
            Err(e) => warn!(chat = %chat_id, error = %e, "failed to encode push payload"),
        }
    }

    async fn confirm_sent(&self, message: &Message) -> Result<()> {
        self.engine.store().remove_outbox(&message.id).await?;
        self.advance(&message.id, DeliveryStatus::Sent).await?;
        Ok(())
    }

    async fn fail_delivery(&self, message: &Message, reason: &str) -> Result<()> {
        let _guard = self.engine.locks().lock(&message.chat_id).await;
        let store = self.engine.store();
        let mut stored = match store.get_message(&message.id).await? {
            Some(stored) => stored,
            // Cleared while in flight.
            None => return Ok(()),
        };
        store.record_outbox_failure(&message.id, reason).await?;
        if stored.status == DeliveryStatus::Sending {
            stored.transition(DeliveryStatus::Failed)?;
            store.update_message(&stored).await?;
            self.publish_status(&stored);
        }
        Ok(())
    }

    async fn reset_to_sending(&self, id: &MessageId) -> Result<Message> {
        let chat_id = self.message(id).await?.chat_id;
        let _guard = self.engine.locks().lock(&chat_id).await;
        let store = self.engine.store();
        let mut message = store
            .get_message(id)
            .await?
            .ok_or_else(|| MessengerError::MessageNotFound(id.clone()))?;
        if !message.is_from(self.node_id()) {
            return Err(MessengerError::InvalidOperation(format!(
                "message {} was not sent by this node",
                id
            )));
        }

        message.retry()?;
        store.update_message(&message).await?;
        store
            .enqueue_outbox(&OutboxEntry::new(&message, now_millis()))
            .await?;
        self.publish_status(&message);
        info!(message = %id, "retrying failed message");
        Ok(message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery Status
    // ─────────────────────────────────────────────────────────────────────────

    /// Mark a message delivered. Returns false if it already was, or was
    /// further along.
    pub async fn mark_delivered(&self, id: &MessageId) -> Result<bool> {
        self.advance(id, DeliveryStatus::Delivered).await
    }

    /// Mark every incoming message of a chat read and zero its unread
    /// count. Returns the number of messages advanced.
    pub async fn mark_read(&self, chat_id: &ChatId) -> Result<usize> {
        let _guard = self.engine.locks().lock(chat_id).await;
        let store = self.engine.store();

        let mut advanced = 0;
        for mut message in store.get_messages(chat_id).await? {
            if message.is_from(self.node_id()) || message.undecryptable {
                continue;
            }
            if message.advance_to(DeliveryStatus::Read) {
                store.update_message(&message).await?;
                self.publish_status(&message);
                advanced += 1;
            }
        }

        if let Some(mut chat) = store.get_chat(chat_id).await? {
            if chat.mark_read() {
                store.update_chat(&chat).await?;
                self.engine.publish(SyncEvent::ChatUpdated { chat });
            }
        }
        Ok(advanced)
    }

    async fn advance(&self, id: &MessageId, status: DeliveryStatus) -> Result<bool> {
        let chat_id = self.message(id).await?.chat_id;
        let _guard = self.engine.locks().lock(&chat_id).await;
        let store = self.engine.store();
        let mut message = store
            .get_message(id)
            .await?
            .ok_or_else(|| MessengerError::MessageNotFound(id.clone()))?;
        if !message.advance_to(status) {
            return Ok(false);
        }
        store.update_message(&message).await?;
        self.publish_status(&message);
        Ok(true)
    }

    fn publish_status(&self, message: &Message) {
        self.engine.publish(SyncEvent::StatusChanged {
            chat_id: message.chat_id.clone(),
            message_id: message.id.clone(),
            status: message.status,
        });
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chat Management
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a chat with this node as a participant. Returns the stored
    /// chat unchanged if it already exists.
    pub async fn create_chat(
        &self,
        chat_id: &ChatId,
        name: Option<&str>,
        participants: impl IntoIterator<Item = NodeId>,
    ) -> Result<ChatState> {
        let (chat, created) = {
            let _guard = self.engine.locks().lock(chat_id).await;
            let store = self.engine.store();
            match store.get_chat(chat_id).await? {
                Some(existing) => (existing, false),
                None => {
                    let mut chat = ChatState::new(chat_id.clone())
                        .with_participants(participants)
                        .with_participants([self.node_id().clone()]);
                    chat.name = name.map(str::to_string);
                    chat.vector.increment(self.node_id());
                    chat.version = 1;
                    store.update_chat(&chat).await?;
                    (chat, true)
                }
            }
        };
        self.engine.register_chat(chat_id.clone()).await;

        if created {
            info!(chat = %chat_id, participants = chat.participants.len(), "chat created");
            self.engine.publish(SyncEvent::ChatUpdated { chat: chat.clone() });
            self.spawn_state_broadcast(chat.clone());
        }
        Ok(chat)
    }

    /// Rename a chat or change its avatar. `None` leaves a field unchanged.
    pub async fn update_chat_metadata(
        &self,
        chat_id: &ChatId,
        name: Option<String>,
        avatar: Option<String>,
    ) -> Result<ChatState> {
        self.edit_chat(chat_id, |chat| {
            if let Some(name) = name {
                chat.name = Some(name);
            }
            if let Some(avatar) = avatar {
                chat.avatar = Some(avatar);
            }
        })
        .await
    }

    pub async fn add_participant(&self, chat_id: &ChatId, node_id: NodeId) -> Result<ChatState> {
        self.edit_chat(chat_id, |chat| {
            chat.participants.insert(node_id);
        })
        .await
    }

    /// Delete a chat's local messages. Ledger copies at or before the
    /// newest cleared message are not merged back in.
    pub async fn clear_chat(&self, chat_id: &ChatId) -> Result<usize> {
        let _guard = self.engine.locks().lock(chat_id).await;
        let store = self.engine.store();
        let mut chat = store
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| MessengerError::ChatNotFound(chat_id.clone()))?;

        let through = store
            .get_messages(chat_id)
            .await?
            .iter()
            .map(|m| m.timestamp)
            .max()
            .unwrap_or(0)
            .max(chat.last_message_time);
        let removed = store.clear_chat(chat_id).await?;
        chat.clear(through);
        store.update_chat(&chat).await?;

        info!(chat = %chat_id, removed, "chat cleared");
        self.engine.publish(SyncEvent::ChatUpdated { chat });
        Ok(removed)
    }

    async fn edit_chat<F>(&self, chat_id: &ChatId, edit: F) -> Result<ChatState>
    where
        F: FnOnce(&mut ChatState),
    {
        let chat = {
            let _guard = self.engine.locks().lock(chat_id).await;
            let store = self.engine.store();
            let mut chat = store
                .get_chat(chat_id)
                .await?
                .ok_or_else(|| MessengerError::ChatNotFound(chat_id.clone()))?;
            edit(&mut chat);
            chat.vector.increment(self.node_id());
            chat.version = chat.version.saturating_add(1);
            store.update_chat(&chat).await?;
            chat
        };
        self.engine.publish(SyncEvent::ChatUpdated { chat: chat.clone() });
        self.spawn_state_broadcast(chat.clone());
        Ok(chat)
    }

    /// Seal a chat state and publish it on push and the ledger. Best effort:
    /// the next edit carries the full state again.
    fn spawn_state_broadcast(&self, chat: ChatState) {
        let this = self.clone();
        tokio::spawn(async move {
            let record = match this.seal_state(&chat).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(chat = %chat.id, error = %e, "failed to seal chat state");
                    return;
                }
            };
            this.push_record(event_names::CHAT_STATE, &chat.id, &record)
                .await;
            if let Err(reason) = this.submit(&chat.id, &record).await {
                warn!(chat = %chat.id, %reason, "chat state submit failed");
            }
        });
    }

    async fn seal_state(&self, chat: &ChatState) -> Result<LedgerRecord> {
        let identity = self.engine.identity();
        let crypto = self.engine.crypto();
        let key = crypto.derive_key(&chat.id, identity).await?;
        let bytes = SealedContent::chat_state(chat).to_bytes()?;
        let sealed = crypto.encrypt(&bytes, &key).await?;
        Ok(LedgerRecord {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            sender_commitment: identity.commitment(),
            timestamp: now_millis(),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ephemeral Signals
    // ─────────────────────────────────────────────────────────────────────────

    /// Tell chat members we are typing. Dropped when push is unavailable.
    pub async fn set_typing(&self, chat_id: &ChatId, typing: bool) -> Result<()> {
        if let Some(push) = self.engine.active_push().await {
            let payload = wire::encode_typing(chat_id, self.node_id(), typing)?;
            push.send(event_names::TYPING, payload).await?;
        }
        Ok(())
    }

    pub async fn set_presence(&self, online: bool) -> Result<()> {
        if let Some(push) = self.engine.active_push().await {
            let payload = wire::encode_presence(self.node_id(), online)?;
            push.send(event_names::PRESENCE, payload).await?;
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Messages of a chat in display order (wall-clock timestamp).
    pub async fn messages(&self, chat_id: &ChatId) -> Result<Vec<Message>> {
        Ok(self.engine.store().get_messages(chat_id).await?)
    }

    pub async fn message(&self, id: &MessageId) -> Result<Message> {
        self.engine
            .store()
            .get_message(id)
            .await?
            .ok_or_else(|| MessengerError::MessageNotFound(id.clone()))
    }

    /// All chats, most recently active first.
    pub async fn chats(&self) -> Result<Vec<ChatState>> {
        Ok(self.engine.store().get_chats().await?)
    }

    pub async fn chat(&self, chat_id: &ChatId) -> Result<ChatState> {
        self.engine
            .store()
            .get_chat(chat_id)
            .await?
            .ok_or_else(|| MessengerError::ChatNotFound(chat_id.clone()))
    }

    /// Ledger submissions not yet confirmed.
    pub async fn pending_outbox(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self.engine.store().pending_outbox().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_core::Identity;
    use chatsync_crypto::ChaChaBox;
    use chatsync_store::MemoryStore;
    use chatsync_sync::MemoryLedger;
    use std::sync::Arc;

    async fn messenger() -> (Messenger, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let parts = EngineParts {
            identity: Identity::from_seed(&[3; 32]),
            store: Arc::new(MemoryStore::new()),
            ledger: ledger.clone(),
            crypto: Arc::new(ChaChaBox::new()),
            push: None,
        };
        let messenger = Messenger::open(parts, MessengerConfig::default())
            .await
            .unwrap();
        (messenger, ledger)
    }

    #[tokio::test]
    async fn test_send_is_optimistic_and_durable() {
        let (messenger, ledger) = messenger().await;
        ledger.set_offline(true);
        let chat: ChatId = "notes".into();

        let sent = messenger.send_message(&chat, "hello", false, None).await.unwrap();
        assert_eq!(sent.plaintext.as_deref(), Some("hello"));

        let stored = messenger.message(&sent.id).await.unwrap();
        assert!(matches!(
            stored.status,
            DeliveryStatus::Sending | DeliveryStatus::Failed
        ));
        assert_eq!(messenger.pending_outbox().await.unwrap().len(), 1);
        assert!(messenger
            .engine()
            .registered_chats()
            .await
            .contains(&chat));
    }

    #[tokio::test]
    async fn test_anonymous_send_hides_commitment() {
        let (messenger, _) = messenger().await;
        let chat: ChatId = "notes".into();
        let named = messenger.send_message(&chat, "a", false, None).await.unwrap();
        let anon = messenger.send_message(&chat, "b", true, None).await.unwrap();

        assert_eq!(named.sender_commitment, messenger.engine().identity().commitment());
        assert_ne!(anon.sender_commitment, named.sender_commitment);
    }

    #[tokio::test]
    async fn test_sends_stamp_increasing_lamport() {
        let (messenger, _) = messenger().await;
        let chat: ChatId = "notes".into();
        let first = messenger.send_message(&chat, "1", false, None).await.unwrap();
        let second = messenger
            .send_message(&chat, "2", false, Some(first.id.clone()))
            .await
            .unwrap();

        assert!(second.lamport > first.lamport);
        assert_eq!(second.reply_to, Some(first.id));
    }

    #[tokio::test]
    async fn test_retry_requires_failed_status() {
        let (messenger, _) = messenger().await;
        let chat: ChatId = "notes".into();
        let sent = messenger.send_message(&chat, "x", false, None).await.unwrap();

        assert!(matches!(
            messenger.retry_message(&sent.id).await,
            Err(MessengerError::Core(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_rejects_foreign_message() {
        let (messenger, _) = messenger().await;
        let mut foreign = messenger
            .send_message(&"notes".into(), "x", false, None)
            .await
            .unwrap();
        foreign.id = MessageId::new("foreign");
        foreign.sender_id = "someone-else".into();
        foreign.status = DeliveryStatus::Failed;
        messenger.engine().store().add_message(&foreign).await.unwrap();

        assert!(matches!(
            messenger.retry_message(&foreign.id).await,
            Err(MessengerError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_edit_unknown_chat_fails() {
        let (messenger, _) = messenger().await;
        let result = messenger
            .update_chat_metadata(&"missing".into(), Some("x".into()), None)
            .await;
        assert!(matches!(result, Err(MessengerError::ChatNotFound(_))));
    }

    #[tokio::test]
    async fn test_create_chat_is_idempotent() {
        let (messenger, _) = messenger().await;
        let chat: ChatId = "team".into();
        let peer: NodeId = "peer".into();

        let created = messenger
            .create_chat(&chat, Some("Team"), [peer.clone()])
            .await
            .unwrap();
        assert!(created.participants.contains(&peer));
        assert!(created.participants.contains(messenger.node_id()));
        assert_eq!(created.vector.get(messenger.node_id()), 1);

        let again = messenger.create_chat(&chat, Some("Other"), []).await.unwrap();
        assert_eq!(again, created);
    }

    #[tokio::test]
    async fn test_metadata_edit_ticks_chat_vector() {
        let (messenger, _) = messenger().await;
        let chat: ChatId = "team".into();
        messenger.create_chat(&chat, Some("Team"), []).await.unwrap();

        let edited = messenger
            .update_chat_metadata(&chat, Some("Renamed".into()), Some("avatar.png".into()))
            .await
            .unwrap();
        assert_eq!(edited.name.as_deref(), Some("Renamed"));
        assert_eq!(edited.avatar.as_deref(), Some("avatar.png"));
        assert_eq!(edited.vector.get(messenger.node_id()), 2);
        assert_eq!(messenger.chat(&chat).await.unwrap(), edited);
    }
}
