//! Test fixtures and helpers.
//!
//! A [`Network`] is a set of nodes sharing one in-memory ledger, one push
//! hub and one group secret for a single chat.

use std::sync::Arc;
use std::time::Duration;

use chatsync::{Messenger, MessengerConfig, Result};
use chatsync_core::{
    ChatId, DeliveryStatus, Identity, LamportStamp, MessageEnvelope, MessageId, SealedContent,
    VectorClock,
};
use chatsync_crypto::{ChaChaBox, CryptoBox};
use chatsync_store::{MemoryStore, Persistence};
use chatsync_sync::{
    CycleReport, EngineParts, LedgerRecord, MemoryLedger, MemoryPushHub, PushChannel,
    TransportChannel,
};

/// The chat every fixture node is a member of.
pub const GROUP_CHAT: &str = "group";

/// Secret shared by all members of [`GROUP_CHAT`].
pub const GROUP_SECRET: [u8; 32] = [42; 32];

/// Shared ledger and push hub for a group of test nodes.
pub struct Network {
    pub ledger: Arc<MemoryLedger>,
    pub hub: MemoryPushHub,
    pub config: MessengerConfig,
}

impl Network {
    pub fn new() -> Self {
        Self::with_config(MessengerConfig::default())
    }

    pub fn with_config(config: MessengerConfig) -> Self {
        Self {
            ledger: Arc::new(MemoryLedger::new()),
            hub: MemoryPushHub::new(),
            config,
        }
    }

    pub fn chat(&self) -> ChatId {
        GROUP_CHAT.into()
    }

    /// A pull-only node with a deterministic identity.
    pub async fn node(&self, seed: u8) -> Result<Node> {
        self.build(seed, None).await
    }

    /// A node that also connects to the push hub when started.
    pub async fn push_node(&self, seed: u8) -> Result<Node> {
        let push: Arc<dyn TransportChannel> = Arc::new(PushChannel::new(
            self.hub.socket(),
            self.config.sync.push.clone(),
        ));
        self.build(seed, Some(push)).await
    }

    /// `count` pull-only nodes seeded `1..=count`.
    pub async fn nodes(&self, count: u8) -> Result<Vec<Node>> {
        let mut nodes = Vec::with_capacity(count as usize);
        for seed in 1..=count {
            nodes.push(self.node(seed).await?);
        }
        Ok(nodes)
    }

    async fn build(&self, seed: u8, push: Option<Arc<dyn TransportChannel>>) -> Result<Node> {
        let identity = Identity::from_seed(&[seed; 32]);
        let crypto = Arc::new(ChaChaBox::new());
        crypto.set_group_secret(self.chat(), GROUP_SECRET).await;
        let store = Arc::new(MemoryStore::new());

        let parts = EngineParts {
            identity: identity.clone(),
            store: store.clone(),
            ledger: self.ledger.clone(),
            crypto,
            push,
        };
        let messenger = Messenger::open(parts, self.config.clone()).await?;
        messenger.engine().register_chat(self.chat()).await;
        Ok(Node {
            messenger,
            store,
            identity,
        })
    }

    /// Run one poll cycle on every node, in order.
    pub async fn sync_all(&self, nodes: &[Node]) -> Result<()> {
        for node in nodes {
            node.sync().await?;
        }
        Ok(())
    }

    /// Wait for every node's outbox to drain.
    pub async fn settle_all(&self, nodes: &[Node]) -> bool {
        for node in nodes {
            if !node.settle().await {
                return false;
            }
        }
        true
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant in a [`Network`].
pub struct Node {
    pub messenger: Messenger,
    pub store: Arc<MemoryStore>,
    pub identity: Identity,
}

impl Node {
    pub async fn send(&self, body: &str) -> Result<MessageId> {
        let message = self
            .messenger
            .send_message(&GROUP_CHAT.into(), body, false, None)
            .await?;
        Ok(message.id)
    }

    pub async fn sync(&self) -> Result<CycleReport> {
        Ok(self.messenger.engine().run_cycle().await?)
    }

    /// Wait until nothing is in flight: the outbox is empty and no message
    /// is still `Sending`. Gives up after about five seconds.
    pub async fn settle(&self) -> bool {
        for _ in 0..500 {
            if self.is_settled().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn is_settled(&self) -> bool {
        let outbox_empty = matches!(self.messenger.pending_outbox().await, Ok(p) if p.is_empty());
        let in_flight = match self.store.get_messages(&GROUP_CHAT.into()).await {
            Ok(messages) => messages
                .iter()
                .any(|m| m.status == DeliveryStatus::Sending),
            Err(_) => true,
        };
        outbox_empty && !in_flight
    }

    /// `(id, body)` of every message in display order.
    pub async fn transcript(&self) -> Result<Vec<(MessageId, Option<String>)>> {
        Ok(self
            .messenger
            .messages(&GROUP_CHAT.into())
            .await?
            .into_iter()
            .map(|m| (m.id, m.plaintext))
            .collect())
    }
}

/// Seal a message for [`GROUP_CHAT`] with an explicit id and Lamport
/// counter, as another member would have submitted it.
pub async fn sealed_message(
    identity: &Identity,
    id: &str,
    counter: u64,
    body: &str,
    sent_at: i64,
) -> Result<LedgerRecord> {
    let node = identity.node_id();
    let envelope = MessageEnvelope {
        id: id.into(),
        chat_id: GROUP_CHAT.into(),
        body: body.into(),
        sender_id: node.clone(),
        sent_at,
        lamport: LamportStamp::new(counter, node.clone()),
        vector: VectorClock::from_entries([(node, counter)]),
        reply_to: None,
    };

    let crypto = ChaChaBox::new();
    crypto.set_group_secret(GROUP_CHAT.into(), GROUP_SECRET).await;
    let key = crypto.derive_key(&GROUP_CHAT.into(), identity).await?;
    let sealed = crypto
        .encrypt(&SealedContent::Message(envelope).to_bytes()?, &key)
        .await?;
    Ok(LedgerRecord {
        ciphertext: sealed.ciphertext,
        nonce: sealed.nonce,
        sender_commitment: identity.commitment(),
        timestamp: sent_at,
    })
}
