//! Multi-node tests of the Messenger over a shared in-memory ledger.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chatsync::core::{LamportStamp, MessageEnvelope, SealedContent, VectorClock};
use chatsync::crypto::{ChaChaBox, CryptoBox};
use chatsync::store::{MemoryStore, Persistence, SqliteStore};
use chatsync::sync::{LedgerRecord, MemoryLedger, MemoryPushHub, PushChannel, PushConfig};
use chatsync::{
    ChatId, DeliveryStatus, EngineParts, Identity, Message, MessageId, Messenger,
    MessengerConfig, SyncEvent,
};
use tokio::time::sleep;

const SECRET: [u8; 32] = [9; 32];
const ALICE: u8 = 1;
const BOB: u8 = 2;

fn chat() -> ChatId {
    "team".into()
}

async fn crypto() -> Arc<ChaChaBox> {
    let crypto = Arc::new(ChaChaBox::new());
    crypto.set_group_secret(chat(), SECRET).await;
    crypto
}

async fn node_with(
    seed: u8,
    ledger: &Arc<MemoryLedger>,
    store: Arc<dyn Persistence>,
    hub: Option<&MemoryPushHub>,
) -> Result<Messenger> {
    let _ = tracing_subscriber::fmt::try_init();
    let push = hub.map(|hub| {
        Arc::new(PushChannel::new(hub.socket(), PushConfig::default()))
            as Arc<dyn chatsync::sync::TransportChannel>
    });
    let parts = EngineParts {
        identity: Identity::from_seed(&[seed; 32]),
        store,
        ledger: ledger.clone(),
        crypto: crypto().await,
        push,
    };
    let messenger = Messenger::open(parts, MessengerConfig::default()).await?;
    messenger.engine().register_chat(chat()).await;
    Ok(messenger)
}

async fn node(seed: u8, ledger: &Arc<MemoryLedger>) -> Result<Messenger> {
    node_with(seed, ledger, Arc::new(MemoryStore::new()), None).await
}

/// Poll until a message reaches `status` or give up after ~2s.
async fn wait_for_status(messenger: &Messenger, id: &MessageId, status: DeliveryStatus) -> Message {
    for _ in 0..200 {
        if let Ok(message) = messenger.message(id).await {
            if message.status == status {
                return message;
            }
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("message {} never reached {:?}", id, status);
}

async fn wait_for_records(ledger: &MemoryLedger, n: usize) {
    for _ in 0..200 {
        if ledger.records(&chat()).await.len() >= n {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("ledger never reached {} records", n);
}

/// A message sealed by `seed` with an explicit id and Lamport counter.
async fn record(seed: u8, id: &str, counter: u64, body: &str) -> Result<LedgerRecord> {
    let identity = Identity::from_seed(&[seed; 32]);
    let node = identity.node_id();
    let envelope = MessageEnvelope {
        id: id.into(),
        chat_id: chat(),
        body: body.into(),
        sender_id: node.clone(),
        sent_at: 1_000,
        lamport: LamportStamp::new(counter, node.clone()),
        vector: VectorClock::from_entries([(node, counter)]),
        reply_to: None,
    };
    let crypto = crypto().await;
    let key = crypto.derive_key(&chat(), &identity).await?;
    let sealed = crypto
        .encrypt(&SealedContent::Message(envelope).to_bytes()?, &key)
        .await?;
    Ok(LedgerRecord {
        ciphertext: sealed.ciphertext,
        nonce: sealed.nonce,
        sender_commitment: identity.commitment(),
        timestamp: 1_000,
    })
}

#[tokio::test]
async fn test_message_reaches_peer_through_ledger() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let alice = node(ALICE, &ledger).await?;
    let bob = node(BOB, &ledger).await?;

    let sent = alice.send_message(&chat(), "hello bob", false, None).await?;
    assert_eq!(sent.status, DeliveryStatus::Sending);
    wait_for_status(&alice, &sent.id, DeliveryStatus::Sent).await;
    assert!(alice.pending_outbox().await?.is_empty());

    let report = bob.engine().run_cycle().await?;
    assert_eq!(report.new_messages, 1);
    let received = bob.message(&sent.id).await?;
    assert_eq!(received.plaintext.as_deref(), Some("hello bob"));
    assert_eq!(received.status, DeliveryStatus::Delivered);
    assert_eq!(bob.chat(&chat()).await?.unread_count, 1);

    // Our own record coming back does not regress the status.
    alice.engine().run_cycle().await?;
    assert_eq!(alice.message(&sent.id).await?.status, DeliveryStatus::Sent);
    assert_eq!(alice.messages(&chat()).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_conflicting_versions_converge() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let alice = node(ALICE, &ledger).await?;
    let bob = node(BOB, &ledger).await?;

    ledger.insert(&chat(), record(ALICE, "dup", 5, "alice wrote").await?).await;
    alice.engine().run_cycle().await?;
    assert_eq!(
        alice.message(&"dup".into()).await?.plaintext.as_deref(),
        Some("alice wrote")
    );

    ledger.insert(&chat(), record(BOB, "dup", 7, "bob wrote").await?).await;
    let report = alice.engine().run_cycle().await?;
    assert_eq!(report.conflicts, 1);
    bob.engine().run_cycle().await?;

    let a = alice.message(&"dup".into()).await?;
    let b = bob.message(&"dup".into()).await?;
    assert_eq!(a.plaintext.as_deref(), Some("bob wrote"));
    assert_eq!(a.plaintext, b.plaintext);
    assert_eq!(a.lamport.counter, 7);
    Ok(())
}

#[tokio::test]
async fn test_failed_send_is_kept_and_retried() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let alice = node(ALICE, &ledger).await?;
    let mut events = alice.subscribe();
    ledger.set_offline(true);

    let sent = alice.send_message(&chat(), "eventually", false, None).await?;
    wait_for_status(&alice, &sent.id, DeliveryStatus::Failed).await;
    let pending = alice.pending_outbox().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempts, 1);
    assert!(pending[0].last_error.is_some());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        saw_error |= matches!(event, SyncEvent::SyncError { .. });
    }
    assert!(saw_error);

    ledger.set_offline(false);
    let retried = alice.retry_message(&sent.id).await?;
    assert_eq!(retried.status, DeliveryStatus::Sending);
    wait_for_status(&alice, &sent.id, DeliveryStatus::Sent).await;
    assert!(alice.pending_outbox().await?.is_empty());
    assert_eq!(ledger.records(&chat()).await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_flush_outbox_resubmits_failures() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let alice = node(ALICE, &ledger).await?;
    ledger.set_offline(true);

    let first = alice.send_message(&chat(), "one", false, None).await?;
    let second = alice.send_message(&chat(), "two", false, None).await?;
    wait_for_status(&alice, &first.id, DeliveryStatus::Failed).await;
    wait_for_status(&alice, &second.id, DeliveryStatus::Failed).await;

    ledger.set_offline(false);
    assert_eq!(alice.flush_outbox().await?, 2);
    assert_eq!(alice.message(&first.id).await?.status, DeliveryStatus::Sent);
    assert_eq!(alice.message(&second.id).await?.status, DeliveryStatus::Sent);
    assert!(alice.pending_outbox().await?.is_empty());
    assert_eq!(alice.flush_outbox().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_mark_read_advances_incoming_only() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let alice = node(ALICE, &ledger).await?;
    let bob = node(BOB, &ledger).await?;

    let from_alice = alice.send_message(&chat(), "read me", false, None).await?;
    wait_for_status(&alice, &from_alice.id, DeliveryStatus::Sent).await;
    let from_bob = bob.send_message(&chat(), "mine", false, None).await?;
    wait_for_status(&bob, &from_bob.id, DeliveryStatus::Sent).await;
    bob.engine().run_cycle().await?;
    assert_eq!(bob.chat(&chat()).await?.unread_count, 1);

    assert_eq!(bob.mark_read(&chat()).await?, 1);
    assert_eq!(bob.message(&from_alice.id).await?.status, DeliveryStatus::Read);
    assert_eq!(bob.message(&from_bob.id).await?.status, DeliveryStatus::Sent);
    assert_eq!(bob.chat(&chat()).await?.unread_count, 0);

    // A later merge never moves a read message back.
    bob.engine().run_cycle().await?;
    assert_eq!(bob.message(&from_alice.id).await?.status, DeliveryStatus::Read);
    assert_eq!(bob.mark_read(&chat()).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_chat_metadata_propagates() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let alice = node(ALICE, &ledger).await?;
    let bob = node(BOB, &ledger).await?;
    let bob_id = bob.node_id().clone();

    alice.create_chat(&chat(), Some("Team"), [bob_id.clone()]).await?;
    wait_for_records(&ledger, 1).await;
    bob.engine().run_cycle().await?;
    let seen = bob.chat(&chat()).await?;
    assert_eq!(seen.name.as_deref(), Some("Team"));
    assert!(seen.participants.contains(&bob_id));
    assert!(seen.participants.contains(alice.node_id()));

    alice
        .update_chat_metadata(&chat(), Some("Renamed".into()), None)
        .await?;
    wait_for_records(&ledger, 2).await;
    bob.engine().run_cycle().await?;
    assert_eq!(bob.chat(&chat()).await?.name.as_deref(), Some("Renamed"));

    // Re-reading the same states changes nothing.
    let mut events = bob.subscribe();
    bob.engine().run_cycle().await?;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SyncEvent::ChatUpdated { .. }));
    }
    Ok(())
}

#[tokio::test]
async fn test_cleared_chat_is_not_refilled() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let alice = node(ALICE, &ledger).await?;
    let bob = node(BOB, &ledger).await?;

    for body in ["a", "b"] {
        let sent = alice.send_message(&chat(), body, false, None).await?;
        wait_for_status(&alice, &sent.id, DeliveryStatus::Sent).await;
    }
    assert_eq!(alice.clear_chat(&chat()).await?, 2);
    alice.engine().run_cycle().await?;
    assert!(alice.messages(&chat()).await?.is_empty());
    assert_eq!(alice.chat(&chat()).await?.unread_count, 0);

    sleep(Duration::from_millis(20)).await;
    let later = bob.send_message(&chat(), "after clear", false, None).await?;
    wait_for_status(&bob, &later.id, DeliveryStatus::Sent).await;
    alice.engine().run_cycle().await?;
    let remaining = alice.messages(&chat()).await?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, later.id);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_push_delivers_before_next_poll() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let hub = MemoryPushHub::new();
    let alice = node_with(ALICE, &ledger, Arc::new(MemoryStore::new()), Some(&hub)).await?;
    let bob = node_with(BOB, &ledger, Arc::new(MemoryStore::new()), Some(&hub)).await?;
    alice.start().await;
    bob.start().await;
    sleep(Duration::from_millis(100)).await;
    let queries = ledger.query_count();

    let sent = alice.send_message(&chat(), "fast path", false, None).await?;
    sleep(Duration::from_millis(100)).await;
    let received = bob.message(&sent.id).await?;
    assert_eq!(received.plaintext.as_deref(), Some("fast path"));
    assert_eq!(ledger.query_count(), queries);

    alice.stop().await;
    bob.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_sqlite_state_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("alice.db");
    let ledger = Arc::new(MemoryLedger::new());

    let first = {
        let alice = node_with(ALICE, &ledger, Arc::new(SqliteStore::open(&path)?), None).await?;
        alice.create_chat(&chat(), Some("Team"), []).await?;
        let sent = alice.send_message(&chat(), "persisted", false, None).await?;
        wait_for_status(&alice, &sent.id, DeliveryStatus::Sent).await
    };

    let parts = EngineParts {
        identity: Identity::from_seed(&[ALICE; 32]),
        store: Arc::new(SqliteStore::open(&path)?),
        ledger: ledger.clone(),
        crypto: crypto().await,
        push: None,
    };
    let alice = Messenger::open(parts, MessengerConfig::default()).await?;
    assert!(alice.engine().registered_chats().await.contains(&chat()));
    assert_eq!(alice.chat(&chat()).await?.name.as_deref(), Some("Team"));

    let stored = alice.message(&first.id).await?;
    assert_eq!(stored.plaintext.as_deref(), Some("persisted"));
    assert_eq!(stored.status, DeliveryStatus::Sent);

    let next = alice.send_message(&chat(), "after restart", false, None).await?;
    assert!(next.lamport > first.lamport);
    Ok(())
}
