//! Proptest generators for property-based testing.

use bytes::Bytes;
use proptest::prelude::*;

use chatsync_core::{
    ChatId, ChatState, DeliveryStatus, LamportStamp, Message, MessageId, NodeId, Nonce,
    VectorClock,
};

/// A small pool of node ids so generated clocks overlap.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    prop_oneof![Just("alice"), Just("bob"), Just("carol"), Just("dave")].prop_map(NodeId::from)
}

pub fn vector_clock() -> impl Strategy<Value = VectorClock> {
    prop::collection::btree_map(node_id(), 1u64..=20, 0..=4).prop_map(VectorClock::from_entries)
}

pub fn delivery_status() -> impl Strategy<Value = DeliveryStatus> {
    prop_oneof![
        Just(DeliveryStatus::Failed),
        Just(DeliveryStatus::Sending),
        Just(DeliveryStatus::Sent),
        Just(DeliveryStatus::Delivered),
        Just(DeliveryStatus::Read),
    ]
}

/// Generate a chat state for `chat`.
pub fn chat_state(chat: &str) -> impl Strategy<Value = ChatState> {
    let chat = ChatId::from(chat);
    (
        proptest::option::of("[A-Z][a-z]{0,7}"),
        proptest::option::of("[a-z]{1,6}\\.png"),
        prop::collection::btree_set(node_id(), 1..=4),
        vector_clock(),
        0i64..=5_000,
        0u32..=10,
        0u64..=10,
    )
        .prop_map(
            move |(name, avatar, participants, vector, lmt, unread, version)| {
                let mut state = ChatState::new(chat.clone()).with_participants(participants);
                state.name = name;
                state.avatar = avatar;
                state.vector = vector;
                state.last_message_time = lmt;
                state.unread_count = unread;
                state.version = version;
                state
            },
        )
}

/// Parameters for generating a message.
#[derive(Debug, Clone)]
pub struct MessageParams {
    /// Drawn from a small range so independent sets share ids.
    pub id: u8,
    pub sender: NodeId,
    pub counter: u64,
    pub body: String,
    pub status: DeliveryStatus,
}

impl Arbitrary for MessageParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            0u8..16,
            node_id(),
            1u64..=50,
            "[a-z ]{0,24}",
            delivery_status(),
        )
            .prop_map(|(id, sender, counter, body, status)| MessageParams {
                id,
                sender,
                counter,
                body,
                status,
            })
            .boxed()
    }
}

/// Build a message in `chat` from parameters. The send time is derived from
/// the counter, so copies with equal parameters are identical.
pub fn message_from_params(params: &MessageParams, chat: &str) -> Message {
    Message {
        id: MessageId::new(format!("m{}", params.id)),
        chat_id: chat.into(),
        plaintext: Some(params.body.clone()),
        ciphertext: Bytes::from(params.body.clone().into_bytes()),
        nonce: Nonce::ZERO,
        sender_id: params.sender.clone(),
        sender_commitment: format!("commit-{}", params.sender),
        timestamp: 1_000 + params.counter as i64 * 10,
        lamport: LamportStamp::new(params.counter, params.sender.clone()),
        vector: VectorClock::from_entries([(params.sender.clone(), params.counter)]),
        status: params.status,
        reply_to: None,
        version: 0,
        undecryptable: false,
    }
}

/// A message list with unique ids, as one replica would hold it.
pub fn message_set(chat: &'static str) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(any::<MessageParams>(), 0..12).prop_map(move |params| {
        let mut seen = std::collections::BTreeSet::new();
        params
            .iter()
            .filter(|p| seen.insert(p.id))
            .map(|p| message_from_params(p, chat))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_core::{compare_vector, CausalOrder, ConflictResolver};

    proptest! {
        #[test]
        fn test_vector_merge_commutative(a in vector_clock(), b in vector_clock()) {
            prop_assert_eq!(a.merged(&b), b.merged(&a));
        }

        #[test]
        fn test_vector_merge_associative(
            a in vector_clock(),
            b in vector_clock(),
            c in vector_clock(),
        ) {
            prop_assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
        }

        #[test]
        fn test_vector_merge_dominates_inputs(a in vector_clock(), b in vector_clock()) {
            let merged = a.merged(&b);
            prop_assert_eq!(merged.merged(&a), merged.clone());
            for input in [&a, &b] {
                let order = compare_vector(&merged, input);
                prop_assert!(matches!(order, CausalOrder::After | CausalOrder::Equal));
            }
        }

        #[test]
        fn test_dominating_state_is_taken_verbatim(
            local in chat_state("c"),
            remote in chat_state("c"),
            bump in node_id(),
        ) {
            let mut newer = remote.clone();
            newer.vector = local.vector.merged(&remote.vector);
            newer.vector.increment(&bump);

            let resolver = ConflictResolver::new();
            prop_assert_eq!(resolver.resolve_group_state(&local, &newer).merged, newer.clone());
            prop_assert_eq!(resolver.resolve_group_state(&newer, &local).merged, newer);
        }

        #[test]
        fn test_concurrent_states_converge(a in chat_state("c"), b in chat_state("c")) {
            prop_assume!(compare_vector(&a.vector, &b.vector) == CausalOrder::Concurrent);

            let resolver = ConflictResolver::new();
            let ab = resolver.resolve_group_state(&a, &b).merged;
            let ba = resolver.resolve_group_state(&b, &a).merged;
            prop_assert_eq!(&ab.name, &ba.name);
            prop_assert_eq!(&ab.avatar, &ba.avatar);
            prop_assert_eq!(&ab.participants, &ba.participants);
            prop_assert_eq!(&ab.vector, &ba.vector);
            prop_assert!(ab.participants.is_superset(&a.participants));
            prop_assert!(ab.participants.is_superset(&b.participants));
        }

        #[test]
        fn test_three_way_merge_order_independent(
            a in message_set("c"),
            b in message_set("c"),
            c in message_set("c"),
        ) {
            let resolver = ConflictResolver::new();
            let left = resolver.resolve_messages(&resolver.resolve_messages(&a, &b).merged, &c).merged;
            let right = resolver.resolve_messages(&a, &resolver.resolve_messages(&b, &c).merged).merged;
            prop_assert_eq!(left, right);
        }
    }
}
