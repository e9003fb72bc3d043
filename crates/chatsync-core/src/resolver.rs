//! Conflict resolution for messages and chat state.
//!
//! Both merges are pure functions of their inputs:
//!
//! - **Idempotent**: `resolve(resolve(A, B), B) == resolve(A, B)`
//! - **Outcome-commutative**: `resolve(A, B)` and `resolve(B, A)` pick the
//!   same winning value for every id
//!
//! Remote input is treated as a delta to fold in, never as an authoritative
//! replacement of local state, so optimistic local writes survive a poll
//! that does not know about them yet.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::chat::ChatState;
use crate::clock::{compare_lamport, compare_vector, CausalOrder};
use crate::message::Message;
use crate::types::MessageId;

/// Classification of what a merge ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    None,
    ConcurrentUpdate,
    DivergentState,
    Duplicate,
}

/// Merge strategy names as they appear in reports and logs.
pub mod strategy {
    pub const UNION: &str = "union";
    pub const LAMPORT_LWW: &str = "lamport-lww";
    pub const CAUSAL_DOMINANCE: &str = "causal-dominance";
    pub const FIELD_MERGE: &str = "field-merge";
}

/// Outcome summary of one merge call. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub conflict_type: ConflictType,
    pub strategy: String,
    /// Ids that were duplicates or conflicts.
    pub affected: Vec<String>,
    pub duplicates: usize,
    pub conflicts: usize,
    /// Remote ids that were not present locally.
    pub added: Vec<MessageId>,
}

impl MergeReport {
    fn new(strategy: &str) -> Self {
        Self {
            conflict_type: ConflictType::None,
            strategy: strategy.to_string(),
            affected: Vec::new(),
            duplicates: 0,
            conflicts: 0,
            added: Vec::new(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.conflict_type,
            ConflictType::ConcurrentUpdate | ConflictType::DivergentState
        )
    }
}

/// A merged value together with its report.
#[derive(Debug, Clone)]
pub struct Resolution<T> {
    pub merged: T,
    pub report: MergeReport,
}

/// Stateless resolver for message sets and chat state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Union two message collections by id.
    ///
    /// - id on one side only: kept as-is
    /// - same id, same content: `Duplicate`, local-only state joined
    /// - same id, different content: `ConcurrentUpdate`, Lamport LWW
    ///
    /// The result is sorted by wall-clock timestamp for display. That order
    /// is independent of which copy won, so a message can win on Lamport
    /// order yet sort before its rival when wall clocks drift.
    pub fn resolve_messages(&self, local: &[Message], remote: &[Message]) -> Resolution<Vec<Message>> {
        let mut report = MergeReport::new(strategy::UNION);
        let mut by_id: BTreeMap<MessageId, Message> = BTreeMap::new();

        for msg in local {
            fold_into(&mut by_id, msg, &mut report);
        }
        for msg in remote {
            if !by_id.contains_key(&msg.id) && !report.added.contains(&msg.id) {
                report.added.push(msg.id.clone());
            }
            fold_into(&mut by_id, msg, &mut report);
        }

        report.conflict_type = if report.conflicts > 0 {
            report.strategy = strategy::LAMPORT_LWW.to_string();
            ConflictType::ConcurrentUpdate
        } else if report.duplicates > 0 {
            ConflictType::Duplicate
        } else {
            ConflictType::None
        };
        report.affected.sort();
        report.affected.dedup();

        let mut merged: Vec<Message> = by_id.into_values().collect();
        merged.sort_by(display_order);

        Resolution { merged, report }
    }

    /// Merge two versions of a chat's state.
    ///
    /// If one vector clock dominates, that side is taken verbatim. When the
    /// clocks are concurrent the fields are merged one by one:
    /// name and avatar from the side with the later `last_message_time`,
    /// `last_message_time` and `unread_count` as max, participants as union,
    /// `version = max + 1`.
    pub fn resolve_group_state(&self, local: &ChatState, remote: &ChatState) -> Resolution<ChatState> {
        match compare_vector(&local.vector, &remote.vector) {
            CausalOrder::After => Resolution {
                merged: local.clone(),
                report: MergeReport::new(strategy::CAUSAL_DOMINANCE),
            },
            CausalOrder::Before => Resolution {
                merged: remote.clone(),
                report: MergeReport::new(strategy::CAUSAL_DOMINANCE),
            },
            CausalOrder::Equal if local == remote => Resolution {
                merged: local.clone(),
                report: MergeReport::new(strategy::CAUSAL_DOMINANCE),
            },
            CausalOrder::Equal => {
                // Same history, different fields: replicas diverged without a
                // clock bump. Merge fields but keep the version stable so a
                // repeated merge is a no-op.
                let mut merged = merge_fields(local, remote);
                merged.version = local.version.max(remote.version);
                let mut report = MergeReport::new(strategy::FIELD_MERGE);
                report.conflict_type = ConflictType::DivergentState;
                report.affected.push(local.id.to_string());
                Resolution { merged, report }
            }
            CausalOrder::Concurrent => {
                let mut merged = merge_fields(local, remote);
                merged.version = local.version.max(remote.version).saturating_add(1);
                let mut report = MergeReport::new(strategy::FIELD_MERGE);
                report.conflict_type = ConflictType::ConcurrentUpdate;
                report.conflicts = 1;
                report.affected.push(local.id.to_string());
                tracing::debug!(chat = %local.id, "concurrent chat state update merged field by field");
                Resolution { merged, report }
            }
        }
    }
}

fn fold_into(by_id: &mut BTreeMap<MessageId, Message>, incoming: &Message, report: &mut MergeReport) {
    let Some(existing) = by_id.get_mut(&incoming.id) else {
        by_id.insert(incoming.id.clone(), incoming.clone());
        return;
    };

    if existing.same_content(incoming) {
        existing.absorb(incoming);
        report.duplicates += 1;
    } else {
        let status = existing.status.join(incoming.status);
        let version = existing.version.max(incoming.version);
        if pick_winner(existing, incoming) == Ordering::Less {
            *existing = incoming.clone();
        }
        existing.status = status;
        existing.version = version;
        report.conflicts += 1;
    }
    report.affected.push(incoming.id.to_string());
}

/// Order two conflicting copies; the greater one wins.
///
/// Lamport order first, then the sender commitment, then the raw content
/// so the choice is total and independent of argument order.
fn pick_winner(a: &Message, b: &Message) -> Ordering {
    compare_lamport(&a.lamport, &b.lamport)
        .then_with(|| a.sender_commitment.cmp(&b.sender_commitment))
        .then_with(|| a.ciphertext.cmp(&b.ciphertext))
        .then_with(|| a.nonce.0.cmp(&b.nonce.0))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.reply_to.cmp(&b.reply_to))
}

fn display_order(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| compare_lamport(&a.lamport, &b.lamport))
        .then_with(|| a.id.cmp(&b.id))
}

fn merge_fields(local: &ChatState, remote: &ChatState) -> ChatState {
    let (name, avatar) = match local.last_message_time.cmp(&remote.last_message_time) {
        Ordering::Greater => (local.name.clone(), local.avatar.clone()),
        Ordering::Less => (remote.name.clone(), remote.avatar.clone()),
        Ordering::Equal => (
            local.name.clone().max(remote.name.clone()),
            local.avatar.clone().max(remote.avatar.clone()),
        ),
    };

    ChatState {
        id: local.id.clone(),
        name,
        avatar,
        participants: local.participants.union(&remote.participants).cloned().collect(),
        vector: local.vector.merged(&remote.vector),
        last_message_time: local.last_message_time.max(remote.last_message_time),
        unread_count: local.unread_count.max(remote.unread_count),
        cleared_before: local.cleared_before.max(remote.cleared_before),
        version: local.version.max(remote.version),
    }
}
