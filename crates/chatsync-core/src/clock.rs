//! Logical clocks: Lamport scalar stamps and vector clocks.
//!
//! Every message carries both. The Lamport stamp gives a total order used
//! for last-write-wins; the vector clock captures the partial causal order
//! used to detect concurrent chat-state updates.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::types::NodeId;

/// A Lamport timestamp paired with the node that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LamportStamp {
    pub counter: u64,
    pub node_id: NodeId,
}

impl LamportStamp {
    pub fn new(counter: u64, node_id: NodeId) -> Self {
        Self { counter, node_id }
    }
}

impl Ord for LamportStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_lamport(self, other)
    }
}

impl PartialOrd for LamportStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order over Lamport stamps: counter first, ties broken by a
/// lexical comparison of the node id.
pub fn compare_lamport(a: &LamportStamp, b: &LamportStamp) -> Ordering {
    a.counter
        .cmp(&b.counter)
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// The first clock happened before the second.
    Before,
    /// The first clock happened after the second.
    After,
    /// Neither dominates; the updates need conflict handling.
    Concurrent,
    /// Identical clocks.
    Equal,
}

impl CausalOrder {
    pub fn is_concurrent(&self) -> bool {
        matches!(self, CausalOrder::Concurrent)
    }

    /// The same relationship seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::After => CausalOrder::Before,
            other => other,
        }
    }
}

/// Per-node counter vector. Missing entries read as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<NodeId, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(node, counter)` pairs.
    pub fn from_entries<I, N>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, u64)>,
        N: Into<NodeId>,
    {
        let mut clock = Self::new();
        for (node, counter) in entries {
            clock.set(&node.into(), counter);
        }
        clock
    }

    pub fn get(&self, node: &NodeId) -> u64 {
        self.entries.get(node).copied().unwrap_or(0)
    }

    /// Set a slot. Zero removes the slot so equal clocks compare equal
    /// structurally.
    pub fn set(&mut self, node: &NodeId, counter: u64) {
        if counter == 0 {
            self.entries.remove(node);
        } else {
            self.entries.insert(node.clone(), counter);
        }
    }

    pub fn increment(&mut self, node: &NodeId) -> u64 {
        let slot = self.entries.entry(node.clone()).or_insert(0);
        *slot = slot.saturating_add(1);
        *slot
    }

    /// Componentwise max.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, &counter) in &other.entries {
            let slot = self.entries.entry(node.clone()).or_insert(0);
            *slot = (*slot).max(counter);
        }
    }

    /// Componentwise max, returning a new clock.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<N: Into<NodeId>> FromIterator<(N, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (N, u64)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

/// Compare two vector clocks.
///
/// `a` is `Before` `b` iff every slot of `a` is `<=` the matching slot of
/// `b` with at least one strictly smaller.
pub fn compare_vector(a: &VectorClock, b: &VectorClock) -> CausalOrder {
    let mut a_less = false;
    let mut b_less = false;

    let nodes = a.entries.keys().chain(b.entries.keys());
    for node in nodes {
        let (x, y) = (a.get(node), b.get(node));
        match x.cmp(&y) {
            Ordering::Less => a_less = true,
            Ordering::Greater => b_less = true,
            Ordering::Equal => {}
        }
        if a_less && b_less {
            return CausalOrder::Concurrent;
        }
    }

    match (a_less, b_less) {
        (false, false) => CausalOrder::Equal,
        (true, false) => CausalOrder::Before,
        (false, true) => CausalOrder::After,
        (true, true) => CausalOrder::Concurrent,
    }
}

/// The local node's logical clock.
///
/// Holds a Lamport counter and a vector clock that advance together.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    node_id: NodeId,
    lamport: u64,
    vector: VectorClock,
}

impl LogicalClock {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            lamport: 0,
            vector: VectorClock::new(),
        }
    }

    /// Restore a clock from previously observed state, e.g. the highest
    /// stamps found in storage after a restart.
    pub fn restore(node_id: NodeId, lamport: u64, vector: VectorClock) -> Self {
        Self {
            node_id,
            lamport,
            vector,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    pub fn vector(&self) -> &VectorClock {
        &self.vector
    }

    /// Advance for a local event. Counters saturate at `u64::MAX`.
    pub fn tick(&mut self) -> (LamportStamp, VectorClock) {
        self.lamport = self.lamport.saturating_add(1);
        self.vector.increment(&self.node_id);
        self.stamp()
    }

    /// Fold in a remote stamp: `lamport = max(local, remote) + 1`, vector
    /// merged componentwise then the local slot incremented.
    ///
    /// Call once per distinct remote stamp. Extra calls only inflate the
    /// counters.
    pub fn observe(
        &mut self,
        remote: &LamportStamp,
        remote_vector: &VectorClock,
    ) -> (LamportStamp, VectorClock) {
        self.lamport = self.lamport.max(remote.counter).saturating_add(1);
        self.vector.merge(remote_vector);
        self.vector.increment(&self.node_id);
        self.stamp()
    }

    fn stamp(&self) -> (LamportStamp, VectorClock) {
        (
            LamportStamp::new(self.lamport, self.node_id.clone()),
            self.vector.clone(),
        )
    }
}
