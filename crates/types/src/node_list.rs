//! Consensus membership and weighted quorum arithmetic.

use crate::{NodeId, NodeIndex, PublicKey, Weight};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single member of the consensus committee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusNode {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub weight: Weight,
}

impl ConsensusNode {
    pub fn new(public_key: PublicKey, weight: Weight) -> Self {
        Self {
            node_id: NodeId::from_public_key(&public_key),
            public_key,
            weight,
        }
    }
}

/// Errors constructing a membership list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeListError {
    /// A committee with no members cannot form any quorum.
    #[error("consensus node list is empty")]
    Empty,
    /// Total weight of zero makes every quorum test degenerate.
    #[error("total voting weight is zero")]
    ZeroWeight,
}

/// The sorted consensus committee with precomputed quorum thresholds.
///
/// Nodes are ordered by `(node_id, weight)` so that every node computes an
/// identical list from the same membership set; a node's position in this
/// list is its [`NodeIndex`].
///
/// With total weight `W`, the list tolerates `max_faulty_weight = (W-1)/3`
/// faulty weight and requires `min_required_quorum = W - max_faulty_weight`
/// for any quorum decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusNodeList {
    nodes: Vec<ConsensusNode>,
    total_weight: Weight,
    max_faulty_weight: Weight,
    min_required_quorum: Weight,
    #[serde(skip)]
    index_by_id: HashMap<NodeId, NodeIndex>,
}

impl ConsensusNodeList {
    pub fn new(mut nodes: Vec<ConsensusNode>) -> Result<Self, NodeListError> {
        if nodes.is_empty() {
            return Err(NodeListError::Empty);
        }
        nodes.sort_by(|a, b| (a.node_id, a.weight).cmp(&(b.node_id, b.weight)));
        nodes.dedup_by(|a, b| a.node_id == b.node_id);

        let total_weight: Weight = nodes.iter().map(|n| n.weight).sum();
        if total_weight == 0 {
            return Err(NodeListError::ZeroWeight);
        }
        let max_faulty_weight = (total_weight - 1) / 3;
        let min_required_quorum = total_weight - max_faulty_weight;

        let index_by_id = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node_id, NodeIndex(i as u32)))
            .collect();

        Ok(Self {
            nodes,
            total_weight,
            max_faulty_weight,
            min_required_quorum,
            index_by_id,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ConsensusNode] {
        &self.nodes
    }

    pub fn get(&self, index: NodeIndex) -> Option<&ConsensusNode> {
        self.nodes.get(index.as_usize())
    }

    pub fn index_of(&self, node_id: &NodeId) -> Option<NodeIndex> {
        self.index_by_id.get(node_id).copied()
    }

    pub fn is_member(&self, node_id: &NodeId) -> bool {
        self.index_by_id.contains_key(node_id)
    }

    pub fn weight_of(&self, index: NodeIndex) -> Option<Weight> {
        self.get(index).map(|n| n.weight)
    }

    pub fn public_key(&self, index: NodeIndex) -> Option<&PublicKey> {
        self.get(index).map(|n| &n.public_key)
    }

    pub fn total_weight(&self) -> Weight {
        self.total_weight
    }

    /// Weight the committee can lose while still reaching agreement.
    pub fn max_faulty_weight(&self) -> Weight {
        self.max_faulty_weight
    }

    /// Minimum accumulated weight for any quorum decision.
    pub fn min_required_quorum(&self) -> Weight {
        self.min_required_quorum
    }

    pub fn has_quorum(&self, weight: Weight) -> bool {
        weight >= self.min_required_quorum
    }

    /// Rebuild the lookup table after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index_by_id = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.node_id, NodeIndex(i as u32)))
            .collect();
    }
}
