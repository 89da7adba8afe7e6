//! View-change and new-view message bodies.

use crate::packet::ConsensusMessage;
use palisade_types::{Hash, Proposal};
use serde::{Deserialize, Serialize};

/// A proposal the sender is locked on, together with the view at which it
/// reached prepare-quorum. New leaders pick the highest-view lock per index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedProposal {
    pub view: u64,
    pub proposal: Proposal,
}

/// Body of a ViewChange packet: everything the sender must not lose across
/// the leader switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeData {
    /// Highest index the sender has committed.
    pub committed_index: u64,
    /// Hash committed at that index.
    pub committed_hash: Hash,
    /// Locked proposals above the committed index, with prepare proofs.
    pub prepared: Vec<PreparedProposal>,
}

impl ViewChangeData {
    pub fn digest(&self) -> Hash {
        let mut parts: Vec<Vec<u8>> = vec![
            self.committed_index.to_le_bytes().to_vec(),
            self.committed_hash.as_bytes().to_vec(),
        ];
        for p in &self.prepared {
            parts.push(p.view.to_le_bytes().to_vec());
            parts.push(p.proposal.index.to_le_bytes().to_vec());
            parts.push(p.proposal.hash.as_bytes().to_vec());
        }
        let slices: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        Hash::of_parts(&slices)
    }

    /// Highest index carrying a locked proposal, if any.
    pub fn max_prepared_index(&self) -> Option<u64> {
        self.prepared.iter().map(|p| p.proposal.index).max()
    }
}

/// Body of a NewView packet: the quorum of ViewChange packets justifying the
/// switch, plus the PrePrepares the new leader re-issues from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewViewData {
    pub view_changes: Vec<ConsensusMessage>,
    pub pre_prepares: Vec<ConsensusMessage>,
}

impl NewViewData {
    pub fn digest(&self) -> Hash {
        let mut parts: Vec<Vec<u8>> = Vec::new();
        for vc in &self.view_changes {
            parts.push(vc.from.0.to_le_bytes().to_vec());
            parts.push(vc.hash.as_bytes().to_vec());
        }
        for pp in &self.pre_prepares {
            parts.push(pp.index.to_le_bytes().to_vec());
            parts.push(pp.hash.as_bytes().to_vec());
        }
        let slices: Vec<&[u8]> = parts.iter().map(|p| p.as_slice()).collect();
        Hash::of_parts(&slices)
    }
}
