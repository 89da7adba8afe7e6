//! Proposals ordered by consensus.

use crate::signing::DOMAIN_EMPTY_PROPOSAL;
use crate::{Hash, NodeIndex, Signature};
use serde::{Deserialize, Serialize};

/// A block proposal flowing through the agreement pipeline.
///
/// The payload is opaque to consensus; only the content hash is agreed on.
/// `signature_proof` carries the weighted prepare-quorum proof once the
/// proposal commits, so a synced peer can check it without replaying votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub index: u64,
    pub hash: Hash,
    pub payload: Vec<u8>,
    /// True for governance blocks (membership or parameter changes) whose
    /// effects must land before later blocks may execute.
    pub is_system: bool,
    pub signature_proof: Vec<(NodeIndex, Signature)>,
    pub extra_data: Vec<u8>,
}

impl Proposal {
    pub fn new(index: u64, payload: Vec<u8>) -> Self {
        Self::with_system_flag(index, payload, false)
    }

    pub fn new_system(index: u64, payload: Vec<u8>) -> Self {
        Self::with_system_flag(index, payload, true)
    }

    fn with_system_flag(index: u64, payload: Vec<u8>, is_system: bool) -> Self {
        let hash = Hash::of_parts(&[&[is_system as u8], &index.to_le_bytes(), &payload]);
        Self {
            index,
            hash,
            payload,
            is_system,
            signature_proof: Vec::new(),
            extra_data: Vec::new(),
        }
    }

    /// The deterministic empty proposal used to fill gaps when a new leader
    /// takes over: every node synthesizes an identical one for an index.
    pub fn empty(index: u64) -> Self {
        let hash = Hash::of_parts(&[DOMAIN_EMPTY_PROPOSAL, &index.to_le_bytes()]);
        Self {
            index,
            hash,
            payload: Vec::new(),
            is_system: false,
            signature_proof: Vec::new(),
            extra_data: Vec::new(),
        }
    }

    /// True for synthesized placeholder proposals that seal no transactions.
    pub fn is_empty_placeholder(&self) -> bool {
        self.hash == Hash::of_parts(&[DOMAIN_EMPTY_PROPOSAL, &self.index.to_le_bytes()])
    }
}
