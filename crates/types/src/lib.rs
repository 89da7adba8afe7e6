//! Core types for palisade consensus.
//!
//! This crate provides the foundational types used throughout the agreement
//! core:
//!
//! - **Primitives**: Hash, cryptographic keys and signatures
//! - **Identifiers**: NodeId, NodeIndex, Weight
//! - **Membership**: ConsensusNode, ConsensusNodeList with weighted quorum
//!   arithmetic
//! - **Proposals**: the opaque payload unit ordered by consensus
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod crypto;
mod hash;
mod identifiers;
mod node_list;
mod proposal;
mod signing;

pub use crypto::{KeyPair, PublicKey, Signature};
pub use hash::{Hash, HexError};
pub use identifiers::{NodeId, NodeIndex, Weight};
pub use node_list::{ConsensusNode, ConsensusNodeList, NodeListError};
pub use proposal::Proposal;
pub use signing::{
    consensus_message_payload, DOMAIN_CONSENSUS_MESSAGE, DOMAIN_EMPTY_PROPOSAL,
};

/// Test utilities.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Deterministic key pair from a small seed.
    pub fn test_keypair(seed: u64) -> KeyPair {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        KeyPair::generate(&mut rng)
    }

    /// Key pairs for an `n`-node committee, ordered to match the sorted
    /// membership list built from the same seeds.
    pub fn test_keypairs(n: usize) -> Vec<KeyPair> {
        let mut keypairs: Vec<KeyPair> = (0..n as u64).map(test_keypair).collect();
        keypairs.sort_by_key(|kp| NodeId::from_public_key(&kp.public_key()));
        keypairs
    }

    /// An equal-weight committee of `n` nodes.
    pub fn test_node_list(n: usize) -> ConsensusNodeList {
        let nodes = (0..n as u64)
            .map(|seed| ConsensusNode::new(test_keypair(seed).public_key(), 1))
            .collect();
        ConsensusNodeList::new(nodes).unwrap()
    }
}
