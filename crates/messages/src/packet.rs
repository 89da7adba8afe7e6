//! The consensus packet: one tagged message type for every protocol phase.

use crate::view_change::{NewViewData, ViewChangeData};
use palisade_types::{consensus_message_payload, Hash, KeyPair, NodeIndex, Proposal, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// Wire-stable packet discriminants.
///
/// The ordinals are part of the wire format and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    PrePrepare = 0,
    Prepare = 1,
    Commit = 2,
    ViewChange = 3,
    NewView = 4,
    CheckPoint = 5,
    RecoverRequest = 6,
    RecoverResponse = 7,
    ProposalRequest = 8,
    ProposalResponse = 9,
}

impl PacketType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::PrePrepare),
            1 => Some(Self::Prepare),
            2 => Some(Self::Commit),
            3 => Some(Self::ViewChange),
            4 => Some(Self::NewView),
            5 => Some(Self::CheckPoint),
            6 => Some(Self::RecoverRequest),
            7 => Some(Self::RecoverResponse),
            8 => Some(Self::ProposalRequest),
            9 => Some(Self::ProposalResponse),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PrePrepare => "pre_prepare",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::ViewChange => "view_change",
            Self::NewView => "new_view",
            Self::CheckPoint => "check_point",
            Self::RecoverRequest => "recover_request",
            Self::RecoverResponse => "recover_response",
            Self::ProposalRequest => "proposal_request",
            Self::ProposalResponse => "proposal_response",
        }
    }
}

/// Variable body of a consensus packet.
///
/// The `hash` field of the enclosing packet always equals `digest()` of the
/// payload, so the packet signature binds the body as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    None,
    Proposal(Proposal),
    ViewChange(ViewChangeData),
    NewView(NewViewData),
    RecoverResponse(RecoverResponsePayload),
}

impl MessagePayload {
    pub fn digest(&self) -> Hash {
        match self {
            Self::None => Hash::ZERO,
            Self::Proposal(p) => p.hash,
            Self::ViewChange(d) => d.digest(),
            Self::NewView(d) => d.digest(),
            Self::RecoverResponse(r) => r.digest(),
        }
    }
}

/// A node's answer to a recovery probe: where its chain currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverResponsePayload {
    pub view: u64,
    pub committed_index: u64,
    pub node_count: u32,
}

impl RecoverResponsePayload {
    pub fn digest(&self) -> Hash {
        Hash::of_parts(&[
            &self.view.to_le_bytes(),
            &self.committed_index.to_le_bytes(),
            &self.node_count.to_le_bytes(),
        ])
    }
}

/// A single consensus packet.
///
/// Every protocol phase shares this shape: the fixed header identifies the
/// phase, view, index and sender; `hash` commits to the body; the signature
/// covers the header fields so recipients can authenticate before looking at
/// the body at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub packet_type: PacketType,
    pub view: u64,
    pub index: u64,
    pub from: NodeIndex,
    pub timestamp_ms: u64,
    pub hash: Hash,
    pub payload: MessagePayload,
    pub signature: Signature,
}

impl ConsensusMessage {
    /// Build and sign a packet whose `hash` is the payload digest.
    pub fn signed(
        packet_type: PacketType,
        view: u64,
        index: u64,
        from: NodeIndex,
        timestamp_ms: u64,
        payload: MessagePayload,
        keypair: &KeyPair,
    ) -> Self {
        let hash = payload.digest();
        Self::signed_with_hash(packet_type, view, index, from, timestamp_ms, hash, payload, keypair)
    }

    /// Build and sign a packet with an explicit `hash` (vote packets and
    /// proposal requests reference a hash without carrying the body).
    #[allow(clippy::too_many_arguments)]
    pub fn signed_with_hash(
        packet_type: PacketType,
        view: u64,
        index: u64,
        from: NodeIndex,
        timestamp_ms: u64,
        hash: Hash,
        payload: MessagePayload,
        keypair: &KeyPair,
    ) -> Self {
        let signing = consensus_message_payload(packet_type.as_u8(), view, index, from.0, &hash);
        let signature = keypair.sign(&signing);
        Self {
            packet_type,
            view,
            index,
            from,
            timestamp_ms,
            hash,
            payload,
            signature,
        }
    }

    /// The bytes the packet signature covers.
    pub fn signing_payload(&self) -> Vec<u8> {
        consensus_message_payload(
            self.packet_type.as_u8(),
            self.view,
            self.index,
            self.from.0,
            &self.hash,
        )
    }

    /// Check the packet signature against the sender's key, including that
    /// the body matches the signed digest.
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        if !self.payload_matches_hash() {
            return false;
        }
        public_key.verify(&self.signing_payload(), &self.signature)
    }

    /// True if the body digest agrees with the signed `hash` field.
    ///
    /// Vote packets carry no body, so any hash is consistent with
    /// `MessagePayload::None`.
    pub fn payload_matches_hash(&self) -> bool {
        match &self.payload {
            MessagePayload::None => true,
            payload => payload.digest() == self.hash,
        }
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        match &self.payload {
            MessagePayload::Proposal(p) => Some(p),
            _ => None,
        }
    }

    pub fn view_change_data(&self) -> Option<&ViewChangeData> {
        match &self.payload {
            MessagePayload::ViewChange(d) => Some(d),
            _ => None,
        }
    }

    pub fn new_view_data(&self) -> Option<&NewViewData> {
        match &self.payload {
            MessagePayload::NewView(d) => Some(d),
            _ => None,
        }
    }

    pub fn recover_response(&self) -> Option<&RecoverResponsePayload> {
        match &self.payload {
            MessagePayload::RecoverResponse(r) => Some(r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::test_keypair;

    #[test]
    fn packet_ordinals_are_stable() {
        assert_eq!(PacketType::PrePrepare.as_u8(), 0);
        assert_eq!(PacketType::Prepare.as_u8(), 1);
        assert_eq!(PacketType::Commit.as_u8(), 2);
        assert_eq!(PacketType::ViewChange.as_u8(), 3);
        assert_eq!(PacketType::NewView.as_u8(), 4);
        assert_eq!(PacketType::CheckPoint.as_u8(), 5);
        assert_eq!(PacketType::RecoverRequest.as_u8(), 6);
        assert_eq!(PacketType::RecoverResponse.as_u8(), 7);
        assert_eq!(PacketType::ProposalRequest.as_u8(), 8);
        assert_eq!(PacketType::ProposalResponse.as_u8(), 9);
        for v in 0..=9u8 {
            assert_eq!(PacketType::from_u8(v).map(PacketType::as_u8), Some(v));
        }
        assert_eq!(PacketType::from_u8(10), None);
    }

    #[test]
    fn signature_covers_header() {
        let kp = test_keypair(1);
        let proposal = Proposal::new(3, b"block".to_vec());
        let msg = ConsensusMessage::signed(
            PacketType::PrePrepare,
            0,
            3,
            NodeIndex(0),
            1_000,
            MessagePayload::Proposal(proposal),
            &kp,
        );
        assert!(msg.verify(&kp.public_key()));

        let mut tampered = msg.clone();
        tampered.view = 1;
        assert!(!tampered.verify(&kp.public_key()));
    }

    #[test]
    fn body_swap_is_detected() {
        let kp = test_keypair(1);
        let msg = ConsensusMessage::signed(
            PacketType::PrePrepare,
            0,
            3,
            NodeIndex(0),
            1_000,
            MessagePayload::Proposal(Proposal::new(3, b"a".to_vec())),
            &kp,
        );
        let mut swapped = msg.clone();
        swapped.payload = MessagePayload::Proposal(Proposal::new(3, b"b".to_vec()));
        assert!(!swapped.verify(&kp.public_key()));
    }

    #[test]
    fn wrong_key_fails() {
        let kp = test_keypair(1);
        let msg = ConsensusMessage::signed_with_hash(
            PacketType::Prepare,
            0,
            3,
            NodeIndex(1),
            1_000,
            Hash::of(b"p"),
            MessagePayload::None,
            &kp,
        );
        assert!(msg.verify(&kp.public_key()));
        assert!(!msg.verify(&test_keypair(2).public_key()));
    }
}
