//! Inbound packet verification.
//!
//! The engine assumes every delivered message is authentic; this module is
//! where that assumption is paid for. Besides the outer signature it checks
//! the signatures nested inside ViewChange and NewView packets, so a forged
//! justification never reaches the state machine.

use palisade_messages::{ConsensusMessage, MessagePayload, PacketType, ViewChangeData};
use palisade_types::{consensus_message_payload, ConsensusNodeList, NodeIndex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("sender {0} is not a committee member")]
    UnknownSender(NodeIndex),
    #[error("bad signature on {packet} packet from {from}")]
    BadSignature { packet: &'static str, from: NodeIndex },
    #[error("view change from {from} carries an invalid prepare proof for index {index}")]
    BadPrepareProof { from: NodeIndex, index: u64 },
    #[error("new view carries a non-view-change packet")]
    ForeignNestedPacket,
}

/// Verify a decoded packet before it enters the state machine.
pub fn verify_message(
    message: &ConsensusMessage,
    nodes: &ConsensusNodeList,
) -> Result<(), VerifyError> {
    let public_key = nodes
        .public_key(message.from)
        .ok_or(VerifyError::UnknownSender(message.from))?;
    if !message.verify(public_key) {
        return Err(VerifyError::BadSignature {
            packet: message.packet_type.name(),
            from: message.from,
        });
    }

    match &message.payload {
        MessagePayload::ViewChange(data) => verify_view_change(message.from, data, nodes),
        MessagePayload::NewView(data) => {
            for view_change in &data.view_changes {
                if view_change.packet_type != PacketType::ViewChange {
                    return Err(VerifyError::ForeignNestedPacket);
                }
                verify_message(view_change, nodes)?;
            }
            for pre_prepare in &data.pre_prepares {
                let leader_key = nodes
                    .public_key(pre_prepare.from)
                    .ok_or(VerifyError::UnknownSender(pre_prepare.from))?;
                if !pre_prepare.verify(leader_key) {
                    return Err(VerifyError::BadSignature {
                        packet: pre_prepare.packet_type.name(),
                        from: pre_prepare.from,
                    });
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Check the prepare proofs behind every lock a view change carries.
///
/// Each proof entry is an original Prepare vote: a signature over the vote
/// payload at the view the proposal locked in.
fn verify_view_change(
    from: NodeIndex,
    data: &ViewChangeData,
    nodes: &ConsensusNodeList,
) -> Result<(), VerifyError> {
    for prepared in &data.prepared {
        let proposal = &prepared.proposal;
        for (voter, signature) in &proposal.signature_proof {
            let voter_key = nodes
                .public_key(*voter)
                .ok_or(VerifyError::UnknownSender(*voter))?;
            let payload = consensus_message_payload(
                PacketType::Prepare.as_u8(),
                prepared.view,
                proposal.index,
                voter.0,
                &proposal.hash,
            );
            if !voter_key.verify(&payload, signature) {
                return Err(VerifyError::BadPrepareProof {
                    from,
                    index: proposal.index,
                });
            }
        }
    }
    Ok(())
}
