//! Wire codec for consensus packets.

use crate::packet::ConsensusMessage;

/// Errors decoding or encoding wire bytes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(bincode::Error),
}

/// Serialize a packet for transport.
pub fn encode(message: &ConsensusMessage) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(message).map_err(CodecError::Encode)
}

/// Deserialize a packet received from the wire.
pub fn decode(bytes: &[u8]) -> Result<ConsensusMessage, CodecError> {
    bincode::deserialize(bytes).map_err(CodecError::Decode)
}
