//! Domain-separated signing payloads.
//!
//! Every signature in the protocol covers a domain tag plus the fields that
//! identify the statement being signed, never raw user bytes.

/// Domain tag for consensus packet signatures.
pub const DOMAIN_CONSENSUS_MESSAGE: &[u8] = b"PALISADE_CONSENSUS_MESSAGE";
/// Domain tag for synthesized empty proposals.
pub const DOMAIN_EMPTY_PROPOSAL: &[u8] = b"PALISADE_EMPTY_PROPOSAL";

/// Build the signing payload for a consensus packet.
pub fn consensus_message_payload(
    packet_type: u8,
    view: u64,
    index: u64,
    from: u32,
    hash: &crate::Hash,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(DOMAIN_CONSENSUS_MESSAGE.len() + 1 + 8 + 8 + 4 + 32);
    payload.extend_from_slice(DOMAIN_CONSENSUS_MESSAGE);
    payload.push(packet_type);
    payload.extend_from_slice(&view.to_le_bytes());
    payload.extend_from_slice(&index.to_le_bytes());
    payload.extend_from_slice(&from.to_le_bytes());
    payload.extend_from_slice(hash.as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Hash;

    #[test]
    fn payload_binds_all_fields() {
        let h = Hash::of(b"p");
        let base = consensus_message_payload(1, 0, 3, 2, &h);
        assert_ne!(base, consensus_message_payload(2, 0, 3, 2, &h));
        assert_ne!(base, consensus_message_payload(1, 1, 3, 2, &h));
        assert_ne!(base, consensus_message_payload(1, 0, 4, 2, &h));
        assert_ne!(base, consensus_message_payload(1, 0, 3, 1, &h));
        assert_ne!(base, consensus_message_payload(1, 0, 3, 2, &Hash::of(b"q")));
    }
}
