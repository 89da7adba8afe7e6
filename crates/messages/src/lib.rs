//! Network messages for the consensus protocol.

pub mod codec;
mod packet;
mod view_change;

// Re-export commonly used types
pub use codec::CodecError;
pub use packet::{ConsensusMessage, MessagePayload, PacketType, RecoverResponsePayload};
pub use view_change::{NewViewData, PreparedProposal, ViewChangeData};
