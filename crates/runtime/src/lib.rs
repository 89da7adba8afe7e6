//! Tokio runtime around the consensus engine.
//!
//! The engine itself is synchronous and deterministic; everything impure
//! lives here: channels and timers, packet decode and signature checks,
//! delegated verification and execution, ledger commits, and the transport.

mod service;
mod timers;
mod verify;

pub use service::{Collaborators, ConsensusService, ServiceError, ServiceOptions};
pub use timers::TimerManager;
pub use verify::{verify_message, VerifyError};
