//! Weighted PBFT-family agreement for a permissioned committee.
//!
//! The crate is a pure state machine: [`ConsensusEngine`] consumes
//! [`Event`](palisade_core::Event)s and returns
//! [`Action`](palisade_core::Action)s, with no I/O of its own. The runner
//! owns sockets, timers and the executor, and feeds events back in.
//!
//! Proposals move through a per-index [`ProposalCertificate`]:
//! pre-prepare, prepare quorum (lock), commit quorum (total order),
//! execution, checkpoint quorum (stable, garbage-collectible). Leader
//! failures are handled by weighted view changes with adaptive timeouts.

mod cache;
mod certificate;
mod config;
mod engine;
mod timer;

pub use cache::{CacheProcessor, RecoverTarget};
pub use certificate::{CertificatePhase, PrePrepareOutcome, ProposalCertificate};
pub use config::{ConfigError, NodeConfig};
pub use engine::{ConsensusEngine, ConsensusStatus, EngineOptions};
pub use timer::AdaptiveTimer;
