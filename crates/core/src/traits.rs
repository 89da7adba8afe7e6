//! The state machine contract and the collaborator seams.
//!
//! Consensus owns ordering only. Everything with I/O or heavy CPU behind it
//! (the wire, storage, execution, the transaction pool) sits behind one of
//! the traits below, implemented by the embedding node and driven by the
//! runtime.

use crate::{Action, Event};
use async_trait::async_trait;
use palisade_types::{ConsensusNode, Hash, NodeId, Proposal};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The deterministic state machine driven by the runner.
pub trait StateMachine {
    /// Handle an event and return the actions to perform.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Advance the machine's notion of time before delivering an event.
    fn set_time(&mut self, now: Duration);

    /// Current time as last set by the runner.
    fn now(&self) -> Duration;
}

/// Where the ledger currently stands, as loaded at startup or reported
/// after a state sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub committed_index: u64,
    pub committed_hash: Hash,
    pub view: u64,
    pub nodes: Vec<ConsensusNode>,
}

/// The wire. Both calls are best-effort; consensus tolerates loss.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn broadcast(&self, payload: Vec<u8>);
    async fn send_to_node(&self, node: NodeId, payload: Vec<u8>, timeout: Duration);
}

/// Persistent chain storage.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn load_state(&self) -> Result<LedgerState, CollaboratorError>;
    async fn commit_proposal(&self, proposal: &Proposal) -> Result<(), CollaboratorError>;
    async fn commit_stable_checkpoint(&self, proposal: &Proposal)
        -> Result<(), CollaboratorError>;
}

/// Applies ordered proposals to application state.
#[async_trait]
pub trait StateMachineExecutor: Send + Sync {
    /// Execute `proposal` on top of `last_applied_index` and return it with
    /// its post-execution hash filled in.
    async fn apply(
        &self,
        last_applied_index: u64,
        proposal: Proposal,
    ) -> Result<Proposal, CollaboratorError>;
}

/// Transaction-pool-facing checks and notifications.
#[async_trait]
pub trait ProposalValidator: Send + Sync {
    /// Verify a foreign proposal's payload (transaction validity,
    /// duplicates, limits).
    async fn verify_proposal(&self, proposal: &Proposal) -> bool;

    /// Release the transactions sealed into an abandoned proposal.
    async fn reset_seal_flags(&self, proposal: &Proposal);
}

/// Failure surfaced by a collaborator. Consensus treats these as
/// retry-later, never as fatal.
#[derive(Debug, thiserror::Error)]
#[error("{context}: {message}")]
pub struct CollaboratorError {
    pub context: &'static str,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(context: &'static str, message: impl Into<String>) -> Self {
        Self {
            context,
            message: message.into(),
        }
    }
}
