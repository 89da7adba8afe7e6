//! Action types for the deterministic state machine.

use crate::{Event, TimerId};
use palisade_messages::ConsensusMessage;
use palisade_types::{NodeId, Proposal};
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a packet to every consensus node.
    Broadcast { message: ConsensusMessage },

    /// Send a packet to a single node (recovery and proposal fetch).
    SendToNode {
        node: NodeId,
        message: ConsensusMessage,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set a timer to fire after a duration. Re-setting an armed timer
    /// replaces it.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously set timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (fed back as events with Internal priority)
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing, ahead of any
    /// external input at the same instant.
    EnqueueInternal { event: Event },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated Work (async, returns callback event)
    // ═══════════════════════════════════════════════════════════════════════
    /// Verify a pre-prepare's payload against local rules (transaction
    /// validity, duplicates, size limits).
    ///
    /// Delegated to a worker in production, instant in tests.
    /// Returns `Event::ProposalVerified` when complete.
    VerifyProposal { message: ConsensusMessage },

    /// Apply a committed proposal to the state machine executor.
    ///
    /// At most one execution is in flight at a time; the cache processor
    /// dispatches strictly in index order.
    /// Returns `Event::ProposalExecuted` when complete.
    ExecuteProposal {
        last_applied_index: u64,
        proposal: Proposal,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence and pool notifications (fire-and-forget)
    // ═══════════════════════════════════════════════════════════════════════
    /// Persist an executed proposal with its prepare proof.
    CommitProposal { proposal: Proposal },

    /// Mark a proposal stable: a checkpoint quorum agreed on its
    /// post-execution state.
    CommitStableCheckpoint { proposal: Proposal },

    /// Release the transactions sealed into an abandoned proposal back to
    /// the pool.
    ResetSealFlags { proposal: Proposal },
}

impl Action {
    /// True for actions whose result re-enters the state machine as a
    /// callback event.
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::VerifyProposal { .. } | Action::ExecuteProposal { .. }
        )
    }

    /// Short name for logging and stats.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendToNode { .. } => "SendToNode",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::VerifyProposal { .. } => "VerifyProposal",
            Action::ExecuteProposal { .. } => "ExecuteProposal",
            Action::CommitProposal { .. } => "CommitProposal",
            Action::CommitStableCheckpoint { .. } => "CommitStableCheckpoint",
            Action::ResetSealFlags { .. } => "ResetSealFlags",
        }
    }
}
