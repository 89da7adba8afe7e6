//! Event types for the deterministic state machine.

use crate::traits::LedgerState;
use palisade_messages::ConsensusMessage;
use palisade_types::{Hash, Proposal};

/// Priority ordering for events delivered at the same instant.
///
/// Lower values are processed first. Internal events preserve causality:
/// a transition enqueued while handling an event runs before any external
/// input observed at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Internal = 0,
    Timer = 1,
    Network = 2,
    Client = 3,
}

/// All possible inputs to the state machine.
///
/// Events are **facts** - something that happened. The state machine reacts
/// to them and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// The view timeout fired: the current leader failed to make progress.
    ConsensusTimer,

    /// The recovery probe timer fired: re-ask peers where the chain stands.
    RecoveryTimer,

    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// A consensus packet arrived from the wire, already decoded and
    /// signature-checked by the runner.
    MessageReceived { message: ConsensusMessage },

    // ═══════════════════════════════════════════════════════════════════════
    // Client
    // ═══════════════════════════════════════════════════════════════════════
    /// The local node was asked to propose a new block.
    SubmitProposal { proposal: Proposal, is_system: bool },

    /// A block reached the ledger outside consensus (state sync).
    NewBlockSynced { state: LedgerState },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (callbacks from delegated work, or enqueued transitions)
    // ═══════════════════════════════════════════════════════════════════════
    /// Result of delegated payload verification for a pre-prepare.
    ProposalVerified {
        message: ConsensusMessage,
        valid: bool,
    },

    /// Result of delegated block execution.
    ///
    /// `executed` is the proposal with its post-execution hash, or `None`
    /// if execution failed and should be retried by a future leader.
    ProposalExecuted {
        index: u64,
        input_hash: Hash,
        executed: Option<Proposal>,
    },

    /// Enough view-change weight accumulated for `to_view`.
    ViewChangeQuorumReached { to_view: u64 },
}

impl Event {
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::ProposalVerified { .. }
            | Event::ProposalExecuted { .. }
            | Event::ViewChangeQuorumReached { .. } => EventPriority::Internal,
            Event::ConsensusTimer | Event::RecoveryTimer => EventPriority::Timer,
            Event::MessageReceived { .. } => EventPriority::Network,
            Event::SubmitProposal { .. } | Event::NewBlockSynced { .. } => EventPriority::Client,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Short name for logging and stats.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ConsensusTimer => "ConsensusTimer",
            Event::RecoveryTimer => "RecoveryTimer",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::SubmitProposal { .. } => "SubmitProposal",
            Event::NewBlockSynced { .. } => "NewBlockSynced",
            Event::ProposalVerified { .. } => "ProposalVerified",
            Event::ProposalExecuted { .. } => "ProposalExecuted",
            Event::ViewChangeQuorumReached { .. } => "ViewChangeQuorumReached",
        }
    }
}
