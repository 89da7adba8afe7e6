//! Core types for palisade consensus.
//!
//! This crate provides the foundational types for the consensus architecture:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait the engine implements
//! - Collaborator traits for everything consensus does not own
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner (tests or production) which:
//! 1. Delivers events to the state machine, one at a time
//! 2. Executes the returned actions
//! 3. Converts action results back into events

mod action;
mod event;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use traits::{
    CollaboratorError, Ledger, LedgerState, ProposalValidator, StateMachine,
    StateMachineExecutor, Transport,
};

/// Identifies a timer owned by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// View timeout timer
    Consensus,
    /// Recovery probe timer
    Recovery,
}
