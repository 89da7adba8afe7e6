//! The top-level consensus state machine.
//!
//! [`ConsensusEngine`] implements [`StateMachine`]: the runner feeds it one
//! event at a time and executes the returned actions. Every certificate and
//! table mutation happens inside this single logical critical section.
//!
//! # Message flow
//!
//! ```text
//! PrePrepare ──verify──▶ admit ──▶ Prepare (bcast)
//! Prepare ──quorum──▶ lock ──▶ Commit (bcast)
//! Commit ──quorum──▶ apply queue ──▶ execute ──▶ CheckPoint (bcast)
//! CheckPoint ──quorum──▶ stable ──▶ gc
//! timeout ──▶ ViewChange (bcast) ──quorum at new leader──▶ NewView
//! ```

use crate::cache::{compute_new_view_span, CacheProcessor};
use crate::certificate::{CertificatePhase, PrePrepareOutcome};
use crate::config::{ConfigError, NodeConfig};
use crate::timer::AdaptiveTimer;
use palisade_core::{Action, Event, LedgerState, StateMachine, TimerId};
use palisade_messages::{
    ConsensusMessage, MessagePayload, NewViewData, PacketType, PreparedProposal,
    RecoverResponsePayload, ViewChangeData,
};
use palisade_types::{Hash, KeyPair, NodeIndex, Proposal, Weight};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Tunables for a consensus engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Consecutive indices each leader proposes before rotation.
    pub leader_switch_period: u64,
    /// Width of the proposal pipeline above the stable index.
    pub water_mark_limit: u64,
    /// Base view timeout before escalation.
    pub base_timeout: Duration,
    /// Interval between recovery probes while behind.
    pub recovery_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            leader_switch_period: 1,
            water_mark_limit: 50,
            base_timeout: Duration::from_secs(3),
            recovery_interval: Duration::from_secs(3),
        }
    }
}

/// Diagnostic snapshot of a running engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusStatus {
    pub node_index: Option<u32>,
    pub view: u64,
    pub to_view: u64,
    pub committed_index: u64,
    pub stable_index: u64,
    pub applied_index: u64,
    pub node_count: usize,
    pub total_weight: Weight,
    pub min_required_quorum: Weight,
    pub max_faulty_weight: Weight,
    pub certificate_count: usize,
    pub queue_depth: usize,
    pub is_executing: bool,
    pub change_cycle: u32,
    pub started: bool,
    pub recovering: bool,
}

/// The PBFT-family agreement engine for one node.
pub struct ConsensusEngine {
    keypair: KeyPair,
    config: NodeConfig,
    cache: CacheProcessor,
    timer: AdaptiveTimer,

    now: Duration,
    started: bool,
    /// Probing peers for a quorum-backed chain position.
    recovering: bool,
    /// Indices whose missing proposal body we already asked the leader for.
    fetch_requested: BTreeSet<u64>,

    options: EngineOptions,
}

impl ConsensusEngine {
    /// Build an engine for a fresh chain.
    pub fn new(
        keypair: KeyPair,
        nodes: Vec<palisade_types::ConsensusNode>,
        options: EngineOptions,
    ) -> Result<Self, ConfigError> {
        let local_node_id = palisade_types::NodeId::from_public_key(&keypair.public_key());
        let config = NodeConfig::new(
            local_node_id,
            nodes,
            options.leader_switch_period,
            options.water_mark_limit,
        )?;
        Ok(Self {
            keypair,
            config,
            cache: CacheProcessor::new(0),
            timer: AdaptiveTimer::new(options.base_timeout),
            now: Duration::ZERO,
            started: false,
            recovering: false,
            fetch_requested: BTreeSet::new(),
            options,
        })
    }

    /// Build an engine resuming from persisted ledger state.
    pub fn restore(
        keypair: KeyPair,
        state: &LedgerState,
        options: EngineOptions,
    ) -> Result<Self, ConfigError> {
        let mut engine = Self::new(keypair, state.nodes.clone(), options)?;
        engine.config.record_committed(state.committed_index, state.committed_hash);
        engine.config.record_stable(state.committed_index);
        engine.config.enter_new_view(state.view);
        engine.cache = CacheProcessor::new(state.committed_index);
        Ok(engine)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn applied_index(&self) -> u64 {
        self.cache.applied_index()
    }

    /// Arm the timers and probe peers for the current chain position.
    pub fn start(&mut self) -> Vec<Action> {
        self.started = true;
        info!(
            node_index = ?self.config.node_index(),
            view = self.config.view(),
            committed_index = self.config.committed_index(),
            "consensus engine starting"
        );
        let mut actions = vec![Action::SetTimer {
            id: TimerId::Consensus,
            duration: self.timer.current_timeout(),
        }];
        if let Some(probe) = self.recover_probe() {
            self.recovering = true;
            actions.push(Action::Broadcast { message: probe });
            actions.push(Action::SetTimer {
                id: TimerId::Recovery,
                duration: self.options.recovery_interval,
            });
        }
        actions
    }

    pub fn stop(&mut self) -> Vec<Action> {
        self.started = false;
        info!("consensus engine stopping");
        vec![
            Action::CancelTimer { id: TimerId::Consensus },
            Action::CancelTimer { id: TimerId::Recovery },
        ]
    }

    pub fn consensus_status(&self) -> ConsensusStatus {
        ConsensusStatus {
            node_index: self.config.node_index().map(|i| i.0),
            view: self.config.view(),
            to_view: self.config.to_view(),
            committed_index: self.config.committed_index(),
            stable_index: self.config.stable_index(),
            applied_index: self.cache.applied_index(),
            node_count: self.config.nodes().len(),
            total_weight: self.config.nodes().total_weight(),
            min_required_quorum: self.config.min_required_quorum(),
            max_faulty_weight: self.config.max_faulty_weight(),
            certificate_count: self.cache.certificate_count(),
            queue_depth: self.cache.queue_depth(),
            is_executing: self.cache.is_executing(),
            change_cycle: self.timer.change_cycle(),
            started: self.started,
            recovering: self.recovering,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn timestamp_ms(&self) -> u64 {
        self.now.as_millis() as u64
    }

    fn signed_vote(
        keypair: &KeyPair,
        packet_type: PacketType,
        view: u64,
        index: u64,
        from: NodeIndex,
        timestamp_ms: u64,
        hash: Hash,
    ) -> ConsensusMessage {
        ConsensusMessage::signed_with_hash(
            packet_type,
            view,
            index,
            from,
            timestamp_ms,
            hash,
            MessagePayload::None,
            keypair,
        )
    }

    fn arm_consensus_timer(&self) -> Action {
        Action::SetTimer {
            id: TimerId::Consensus,
            duration: self.timer.current_timeout(),
        }
    }

    fn recover_probe(&self) -> Option<ConsensusMessage> {
        let me = self.config.node_index()?;
        Some(Self::signed_vote(
            &self.keypair,
            PacketType::RecoverRequest,
            self.config.view(),
            self.config.committed_index(),
            me,
            self.timestamp_ms(),
            Hash::ZERO,
        ))
    }

    /// Sign and self-record a vote, returning the broadcast. Observers are
    /// silent.
    fn broadcast_own_vote(
        &mut self,
        packet_type: PacketType,
        index: u64,
        hash: Hash,
    ) -> Vec<Action> {
        let Some(me) = self.config.node_index() else {
            return Vec::new();
        };
        let view = self.config.view();
        let message = Self::signed_vote(
            &self.keypair,
            packet_type,
            view,
            index,
            me,
            self.timestamp_ms(),
            hash,
        );
        let cert = self.cache.certificate(index);
        match packet_type {
            PacketType::Prepare => {
                cert.add_prepare(me, hash, view, message.signature);
            }
            PacketType::Commit => {
                cert.add_commit(me, hash, view, message.signature);
            }
            PacketType::CheckPoint => {
                cert.add_checkpoint(me, hash, view, message.signature);
            }
            _ => {}
        }
        vec![Action::Broadcast { message }]
    }

    /// Run the quorum transitions for one index and emit the follow-ups.
    fn check_transitions(&mut self, index: u64) -> Vec<Action> {
        let view = self.config.view();
        let mut actions = Vec::new();

        let locked = self
            .cache
            .certificate(index)
            .check_and_precommit(self.config.nodes(), view);
        if locked {
            if let Some(hash) = self.cache.certificate(index).pre_prepared_hash() {
                actions.extend(self.broadcast_own_vote(PacketType::Commit, index, hash));
            }
        }

        let committed = self
            .cache
            .certificate(index)
            .check_and_commit(self.config.nodes(), view);
        if committed {
            actions.extend(self.on_committed(index));
        }
        actions
    }

    fn on_committed(&mut self, index: u64) -> Vec<Action> {
        let Some(cert) = self.cache.get(index) else {
            return Vec::new();
        };
        let Some(mut proposal) = cert.proposal().cloned() else {
            error!(
                index,
                invariant = "committed_without_body",
                "FATAL: commit quorum without proposal body"
            );
            return Vec::new();
        };
        proposal.signature_proof = cert.prepare_proof().to_vec();
        info!(index, hash = %proposal.hash, "proposal committed");

        self.config.record_committed(index, proposal.hash);
        if proposal.is_system {
            self.config.note_pending_system_proposal(index);
        }
        self.cache.update_commit_queue(proposal);

        let mut actions = vec![self.arm_consensus_timer()];
        actions.extend(self.try_apply());
        actions
    }

    fn try_apply(&mut self) -> Vec<Action> {
        match self.cache.try_apply_commit_queue() {
            Some((last_applied_index, proposal)) => vec![Action::ExecuteProposal {
                last_applied_index,
                proposal,
            }],
            None => Vec::new(),
        }
    }

    /// Finalize every certificate that can become stable, cascading through
    /// dependency gates.
    fn check_stable_chain(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        loop {
            let mut progressed = false;
            for index in self.cache.checkpointed_indices() {
                let dependencies_stable = self.cache.dependencies_stable(index);
                let stable = self
                    .cache
                    .certificate(index)
                    .check_and_commit_stable(self.config.nodes(), dependencies_stable);
                if stable {
                    actions.extend(self.on_stable(index));
                    progressed = true;
                    break;
                }
            }
            if !progressed {
                return actions;
            }
        }
    }

    fn on_stable(&mut self, index: u64) -> Vec<Action> {
        let Some(executed) = self.cache.get(index).and_then(|c| c.executed()).cloned() else {
            return Vec::new();
        };
        info!(index, hash = %executed.hash, "proposal stable");
        self.config.record_stable(index);
        self.cache.gc_stable(index);
        self.fetch_requested.retain(|i| *i > index);

        let mut actions = vec![Action::CommitStableCheckpoint { proposal: executed }];
        actions.extend(self.try_apply());
        actions
    }

    /// Enter `new_view`: adopt it, reset escalation, drop invalidated votes
    /// and release transactions sealed into abandoned proposals.
    fn enter_view(&mut self, new_view: u64) -> Vec<Action> {
        info!(view = new_view, "entering new view");
        self.config.enter_new_view(new_view);
        self.timer.reset();
        let mut actions: Vec<Action> = self
            .cache
            .reset_on_new_view(new_view)
            .into_iter()
            .map(|proposal| Action::ResetSealFlags { proposal })
            .collect();
        actions.push(self.arm_consensus_timer());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Client path
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, proposal))]
    fn on_submit_proposal(&mut self, proposal: Proposal, is_system: bool) -> Vec<Action> {
        let reject = |reason: &'static str, proposal: Proposal| {
            debug!(reason, "proposal submission rejected");
            vec![Action::ResetSealFlags { proposal }]
        };

        if self.config.is_observer() {
            return reject("observer cannot propose", proposal);
        }
        if !is_system && !self.config.can_handle_new_proposal() {
            return reject("system proposal pending", proposal);
        }
        let next_index = self
            .cache
            .max_pre_prepared_index()
            .max(self.config.committed_index())
            + 1;
        if !self.config.in_water_marks(next_index) {
            return reject("outside water marks", proposal);
        }
        if !self.config.is_leader_for(next_index) {
            return reject("not the leader for the next index", proposal);
        }

        // Rebuild at the assigned index; the pool sealed only the payload.
        let proposal = if is_system {
            Proposal::new_system(next_index, proposal.payload)
        } else {
            Proposal::new(next_index, proposal.payload)
        };
        let Some(me) = self.config.node_index() else {
            return Vec::new();
        };
        let message = ConsensusMessage::signed(
            PacketType::PrePrepare,
            self.config.view(),
            next_index,
            me,
            self.timestamp_ms(),
            MessagePayload::Proposal(proposal.clone()),
            &self.keypair,
        );

        // Admit locally first so a rejected proposal is never broadcast.
        match self.cache.certificate(next_index).add_pre_prepare(message.clone()) {
            PrePrepareOutcome::Accepted | PrePrepareOutcome::Refreshed => {}
            PrePrepareOutcome::Rejected(reason) => return reject(reason, proposal),
        }
        if is_system {
            self.config.note_pending_system_proposal(next_index);
        }
        info!(index = next_index, hash = %message.hash, "proposing");

        let mut actions = vec![Action::Broadcast {
            message: message.clone(),
        }];
        actions.extend(self.broadcast_own_vote(PacketType::Prepare, next_index, message.hash));
        actions.extend(self.check_transitions(next_index));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Ordering phases
    // ═══════════════════════════════════════════════════════════════════════

    fn on_pre_prepare(&mut self, message: ConsensusMessage) -> Vec<Action> {
        if message.view != self.config.view() {
            debug!(index = message.index, msg_view = message.view, view = self.config.view(), "pre-prepare at wrong view");
            return Vec::new();
        }
        if !self.config.in_water_marks(message.index) {
            debug!(index = message.index, "pre-prepare outside water marks");
            return Vec::new();
        }
        if message.from != self.config.leader_for(message.index) {
            warn!(
                index = message.index,
                from = %message.from,
                "pre-prepare from non-leader, dropping"
            );
            return Vec::new();
        }
        if Some(message.from) == self.config.node_index() {
            return Vec::new();
        }
        let Some(proposal) = message.proposal() else {
            debug!(index = message.index, "pre-prepare without body");
            return Vec::new();
        };
        if proposal.index != message.index {
            warn!(index = message.index, "pre-prepare body index mismatch");
            return Vec::new();
        }
        if let Some(cert) = self.cache.get(message.index) {
            if cert.pre_prepared_hash() == Some(message.hash)
                && cert.pre_prepare_view() >= Some(message.view)
            {
                return Vec::new();
            }
        }
        // Synthetic empty proposals carry nothing to verify.
        if proposal.is_empty_placeholder() {
            return self.admit_pre_prepare(message);
        }
        vec![Action::VerifyProposal { message }]
    }

    fn on_proposal_verified(&mut self, message: ConsensusMessage, valid: bool) -> Vec<Action> {
        if !valid {
            warn!(index = message.index, hash = %message.hash, "proposal failed verification, dropping");
            return Vec::new();
        }
        // The view may have moved while verification ran.
        if message.view != self.config.view() {
            debug!(index = message.index, "verified proposal is stale");
            return Vec::new();
        }
        self.admit_pre_prepare(message)
    }

    fn admit_pre_prepare(&mut self, message: ConsensusMessage) -> Vec<Action> {
        let index = message.index;
        let hash = message.hash;
        let is_system = message.proposal().is_some_and(|p| p.is_system);

        match self.cache.certificate(index).add_pre_prepare(message) {
            PrePrepareOutcome::Rejected(reason) => {
                debug!(index, reason, "pre-prepare rejected");
                return Vec::new();
            }
            PrePrepareOutcome::Accepted | PrePrepareOutcome::Refreshed => {}
        }
        if is_system {
            self.config.note_pending_system_proposal(index);
        }
        debug!(index, %hash, "pre-prepare admitted");

        let mut actions = self.broadcast_own_vote(PacketType::Prepare, index, hash);
        // A lock replayed across a view change needs a fresh commit vote:
        // the old one was pruned with its view.
        let phase = self.cache.certificate(index).phase();
        if phase == CertificatePhase::Precommitted {
            actions.extend(self.broadcast_own_vote(PacketType::Commit, index, hash));
        }
        actions.extend(self.check_transitions(index));
        actions
    }

    fn on_vote(&mut self, message: ConsensusMessage) -> Vec<Action> {
        if message.view < self.config.view() {
            debug!(index = message.index, msg_view = message.view, "stale vote");
            return Vec::new();
        }
        if !self.config.in_water_marks(message.index) {
            debug!(index = message.index, "vote outside water marks");
            return Vec::new();
        }
        let cert = self.cache.certificate(message.index);
        match message.packet_type {
            PacketType::Prepare => {
                cert.add_prepare(message.from, message.hash, message.view, message.signature);
            }
            PacketType::Commit => {
                cert.add_commit(message.from, message.hash, message.view, message.signature);
            }
            _ => return Vec::new(),
        }

        let mut actions = self.request_missing_body(message.index);
        actions.extend(self.check_transitions(message.index));
        actions
    }

    /// When prepare weight piles up behind a hash we have no body for, ask
    /// the slot's leader for it.
    fn request_missing_body(&mut self, index: u64) -> Vec<Action> {
        if self.fetch_requested.contains(&index) {
            return Vec::new();
        }
        let Some(me) = self.config.node_index() else {
            return Vec::new();
        };
        if self
            .cache
            .get(index)
            .is_some_and(|c| c.pre_prepared_hash().is_some())
        {
            return Vec::new();
        }
        let Some((hash, weight)) = self
            .cache
            .get(index)
            .and_then(|c| c.orphan_vote_weight(self.config.nodes()))
        else {
            return Vec::new();
        };
        if weight <= self.config.max_faulty_weight() {
            return Vec::new();
        }
        let leader = self.config.leader_for(index);
        let Some(leader_node) = self.config.nodes().get(leader) else {
            return Vec::new();
        };
        self.fetch_requested.insert(index);
        debug!(index, %hash, leader = %leader, "requesting missing proposal body");
        let message = Self::signed_vote(
            &self.keypair,
            PacketType::ProposalRequest,
            self.config.view(),
            index,
            me,
            self.timestamp_ms(),
            hash,
        );
        vec![Action::SendToNode {
            node: leader_node.node_id,
            message,
        }]
    }

    fn on_check_point(&mut self, message: ConsensusMessage) -> Vec<Action> {
        if !self.config.in_water_marks(message.index) {
            debug!(index = message.index, "checkpoint outside water marks");
            return Vec::new();
        }
        self.cache.certificate(message.index).add_checkpoint(
            message.from,
            message.hash,
            message.view,
            message.signature,
        );
        self.check_stable_chain()
    }

    fn on_proposal_executed(
        &mut self,
        index: u64,
        input_hash: Hash,
        executed: Option<Proposal>,
    ) -> Vec<Action> {
        match self.cache.on_executed(index, input_hash, executed) {
            None => self.try_apply(),
            Some(executed) => {
                debug!(index, hash = %executed.hash, "proposal executed");
                let mut actions = vec![Action::CommitProposal {
                    proposal: executed.clone(),
                }];
                actions.extend(self.broadcast_own_vote(
                    PacketType::CheckPoint,
                    index,
                    executed.hash,
                ));
                actions.extend(self.check_stable_chain());
                actions.extend(self.try_apply());
                actions
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View change
    // ═══════════════════════════════════════════════════════════════════════

    fn on_consensus_timer(&mut self) -> Vec<Action> {
        if self.cache.is_executing() {
            // Execution latency is not leader failure.
            return vec![self.arm_consensus_timer()];
        }
        if self.config.is_observer() {
            return vec![self.arm_consensus_timer()];
        }
        let to_view = self.config.to_view() + 1;
        self.config.advance_to_view(to_view);
        self.timer.escalate();
        warn!(
            view = self.config.view(),
            to_view,
            change_cycle = self.timer.change_cycle(),
            "view timeout, broadcasting view change"
        );
        let mut actions = self.broadcast_view_change(to_view);
        actions.push(self.arm_consensus_timer());
        actions.extend(self.check_view_change_quorum(to_view));
        actions
    }

    fn broadcast_view_change(&mut self, to_view: u64) -> Vec<Action> {
        let Some(me) = self.config.node_index() else {
            return Vec::new();
        };
        let committed_index = self.config.committed_index();
        let prepared = self
            .cache
            .locked_proposals(committed_index)
            .into_iter()
            .map(|(view, proposal)| PreparedProposal { view, proposal })
            .collect();
        let data = ViewChangeData {
            committed_index,
            committed_hash: self.config.committed_hash(),
            prepared,
        };
        let message = ConsensusMessage::signed(
            PacketType::ViewChange,
            to_view,
            committed_index,
            me,
            self.timestamp_ms(),
            MessagePayload::ViewChange(data),
            &self.keypair,
        );
        self.cache.add_view_change(message.clone());
        vec![Action::Broadcast { message }]
    }

    fn on_view_change(&mut self, message: ConsensusMessage) -> Vec<Action> {
        let Some(data) = message.view_change_data() else {
            debug!(from = %message.from, "view change without body");
            return Vec::new();
        };
        if message.view <= self.config.view() {
            debug!(to_view = message.view, "stale view change");
            return Vec::new();
        }
        // Carried locks must be backed by a prepare quorum.
        for prepared in &data.prepared {
            if prepared.proposal.index <= data.committed_index {
                warn!(from = %message.from, "view change lock below committed floor");
                return Vec::new();
            }
            let proof_weight: Weight = prepared
                .proposal
                .signature_proof
                .iter()
                .filter_map(|(voter, _)| self.config.nodes().weight_of(*voter))
                .sum();
            if proof_weight < self.config.min_required_quorum() {
                warn!(
                    from = %message.from,
                    index = prepared.proposal.index,
                    proof_weight,
                    "view change lock with insufficient prepare proof"
                );
                return Vec::new();
            }
        }
        let to_view = message.view;
        self.cache.add_view_change(message);

        let mut actions = Vec::new();
        if let Some(target) = self
            .cache
            .fast_view_change_target(self.config.to_view(), self.config.nodes())
        {
            // Someone honest is already ahead; skip straight to their view.
            info!(target, to_view = self.config.to_view(), "fast view change");
            self.config.advance_to_view(target);
            actions.extend(self.broadcast_view_change(target));
            actions.push(self.arm_consensus_timer());
            actions.extend(self.check_view_change_quorum(target));
        }
        actions.extend(self.check_view_change_quorum(to_view));
        actions
    }

    fn check_view_change_quorum(&mut self, to_view: u64) -> Vec<Action> {
        if to_view <= self.config.view() {
            return Vec::new();
        }
        let weight = self.cache.view_change_weight(to_view, self.config.nodes());
        if weight < self.config.min_required_quorum() {
            return Vec::new();
        }
        let (max_committed, _) = self.cache.new_view_span(to_view, 0);
        let leader = self.config.leader_for_view(max_committed + 1, to_view);
        if Some(leader) != self.config.node_index() {
            return Vec::new();
        }
        vec![Action::EnqueueInternal {
            event: Event::ViewChangeQuorumReached { to_view },
        }]
    }

    fn on_view_change_quorum_reached(&mut self, to_view: u64) -> Vec<Action> {
        if to_view <= self.config.view() {
            return Vec::new();
        }
        let Some(me) = self.config.node_index() else {
            return Vec::new();
        };
        // Re-validate: the tables may have moved since the enqueue.
        let weight = self.cache.view_change_weight(to_view, self.config.nodes());
        if weight < self.config.min_required_quorum() {
            return Vec::new();
        }
        let (max_committed, span) = self.cache.new_view_span(to_view, 0);
        if self.config.leader_for_view(max_committed + 1, to_view) != me {
            return Vec::new();
        }

        let pre_prepares: Vec<ConsensusMessage> = span
            .into_iter()
            .map(|(index, lock)| {
                let proposal = lock.unwrap_or_else(|| Proposal::empty(index));
                ConsensusMessage::signed(
                    PacketType::PrePrepare,
                    to_view,
                    index,
                    me,
                    self.timestamp_ms(),
                    MessagePayload::Proposal(proposal),
                    &self.keypair,
                )
            })
            .collect();
        info!(
            to_view,
            max_committed,
            replayed = pre_prepares.len(),
            "view change quorum reached, assembling new view"
        );
        let data = NewViewData {
            view_changes: self.cache.view_changes_for(to_view),
            pre_prepares: pre_prepares.clone(),
        };
        let message = ConsensusMessage::signed(
            PacketType::NewView,
            to_view,
            max_committed,
            me,
            self.timestamp_ms(),
            MessagePayload::NewView(data),
            &self.keypair,
        );

        let mut actions = vec![Action::Broadcast { message }];
        actions.extend(self.enter_view(to_view));
        for pre_prepare in pre_prepares {
            actions.extend(self.admit_pre_prepare(pre_prepare));
        }
        actions
    }

    fn on_new_view(&mut self, message: ConsensusMessage) -> Vec<Action> {
        let to_view = message.view;
        if to_view <= self.config.view() {
            debug!(to_view, "stale new view");
            return Vec::new();
        }
        let Some(data) = message.new_view_data() else {
            debug!(from = %message.from, "new view without body");
            return Vec::new();
        };

        // The justifying view changes must form a quorum for this exact view.
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut weight: Weight = 0;
        for vc in &data.view_changes {
            if vc.packet_type != PacketType::ViewChange || vc.view != to_view {
                warn!(to_view, "new view carries foreign view change");
                return Vec::new();
            }
            if !seen.insert(vc.from) {
                continue;
            }
            let Some(w) = self.config.nodes().weight_of(vc.from) else {
                warn!(to_view, from = %vc.from, "new view carries non-member view change");
                return Vec::new();
            };
            weight += w;
        }
        if weight < self.config.min_required_quorum() {
            warn!(to_view, weight, "new view without quorum");
            return Vec::new();
        }

        let (max_committed, span) = compute_new_view_span(data.view_changes.iter(), 0);
        if message.from != self.config.leader_for_view(max_committed + 1, to_view) {
            warn!(to_view, from = %message.from, "new view from wrong leader");
            return Vec::new();
        }

        // The replayed pre-prepares must match the span exactly: the
        // highest-view lock per index, empty placeholders for gaps.
        if data.pre_prepares.len() != span.len() {
            warn!(to_view, "new view span mismatch");
            return Vec::new();
        }
        for ((index, lock), pre_prepare) in span.iter().zip(&data.pre_prepares) {
            let expected_hash = lock
                .as_ref()
                .map(|p| p.hash)
                .unwrap_or_else(|| Proposal::empty(*index).hash);
            let well_formed = pre_prepare.packet_type == PacketType::PrePrepare
                && pre_prepare.index == *index
                && pre_prepare.view == to_view
                && pre_prepare.from == message.from
                && pre_prepare.hash == expected_hash;
            if !well_formed {
                warn!(to_view, index, "new view replays unexpected pre-prepare");
                return Vec::new();
            }
        }

        info!(to_view, from = %message.from, "accepting new view");
        let pre_prepares = data.pre_prepares.clone();
        let mut actions = self.enter_view(to_view);
        for pre_prepare in pre_prepares {
            actions.extend(self.admit_pre_prepare(pre_prepare));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Recovery and proposal fetch
    // ═══════════════════════════════════════════════════════════════════════

    fn on_recover_request(&mut self, message: ConsensusMessage) -> Vec<Action> {
        let Some(me) = self.config.node_index() else {
            return Vec::new();
        };
        let Some(peer) = self.config.nodes().get(message.from) else {
            return Vec::new();
        };
        let payload = RecoverResponsePayload {
            view: self.config.view(),
            committed_index: self.config.committed_index(),
            node_count: self.config.nodes().len() as u32,
        };
        let response = ConsensusMessage::signed(
            PacketType::RecoverResponse,
            self.config.view(),
            self.config.committed_index(),
            me,
            self.timestamp_ms(),
            MessagePayload::RecoverResponse(payload),
            &self.keypair,
        );
        vec![Action::SendToNode {
            node: peer.node_id,
            message: response,
        }]
    }

    fn on_recover_response(&mut self, message: ConsensusMessage) -> Vec<Action> {
        if !self.recovering {
            return Vec::new();
        }
        let Some(payload) = message.recover_response().copied() else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        let target = self.cache.add_recover_response(
            message.from,
            payload,
            self.config.nodes(),
            self.config.view(),
            self.config.committed_index(),
        );
        match target {
            Some(target) => {
                info!(
                    view = target.view,
                    committed_index = target.committed_index,
                    "recovery: peers are ahead, adopting their view"
                );
                if target.view > self.config.view() {
                    actions.extend(self.enter_view(target.view));
                }
                // The committed gap is closed by the sync layer, which
                // reports back through NewBlockSynced.
                self.finish_recovery(&mut actions);
            }
            None => {
                let weight = self.cache.recover_response_weight(self.config.nodes());
                if weight >= self.config.min_required_quorum() {
                    debug!("recovery: quorum confirms we are current");
                    self.finish_recovery(&mut actions);
                }
            }
        }
        actions
    }

    fn finish_recovery(&mut self, actions: &mut Vec<Action>) {
        self.recovering = false;
        self.cache.clear_recover_responses();
        actions.push(Action::CancelTimer { id: TimerId::Recovery });
    }

    fn on_recovery_timer(&mut self) -> Vec<Action> {
        if !self.recovering {
            return Vec::new();
        }
        let Some(probe) = self.recover_probe() else {
            return Vec::new();
        };
        vec![
            Action::Broadcast { message: probe },
            Action::SetTimer {
                id: TimerId::Recovery,
                duration: self.options.recovery_interval,
            },
        ]
    }

    fn on_proposal_request(&mut self, message: ConsensusMessage) -> Vec<Action> {
        let Some(me) = self.config.node_index() else {
            return Vec::new();
        };
        let Some(peer) = self.config.nodes().get(message.from) else {
            return Vec::new();
        };
        let Some(proposal) = self
            .cache
            .get(message.index)
            .and_then(|c| c.proposal())
            .filter(|p| p.hash == message.hash)
            .cloned()
        else {
            debug!(index = message.index, "proposal request for unknown body");
            return Vec::new();
        };
        let response = ConsensusMessage::signed(
            PacketType::ProposalResponse,
            self.config.view(),
            message.index,
            me,
            self.timestamp_ms(),
            MessagePayload::Proposal(proposal),
            &self.keypair,
        );
        vec![Action::SendToNode {
            node: peer.node_id,
            message: response,
        }]
    }

    fn on_proposal_response(&mut self, message: ConsensusMessage) -> Vec<Action> {
        if !self.fetch_requested.contains(&message.index) {
            debug!(index = message.index, "unsolicited proposal response");
            return Vec::new();
        }
        let Some(proposal) = message.proposal() else {
            return Vec::new();
        };
        if proposal.index != message.index {
            return Vec::new();
        }
        // Only admit a body the committee is already voting on.
        let backed = self
            .cache
            .get(message.index)
            .and_then(|c| c.orphan_vote_weight(self.config.nodes()))
            .is_some_and(|(hash, weight)| {
                hash == message.hash && weight > self.config.max_faulty_weight()
            });
        if !backed {
            debug!(index = message.index, "proposal response without vote backing");
            return Vec::new();
        }
        self.fetch_requested.remove(&message.index);
        self.admit_pre_prepare(message)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync
    // ═══════════════════════════════════════════════════════════════════════

    fn on_new_block_synced(&mut self, state: LedgerState) -> Vec<Action> {
        if let Err(error) = self.config.set_consensus_node_list(state.nodes) {
            error!(%error, "FATAL: synced ledger carries invalid membership");
            return Vec::new();
        }
        info!(
            committed_index = state.committed_index,
            view = state.view,
            "ledger advanced externally"
        );
        self.config
            .record_committed(state.committed_index, state.committed_hash);
        self.config.record_stable(state.committed_index);
        self.cache.gc_stable(state.committed_index);
        self.fetch_requested
            .retain(|i| *i > state.committed_index);

        let mut actions = if state.view > self.config.view() {
            self.enter_view(state.view)
        } else {
            vec![self.arm_consensus_timer()]
        };
        actions.extend(self.try_apply());
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatch
    // ═══════════════════════════════════════════════════════════════════════

    fn on_message(&mut self, message: ConsensusMessage) -> Vec<Action> {
        if self.config.nodes().get(message.from).is_none() {
            debug!(from = %message.from, "message from non-member");
            return Vec::new();
        }
        match message.packet_type {
            PacketType::PrePrepare => self.on_pre_prepare(message),
            PacketType::Prepare | PacketType::Commit => self.on_vote(message),
            PacketType::ViewChange => self.on_view_change(message),
            PacketType::NewView => self.on_new_view(message),
            PacketType::CheckPoint => self.on_check_point(message),
            PacketType::RecoverRequest => self.on_recover_request(message),
            PacketType::RecoverResponse => self.on_recover_response(message),
            PacketType::ProposalRequest => self.on_proposal_request(message),
            PacketType::ProposalResponse => self.on_proposal_response(message),
        }
    }
}

impl StateMachine for ConsensusEngine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        if !self.started {
            debug!(event = event.type_name(), "engine not started, dropping event");
            return Vec::new();
        }
        match event {
            Event::ConsensusTimer => self.on_consensus_timer(),
            Event::RecoveryTimer => self.on_recovery_timer(),
            Event::MessageReceived { message } => self.on_message(message),
            Event::SubmitProposal { proposal, is_system } => {
                self.on_submit_proposal(proposal, is_system)
            }
            Event::NewBlockSynced { state } => self.on_new_block_synced(state),
            Event::ProposalVerified { message, valid } => {
                self.on_proposal_verified(message, valid)
            }
            Event::ProposalExecuted {
                index,
                input_hash,
                executed,
            } => self.on_proposal_executed(index, input_hash, executed),
            Event::ViewChangeQuorumReached { to_view } => {
                self.on_view_change_quorum_reached(to_view)
            }
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::{test_keypair, test_node_list};
    use palisade_types::ConsensusNode;
    use tracing_test::traced_test;

    fn make_engine(seed: u64, n: usize) -> ConsensusEngine {
        let list = test_node_list(n);
        let mut engine = ConsensusEngine::new(
            test_keypair(seed),
            list.nodes().to_vec(),
            EngineOptions::default(),
        )
        .unwrap();
        engine.start();
        engine
    }

    fn engine_with_index(n: usize, index: u32) -> ConsensusEngine {
        // test keypairs sort arbitrarily; find the seed landing at `index`
        let list = test_node_list(n);
        for seed in 0..n as u64 {
            let kp = test_keypair(seed);
            let id = palisade_types::NodeId::from_public_key(&kp.public_key());
            if list.index_of(&id) == Some(NodeIndex(index)) {
                return make_engine(seed, n);
            }
        }
        unreachable!("no seed maps to index {index}");
    }

    fn broadcasts(actions: &[Action]) -> Vec<&ConsensusMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn leader_submission_broadcasts_pre_prepare_and_prepare() {
        // index 1 at view 0 belongs to node index 1
        let mut engine = engine_with_index(4, 1);
        let actions = engine.handle(Event::SubmitProposal {
            proposal: Proposal::new(0, b"txs".to_vec()),
            is_system: false,
        });
        let sent = broadcasts(&actions);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].packet_type, PacketType::PrePrepare);
        assert_eq!(sent[0].index, 1);
        assert_eq!(sent[1].packet_type, PacketType::Prepare);
        assert_eq!(sent[1].hash, sent[0].hash);
    }

    #[test]
    fn non_leader_submission_releases_seals() {
        let mut engine = engine_with_index(4, 0);
        let actions = engine.handle(Event::SubmitProposal {
            proposal: Proposal::new(0, b"txs".to_vec()),
            is_system: false,
        });
        assert!(matches!(actions[..], [Action::ResetSealFlags { .. }]));
    }

    #[test]
    fn system_proposal_gates_further_submissions() {
        let mut engine = engine_with_index(4, 1);
        let actions = engine.handle(Event::SubmitProposal {
            proposal: Proposal::new(0, b"governance".to_vec()),
            is_system: true,
        });
        assert!(!broadcasts(&actions).is_empty());
        assert!(!engine.config().can_handle_new_proposal());

        let actions = engine.handle(Event::SubmitProposal {
            proposal: Proposal::new(0, b"ordinary".to_vec()),
            is_system: false,
        });
        assert!(matches!(actions[..], [Action::ResetSealFlags { .. }]));
    }

    #[traced_test]
    #[test]
    fn pre_prepare_from_non_leader_is_dropped() {
        let mut leader = engine_with_index(4, 2); // leader for index 2
        let submit = leader.handle(Event::SubmitProposal {
            proposal: Proposal::new(0, b"x".to_vec()),
            is_system: false,
        });
        // index assigned is 2, not 1: leader_for(1) is node 1
        let pre_prepare = broadcasts(&submit)[0].clone();
        assert_eq!(pre_prepare.index, 2);

        let mut follower = engine_with_index(4, 0);
        // tamper: claim index 1, which node 2 does not lead
        let mut forged = pre_prepare;
        forged.index = 1;
        let actions = follower.handle(Event::MessageReceived { message: forged });
        assert!(actions.is_empty());
        assert!(logs_contain("non-leader"));
    }

    #[test]
    fn foreign_pre_prepare_is_verified_before_admission() {
        let mut leader = engine_with_index(4, 1);
        let submit = leader.handle(Event::SubmitProposal {
            proposal: Proposal::new(0, b"x".to_vec()),
            is_system: false,
        });
        let pre_prepare = broadcasts(&submit)[0].clone();

        let mut follower = engine_with_index(4, 0);
        let actions = follower.handle(Event::MessageReceived {
            message: pre_prepare.clone(),
        });
        assert!(matches!(actions[..], [Action::VerifyProposal { .. }]));

        let actions = follower.handle(Event::ProposalVerified {
            message: pre_prepare,
            valid: true,
        });
        let sent = broadcasts(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::Prepare);
    }

    #[test]
    fn timeout_escalates_and_broadcasts_view_change() {
        let mut engine = make_engine(0, 4);
        let actions = engine.handle(Event::ConsensusTimer);
        let sent = broadcasts(&actions);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet_type, PacketType::ViewChange);
        assert_eq!(sent[0].view, 1);
        assert_eq!(engine.config().to_view(), 1);
        assert_eq!(engine.config().view(), 0);

        let actions = engine.handle(Event::ConsensusTimer);
        assert_eq!(broadcasts(&actions)[0].view, 2);
        assert_eq!(engine.consensus_status().change_cycle, 2);
    }

    #[test]
    fn timeout_during_execution_only_rearms() {
        let mut engine = engine_with_index(4, 1);
        // drive a proposal into the commit queue directly via the cache path:
        // simpler to emulate execution-in-flight with a committed proposal
        let submit = engine.handle(Event::SubmitProposal {
            proposal: Proposal::new(0, b"x".to_vec()),
            is_system: false,
        });
        let pre_prepare = broadcasts(&submit)[0].clone();
        let hash = pre_prepare.hash;

        // three foreign prepares + three foreign commits drive it to Committed
        for sender in [0u32, 2, 3] {
            let kp = keypair_for_index(4, sender);
            let vote = ConsensusEngine::signed_vote(
                &kp,
                PacketType::Prepare,
                0,
                1,
                NodeIndex(sender),
                0,
                hash,
            );
            engine.handle(Event::MessageReceived { message: vote });
        }
        for sender in [0u32, 2, 3] {
            let kp = keypair_for_index(4, sender);
            let vote = ConsensusEngine::signed_vote(
                &kp,
                PacketType::Commit,
                0,
                1,
                NodeIndex(sender),
                0,
                hash,
            );
            engine.handle(Event::MessageReceived { message: vote });
        }
        assert!(engine.consensus_status().is_executing);

        let actions = engine.handle(Event::ConsensusTimer);
        assert!(broadcasts(&actions).is_empty());
        assert_eq!(engine.config().to_view(), 0);
    }

    fn keypair_for_index(n: usize, index: u32) -> KeyPair {
        let list = test_node_list(n);
        for seed in 0..n as u64 {
            let kp = test_keypair(seed);
            let id = palisade_types::NodeId::from_public_key(&kp.public_key());
            if list.index_of(&id) == Some(NodeIndex(index)) {
                return kp;
            }
        }
        unreachable!()
    }

    #[test]
    fn checkpoint_outside_water_marks_opens_no_certificate() {
        let mut engine = engine_with_index(4, 0);
        let kp = keypair_for_index(4, 1);
        // far beyond the water-mark window (stable 0, limit 50)
        for index in 1_000_000..1_000_050 {
            let vote = ConsensusEngine::signed_vote(
                &kp,
                PacketType::CheckPoint,
                0,
                index,
                NodeIndex(1),
                0,
                Hash::of(b"far future"),
            );
            let actions = engine.handle(Event::MessageReceived { message: vote });
            assert!(actions.is_empty());
        }
        assert_eq!(engine.consensus_status().certificate_count, 0);

        // an in-window checkpoint still lands
        let vote = ConsensusEngine::signed_vote(
            &kp,
            PacketType::CheckPoint,
            0,
            1,
            NodeIndex(1),
            0,
            Hash::of(b"executed"),
        );
        engine.handle(Event::MessageReceived { message: vote });
        assert_eq!(engine.consensus_status().certificate_count, 1);
    }

    #[test]
    fn recover_request_is_answered() {
        let mut engine = engine_with_index(4, 0);
        let kp = keypair_for_index(4, 2);
        let probe = ConsensusEngine::signed_vote(
            &kp,
            PacketType::RecoverRequest,
            0,
            0,
            NodeIndex(2),
            0,
            Hash::ZERO,
        );
        let actions = engine.handle(Event::MessageReceived { message: probe });
        assert!(matches!(
            &actions[..],
            [Action::SendToNode { message, .. }]
                if message.packet_type == PacketType::RecoverResponse
        ));
    }

    #[test]
    fn status_snapshot_reflects_configuration() {
        let engine = make_engine(0, 10);
        let status = engine.consensus_status();
        assert_eq!(status.node_count, 10);
        assert_eq!(status.total_weight, 10);
        assert_eq!(status.max_faulty_weight, 3);
        assert_eq!(status.min_required_quorum, 7);
        assert!(status.started);
    }

    #[test]
    fn observer_engine_stays_silent() {
        // a keypair outside the committee
        let list = test_node_list(4);
        let mut engine = ConsensusEngine::new(
            test_keypair(99),
            list.nodes().to_vec(),
            EngineOptions::default(),
        )
        .unwrap();
        engine.start();
        assert!(engine.config().is_observer());

        let actions = engine.handle(Event::ConsensusTimer);
        assert!(broadcasts(&actions).is_empty());
        let actions = engine.handle(Event::SubmitProposal {
            proposal: Proposal::new(0, b"x".to_vec()),
            is_system: false,
        });
        assert!(matches!(actions[..], [Action::ResetSealFlags { .. }]));
    }

    #[test]
    fn membership_from_sync_replaces_node_list() {
        let mut engine = make_engine(0, 4);
        let new_list: Vec<ConsensusNode> = test_node_list(7).nodes().to_vec();
        engine.handle(Event::NewBlockSynced {
            state: LedgerState {
                committed_index: 5,
                committed_hash: Hash::of(b"synced"),
                view: 2,
                nodes: new_list,
            },
        });
        let status = engine.consensus_status();
        assert_eq!(status.node_count, 7);
        assert_eq!(status.min_required_quorum, 5);
        assert_eq!(status.committed_index, 5);
        assert_eq!(status.stable_index, 5);
        assert_eq!(status.view, 2);
    }
}
