//! Per-index vote certificate.
//!
//! A [`ProposalCertificate`] collects everything the protocol knows about one
//! index: the pre-prepare, the weighted Prepare/Commit/CheckPoint votes, and
//! the phase reached. It never performs I/O; the engine reads transition
//! results and emits the corresponding actions.

use palisade_messages::ConsensusMessage;
use palisade_types::{ConsensusNodeList, Hash, NodeIndex, Proposal, Signature, Weight};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error};

/// Lifecycle of a certificate.
///
/// Phases only move forward; `reset_cache` is the one exception, dropping an
/// unlocked pre-prepare back to `Empty` when a view change abandons it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CertificatePhase {
    /// No pre-prepare seen yet (early votes may already be parked here).
    Empty,
    /// A leader proposal is admitted; collecting Prepare votes.
    HasPrePrepare,
    /// Weighted prepare-quorum reached; the proposal is locked.
    Precommitted,
    /// Weighted commit-quorum reached; awaiting execution.
    Committed,
    /// Executed; collecting CheckPoint votes on the post-execution hash.
    Checkpointed,
    /// Checkpoint quorum plus all dependencies stable; final.
    StableCommitted,
}

/// Outcome of offering a pre-prepare to the certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrePrepareOutcome {
    /// Admitted as the proposal for this index.
    Accepted,
    /// Same hash at a non-lower view; bookkeeping refreshed, no new work.
    Refreshed,
    /// Conflicting or stale; dropped.
    Rejected(&'static str),
}

#[derive(Debug, Clone)]
struct Vote {
    view: u64,
    signature: Signature,
}

/// Weighted votes per candidate hash, idempotent per `(hash, voter)`.
#[derive(Debug, Clone, Default)]
struct VoteSet {
    votes: HashMap<Hash, BTreeMap<NodeIndex, Vote>>,
}

impl VoteSet {
    /// Record a vote. Re-votes by the same node on the same hash refresh the
    /// view (a legitimate revote after a view change) but never add weight.
    fn insert(&mut self, hash: Hash, voter: NodeIndex, view: u64, signature: Signature) -> bool {
        match self.votes.entry(hash).or_default().entry(voter) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(Vote { view, signature });
                true
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                if view > slot.get().view {
                    slot.insert(Vote { view, signature });
                }
                false
            }
        }
    }

    /// Accumulated weight behind `hash` from votes cast at exactly `view`.
    fn weight_at_view(&self, hash: &Hash, view: u64, nodes: &ConsensusNodeList) -> Weight {
        self.votes.get(hash).map_or(0, |voters| {
            voters
                .iter()
                .filter(|(_, vote)| vote.view == view)
                .filter_map(|(voter, _)| nodes.weight_of(*voter))
                .sum()
        })
    }

    /// Accumulated weight behind `hash` regardless of view.
    fn weight_any_view(&self, hash: &Hash, nodes: &ConsensusNodeList) -> Weight {
        self.votes.get(hash).map_or(0, |voters| {
            voters
                .keys()
                .filter_map(|voter| nodes.weight_of(*voter))
                .sum()
        })
    }

    /// Voters behind `hash` at `view`, with their signatures.
    fn proof(&self, hash: &Hash, view: u64, nodes: &ConsensusNodeList) -> Vec<(NodeIndex, Signature)> {
        self.votes.get(hash).map_or_else(Vec::new, |voters| {
            voters
                .iter()
                .filter(|(voter, vote)| vote.view == view && nodes.get(**voter).is_some())
                .map(|(voter, vote)| (*voter, vote.signature))
                .collect()
        })
    }

    /// All hashes at quorum for `view`. More than one is a correctness alarm.
    fn quorum_hashes(&self, view: u64, nodes: &ConsensusNodeList) -> Vec<Hash> {
        self.votes
            .keys()
            .filter(|hash| self.weight_at_view(hash, view, nodes) >= nodes.min_required_quorum())
            .copied()
            .collect()
    }

    fn prune_below_view(&mut self, view: u64) {
        for voters in self.votes.values_mut() {
            voters.retain(|_, vote| vote.view >= view);
        }
        self.votes.retain(|_, voters| !voters.is_empty());
    }
}

/// All consensus state for one proposal index.
#[derive(Debug, Clone)]
pub struct ProposalCertificate {
    index: u64,
    phase: CertificatePhase,
    /// The admitted leader proposal, if any. Carries the full payload.
    pre_prepare: Option<ConsensusMessage>,
    prepares: VoteSet,
    commits: VoteSet,
    /// CheckPoint votes are view-independent: they attest to executed state.
    checkpoints: VoteSet,
    /// Snapshot of the prepare-quorum taken at precommit time.
    prepare_proof: Vec<(NodeIndex, Signature)>,
    /// The proposal with its post-execution hash, once applied.
    executed: Option<Proposal>,
    /// Commit transition emitted exactly once.
    submitted: bool,
}

impl ProposalCertificate {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            phase: CertificatePhase::Empty,
            pre_prepare: None,
            prepares: VoteSet::default(),
            commits: VoteSet::default(),
            checkpoints: VoteSet::default(),
            prepare_proof: Vec::new(),
            executed: None,
            submitted: false,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn phase(&self) -> CertificatePhase {
        self.phase
    }

    pub fn proposal(&self) -> Option<&Proposal> {
        self.pre_prepare.as_ref().and_then(|m| m.proposal())
    }

    pub fn pre_prepared_hash(&self) -> Option<Hash> {
        self.pre_prepare.as_ref().map(|m| m.hash)
    }

    pub fn pre_prepare_view(&self) -> Option<u64> {
        self.pre_prepare.as_ref().map(|m| m.view)
    }

    pub fn executed(&self) -> Option<&Proposal> {
        self.executed.as_ref()
    }

    pub fn is_committed(&self) -> bool {
        self.phase >= CertificatePhase::Committed
    }

    pub fn is_stable(&self) -> bool {
        self.phase == CertificatePhase::StableCommitted
    }

    /// The prepare-quorum proof snapshotted at precommit.
    pub fn prepare_proof(&self) -> &[(NodeIndex, Signature)] {
        &self.prepare_proof
    }

    /// The locked proposal a view change must carry forward, with its
    /// prepare proof attached and the view it locked at.
    pub fn locked_for_view_change(&self) -> Option<(u64, Proposal)> {
        if self.phase < CertificatePhase::Precommitted || self.is_stable() {
            return None;
        }
        let message = self.pre_prepare.as_ref()?;
        let mut proposal = message.proposal()?.clone();
        proposal.signature_proof = self.prepare_proof.clone();
        Some((message.view, proposal))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message admission
    // ═══════════════════════════════════════════════════════════════════════

    /// Offer a pre-prepare. At most one hash may occupy an index; an
    /// equal-hash message at a non-lower view refreshes the slot (leader
    /// re-issue after a view change), everything else is rejected.
    pub fn add_pre_prepare(&mut self, message: ConsensusMessage) -> PrePrepareOutcome {
        if self.phase == CertificatePhase::StableCommitted {
            return PrePrepareOutcome::Rejected("index already stable");
        }
        if message.proposal().is_none() {
            return PrePrepareOutcome::Rejected("pre-prepare without proposal body");
        }
        match &self.pre_prepare {
            None => {
                self.pre_prepare = Some(message);
                if self.phase == CertificatePhase::Empty {
                    self.phase = CertificatePhase::HasPrePrepare;
                }
                PrePrepareOutcome::Accepted
            }
            Some(existing) if existing.hash == message.hash => {
                if message.view >= existing.view {
                    self.pre_prepare = Some(message);
                    PrePrepareOutcome::Refreshed
                } else {
                    PrePrepareOutcome::Rejected("stale view for admitted hash")
                }
            }
            Some(_) => PrePrepareOutcome::Rejected("conflicting pre-prepare for index"),
        }
    }

    /// Record a Prepare vote. Returns true if new weight was added.
    pub fn add_prepare(
        &mut self,
        voter: NodeIndex,
        hash: Hash,
        view: u64,
        signature: Signature,
    ) -> bool {
        self.prepares.insert(hash, voter, view, signature)
    }

    /// Record a Commit vote. Returns true if new weight was added.
    pub fn add_commit(
        &mut self,
        voter: NodeIndex,
        hash: Hash,
        view: u64,
        signature: Signature,
    ) -> bool {
        self.commits.insert(hash, voter, view, signature)
    }

    /// Record a CheckPoint vote on a post-execution hash.
    pub fn add_checkpoint(
        &mut self,
        voter: NodeIndex,
        hash: Hash,
        view: u64,
        signature: Signature,
    ) -> bool {
        self.checkpoints.insert(hash, voter, view, signature)
    }

    pub fn prepare_weight(&self, hash: &Hash, view: u64, nodes: &ConsensusNodeList) -> Weight {
        self.prepares.weight_at_view(hash, view, nodes)
    }

    pub fn commit_weight(&self, hash: &Hash, view: u64, nodes: &ConsensusNodeList) -> Weight {
        self.commits.weight_at_view(hash, view, nodes)
    }

    /// Weight behind any hash at this index without a matching pre-prepare,
    /// used to decide when to fetch a missing proposal body.
    pub fn orphan_vote_weight(&self, nodes: &ConsensusNodeList) -> Option<(Hash, Weight)> {
        let admitted = self.pre_prepared_hash();
        self.prepares
            .votes
            .keys()
            .filter(|hash| Some(**hash) != admitted)
            .map(|hash| (*hash, self.prepares.weight_any_view(hash, nodes)))
            .max_by_key(|(_, weight)| *weight)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Quorum transitions
    // ═══════════════════════════════════════════════════════════════════════

    /// Try to lock the proposal: requires an admitted pre-prepare and a
    /// weighted prepare-quorum on its hash at `view`.
    pub fn check_and_precommit(&mut self, nodes: &ConsensusNodeList, view: u64) -> bool {
        if self.phase != CertificatePhase::HasPrePrepare {
            return false;
        }
        if self.contradiction(&self.prepares, "prepare", view, nodes) {
            return false;
        }
        let Some(hash) = self.pre_prepared_hash() else {
            return false;
        };
        let weight = self.prepares.weight_at_view(&hash, view, nodes);
        if weight < nodes.min_required_quorum() {
            return false;
        }
        self.prepare_proof = self.prepares.proof(&hash, view, nodes);
        self.phase = CertificatePhase::Precommitted;
        debug!(index = self.index, %hash, weight, "proposal locked");
        true
    }

    /// Try to commit: requires the lock plus a weighted commit-quorum at
    /// `view`. Fires at most once per certificate.
    pub fn check_and_commit(&mut self, nodes: &ConsensusNodeList, view: u64) -> bool {
        if self.phase != CertificatePhase::Precommitted || self.submitted {
            return false;
        }
        if self.contradiction(&self.commits, "commit", view, nodes) {
            return false;
        }
        let Some(hash) = self.pre_prepared_hash() else {
            return false;
        };
        if self.commits.weight_at_view(&hash, view, nodes) < nodes.min_required_quorum() {
            return false;
        }
        self.submitted = true;
        self.phase = CertificatePhase::Committed;
        debug!(index = self.index, %hash, "proposal committed");
        true
    }

    /// Record the execution result and move to Checkpointed.
    pub fn note_executed(&mut self, executed: Proposal) {
        if self.phase == CertificatePhase::Committed {
            self.phase = CertificatePhase::Checkpointed;
            self.executed = Some(executed);
        }
    }

    /// Try to finalize: checkpoint quorum on the post-execution hash, and
    /// every lower-index dependency already stable.
    pub fn check_and_commit_stable(
        &mut self,
        nodes: &ConsensusNodeList,
        dependencies_stable: bool,
    ) -> bool {
        if self.phase != CertificatePhase::Checkpointed || !dependencies_stable {
            return false;
        }
        let Some(executed_hash) = self.executed.as_ref().map(|p| p.hash) else {
            return false;
        };
        if self.checkpoints.weight_any_view(&executed_hash, nodes) < nodes.min_required_quorum() {
            return false;
        }
        self.phase = CertificatePhase::StableCommitted;
        debug!(index = self.index, hash = %executed_hash, "proposal stable");
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View change support
    // ═══════════════════════════════════════════════════════════════════════

    /// Discard state invalidated by entering `new_view`: votes cast below it,
    /// and an unlocked pre-prepare from an abandoned view. Returns the
    /// abandoned proposal so its sealed transactions can be released.
    pub fn reset_cache(&mut self, new_view: u64) -> Option<Proposal> {
        self.prepares.prune_below_view(new_view);
        self.commits.prune_below_view(new_view);

        if self.phase >= CertificatePhase::Precommitted {
            return None;
        }
        let stale = self
            .pre_prepare
            .as_ref()
            .is_some_and(|m| m.view < new_view);
        if !stale {
            return None;
        }
        let abandoned = self.pre_prepare.take().and_then(|m| m.proposal().cloned());
        self.phase = CertificatePhase::Empty;
        abandoned
    }

    /// Two distinct hashes at quorum would mean the committee double-signed;
    /// there is no protocol-level recovery from that.
    fn contradiction(
        &self,
        set: &VoteSet,
        kind: &'static str,
        view: u64,
        nodes: &ConsensusNodeList,
    ) -> bool {
        let at_quorum = set.quorum_hashes(view, nodes);
        if at_quorum.len() > 1 {
            error!(
                index = self.index,
                view,
                kind,
                hashes = ?at_quorum,
                invariant = "single_quorum_per_index",
                "FATAL: contradictory quorums detected"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_messages::{MessagePayload, PacketType};
    use palisade_types::test_utils::{test_keypairs, test_node_list};
    use palisade_types::KeyPair;
    use tracing_test::traced_test;

    fn pre_prepare(index: u64, view: u64, from: u32, payload: &[u8], kp: &KeyPair) -> ConsensusMessage {
        ConsensusMessage::signed(
            PacketType::PrePrepare,
            view,
            index,
            NodeIndex(from),
            0,
            MessagePayload::Proposal(Proposal::new(index, payload.to_vec())),
            kp,
        )
    }

    fn vote_sig(kp: &KeyPair) -> Signature {
        kp.sign(b"vote")
    }

    #[test]
    fn happy_path_reaches_stable() {
        let nodes = test_node_list(4);
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(1);

        let msg = pre_prepare(1, 0, 0, b"block", &kps[0]);
        let hash = msg.hash;
        assert_eq!(cert.add_pre_prepare(msg), PrePrepareOutcome::Accepted);
        assert_eq!(cert.phase(), CertificatePhase::HasPrePrepare);

        for i in 0..3u32 {
            cert.add_prepare(NodeIndex(i), hash, 0, vote_sig(&kps[i as usize]));
        }
        assert!(cert.check_and_precommit(&nodes, 0));
        assert_eq!(cert.phase(), CertificatePhase::Precommitted);
        assert_eq!(cert.prepare_proof().len(), 3);

        for i in 0..3u32 {
            cert.add_commit(NodeIndex(i), hash, 0, vote_sig(&kps[i as usize]));
        }
        assert!(cert.check_and_commit(&nodes, 0));
        assert_eq!(cert.phase(), CertificatePhase::Committed);
        // commit fires once
        assert!(!cert.check_and_commit(&nodes, 0));

        let executed = Proposal::new(1, b"executed".to_vec());
        let executed_hash = executed.hash;
        cert.note_executed(executed);
        assert_eq!(cert.phase(), CertificatePhase::Checkpointed);

        for i in 0..3u32 {
            cert.add_checkpoint(NodeIndex(i), executed_hash, 0, vote_sig(&kps[i as usize]));
        }
        assert!(cert.check_and_commit_stable(&nodes, true));
        assert!(cert.is_stable());
    }

    #[test]
    fn duplicate_prepare_adds_no_weight() {
        let nodes = test_node_list(4);
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(1);
        let msg = pre_prepare(1, 0, 0, b"block", &kps[0]);
        let hash = msg.hash;
        cert.add_pre_prepare(msg);

        assert!(cert.add_prepare(NodeIndex(0), hash, 0, vote_sig(&kps[0])));
        assert!(!cert.add_prepare(NodeIndex(0), hash, 0, vote_sig(&kps[0])));
        assert!(cert.add_prepare(NodeIndex(1), hash, 0, vote_sig(&kps[1])));
        assert_eq!(cert.prepare_weight(&hash, 0, &nodes), 2);
        assert!(!cert.check_and_precommit(&nodes, 0));
    }

    #[test]
    fn votes_before_pre_prepare_are_retained() {
        let nodes = test_node_list(4);
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(2);
        let msg = pre_prepare(2, 0, 0, b"late", &kps[0]);
        let hash = msg.hash;

        for i in 1..4u32 {
            cert.add_prepare(NodeIndex(i), hash, 0, vote_sig(&kps[i as usize]));
        }
        assert_eq!(cert.phase(), CertificatePhase::Empty);
        assert!(!cert.check_and_precommit(&nodes, 0));

        cert.add_pre_prepare(msg);
        assert!(cert.check_and_precommit(&nodes, 0));
    }

    #[test]
    fn conflicting_pre_prepare_is_rejected() {
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(1);
        cert.add_pre_prepare(pre_prepare(1, 0, 0, b"a", &kps[0]));
        assert!(matches!(
            cert.add_pre_prepare(pre_prepare(1, 0, 0, b"b", &kps[0])),
            PrePrepareOutcome::Rejected(_)
        ));
        // same hash at a later view refreshes
        assert_eq!(
            cert.add_pre_prepare(pre_prepare(1, 1, 1, b"a", &kps[1])),
            PrePrepareOutcome::Refreshed
        );
        assert_eq!(cert.pre_prepare_view(), Some(1));
    }

    #[test]
    fn stale_view_votes_do_not_count() {
        let nodes = test_node_list(4);
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(1);
        let msg = pre_prepare(1, 1, 1, b"block", &kps[1]);
        let hash = msg.hash;
        cert.add_pre_prepare(msg);

        for i in 0..3u32 {
            cert.add_prepare(NodeIndex(i), hash, 0, vote_sig(&kps[i as usize]));
        }
        assert!(!cert.check_and_precommit(&nodes, 1));
        assert_eq!(cert.prepare_weight(&hash, 1, &nodes), 0);
    }

    #[test]
    fn reset_cache_releases_unlocked_pre_prepare() {
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(3);
        let msg = pre_prepare(3, 0, 0, b"abandoned", &kps[0]);
        let hash = msg.hash;
        cert.add_pre_prepare(msg);
        cert.add_prepare(NodeIndex(1), hash, 0, vote_sig(&kps[1]));

        let released = cert.reset_cache(1);
        assert_eq!(released.map(|p| p.hash), Some(hash));
        assert_eq!(cert.phase(), CertificatePhase::Empty);
        assert_eq!(cert.pre_prepared_hash(), None);
    }

    #[test]
    fn reset_cache_keeps_locked_proposal() {
        let nodes = test_node_list(4);
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(3);
        let msg = pre_prepare(3, 0, 0, b"locked", &kps[0]);
        let hash = msg.hash;
        cert.add_pre_prepare(msg);
        for i in 0..3u32 {
            cert.add_prepare(NodeIndex(i), hash, 0, vote_sig(&kps[i as usize]));
        }
        assert!(cert.check_and_precommit(&nodes, 0));

        assert!(cert.reset_cache(1).is_none());
        assert_eq!(cert.phase(), CertificatePhase::Precommitted);
        let (view, locked) = cert.locked_for_view_change().unwrap();
        assert_eq!(view, 0);
        assert_eq!(locked.hash, hash);
        assert_eq!(locked.signature_proof.len(), 3);
    }

    #[test]
    fn dependencies_gate_stability() {
        let nodes = test_node_list(4);
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(1);
        let msg = pre_prepare(1, 0, 0, b"block", &kps[0]);
        let hash = msg.hash;
        cert.add_pre_prepare(msg);
        for i in 0..3u32 {
            cert.add_prepare(NodeIndex(i), hash, 0, vote_sig(&kps[i as usize]));
            cert.add_commit(NodeIndex(i), hash, 0, vote_sig(&kps[i as usize]));
        }
        cert.check_and_precommit(&nodes, 0);
        cert.check_and_commit(&nodes, 0);
        let executed = Proposal::new(1, b"executed".to_vec());
        let executed_hash = executed.hash;
        cert.note_executed(executed);
        for i in 0..3u32 {
            cert.add_checkpoint(NodeIndex(i), executed_hash, 0, vote_sig(&kps[i as usize]));
        }
        assert!(!cert.check_and_commit_stable(&nodes, false));
        assert!(cert.check_and_commit_stable(&nodes, true));
    }

    #[traced_test]
    #[test]
    fn contradictory_quorums_raise_alarm() {
        let nodes = test_node_list(4);
        let kps = test_keypairs(4);
        let mut cert = ProposalCertificate::new(1);
        let msg = pre_prepare(1, 0, 0, b"a", &kps[0]);
        let hash_a = msg.hash;
        let hash_b = Hash::of(b"b");
        cert.add_pre_prepare(msg);

        // a Byzantine committee signs both hashes at quorum
        for i in 0..4u32 {
            cert.add_prepare(NodeIndex(i), hash_a, 0, vote_sig(&kps[i as usize]));
            cert.add_prepare(NodeIndex(i), hash_b, 0, vote_sig(&kps[i as usize]));
        }
        assert!(!cert.check_and_precommit(&nodes, 0));
        assert!(logs_contain("contradictory quorums"));
        assert_eq!(cert.phase(), CertificatePhase::HasPrePrepare);
    }
}
