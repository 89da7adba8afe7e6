//! Cross-index orchestration: the certificate map, the ordered apply queue,
//! and the view-change vote tables.

use crate::certificate::{CertificatePhase, ProposalCertificate};
use palisade_messages::{ConsensusMessage, RecoverResponsePayload};
use palisade_types::{ConsensusNodeList, Hash, NodeIndex, Proposal, Weight};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Target state adopted from a recovery quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverTarget {
    pub view: u64,
    pub committed_index: u64,
}

/// Owns every in-flight certificate plus the machinery that spans indices:
/// the committed-but-unapplied queue, the system-proposal dependency set,
/// per-view ViewChange tables and the recovery-response table.
#[derive(Debug, Default)]
pub struct CacheProcessor {
    certificates: BTreeMap<u64, ProposalCertificate>,

    /// Committed proposals awaiting in-order application.
    commit_queue: BTreeMap<u64, Proposal>,
    /// The single execution in flight, keyed by (index, input hash) so a
    /// stale completion after a view change is recognized and dropped.
    executing: Option<(u64, Hash)>,
    /// Highest index applied to the executor.
    applied_index: u64,
    /// Committed system proposals not yet stable; indices above the smallest
    /// entry must not be applied.
    pending_system: BTreeSet<u64>,

    /// ViewChange packets per target view, one slot per sender.
    view_changes: BTreeMap<u64, HashMap<NodeIndex, ConsensusMessage>>,
    /// Recovery responses, one slot per sender.
    recover_responses: HashMap<NodeIndex, RecoverResponsePayload>,
}

impl CacheProcessor {
    pub fn new(applied_index: u64) -> Self {
        Self {
            applied_index,
            ..Self::default()
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Certificates
    // ═══════════════════════════════════════════════════════════════════════

    /// Certificate for `index`, created lazily on first touch.
    pub fn certificate(&mut self, index: u64) -> &mut ProposalCertificate {
        self.certificates
            .entry(index)
            .or_insert_with(|| ProposalCertificate::new(index))
    }

    pub fn get(&self, index: u64) -> Option<&ProposalCertificate> {
        self.certificates.get(&index)
    }

    pub fn certificate_count(&self) -> usize {
        self.certificates.len()
    }

    /// Highest index holding an admitted pre-prepare, for choosing the next
    /// proposal slot.
    pub fn max_pre_prepared_index(&self) -> u64 {
        self.certificates
            .iter()
            .filter(|(_, cert)| cert.pre_prepared_hash().is_some())
            .map(|(index, _)| *index)
            .max()
            .unwrap_or(0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Apply queue
    // ═══════════════════════════════════════════════════════════════════════

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn is_executing(&self) -> bool {
        self.executing.is_some()
    }

    pub fn queue_depth(&self) -> usize {
        self.commit_queue.len()
    }

    /// Enqueue a committed proposal for in-order application. A system
    /// proposal joins the dependency set gating everything above it.
    pub fn update_commit_queue(&mut self, proposal: Proposal) {
        if proposal.index <= self.applied_index {
            debug!(index = proposal.index, "committed proposal already applied, dropping");
            return;
        }
        if proposal.is_system {
            self.pending_system.insert(proposal.index);
        }
        self.commit_queue.insert(proposal.index, proposal);
    }

    /// Dispatch the next in-order proposal to the executor, if one is due.
    ///
    /// At most one execution is in flight; indices above an unstable system
    /// proposal wait until it finalizes. Returns `(last_applied, proposal)`
    /// for an `ExecuteProposal` action.
    pub fn try_apply_commit_queue(&mut self) -> Option<(u64, Proposal)> {
        // Entries at or below the applied index are stale (state sync ran ahead).
        let applied = self.applied_index;
        self.commit_queue.retain(|index, _| *index > applied);

        if self.executing.is_some() {
            return None;
        }
        let next = self.applied_index + 1;
        if self
            .pending_system
            .first()
            .is_some_and(|gate| *gate < next)
        {
            return None;
        }
        let proposal = self.commit_queue.get(&next)?.clone();
        self.executing = Some((next, proposal.hash));
        Some((self.applied_index, proposal))
    }

    /// Record an execution completion. Returns the executed proposal when
    /// the completion matches the dispatch in flight; stale completions from
    /// before a sync or view change are dropped.
    pub fn on_executed(
        &mut self,
        index: u64,
        input_hash: Hash,
        executed: Option<Proposal>,
    ) -> Option<Proposal> {
        if self.executing != Some((index, input_hash)) {
            warn!(index, %input_hash, "stale execution result, dropping");
            return None;
        }
        self.executing = None;
        let executed = match executed {
            Some(executed) => executed,
            None => {
                // Leave the proposal queued; the next queue pass retries.
                warn!(index, "execution failed, will retry");
                return None;
            }
        };
        self.applied_index = index;
        self.commit_queue.remove(&index);
        self.certificate(index).note_executed(executed.clone());
        Some(executed)
    }

    /// True once every system proposal below `index` has stably committed.
    pub fn dependencies_stable(&self, index: u64) -> bool {
        !self.pending_system.iter().any(|gate| *gate < index)
    }

    /// Indices executed but not yet stable, in order. Stability cascades:
    /// finalizing one index may unblock the dependencies of the next.
    pub fn checkpointed_indices(&self) -> Vec<u64> {
        self.certificates
            .iter()
            .filter(|(_, cert)| cert.phase() == CertificatePhase::Checkpointed)
            .map(|(index, _)| *index)
            .collect()
    }

    /// Drop state made obsolete by a new stable index.
    pub fn gc_stable(&mut self, stable_index: u64) {
        self.certificates.retain(|index, _| *index > stable_index);
        self.commit_queue.retain(|index, _| *index > stable_index);
        self.pending_system.retain(|index| *index > stable_index);
        if self.applied_index < stable_index {
            self.applied_index = stable_index;
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View change tables
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a ViewChange packet. One live slot per sender: a ViewChange
    /// for a higher target view supersedes the sender's earlier ones, and a
    /// replay of a lower target is ignored. The table therefore never grows
    /// past one entry per committee member, whatever a sender replays.
    pub fn add_view_change(&mut self, message: ConsensusMessage) {
        let to_view = message.view;
        let from = message.from;
        let above = (std::ops::Bound::Excluded(to_view), std::ops::Bound::Unbounded);
        if self
            .view_changes
            .range::<u64, _>(above)
            .any(|(_, senders)| senders.contains_key(&from))
        {
            return;
        }
        self.view_changes.retain(|view, senders| {
            if *view < to_view {
                senders.remove(&from);
            }
            !senders.is_empty()
        });
        self.view_changes
            .entry(to_view)
            .or_default()
            .insert(from, message);
    }

    /// Accumulated weight behind a view change to exactly `to_view`.
    pub fn view_change_weight(&self, to_view: u64, nodes: &ConsensusNodeList) -> Weight {
        self.view_changes.get(&to_view).map_or(0, |senders| {
            senders
                .keys()
                .filter_map(|from| nodes.weight_of(*from))
                .sum()
        })
    }

    /// The collected ViewChange packets for `to_view`.
    pub fn view_changes_for(&self, to_view: u64) -> Vec<ConsensusMessage> {
        self.view_changes
            .get(&to_view)
            .map_or_else(Vec::new, |senders| senders.values().cloned().collect())
    }

    /// Fast view change: if senders worth more than `max_faulty_weight`
    /// already target views beyond ours, at least one of them is honest.
    /// Returns the highest view backed by that much weight.
    pub fn fast_view_change_target(
        &self,
        current_to_view: u64,
        nodes: &ConsensusNodeList,
    ) -> Option<u64> {
        let threshold = nodes.max_faulty_weight() + 1;
        let mut cumulative: Weight = 0;
        // Walk target views from the highest down, accumulating sender weight.
        for (to_view, senders) in self.view_changes.iter().rev() {
            if *to_view <= current_to_view {
                break;
            }
            cumulative += senders
                .keys()
                .filter_map(|from| nodes.weight_of(*from))
                .sum::<Weight>();
            if cumulative >= threshold {
                return Some(*to_view);
            }
        }
        None
    }

    /// Assemble the NewView span for `to_view` from the collected ViewChange
    /// packets. See [`compute_new_view_span`].
    pub fn new_view_span(
        &self,
        to_view: u64,
        own_committed_index: u64,
    ) -> (u64, Vec<(u64, Option<Proposal>)>) {
        let messages = self.view_changes.get(&to_view);
        compute_new_view_span(
            messages.into_iter().flat_map(|senders| senders.values()),
            own_committed_index,
        )
    }

    /// Drop view-change state consumed by entering `new_view`, and reset
    /// every certificate. Returns the abandoned proposals whose sealed
    /// transactions must be released to the pool.
    pub fn reset_on_new_view(&mut self, new_view: u64) -> Vec<Proposal> {
        self.view_changes.retain(|to_view, _| *to_view > new_view);
        let mut released = Vec::new();
        for cert in self.certificates.values_mut() {
            if let Some(abandoned) = cert.reset_cache(new_view) {
                // Synthetic empty proposals seal nothing.
                if !abandoned.is_empty_placeholder() {
                    released.push(abandoned);
                }
            }
        }
        released
    }

    /// Indices with a commit quorum but no execution yet, used when building
    /// our own ViewChange (they ride along as locked proposals).
    pub fn locked_proposals(&self, above_index: u64) -> Vec<(u64, Proposal)> {
        self.certificates
            .iter()
            .filter(|(index, _)| **index > above_index)
            .filter_map(|(_, cert)| cert.locked_for_view_change())
            .collect()
    }

    /// Highest committed-or-better certificate index.
    pub fn max_committed_index(&self) -> u64 {
        self.certificates
            .iter()
            .filter(|(_, cert)| cert.phase() >= CertificatePhase::Committed)
            .map(|(index, _)| *index)
            .max()
            .unwrap_or(0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Recovery
    // ═══════════════════════════════════════════════════════════════════════

    /// Record a recovery response. Once senders worth more than
    /// `max_faulty_weight` agree we are behind, at least one honest node is
    /// ahead of us; adopt the highest view and committed index they back.
    pub fn add_recover_response(
        &mut self,
        from: NodeIndex,
        payload: RecoverResponsePayload,
        nodes: &ConsensusNodeList,
        own_view: u64,
        own_committed_index: u64,
    ) -> Option<RecoverTarget> {
        self.recover_responses.insert(from, payload);
        let threshold = nodes.max_faulty_weight() + 1;

        let backed_view = Self::highest_backed(
            self.recover_responses.iter().map(|(f, p)| (*f, p.view)),
            nodes,
            threshold,
        );
        let backed_committed = Self::highest_backed(
            self.recover_responses
                .iter()
                .map(|(f, p)| (*f, p.committed_index)),
            nodes,
            threshold,
        );

        let target = RecoverTarget {
            view: backed_view.unwrap_or(0),
            committed_index: backed_committed.unwrap_or(0),
        };
        if target.view > own_view || target.committed_index > own_committed_index {
            Some(target)
        } else {
            None
        }
    }

    pub fn clear_recover_responses(&mut self) {
        self.recover_responses.clear();
    }

    /// Total weight of recovery responses collected so far.
    pub fn recover_response_weight(&self, nodes: &ConsensusNodeList) -> Weight {
        self.recover_responses
            .keys()
            .filter_map(|from| nodes.weight_of(*from))
            .sum()
    }

    /// Highest value such that senders worth at least `threshold` report a
    /// value at or above it.
    fn highest_backed(
        reports: impl Iterator<Item = (NodeIndex, u64)>,
        nodes: &ConsensusNodeList,
        threshold: Weight,
    ) -> Option<u64> {
        let mut by_value: BTreeMap<u64, Weight> = BTreeMap::new();
        for (from, value) in reports {
            if let Some(weight) = nodes.weight_of(from) {
                *by_value.entry(value).or_default() += weight;
            }
        }
        let mut cumulative: Weight = 0;
        for (value, weight) in by_value.iter().rev() {
            cumulative += weight;
            if cumulative >= threshold {
                return Some(*value);
            }
        }
        None
    }
}

/// The committed floor and per-index proposals a NewView must carry.
///
/// The span runs from the highest committed index any sender reported, up to
/// the highest locked proposal - but always at least one slot, so the new
/// leader immediately re-anchors progress on the stalled index. Each slot is
/// the highest-view lock among the collected ViewChanges, or `None` for a
/// gap the leader fills with the deterministic empty proposal.
pub fn compute_new_view_span<'a>(
    view_changes: impl Iterator<Item = &'a ConsensusMessage>,
    own_committed_index: u64,
) -> (u64, Vec<(u64, Option<Proposal>)>) {
    let mut max_committed = own_committed_index;
    let mut locks: BTreeMap<u64, (u64, Proposal)> = BTreeMap::new();

    for message in view_changes {
        let Some(data) = message.view_change_data() else {
            continue;
        };
        max_committed = max_committed.max(data.committed_index);
        for prepared in &data.prepared {
            let index = prepared.proposal.index;
            let replace = locks
                .get(&index)
                .is_none_or(|(view, _)| prepared.view > *view);
            if replace {
                locks.insert(index, (prepared.view, prepared.proposal.clone()));
            }
        }
    }

    let span_end = locks
        .keys()
        .next_back()
        .copied()
        .unwrap_or(0)
        .max(max_committed + 1);
    let span = (max_committed + 1..=span_end)
        .map(|index| (index, locks.remove(&index).map(|(_, p)| p)))
        .collect();
    (max_committed, span)
}
