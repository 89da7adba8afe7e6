//! Cluster view of a single node: membership, quorum thresholds, view
//! bookkeeping, leader rotation and the proposal window.

use palisade_types::{
    ConsensusNode, ConsensusNodeList, Hash, NodeId, NodeIndex, NodeListError, Weight,
};
use tracing::info;

/// Fatal configuration errors. Unlike message-level rejections these are
/// returned to the caller and abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid consensus node list: {0}")]
    InvalidNodeList(#[from] NodeListError),
    #[error("leader switch period must be non-zero")]
    ZeroLeaderSwitchPeriod,
    #[error("water mark limit must be non-zero")]
    ZeroWaterMarkLimit,
}

/// Per-node consensus configuration and chain position.
///
/// # State
///
/// - `view` is the view the node operates in; `to_view` is the view it is
///   trying to reach through view changes (`to_view >= view`).
/// - `committed_index` / `stable_index` track the highest Committed and
///   StableCommitted proposals. The stable index is the low water mark:
///   new proposals must land in `(stable_index, stable_index + water_mark_limit]`.
/// - `pending_system_index` gates ordinary proposals while a governance
///   proposal is in flight, so its effects land before anything built on top
///   of them.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    local_node_id: NodeId,
    nodes: ConsensusNodeList,
    /// Local position in the sorted list; `None` for observers that follow
    /// the protocol without voting.
    node_index: Option<NodeIndex>,

    view: u64,
    to_view: u64,

    /// Consecutive proposals each leader gets before rotation.
    leader_switch_period: u64,
    /// Width of the proposal pipeline above the stable index.
    water_mark_limit: u64,

    committed_index: u64,
    committed_hash: Hash,
    stable_index: u64,

    pending_system_index: Option<u64>,
}

impl NodeConfig {
    pub fn new(
        local_node_id: NodeId,
        nodes: Vec<ConsensusNode>,
        leader_switch_period: u64,
        water_mark_limit: u64,
    ) -> Result<Self, ConfigError> {
        if leader_switch_period == 0 {
            return Err(ConfigError::ZeroLeaderSwitchPeriod);
        }
        if water_mark_limit == 0 {
            return Err(ConfigError::ZeroWaterMarkLimit);
        }
        let nodes = ConsensusNodeList::new(nodes)?;
        let node_index = nodes.index_of(&local_node_id);
        Ok(Self {
            local_node_id,
            nodes,
            node_index,
            view: 0,
            to_view: 0,
            leader_switch_period,
            water_mark_limit,
            committed_index: 0,
            committed_hash: Hash::ZERO,
            stable_index: 0,
            pending_system_index: None,
        })
    }

    /// Replace the membership list, recomputing quorum thresholds and the
    /// local position. An empty list is fatal.
    pub fn set_consensus_node_list(
        &mut self,
        nodes: Vec<ConsensusNode>,
    ) -> Result<(), ConfigError> {
        let nodes = ConsensusNodeList::new(nodes)?;
        if nodes != self.nodes {
            info!(
                node_count = nodes.len(),
                total_weight = nodes.total_weight(),
                quorum = nodes.min_required_quorum(),
                "consensus membership updated"
            );
        }
        self.node_index = nodes.index_of(&self.local_node_id);
        self.nodes = nodes;
        Ok(())
    }

    pub fn nodes(&self) -> &ConsensusNodeList {
        &self.nodes
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn node_index(&self) -> Option<NodeIndex> {
        self.node_index
    }

    pub fn is_observer(&self) -> bool {
        self.node_index.is_none()
    }

    pub fn min_required_quorum(&self) -> Weight {
        self.nodes.min_required_quorum()
    }

    pub fn max_faulty_weight(&self) -> Weight {
        self.nodes.max_faulty_weight()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Leader rotation
    // ═══════════════════════════════════════════════════════════════════════

    /// Leader for `index` at the current view.
    pub fn leader_for(&self, index: u64) -> NodeIndex {
        self.leader_for_view(index, self.view)
    }

    /// Leader for `index` at an arbitrary view. Each leader keeps the slot
    /// for `leader_switch_period` consecutive indices; every view change
    /// shifts the rotation by one.
    pub fn leader_for_view(&self, index: u64, view: u64) -> NodeIndex {
        let n = self.nodes.len() as u64;
        let slot = (index / self.leader_switch_period).wrapping_add(view) % n;
        NodeIndex(slot as u32)
    }

    pub fn is_leader_for(&self, index: u64) -> bool {
        self.node_index == Some(self.leader_for(index))
    }

    pub fn leader_switch_period(&self) -> u64 {
        self.leader_switch_period
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View bookkeeping
    // ═══════════════════════════════════════════════════════════════════════

    pub fn view(&self) -> u64 {
        self.view
    }

    pub fn to_view(&self) -> u64 {
        self.to_view
    }

    /// Raise the target view (timeout escalation or fast view change).
    pub fn advance_to_view(&mut self, to_view: u64) {
        debug_assert!(to_view >= self.to_view);
        self.to_view = to_view.max(self.to_view);
    }

    /// Enter `new_view` after a view-change quorum or accepted NewView.
    pub fn enter_new_view(&mut self, new_view: u64) {
        self.view = new_view;
        self.to_view = new_view;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chain position and the proposal window
    // ═══════════════════════════════════════════════════════════════════════

    pub fn committed_index(&self) -> u64 {
        self.committed_index
    }

    pub fn committed_hash(&self) -> Hash {
        self.committed_hash
    }

    pub fn stable_index(&self) -> u64 {
        self.stable_index
    }

    pub fn record_committed(&mut self, index: u64, hash: Hash) {
        if index > self.committed_index {
            self.committed_index = index;
            self.committed_hash = hash;
        }
    }

    pub fn record_stable(&mut self, index: u64) {
        if index > self.stable_index {
            self.stable_index = index;
        }
        if self
            .pending_system_index
            .is_some_and(|pending| pending <= self.stable_index)
        {
            self.pending_system_index = None;
        }
    }

    /// Whether `index` falls inside the active proposal window.
    pub fn in_water_marks(&self, index: u64) -> bool {
        index > self.stable_index && index <= self.stable_index + self.water_mark_limit
    }

    pub fn water_mark_limit(&self) -> u64 {
        self.water_mark_limit
    }

    // ═══════════════════════════════════════════════════════════════════════
    // System proposal gate
    // ═══════════════════════════════════════════════════════════════════════

    /// Ordinary proposals are held back while a governance proposal is in
    /// flight; its effects (e.g. a membership change) must land first.
    pub fn can_handle_new_proposal(&self) -> bool {
        self.pending_system_index.is_none()
    }

    pub fn note_pending_system_proposal(&mut self, index: u64) {
        self.pending_system_index = Some(index);
    }

    pub fn pending_system_index(&self) -> Option<u64> {
        self.pending_system_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_types::test_utils::test_node_list;

    fn make_config(n: usize) -> NodeConfig {
        let list = test_node_list(n);
        let local = list.nodes()[0].node_id;
        NodeConfig::new(local, list.nodes().to_vec(), 1, 10).unwrap()
    }

    #[test]
    fn empty_membership_is_fatal() {
        let list = test_node_list(1);
        let local = list.nodes()[0].node_id;
        let err = NodeConfig::new(local, vec![], 1, 10).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNodeList(_)));
    }

    #[test]
    fn leader_rotates_per_index_and_view() {
        let config = make_config(4);
        // period 1: each index gets the next leader
        assert_eq!(config.leader_for_view(1, 0), NodeIndex(1));
        assert_eq!(config.leader_for_view(2, 0), NodeIndex(2));
        assert_eq!(config.leader_for_view(4, 0), NodeIndex(0));
        // a view change shifts the whole rotation
        assert_eq!(config.leader_for_view(1, 1), NodeIndex(2));
        assert_eq!(config.leader_for_view(1, 3), NodeIndex(0));
    }

    #[test]
    fn leader_switch_period_groups_indices() {
        let list = test_node_list(4);
        let local = list.nodes()[0].node_id;
        let config = NodeConfig::new(local, list.nodes().to_vec(), 3, 10).unwrap();
        assert_eq!(config.leader_for_view(0, 0), config.leader_for_view(2, 0));
        assert_ne!(config.leader_for_view(2, 0), config.leader_for_view(3, 0));
    }

    #[test]
    fn water_marks_window() {
        let mut config = make_config(4);
        assert!(config.in_water_marks(1));
        assert!(config.in_water_marks(10));
        assert!(!config.in_water_marks(0));
        assert!(!config.in_water_marks(11));
        config.record_stable(5);
        assert!(!config.in_water_marks(5));
        assert!(config.in_water_marks(6));
        assert!(config.in_water_marks(15));
    }

    #[test]
    fn system_proposal_gate_clears_on_stable() {
        let mut config = make_config(4);
        assert!(config.can_handle_new_proposal());
        config.note_pending_system_proposal(3);
        assert!(!config.can_handle_new_proposal());
        config.record_stable(2);
        assert!(!config.can_handle_new_proposal());
        config.record_stable(3);
        assert!(config.can_handle_new_proposal());
    }

    #[test]
    fn membership_change_recomputes_position() {
        let mut config = make_config(4);
        assert!(config.node_index().is_some());
        let others = test_node_list(4)
            .nodes()
            .iter()
            .filter(|n| n.node_id != config.local_node_id())
            .cloned()
            .collect();
        config.set_consensus_node_list(others).unwrap();
        assert!(config.is_observer());
    }
}
