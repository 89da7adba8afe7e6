//! End-to-end service tests over an in-process loopback transport.

use async_trait::async_trait;
use palisade_core::{
    CollaboratorError, Ledger, LedgerState, ProposalValidator, StateMachineExecutor, Transport,
};
use palisade_runtime::{Collaborators, ConsensusService, ServiceOptions};
use palisade_types::test_utils::test_keypairs;
use palisade_types::{ConsensusNode, Hash, NodeId, Proposal};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Routes encoded packets between services through one unbounded bus.
struct BusTransport {
    from: usize,
    bus: mpsc::UnboundedSender<(usize, Option<NodeId>, Vec<u8>)>,
}

#[async_trait]
impl Transport for BusTransport {
    async fn broadcast(&self, payload: Vec<u8>) {
        let _ = self.bus.send((self.from, None, payload));
    }

    async fn send_to_node(&self, node: NodeId, payload: Vec<u8>, _timeout: Duration) {
        let _ = self.bus.send((self.from, Some(node), payload));
    }
}

/// In-memory ledger recording committed and stable proposals.
struct MemoryLedger {
    state: LedgerState,
    committed: Mutex<Vec<Proposal>>,
    stable: Mutex<Vec<Proposal>>,
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn load_state(&self) -> Result<LedgerState, CollaboratorError> {
        Ok(self.state.clone())
    }

    async fn commit_proposal(&self, proposal: &Proposal) -> Result<(), CollaboratorError> {
        self.committed.lock().push(proposal.clone());
        Ok(())
    }

    async fn commit_stable_checkpoint(
        &self,
        proposal: &Proposal,
    ) -> Result<(), CollaboratorError> {
        self.stable.lock().push(proposal.clone());
        Ok(())
    }
}

/// Executor that leaves proposals unchanged, so every node reaches the same
/// post-execution hash.
struct EchoExecutor;

#[async_trait]
impl StateMachineExecutor for EchoExecutor {
    async fn apply(
        &self,
        _last_applied_index: u64,
        proposal: Proposal,
    ) -> Result<Proposal, CollaboratorError> {
        Ok(proposal)
    }
}

struct PermissiveValidator {
    released: Mutex<Vec<Proposal>>,
}

#[async_trait]
impl ProposalValidator for PermissiveValidator {
    async fn verify_proposal(&self, _proposal: &Proposal) -> bool {
        true
    }

    async fn reset_seal_flags(&self, proposal: &Proposal) {
        self.released.lock().push(proposal.clone());
    }
}

struct TestCluster {
    services: Arc<Vec<ConsensusService>>,
    ledgers: Vec<Arc<MemoryLedger>>,
}

async fn spawn_cluster(n: usize) -> TestCluster {
    let keypairs = test_keypairs(n);
    let nodes: Vec<ConsensusNode> = keypairs
        .iter()
        .map(|kp| ConsensusNode::new(kp.public_key(), 1))
        .collect();
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.node_id).collect();
    let genesis = LedgerState {
        committed_index: 0,
        committed_hash: Hash::ZERO,
        view: 0,
        nodes: nodes.clone(),
    };

    let (bus_tx, mut bus_rx) = mpsc::unbounded_channel();
    let mut services = Vec::with_capacity(n);
    let mut ledgers = Vec::with_capacity(n);
    for (i, keypair) in keypairs.into_iter().enumerate() {
        let ledger = Arc::new(MemoryLedger {
            state: genesis.clone(),
            committed: Mutex::new(Vec::new()),
            stable: Mutex::new(Vec::new()),
        });
        ledgers.push(ledger.clone());
        let collaborators = Collaborators {
            transport: Arc::new(BusTransport {
                from: i,
                bus: bus_tx.clone(),
            }),
            ledger,
            executor: Arc::new(EchoExecutor),
            validator: Arc::new(PermissiveValidator {
                released: Mutex::new(Vec::new()),
            }),
        };
        let service = ConsensusService::start(keypair, collaborators, ServiceOptions::default())
            .await
            .expect("service start");
        services.push(service);
    }
    let services = Arc::new(services);

    let router_services = services.clone();
    tokio::spawn(async move {
        while let Some((from, target, bytes)) = bus_rx.recv().await {
            match target {
                None => {
                    for (j, service) in router_services.iter().enumerate() {
                        if j != from {
                            let _ = service.on_receive_message(&bytes).await;
                        }
                    }
                }
                Some(node) => {
                    if let Some(j) = ids.iter().position(|id| *id == node) {
                        let _ = router_services[j].on_receive_message(&bytes).await;
                    }
                }
            }
        }
    });

    TestCluster { services, ledgers }
}

async fn wait_for_stable(cluster: &TestCluster, index: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let done = cluster
            .services
            .iter()
            .all(|s| s.status().stable_index >= index);
        if done {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster did not reach stable index {index}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn four_nodes_agree_over_loopback_transport() {
    let cluster = spawn_cluster(4).await;

    // node 1 leads index 1 at view 0
    cluster.services[1]
        .submit_proposal(b"block one".to_vec(), false)
        .await
        .expect("submit");
    wait_for_stable(&cluster, 1).await;

    let reference: Vec<Hash> = cluster.ledgers[0]
        .stable
        .lock()
        .iter()
        .map(|p| p.hash)
        .collect();
    assert_eq!(reference.len(), 1);
    for (i, ledger) in cluster.ledgers.iter().enumerate() {
        let committed = ledger.committed.lock();
        assert_eq!(committed.len(), 1, "node {i}");
        assert_eq!(committed[0].payload, b"block one", "node {i}");
        // committed proposals carry the prepare-quorum proof
        assert!(committed[0].signature_proof.len() >= 3, "node {i}");
        let stable: Vec<Hash> = ledger.stable.lock().iter().map(|p| p.hash).collect();
        assert_eq!(stable, reference, "node {i} finalized a different chain");
    }
}

#[tokio::test]
async fn chain_grows_across_rotating_leaders() {
    let cluster = spawn_cluster(4).await;

    for index in 1u64..=4 {
        let leader = (index % 4) as usize;
        cluster.services[leader]
            .submit_proposal(format!("block {index}").as_bytes().to_vec(), false)
            .await
            .expect("submit");
        wait_for_stable(&cluster, index).await;
    }

    for ledger in &cluster.ledgers {
        let stable = ledger.stable.lock();
        assert_eq!(stable.len(), 4);
        let indices: Vec<u64> = stable.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }
}

#[tokio::test]
async fn garbage_and_forged_packets_are_rejected_at_ingress() {
    let cluster = spawn_cluster(4).await;

    let err = cluster.services[0]
        .on_receive_message(&[0xde, 0xad, 0xbe, 0xef])
        .await
        .unwrap_err();
    assert!(matches!(err, palisade_runtime::ServiceError::Codec(_)));

    // a packet signed by a key outside the committee
    let outsider = palisade_types::test_utils::test_keypair(99);
    let forged = palisade_messages::ConsensusMessage::signed(
        palisade_messages::PacketType::Prepare,
        0,
        1,
        palisade_types::NodeIndex(1),
        0,
        palisade_messages::MessagePayload::None,
        &outsider,
    );
    let bytes = palisade_messages::codec::encode(&forged).expect("encode");
    let err = cluster.services[0]
        .on_receive_message(&bytes)
        .await
        .unwrap_err();
    assert!(matches!(err, palisade_runtime::ServiceError::Verify(_)));

    // the forgeries left no trace
    assert_eq!(cluster.services[0].status().certificate_count, 0);
}

#[tokio::test]
async fn single_node_committee_finalizes_alone() {
    let cluster = spawn_cluster(1).await;
    let status = cluster.services[0].status();
    assert_eq!(status.min_required_quorum, 1);

    cluster.services[0]
        .submit_proposal(b"solo".to_vec(), false)
        .await
        .expect("submit");
    wait_for_stable(&cluster, 1).await;
    assert_eq!(cluster.ledgers[0].stable.lock().len(), 1);
}

#[tokio::test]
async fn stop_drains_cleanly() {
    let keypairs = test_keypairs(1);
    let nodes = vec![ConsensusNode::new(keypairs[0].public_key(), 1)];
    let (bus_tx, _bus_rx) = mpsc::unbounded_channel();
    let collaborators = Collaborators {
        transport: Arc::new(BusTransport { from: 0, bus: bus_tx }),
        ledger: Arc::new(MemoryLedger {
            state: LedgerState {
                committed_index: 0,
                committed_hash: Hash::ZERO,
                view: 0,
                nodes,
            },
            committed: Mutex::new(Vec::new()),
            stable: Mutex::new(Vec::new()),
        }),
        executor: Arc::new(EchoExecutor),
        validator: Arc::new(PermissiveValidator {
            released: Mutex::new(Vec::new()),
        }),
    };
    let service = ConsensusService::start(
        keypairs.into_iter().next().expect("keypair"),
        collaborators,
        ServiceOptions::default(),
    )
    .await
    .expect("service start");

    assert!(service.status().started);
    service.stop().await;
}
