//! The tokio runner around the consensus engine.
//!
//! [`ConsensusService`] owns the engine on a dedicated task and plays the
//! impure half of the protocol: it decodes and verifies inbound packets,
//! executes the engine's actions, runs delegated verification and execution
//! on worker tasks, and feeds their results back as events.
//!
//! Events flow through prioritized channels drained with a biased select,
//! ordered like [`EventPriority`](palisade_core::EventPriority): callbacks
//! from delegated work first, then timers (liveness must survive network
//! floods), then network traffic, then client submissions.

use crate::timers::TimerManager;
use crate::verify::{verify_message, VerifyError};
use palisade_consensus::{ConfigError, ConsensusEngine, ConsensusStatus, EngineOptions};
use palisade_core::{
    Action, CollaboratorError, Event, Ledger, LedgerState, ProposalValidator, StateMachine,
    StateMachineExecutor, Transport,
};
use palisade_messages::{codec, CodecError, ConsensusMessage};
use palisade_types::{ConsensusNodeList, KeyPair, Proposal};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Errors surfaced by the service API.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("event channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Tunables for the service.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub engine: EngineOptions,
    /// Capacity of each event channel.
    pub channel_capacity: usize,
    /// Concurrent delegated verifications/executions.
    pub max_delegated_tasks: usize,
    /// Ledger commit retries before giving up.
    pub commit_retry_attempts: u32,
    pub commit_retry_backoff: Duration,
    /// Timeout handed to the transport for directed sends.
    pub send_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            engine: EngineOptions::default(),
            channel_capacity: 1024,
            max_delegated_tasks: 4,
            commit_retry_attempts: 3,
            commit_retry_backoff: Duration::from_millis(250),
            send_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything consensus does not own, supplied by the embedding node.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub ledger: Arc<dyn Ledger>,
    pub executor: Arc<dyn StateMachineExecutor>,
    pub validator: Arc<dyn ProposalValidator>,
}

/// Snapshot shared with the service handle, refreshed after every event.
struct Shared {
    status: ConsensusStatus,
    nodes: ConsensusNodeList,
}

/// Handle to a running consensus service.
pub struct ConsensusService {
    network_tx: mpsc::Sender<Event>,
    client_tx: mpsc::Sender<Event>,
    shared: Arc<RwLock<Shared>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ConsensusService {
    /// Load the chain position from the ledger and spin up the engine task.
    pub async fn start(
        keypair: KeyPair,
        collaborators: Collaborators,
        options: ServiceOptions,
    ) -> Result<Self, ServiceError> {
        let state = collaborators.ledger.load_state().await?;
        let engine = ConsensusEngine::restore(keypair, &state, options.engine.clone())?;
        let shared = Arc::new(RwLock::new(Shared {
            status: engine.consensus_status(),
            nodes: engine.config().nodes().clone(),
        }));

        let (timer_tx, timer_rx) = mpsc::channel(options.channel_capacity);
        let (callback_tx, callback_rx) = mpsc::channel(options.channel_capacity);
        let (network_tx, network_rx) = mpsc::channel(options.channel_capacity);
        let (client_tx, client_rx) = mpsc::channel(options.channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let runner = Runner {
            engine,
            timers: TimerManager::new(timer_tx),
            callback_tx,
            delegated: Arc::new(Semaphore::new(options.max_delegated_tasks)),
            collaborators,
            options,
            shared: shared.clone(),
            start_time: Instant::now(),
        };
        let task =
            tokio::spawn(runner.run(timer_rx, callback_rx, network_rx, client_rx, shutdown_rx));

        Ok(Self {
            network_tx,
            client_tx,
            shared,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    /// Feed a packet received from the wire. Decoding and signature
    /// verification happen here, on the caller's task; the engine only ever
    /// sees authentic messages.
    pub async fn on_receive_message(&self, bytes: &[u8]) -> Result<(), ServiceError> {
        let message = codec::decode(bytes)?;
        {
            let shared = self.shared.read();
            verify_message(&message, &shared.nodes)?;
        }
        self.deliver_network(message).await
    }

    async fn deliver_network(&self, message: ConsensusMessage) -> Result<(), ServiceError> {
        self.network_tx
            .send(Event::MessageReceived { message })
            .await
            .map_err(|_| ServiceError::ChannelClosed)
    }

    /// Ask the engine to propose `payload` as the next block.
    pub async fn submit_proposal(
        &self,
        payload: Vec<u8>,
        is_system: bool,
    ) -> Result<(), ServiceError> {
        self.client_tx
            .send(Event::SubmitProposal {
                proposal: Proposal::new(0, payload),
                is_system,
            })
            .await
            .map_err(|_| ServiceError::ChannelClosed)
    }

    /// Report a block that reached the ledger outside consensus (state sync).
    pub async fn notify_new_block(&self, state: LedgerState) -> Result<(), ServiceError> {
        self.client_tx
            .send(Event::NewBlockSynced { state })
            .await
            .map_err(|_| ServiceError::ChannelClosed)
    }

    /// Diagnostic snapshot, refreshed after every processed event.
    pub fn status(&self) -> ConsensusStatus {
        self.shared.read().status.clone()
    }

    /// Shut the engine task down and wait for it to drain.
    pub async fn stop(mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Err(error) = (&mut self.task).await {
            if !error.is_cancelled() {
                error!(%error, "consensus task failed");
            }
        }
    }
}

struct Runner {
    engine: ConsensusEngine,
    timers: TimerManager,
    callback_tx: mpsc::Sender<Event>,
    delegated: Arc<Semaphore>,
    collaborators: Collaborators,
    options: ServiceOptions,
    shared: Arc<RwLock<Shared>>,
    start_time: Instant,
}

impl Runner {
    async fn run(
        mut self,
        mut timer_rx: mpsc::Receiver<Event>,
        mut callback_rx: mpsc::Receiver<Event>,
        mut network_rx: mpsc::Receiver<Event>,
        mut client_rx: mpsc::Receiver<Event>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let actions = self.engine.start();
        self.process_actions(actions).await;
        self.refresh_shared();

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("shutdown signal received");
                    break;
                }
                // Callbacks before timers, matching EventPriority: a pending
                // quorum or execution result must not be preempted by another
                // timeout escalation.
                Some(event) = callback_rx.recv() => self.dispatch(event).await,
                Some(event) = timer_rx.recv() => self.dispatch(event).await,
                Some(event) = network_rx.recv() => self.dispatch(event).await,
                Some(event) = client_rx.recv() => self.dispatch(event).await,
                else => break,
            }
        }

        let actions = self.engine.stop();
        self.process_actions(actions).await;
        self.timers.cancel_all();
        self.refresh_shared();
    }

    async fn dispatch(&mut self, event: Event) {
        let event_type = event.type_name();
        self.engine.set_time(self.start_time.elapsed());
        let actions = self.engine.handle(event);
        if !actions.is_empty() {
            trace!(event_type, actions = actions.len(), "event produced actions");
        }
        self.process_actions(actions).await;
        self.refresh_shared();
    }

    fn refresh_shared(&self) {
        let mut shared = self.shared.write();
        shared.status = self.engine.consensus_status();
        if shared.nodes != *self.engine.config().nodes() {
            shared.nodes = self.engine.config().nodes().clone();
        }
    }

    async fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.process_action(action).await;
        }
    }

    async fn process_action(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => match codec::encode(&message) {
                Ok(bytes) => self.collaborators.transport.broadcast(bytes).await,
                Err(error) => error!(%error, "failed to encode broadcast"),
            },
            Action::SendToNode { node, message } => match codec::encode(&message) {
                Ok(bytes) => {
                    self.collaborators
                        .transport
                        .send_to_node(node, bytes, self.options.send_timeout)
                        .await
                }
                Err(error) => error!(%error, "failed to encode directed send"),
            },
            Action::SetTimer { id, duration } => self.timers.set_timer(id, duration),
            Action::CancelTimer { id } => self.timers.cancel_timer(id),
            Action::EnqueueInternal { event } => {
                if self.callback_tx.send(event).await.is_err() {
                    debug!("callback channel closed, dropping internal event");
                }
            }
            Action::VerifyProposal { message } => self.spawn_verification(message),
            Action::ExecuteProposal {
                last_applied_index,
                proposal,
            } => self.spawn_execution(last_applied_index, proposal),
            Action::CommitProposal { proposal } => self.spawn_commit(proposal, false),
            Action::CommitStableCheckpoint { proposal } => self.spawn_commit(proposal, true),
            Action::ResetSealFlags { proposal } => {
                let validator = self.collaborators.validator.clone();
                tokio::spawn(async move {
                    validator.reset_seal_flags(&proposal).await;
                });
            }
        }
    }

    fn spawn_verification(&self, message: ConsensusMessage) {
        let validator = self.collaborators.validator.clone();
        let callback_tx = self.callback_tx.clone();
        let delegated = self.delegated.clone();
        tokio::spawn(async move {
            let Ok(_permit) = delegated.acquire_owned().await else {
                return;
            };
            let valid = match message.proposal() {
                Some(proposal) => validator.verify_proposal(proposal).await,
                None => false,
            };
            let _ = callback_tx
                .send(Event::ProposalVerified { message, valid })
                .await;
        });
    }

    fn spawn_execution(&self, last_applied_index: u64, proposal: Proposal) {
        let executor = self.collaborators.executor.clone();
        let callback_tx = self.callback_tx.clone();
        let delegated = self.delegated.clone();
        tokio::spawn(async move {
            let Ok(_permit) = delegated.acquire_owned().await else {
                return;
            };
            let index = proposal.index;
            let input_hash = proposal.hash;
            let executed = match executor.apply(last_applied_index, proposal).await {
                Ok(executed) => Some(executed),
                Err(error) => {
                    warn!(index, %error, "proposal execution failed");
                    None
                }
            };
            let _ = callback_tx
                .send(Event::ProposalExecuted {
                    index,
                    input_hash,
                    executed,
                })
                .await;
        });
    }

    /// Ledger commits are fire-and-forget with bounded retries; consensus
    /// ordering does not wait for storage.
    fn spawn_commit(&self, proposal: Proposal, stable: bool) {
        let ledger = self.collaborators.ledger.clone();
        let attempts = self.options.commit_retry_attempts.max(1);
        let backoff = self.options.commit_retry_backoff;
        tokio::spawn(async move {
            for attempt in 1..=attempts {
                let result = if stable {
                    ledger.commit_stable_checkpoint(&proposal).await
                } else {
                    ledger.commit_proposal(&proposal).await
                };
                match result {
                    Ok(()) => return,
                    Err(error) if attempt < attempts => {
                        warn!(
                            index = proposal.index,
                            attempt, %error,
                            "ledger commit failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    Err(error) => {
                        error!(index = proposal.index, %error, "ledger commit failed permanently");
                    }
                }
            }
        });
    }
}
