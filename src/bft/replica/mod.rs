//! The replica orchestrator: owns the node's identity, peer table,
//! view and per-sequence consensus states, and runs the long-lived
//! tasks that move messages between them.
//!
//! Task layout mirrors the protocol pipeline: one dispatcher feeding a
//! pool of resolvers, one execution serializer, one outbound sender
//! with bounded concurrency, and one error logger with a cool-down.
//! Each consensus instance additionally runs its own task, which
//! serializes stage transitions and watches the commit deadline.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Semaphore;

use crate::bft::checkpoint::{CheckpointLog, PERIOD};
use crate::bft::communication::message::{
    CheckPointMessage,
    NewViewMessage,
    PrePrepareMessage,
    PreparedProof,
    ReplyMessage,
    RequestMessage,
    SignedEnvelope,
    SystemMessage,
    ViewChangeMessage,
    VoteKind,
    VoteMessage,
};
use crate::bft::communication::{NodeId, NodeTable, Transport, ViewInfo};
use crate::bft::consensus::{ConsensusEngine, Stage, State};
use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::KeyPair;
use crate::bft::error::*;
use crate::bft::executable::{ExecutionQueue, Service};
use crate::bft::ordering::{SeqNo, ViewId};
use crate::bft::sync::Synchronizer;

/// Number of parallel resolver tasks draining the delivery queue.
pub const NUM_RESOLVE_TASKS: usize = 6;

/// Deadline for a consensus instance to commit before the primary is
/// suspected.
pub const CONSENSUS_DEADLINE: Duration = Duration::from_millis(50);

/// Cooling time applied by the error logger after a burst of errors.
pub const COOLING_TIME: Duration = Duration::from_millis(2);

/// Number of errors tolerated before the logger cools down.
pub const COOLING_TOTAL_ERR_MSG: usize = 5;

/// Bound on concurrently outstanding outbound deliveries.
pub const MAX_OUTBOUND_CONNECTION: usize = 1000;

// capacity of the bounded error channel
const ERROR_CHAN_BOUND: usize = 128;

/// Tunables of a replica. The defaults are the protocol constants.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// The view the system boots in.
    pub initial_view: ViewId,
    pub resolvers: usize,
    pub deadline: Duration,
    pub cooling_time: Duration,
    pub cooling_total_err_msg: usize,
    pub max_outbound: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            initial_view: ViewId::ZERO,
            resolvers: NUM_RESOLVE_TASKS,
            deadline: CONSENSUS_DEADLINE,
            cooling_time: COOLING_TIME,
            cooling_total_err_msg: COOLING_TOTAL_ERR_MSG,
            max_outbound: MAX_OUTBOUND_CONNECTION,
        }
    }
}

/// A message fanned into one consensus instance.
enum InstanceMessage {
    PrePrepare(PrePrepareMessage),
    Vote(VoteMessage),
}

/// Handle to one consensus instance: its inbox, and the shared state
/// the instance task mutates.
#[derive(Clone)]
struct StateHandle {
    inbox: mpsc::UnboundedSender<InstanceMessage>,
    state: SharedState,
}

type SharedState = Arc<Mutex<Box<dyn ConsensusEngine + Send>>>;

// receivers parked between bootstrap and start
struct Receivers {
    entrance: mpsc::UnboundedReceiver<SystemMessage>,
    view_entrance: mpsc::UnboundedReceiver<SystemMessage>,
    delivery: flume::Receiver<SystemMessage>,
    execution: mpsc::UnboundedReceiver<(ReplyMessage, RequestMessage)>,
    outbound: mpsc::UnboundedReceiver<SystemMessage>,
    errors: mpsc::Receiver<Error>,
}

/// A single PBFT replica.
pub struct Replica<T: Transport> {
    node_id: NodeId,
    keypair: KeyPair,
    table: NodeTable,
    config: ReplicaConfig,
    transport: Arc<T>,

    view: RwLock<ViewInfo>,
    is_view_changing: AtomicBool,
    // last sequence number assigned by this node when primary
    total_consensus: AtomicU64,
    states: RwLock<HashMap<SeqNo, StateHandle>>,
    committed: RwLock<Vec<RequestMessage>>,
    // (clientID, timestamp) pairs already executed, for reply-once and
    // the backup suspicion timers
    executed: Mutex<HashSet<(String, i64)>>,
    // requests proposed but not yet executed, keyed the same way; a
    // retransmission must not be allocated a second sequence number
    in_flight: Mutex<HashMap<(String, i64), SeqNo>>,
    checkpoints: Mutex<CheckpointLog>,
    synchronizer: Mutex<Synchronizer>,

    entrance_tx: mpsc::UnboundedSender<SystemMessage>,
    view_entrance_tx: mpsc::UnboundedSender<SystemMessage>,
    delivery_tx: flume::Sender<SystemMessage>,
    execution_tx: mpsc::UnboundedSender<(ReplyMessage, RequestMessage)>,
    outbound_tx: mpsc::UnboundedSender<SystemMessage>,
    error_tx: mpsc::Sender<Error>,

    receivers: Mutex<Option<Receivers>>,
    // self reference handed to the tasks this replica spawns
    myself: Weak<Replica<T>>,
}

impl<T: Transport> Replica<T> {
    /// Assembles a replica from its identity and collaborators.
    ///
    /// Fails fatally when the node is missing from the table or its key
    /// pair does not match the table's public key.
    pub fn bootstrap(
        config: ReplicaConfig,
        node_id: NodeId,
        keypair: KeyPair,
        table: NodeTable,
        transport: Arc<T>,
    ) -> Result<Arc<Self>> {
        let info = table.get(&node_id).ok_or_else(|| {
            Error::Bootstrap(format!("node '{}' does not exist in the node table", node_id))
        })?;
        if info.public_key.as_bytes() != keypair.public_key_bytes() {
            return Err(Error::Bootstrap(format!(
                "key pair of '{}' does not match the node table",
                node_id
            )));
        }
        let params = table.params();

        let (entrance_tx, entrance_rx) = mpsc::unbounded_channel();
        let (view_entrance_tx, view_entrance_rx) = mpsc::unbounded_channel();
        let (delivery_tx, delivery_rx) = flume::unbounded();
        let (execution_tx, execution_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHAN_BOUND);

        let view = ViewInfo::new(config.initial_view, params);
        let synchronizer = Synchronizer::new(node_id.clone(), params);

        Ok(Arc::new_cyclic(|myself| Replica {
            myself: myself.clone(),
            node_id,
            keypair,
            table,
            config,
            transport,
            view: RwLock::new(view),
            is_view_changing: AtomicBool::new(false),
            total_consensus: AtomicU64::new(0),
            states: RwLock::new(HashMap::new()),
            committed: RwLock::new(Vec::new()),
            executed: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            checkpoints: Mutex::new(CheckpointLog::new()),
            synchronizer: Mutex::new(synchronizer),
            entrance_tx,
            view_entrance_tx,
            delivery_tx,
            execution_tx,
            outbound_tx,
            error_tx,
            receivers: Mutex::new(Some(Receivers {
                entrance: entrance_rx,
                view_entrance: view_entrance_rx,
                delivery: delivery_rx,
                execution: execution_rx,
                outbound: outbound_rx,
                errors: error_rx,
            })),
        }))
    }

    /// Spawns the replica's long-lived tasks. Must run inside a tokio
    /// runtime; `service` executes the committed operations.
    pub fn start(&self, service: impl Service) -> Result<()> {
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| Error::Bootstrap("replica already started".into()))?;
        let replica = self
            .myself
            .upgrade()
            .ok_or_else(|| Error::Bootstrap("replica dropped before start".into()))?;

        tokio::spawn(replica.clone().dispatch(receivers.entrance, receivers.view_entrance));
        for _ in 0..self.config.resolvers {
            tokio::spawn(replica.clone().resolve(receivers.delivery.clone()));
        }
        tokio::spawn(replica.clone().execute(receivers.execution, Box::new(service)));
        tokio::spawn(replica.clone().send_outbound(receivers.outbound));
        tokio::spawn(replica.log_errors(receivers.errors));

        info!("replica {} started in view {}", self.node_id, self.current_view().id());
        Ok(())
    }

    // ------------------------------------------------------------------
    // inbound
    // ------------------------------------------------------------------

    /// Inbound push endpoint: a signed envelope received from a peer.
    ///
    /// The envelope must verify under the public key of the origin its
    /// payload claims, and that origin must be a table member.
    pub fn receive(&self, raw: &[u8]) -> Result<()> {
        match self.open_envelope(raw) {
            Ok(message) => {
                self.enqueue(message);
                Ok(())
            }
            Err(e) => {
                // recorded, then surfaced to the transport adapter
                let _ = self.error_tx.try_send(Error::Crypto("inbound envelope rejected"));
                Err(e)
            }
        }
    }

    fn open_envelope(&self, raw: &[u8]) -> Result<SystemMessage> {
        let envelope = SignedEnvelope::from_bytes(raw)?;
        let message = envelope.message()?;
        let origin = message.origin();
        let info = self
            .table
            .get(&origin)
            .ok_or(Error::Crypto("message origin not in the node table"))?;
        envelope.verify(&info.public_key)?;
        Ok(message)
    }

    /// Local request submission, for clients hosted next to the node.
    pub fn submit_request(&self, request: RequestMessage) {
        self.enqueue(SystemMessage::Request(request));
    }

    fn enqueue(&self, message: SystemMessage) {
        let queue = match message {
            SystemMessage::ViewChange(_) | SystemMessage::NewView(_) => &self.view_entrance_tx,
            _ => &self.entrance_tx,
        };
        let _ = queue.send(message);
    }

    // ------------------------------------------------------------------
    // dispatcher
    // ------------------------------------------------------------------

    async fn dispatch(
        self: Arc<Self>,
        mut entrance: mpsc::UnboundedReceiver<SystemMessage>,
        mut view_entrance: mpsc::UnboundedReceiver<SystemMessage>,
    ) {
        loop {
            tokio::select! {
                message = view_entrance.recv() => match message {
                    Some(message) => self.route(message),
                    None => return,
                },
                message = entrance.recv() => match message {
                    // while a view change is in flight, the normal
                    // pipeline is dropped, not queued
                    Some(message) if !self.is_view_changing() => self.route(message),
                    Some(_) => (),
                    None => return,
                },
            }
        }
    }

    fn route(&self, message: SystemMessage) {
        let stable = self.stable_checkpoint();
        let deliver = match &message {
            SystemMessage::Request(_) | SystemMessage::Reply(_) => true,
            SystemMessage::PrePrepare(m) => !self.is_primary() && m.sequence_id > stable,
            // our own broadcast loops back through some transports
            SystemMessage::Vote(m) => m.voter_node_id != self.node_id && m.sequence_id > stable,
            SystemMessage::CheckPoint(m) => {
                m.origin_node_id != self.node_id && m.sequence_id > stable
            }
            SystemMessage::ViewChange(_) | SystemMessage::NewView(_) => true,
        };
        if deliver {
            let _ = self.delivery_tx.send(message);
        }
    }

    // ------------------------------------------------------------------
    // resolvers
    // ------------------------------------------------------------------

    async fn resolve(self: Arc<Self>, delivery: flume::Receiver<SystemMessage>) {
        while let Ok(message) = delivery.recv_async().await {
            if let Err(e) = self.resolve_one(&message) {
                // a vote can outrun its pre-prepare; retry through the
                // dispatcher once the state exists
                let requeue = matches!(e, Error::UnknownState { .. });
                self.report(e).await;
                if requeue {
                    let _ = self.entrance_tx.send(message.clone());
                }
            }
        }
    }

    fn resolve_one(&self, message: &SystemMessage) -> Result<()> {
        match message {
            SystemMessage::Request(request) => self.get_request(request.clone()),
            SystemMessage::PrePrepare(ppm) => {
                let handle = self.find_or_create_state(ppm)?;
                // a closed inbox means the deadline already decided
                let _ = handle.inbox.send(InstanceMessage::PrePrepare(ppm.clone()));
                Ok(())
            }
            SystemMessage::Vote(vote) => {
                let handle = self.get_state(vote.sequence_id)?;
                let _ = handle.inbox.send(InstanceMessage::Vote(vote.clone()));
                Ok(())
            }
            SystemMessage::Reply(reply) => {
                debug!(
                    "reply observed from {} for client {} (result {})",
                    reply.executor_node_id, reply.client_id, reply.result
                );
                Ok(())
            }
            SystemMessage::CheckPoint(message) => self.get_checkpoint(message.clone()),
            SystemMessage::ViewChange(message) => self.get_view_change(message.clone()),
            SystemMessage::NewView(message) => self.get_new_view(message.clone()),
        }
    }

    // ------------------------------------------------------------------
    // request intake
    // ------------------------------------------------------------------

    fn get_request(&self, request: RequestMessage) -> Result<()> {
        // exactly-once per (clientID, timestamp): retransmissions of a
        // request already executed, or still being agreed on, are dropped
        let key = (request.client_id.clone(), request.timestamp);
        if self.executed.lock().contains(&key) || self.in_flight.lock().contains_key(&key) {
            return Ok(());
        }

        let view = self.current_view();
        if self.table.primary(view.id()).id != self.node_id {
            // the backup checks the sequence numbers the primary
            // assigns and uses timeouts to detect when it stops
            self.arm_request_watchdog(request);
            return Ok(());
        }

        // claim the key before allocating, so a concurrently resolved
        // retransmission cannot take a second sequence number
        let seq = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&key) {
                return Ok(());
            }
            let seq = SeqNo::from(self.total_consensus.fetch_add(1, Ordering::SeqCst) + 1);
            in_flight.insert(key.clone(), seq);
            seq
        };
        let stable = self.stable_checkpoint();
        let mut state = State::new(view, self.node_id.clone(), self.node_id.clone(), stable);
        let message = match state.start_consensus(request, seq) {
            Ok(message) => message,
            Err(e) => {
                // release the claim so a retransmission can retry
                self.in_flight.lock().remove(&key);
                return Err(e);
            }
        };

        self.register_state(seq, Box::new(state));
        info!("consensus process started (view {}, seq {})", view.id(), seq);
        self.broadcast(SystemMessage::PrePrepare(message));
        Ok(())
    }

    fn arm_request_watchdog(&self, request: RequestMessage) {
        let Some(replica) = self.myself.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(replica.config.deadline).await;
            let key = (request.client_id.clone(), request.timestamp);
            let executed = replica.executed.lock().contains(&key);
            if !executed && !replica.is_view_changing() {
                // no sequence number exists on this side; identify the
                // stalled request by its client and timestamp
                let (client_id, timestamp) = key;
                replica
                    .report(Error::RequestTimeout { client_id, timestamp })
                    .await;
                replica.start_view_change();
            }
        });
    }

    // ------------------------------------------------------------------
    // consensus instances
    // ------------------------------------------------------------------

    fn get_state(&self, seq: SeqNo) -> Result<StateHandle> {
        self.states
            .read()
            .get(&seq)
            .cloned()
            .ok_or(Error::UnknownState { seq })
    }

    /// Creation policy for backups: a pre-prepare for an unknown
    /// in-window sequence creates the instance.
    fn find_or_create_state(&self, ppm: &PrePrepareMessage) -> Result<StateHandle> {
        if let Some(handle) = self.states.read().get(&ppm.sequence_id) {
            return Ok(handle.clone());
        }

        let stable = self.stable_checkpoint();
        if ppm.sequence_id.index(stable).is_left() {
            return Err(Error::BadSequenceNumber {
                seq: ppm.sequence_id,
                low: stable,
                high: SeqNo::from(u64::from(stable) + crate::bft::ordering::WINDOW),
            });
        }

        let view = self.current_view();
        let primary = self.table.primary(view.id()).id.clone();
        let state = State::new(view, self.node_id.clone(), primary, stable);
        Ok(self.register_state(ppm.sequence_id, Box::new(state)))
    }

    /// Registers an instance and spawns its task, which owns the
    /// deadline. Reuses the existing handle when one is present.
    fn register_state(&self, seq: SeqNo, state: Box<dyn ConsensusEngine + Send>) -> StateHandle {
        let mut states = self.states.write();
        if let Some(handle) = states.get(&seq) {
            return handle.clone();
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let shared: SharedState = Arc::new(Mutex::new(state));
        let handle = StateHandle {
            inbox: inbox_tx,
            state: shared.clone(),
        };
        states.insert(seq, handle.clone());
        drop(states);

        if let Some(replica) = self.myself.upgrade() {
            tokio::spawn(replica.run_instance(shared, inbox_rx));
        }
        handle
    }

    /// The per-instance task: applies messages in arrival order until
    /// the deadline fires or the instance is garbage collected.
    async fn run_instance(
        self: Arc<Self>,
        state: SharedState,
        mut inbox: mpsc::UnboundedReceiver<InstanceMessage>,
    ) {
        let deadline = tokio::time::Instant::now() + self.config.deadline;
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(InstanceMessage::PrePrepare(ppm)) => {
                        self.apply_pre_prepare(&state, ppm).await
                    }
                    Some(InstanceMessage::Vote(vote)) => match vote.kind {
                        VoteKind::Prepare => self.apply_prepare(&state, vote).await,
                        VoteKind::Commit => self.apply_commit(&state, vote).await,
                    },
                    // handle dropped: the instance was garbage collected
                    None => return,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    self.on_deadline(&state).await;
                    return;
                }
            }
        }
    }

    async fn apply_pre_prepare(&self, state: &SharedState, ppm: PrePrepareMessage) {
        let seq = ppm.sequence_id;
        let result = state.lock().pre_prepare(ppm);
        match result {
            Ok(vote) => {
                info!("pre-prepare accepted (seq {})", seq);
                self.broadcast(SystemMessage::Vote(vote.clone()));
                // count our own vote without a network round trip
                self.apply_prepare(state, vote).await;
            }
            Err(e) => self.report(e).await,
        }
    }

    async fn apply_prepare(&self, state: &SharedState, vote: VoteMessage) {
        let seq = vote.sequence_id;
        let result = state.lock().prepare(vote);
        match result {
            Ok(Some(commit)) => {
                info!("prepared (seq {})", seq);
                self.broadcast(SystemMessage::Vote(commit.clone()));
                self.apply_commit(state, commit).await;
            }
            Ok(None) => (),
            Err(e) => self.report(e).await,
        }
    }

    async fn apply_commit(&self, state: &SharedState, vote: VoteMessage) {
        let seq = vote.sequence_id;
        let result = state.lock().commit(vote);
        match result {
            Ok(Some(pair)) => {
                info!("committed (seq {})", seq);
                let _ = self.execution_tx.send(pair);
            }
            Ok(None) => (),
            Err(e) => self.report(e).await,
        }
    }

    async fn on_deadline(&self, state: &SharedState) {
        let (stage, seq) = {
            let state = state.lock();
            (state.stage(), state.sequence_number())
        };
        // no-op when this instance, or a later one, already committed
        if stage >= Stage::Committed || self.last_committed_seq() >= seq {
            return;
        }
        self.report(Error::Timeout { seq }).await;
        self.start_view_change();
    }

    // ------------------------------------------------------------------
    // execution serializer
    // ------------------------------------------------------------------

    async fn execute(
        self: Arc<Self>,
        mut execution: mpsc::UnboundedReceiver<(ReplyMessage, RequestMessage)>,
        mut service: Box<dyn Service>,
    ) {
        let mut queue = ExecutionQueue::new();
        while let Some((reply, request)) = execution.recv().await {
            queue.insert(reply, request);

            let run = queue.drain_contiguous(self.last_committed_seq());
            for (mut reply, request) in run {
                let seq = request.sequence_id;
                reply.result = service.execute(&request);
                info!(
                    "executed seq {} (client {}, op {}) -> {}",
                    seq, request.client_id, request.operation, reply.result
                );

                let key = (request.client_id.clone(), request.timestamp);
                self.executed.lock().insert(key.clone());
                self.in_flight.lock().remove(&key);
                self.committed.write().push(request);
                self.broadcast(SystemMessage::Reply(reply));

                if let Some(handle) = self.states.read().get(&seq) {
                    handle.state.lock().mark_replied();
                }

                if u64::from(seq) % PERIOD == 0 {
                    if let Err(e) = self.emit_checkpoints(seq) {
                        self.report(e).await;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // checkpoints
    // ------------------------------------------------------------------

    /// Emits checkpoint votes for every full period committed since the
    /// stable mark, stopping at the first incomplete window.
    fn emit_checkpoints(&self, upto: SeqNo) -> Result<()> {
        let mut base = self.stable_checkpoint();
        while base < upto {
            if !self.checkpoint_window_committed(base) {
                break;
            }
            let chk_seq = SeqNo::from(u64::from(base) + PERIOD);
            let digest = self.committed_digest(chk_seq)?;
            let message = CheckPointMessage {
                sequence_id: chk_seq,
                digest,
                origin_node_id: self.node_id.clone(),
            };
            self.broadcast(SystemMessage::CheckPoint(message.clone()));
            self.get_checkpoint(message)?;
            base = chk_seq;
        }
        Ok(())
    }

    /// Whether every sequence in `(base, base + PERIOD]` was committed.
    /// The committed log is contiguous, so its length decides.
    fn checkpoint_window_committed(&self, base: SeqNo) -> bool {
        u64::from(self.last_committed_seq()) >= u64::from(base) + PERIOD
    }

    fn committed_digest(&self, seq: SeqNo) -> Result<Digest> {
        let committed = self.committed.read();
        let request = committed
            .get((u64::from(seq) - 1) as usize)
            .ok_or(Error::UnknownState { seq })?;
        request.digest()
    }

    fn get_checkpoint(&self, message: CheckPointMessage) -> Result<()> {
        let stabilized =
            self.checkpoints
                .lock()
                .insert(message, self.table.params(), &self.node_id);
        if let Some(stable) = stabilized {
            // CHECKPOINT: state and logs below the mark are discarded
            self.states.write().retain(|seq, _| *seq > stable);
            info!("CHECKPOINT stable at sequence {}", stable);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // view change
    // ------------------------------------------------------------------

    /// Starts suspecting the primary: broadcast our view-change vote
    /// and stop accepting the normal pipeline.
    fn start_view_change(&self) {
        if self.is_view_changing.swap(true, Ordering::SeqCst) {
            return;
        }

        let next_view = self.current_view().id().next();
        let stable = self.stable_checkpoint();
        let set_p: HashMap<SeqNo, PreparedProof> = {
            let states = self.states.read();
            states
                .iter()
                .filter(|(seq, _)| **seq > stable)
                .filter_map(|(seq, handle)| {
                    handle.state.lock().prepared_proof().map(|proof| (*seq, proof))
                })
                .collect()
        };

        let message = self
            .synchronizer
            .lock()
            .build_view_change(next_view, stable, set_p);
        warn!(
            "view change started: {} suspects the primary of view {}",
            self.node_id,
            self.current_view().id()
        );
        self.broadcast(SystemMessage::ViewChange(message.clone()));
        // our own vote enters the certificate directly
        let _ = self.view_entrance_tx.send(SystemMessage::ViewChange(message));
    }

    fn get_view_change(&self, message: ViewChangeMessage) -> Result<()> {
        let current = self.current_view().id();
        if message.next_view_id <= current {
            return Err(Error::InvalidViewChange("vote for an installed view"));
        }

        let next_view = message.next_view_id;
        let count = self.synchronizer.lock().receive(message)?;
        debug!(
            "view change vote recorded for view {} ({} collected)",
            next_view, count
        );

        if self.table.primary(next_view).id != self.node_id {
            return Ok(());
        }
        let certificate = self.synchronizer.lock().certificate(next_view);
        if let Some(view_changes) = certificate {
            let new_view =
                Synchronizer::synthesize_new_view(&self.node_id, next_view, &view_changes)?;
            info!(
                "new view {} synthesized with {} re-issued pre-prepares",
                next_view,
                new_view.pre_prepares.len()
            );
            self.broadcast(SystemMessage::NewView(new_view.clone()));
            self.install_view(new_view)?;
        }
        Ok(())
    }

    fn get_new_view(&self, message: NewViewMessage) -> Result<()> {
        let current = self.current_view().id();
        if message.next_view_id <= current {
            return Err(Error::InvalidNewView("announcement for an installed view"));
        }
        let expected_primary = self.table.primary(message.next_view_id).id.clone();
        self.synchronizer
            .lock()
            .validate_new_view(&message, &expected_primary)?;
        self.install_view(message)
    }

    /// Installs `nextViewID`, drops the uncommitted window and re-seeds
    /// it from the re-issued pre-prepares.
    fn install_view(&self, new_view: NewViewMessage) -> Result<()> {
        let params = self.table.params();
        let installed = new_view.next_view_id;
        {
            let mut view = self.view.write();
            *view = ViewInfo::new(installed, params);
        }

        // proposals resume after the re-issued window
        let max_s = new_view
            .pre_prepares
            .last()
            .map(|ppm| u64::from(ppm.sequence_id))
            .unwrap_or(u64::from(new_view.min_s));
        let resume = max_s.max(u64::from(self.last_committed_seq()));
        self.total_consensus.store(resume, Ordering::SeqCst);

        // the uncommitted window is exactly what the announcement
        // re-proposes; committed instances stay until their checkpoint
        self.states
            .write()
            .retain(|_, handle| handle.state.lock().stage() >= Stage::Committed);
        self.synchronizer.lock().gc(installed);
        self.is_view_changing.store(false, Ordering::SeqCst);
        info!("view {} installed on {}", installed, self.node_id);

        let primary = self.table.primary(installed).id.clone();
        let last_committed = self.last_committed_seq();
        for ppm in new_view.pre_prepares {
            if ppm.sequence_id <= last_committed {
                continue;
            }
            let seq = ppm.sequence_id;
            if !ppm.request_msg.is_null() {
                // the re-proposed request is in flight again, at its
                // original sequence; retransmissions stay deduplicated
                self.in_flight.lock().insert(
                    (ppm.request_msg.client_id.clone(), ppm.request_msg.timestamp),
                    seq,
                );
            }
            let stable = self.stable_checkpoint();
            let view = self.current_view();
            let state = State::new(view, self.node_id.clone(), primary.clone(), stable);
            let handle = self.register_state(seq, Box::new(state));
            if primary == self.node_id {
                // our own proposal; backups answer it with prepares
                handle.state.lock().install_pre_prepare(ppm);
            } else {
                let _ = handle.inbox.send(InstanceMessage::PrePrepare(ppm));
            }
        }

        // requests whose instance did not survive the change may be
        // retransmitted and proposed afresh
        {
            let states = self.states.read();
            let last_committed = self.last_committed_seq();
            self.in_flight
                .lock()
                .retain(|_, seq| *seq <= last_committed || states.contains_key(seq));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // outbound & errors
    // ------------------------------------------------------------------

    /// Queues a message for signing and delivery to every peer.
    fn broadcast(&self, message: SystemMessage) {
        let _ = self.outbound_tx.send(message);
    }

    async fn send_outbound(self: Arc<Self>, mut outbound: mpsc::UnboundedReceiver<SystemMessage>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_outbound));
        while let Some(message) = outbound.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                return;
            };
            let replica = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = replica.deliver(message).await {
                    replica.report(e).await;
                }
            });
        }
    }

    async fn deliver(&self, message: SystemMessage) -> Result<()> {
        let envelope = SignedEnvelope::seal(&message, &self.keypair)?;
        let bytes = envelope.to_bytes()?;
        for peer in self.table.iter().filter(|peer| peer.id != self.node_id) {
            if let Err(e) = self.transport.send(peer, bytes.clone()).await {
                // a dead peer must not stall the rest of the broadcast
                self.report(e).await;
            }
        }
        Ok(())
    }

    async fn report(&self, error: Error) {
        let _ = self.error_tx.send(error).await;
    }

    async fn log_errors(self: Arc<Self>, mut errors: mpsc::Receiver<Error>) {
        let mut cooling_left = self.config.cooling_total_err_msg;
        while let Some(e) = errors.recv().await {
            cooling_left -= 1;
            if cooling_left == 0 {
                warn!(
                    "{} error messages detected; cooling down for {:?}",
                    self.config.cooling_total_err_msg, self.config.cooling_time
                );
                tokio::time::sleep(self.config.cooling_time).await;
                cooling_left = self.config.cooling_total_err_msg;
            }
            if e.is_protocol_violation() {
                warn!("protocol violation: {}", e);
            } else {
                error!("{}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // introspection
    // ------------------------------------------------------------------

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn current_view(&self) -> ViewInfo {
        *self.view.read()
    }

    pub fn is_view_changing(&self) -> bool {
        self.is_view_changing.load(Ordering::SeqCst)
    }

    pub fn stable_checkpoint(&self) -> SeqNo {
        self.checkpoints.lock().stable_checkpoint()
    }

    /// Snapshot of the committed, executed requests, in sequence order.
    pub fn committed_requests(&self) -> Vec<RequestMessage> {
        self.committed.read().clone()
    }

    pub fn last_committed_seq(&self) -> SeqNo {
        self.committed
            .read()
            .last()
            .map(|request| request.sequence_id)
            .unwrap_or(SeqNo::ZERO)
    }

    /// Number of live consensus instances.
    pub fn active_states(&self) -> usize {
        self.states.read().len()
    }

    fn is_primary(&self) -> bool {
        self.table.primary(self.current_view().id()).id == self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bft::communication::message::MessageTag;
    use crate::bft::communication::NodeInfo;
    use futures::future::BoxFuture;
    use std::time::Instant;

    /// Delivers envelopes between in-process replicas and records the
    /// replies crossing the wire.
    struct InMemoryNetwork {
        inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>>,
        replies: Mutex<Vec<ReplyMessage>>,
    }

    struct ClusterTransport {
        network: Arc<InMemoryNetwork>,
    }

    impl Transport for ClusterTransport {
        fn send(&self, to: &NodeInfo, payload: Vec<u8>) -> BoxFuture<'static, Result<()>> {
            let network = self.network.clone();
            let to = to.id.clone();
            Box::pin(async move {
                if let Ok(envelope) = SignedEnvelope::from_bytes(&payload) {
                    if envelope.msg_type == MessageTag::Reply {
                        if let Ok(SystemMessage::Reply(reply)) = envelope.message() {
                            network.replies.lock().push(reply);
                        }
                    }
                }
                let sender = network.inboxes.read().get(&to).cloned();
                match sender {
                    Some(tx) => tx
                        .send(payload)
                        .map_err(|_| Error::Transport(format!("{} hung up", to))),
                    None => Err(Error::Transport(format!("{} unreachable", to))),
                }
            })
        }
    }

    struct Cluster {
        network: Arc<InMemoryNetwork>,
        replicas: Vec<Arc<Replica<ClusterTransport>>>,
        // key documents for crafting raw envelopes, indexed like the table
        key_docs: Vec<Vec<u8>>,
    }

    impl Cluster {
        fn online(&self) -> impl Iterator<Item = &Arc<Replica<ClusterTransport>>> {
            self.replicas.iter()
        }

        fn replica(&self, id: &str) -> &Arc<Replica<ClusterTransport>> {
            self.replicas
                .iter()
                .find(|r| r.node_id().as_str() == id)
                .expect("replica online")
        }
    }

    /// Boots the replicas named by `online` out of an `n`-node table.
    fn cluster(n: usize, online: &[usize], config: ReplicaConfig) -> Cluster {
        let _ = env_logger::builder().is_test(true).try_init();

        let key_docs: Vec<Vec<u8>> = (0..n).map(|_| KeyPair::generate_pkcs8().unwrap()).collect();
        let network = Arc::new(InMemoryNetwork {
            inboxes: RwLock::new(HashMap::new()),
            replies: Mutex::new(Vec::new()),
        });

        let mut replicas = Vec::new();
        for &i in online {
            let table = NodeTable::new(
                key_docs
                    .iter()
                    .enumerate()
                    .map(|(j, doc)| {
                        let keys = KeyPair::from_pkcs8(doc).unwrap();
                        NodeInfo {
                            id: NodeId::from(format!("Node{}", j + 1)),
                            addr: format!("localhost:{}", 1110 + j),
                            public_key: keys.public_key().unwrap(),
                        }
                    })
                    .collect(),
            )
            .unwrap();

            let transport = Arc::new(ClusterTransport {
                network: network.clone(),
            });
            let replica = Replica::bootstrap(
                config.clone(),
                NodeId::from(format!("Node{}", i + 1)),
                KeyPair::from_pkcs8(&key_docs[i]).unwrap(),
                table,
                transport,
            )
            .unwrap();
            replica.start(crate::bft::executable::AckService).unwrap();

            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            network
                .inboxes
                .write()
                .insert(replica.node_id().clone(), tx);
            let pump = replica.clone();
            tokio::spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    let _ = pump.receive(&bytes);
                }
            });
            replicas.push(replica);
        }

        Cluster {
            network,
            replicas,
            key_docs,
        }
    }

    fn slow_config() -> ReplicaConfig {
        // deadlines long enough that scheduling noise cannot trip a
        // view change mid-test
        ReplicaConfig {
            deadline: Duration::from_secs(5),
            ..ReplicaConfig::default()
        }
    }

    fn request(timestamp: i64, data: &str) -> RequestMessage {
        RequestMessage::new(timestamp, "Client1", "Op1", data)
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn happy_path_commits_on_every_replica() {
        let cluster = cluster(4, &[0, 1, 2, 3], slow_config());

        let req = request(1, &"A".repeat(1024));
        for replica in cluster.online() {
            replica.submit_request(req.clone());
        }

        wait_until("all four replicas commit seq 1", || {
            cluster
                .online()
                .all(|r| r.last_committed_seq() == SeqNo::from(1))
        })
        .await;

        // byte identical committed logs
        let reference = cluster.replicas[0].committed_requests();
        assert_eq!(reference[0].sequence_id, SeqNo::from(1));
        for replica in cluster.online() {
            assert_eq!(replica.committed_requests(), reference);
        }

        // a reply from every executor, each acknowledging the operation
        wait_until("a reply from each replica", || {
            let replies = cluster.network.replies.lock();
            let executors: HashSet<&str> = replies
                .iter()
                .filter(|r| r.result == "Executed" && r.timestamp == 1)
                .map(|r| r.executor_node_id.as_str())
                .collect();
            executors.len() == 4
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn executes_in_sequence_order_on_every_replica() {
        let cluster = cluster(4, &[0, 1, 2, 3], slow_config());

        for t in 1..=3 {
            let req = request(t, "payload");
            for replica in cluster.online() {
                replica.submit_request(req.clone());
            }
        }

        wait_until("all replicas commit seq 3", || {
            cluster
                .online()
                .all(|r| r.last_committed_seq() == SeqNo::from(3))
        })
        .await;

        for replica in cluster.online() {
            let seqs: Vec<u64> = replica
                .committed_requests()
                .iter()
                .map(|r| r.sequence_id.into())
                .collect();
            assert_eq!(seqs, vec![1, 2, 3]);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_backup_still_commits_and_checkpoints() {
        // Node4 offline; 2f = 2 prepares and 2f + 1 = 3 commits remain
        // reachable among the other three
        let cluster = cluster(4, &[0, 1, 2], slow_config());

        for t in 1..=10 {
            let req = request(t, "payload");
            for replica in cluster.online() {
                replica.submit_request(req.clone());
            }
            wait_until("commit", || {
                cluster
                    .online()
                    .all(|r| r.last_committed_seq() == SeqNo::from(t as u64))
            })
            .await;
        }

        wait_until("stable checkpoint reaches 10", || {
            cluster
                .online()
                .all(|r| r.stable_checkpoint() == SeqNo::from(10))
        })
        .await;

        // every instance at or below the mark was garbage collected
        wait_until("states purged", || {
            cluster.online().all(|r| r.active_states() == 0)
        })
        .await;

        // a late vote below the stable checkpoint is dropped outright
        let node1 = cluster.replica("Node1");
        let node4_keys = KeyPair::from_pkcs8(&cluster.key_docs[3]).unwrap();
        let stale = SystemMessage::Vote(VoteMessage {
            view_id: node1.current_view().id(),
            sequence_id: SeqNo::from(4),
            digest: Digest::compute(b"stale"),
            voter_node_id: NodeId::from("Node4"),
            kind: VoteKind::Prepare,
        });
        let bytes = SignedEnvelope::seal(&stale, &node4_keys)
            .unwrap()
            .to_bytes()
            .unwrap();
        node1.receive(&bytes).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node1.active_states(), 0);
        assert_eq!(node1.last_committed_seq(), SeqNo::from(10));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_primary_is_deposed_within_the_deadline() {
        // default 50 ms consensus deadline
        let cluster = cluster(4, &[0, 1, 2, 3], ReplicaConfig::default());

        // the primary of view 0 (Node1) never sees the request and
        // proposes nothing; the backups' suspicion timers fire
        let req = request(1, "payload");
        for id in ["Node2", "Node3", "Node4"] {
            cluster.replica(id).submit_request(req.clone());
        }

        wait_until("every replica installs view 1", || {
            cluster.online().all(|r| {
                r.current_view().id() == ViewId::from(1) && !r.is_view_changing()
            })
        })
        .await;

        // Node2 is the primary of the new view; a client retry now
        // reaches a live proposer and the request commits everywhere
        cluster.replica("Node2").submit_request(req.clone());
        wait_until("request commits in the new view", || {
            cluster
                .online()
                .all(|r| r.last_committed_seq() == SeqNo::from(1))
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retransmitted_request_is_proposed_once() {
        let cluster = cluster(4, &[0, 1, 2, 3], slow_config());

        // the client retries against every replica, twice, without
        // waiting for the first submission to land
        let req = request(1, "payload");
        for _ in 0..2 {
            for replica in cluster.online() {
                replica.submit_request(req.clone());
            }
        }

        wait_until("the request commits everywhere", || {
            cluster
                .online()
                .all(|r| r.last_committed_seq() == SeqNo::from(1))
        })
        .await;

        // the retransmission must not have opened a second instance
        tokio::time::sleep(Duration::from_millis(100)).await;
        for replica in cluster.online() {
            assert_eq!(replica.committed_requests().len(), 1);
        }

        // one reply broadcast per executor for the (client, timestamp)
        // pair; each broadcast fans out to the three peers
        let replies = cluster.network.replies.lock();
        for id in ["Node1", "Node2", "Node3", "Node4"] {
            let count = replies
                .iter()
                .filter(|r| r.executor_node_id.as_str() == id && r.timestamp == 1)
                .count();
            assert!(count <= 3, "{} broadcast {} reply copies", id, count);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_envelopes_signed_with_the_wrong_key() {
        let cluster = cluster(4, &[0, 1, 2, 3], slow_config());
        let node1 = cluster.replica("Node1");

        // a vote claiming Node3 as its voter, sealed with Node2's key
        let forged = SystemMessage::Vote(VoteMessage {
            view_id: node1.current_view().id(),
            sequence_id: SeqNo::from(1),
            digest: Digest::compute(b"forged"),
            voter_node_id: NodeId::from("Node3"),
            kind: VoteKind::Prepare,
        });
        let node2_keys = KeyPair::from_pkcs8(&cluster.key_docs[1]).unwrap();
        let bytes = SignedEnvelope::seal(&forged, &node2_keys)
            .unwrap()
            .to_bytes()
            .unwrap();

        assert!(node1.receive(&bytes).is_err());
        assert_eq!(node1.active_states(), 0);
    }
}
