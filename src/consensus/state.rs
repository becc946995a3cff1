use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error, info};

use crate::consensus::messages::{ConsensusMessage, MsgInfo, TimeoutInfo};
use crate::consensus::replay::suffix_for_height;
use crate::consensus::round_state::{RoundState, Step};
use crate::consensus::ticker::TimeoutTicker;
use crate::consensus::vote_set::{VoteSet, VoteSetError};
use crate::events::{Event, EventBus};
use crate::metrics::Metrics;
use crate::privval::FilePrivValidator;
use crate::state::executor::BlockExecutor;
use crate::state::validation::ValidationError;
use crate::state::State;
use crate::storage::{Wal, WalError, WalRecord};
use crate::types::time::now_ms;
use crate::types::{
    Block, BlockId, Commit, Part, PartSet, PartSetError, Proposal, Validator, Vote, VoteType,
};

const MSG_QUEUE_SIZE: usize = 1000;
const TOCK_QUEUE_SIZE: usize = 256;

#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    pub timeout_propose_ms: u64,
    pub timeout_propose_delta_ms: u64,
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,
    pub timeout_commit_ms: u64,
    pub skip_timeout_commit: bool,
    pub create_empty_blocks: bool,
    pub create_empty_blocks_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval_ms: 0,
        }
    }
}

impl ConsensusConfig {
    pub fn propose(&self, round: u32) -> Duration {
        Duration::from_millis(
            self.timeout_propose_ms + self.timeout_propose_delta_ms * round as u64,
        )
    }

    pub fn prevote(&self, round: u32) -> Duration {
        Duration::from_millis(
            self.timeout_prevote_ms + self.timeout_prevote_delta_ms * round as u64,
        )
    }

    pub fn precommit(&self, round: u32) -> Duration {
        Duration::from_millis(
            self.timeout_precommit_ms + self.timeout_precommit_delta_ms * round as u64,
        )
    }

    /// Round-0 back-pressure when the ULB height keeps failing rounds; the
    /// whole pipeline above it has to slow down instead of burning rounds.
    pub fn previous_failure(&self, ulb_round: u32) -> Duration {
        let capped = ulb_round.min(10) as u64;
        Duration::from_millis(self.timeout_propose_ms + self.timeout_propose_delta_ms * capped)
    }

    pub fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || self.create_empty_blocks_interval_ms > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
    #[error("the coordinator requires the pipelined consensus mode")]
    NotPipelined,
}

/// Non-fatal errors surfaced while ingesting proposals, block parts, and
/// votes.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusMsgError {
    #[error("invalid proposal signature")]
    InvalidProposalSignature,
    #[error("invalid proposal POL round")]
    InvalidProposalPOLRound,
    #[error("vote height mismatch")]
    VoteHeightMismatch,
    #[error("conflicting votes from validator {}", .0.address())]
    ConflictingVotes(Box<crate::types::DuplicateVoteEvidence>),
    #[error("error adding vote")]
    AddingVote,
    #[error("part set error: {0}")]
    PartSet(#[from] PartSetError),
    #[error("proposal block decode failed")]
    BlockDecode,
    #[error("proposal block exceeds the size cap")]
    BlockTooLarge,
}

/// The consensus coordinator. Owns the map of live per-height round
/// machines, routes every input through one receive routine, and serializes
/// finalization so height H promotes state only after H - 1 did.
///
/// Heights within `[last_block_height + 1, last_block_height + len_ulb + 1]`
/// run concurrently; each entry is guarded by its own lock, and the map
/// itself is only mutated here.
pub struct ConsensusState {
    config: ConsensusConfig,
    chain_id: String,

    state: RwLock<State>,
    executor: BlockExecutor,
    priv_validator: Mutex<Option<FilePrivValidator>>,

    round_states: RwLock<BTreeMap<u64, Arc<Mutex<RoundState>>>>,
    tickers: Mutex<BTreeMap<u64, TimeoutTicker>>,

    wal: Mutex<Option<Wal>>,
    replay_mode: AtomicBool,
    stopped: AtomicBool,

    event_bus: EventBus,
    metrics: Arc<Metrics>,

    peer_tx: Sender<MsgInfo>,
    peer_rx: Receiver<MsgInfo>,
    internal_tx: Sender<MsgInfo>,
    internal_rx: Receiver<MsgInfo>,
    tock_tx: Sender<TimeoutInfo>,
    tock_rx: Receiver<TimeoutInfo>,
    new_height_tx: Sender<u64>,
    new_height_rx: Receiver<u64>,
    stats_tx: Sender<MsgInfo>,
    stats_rx: Receiver<MsgInfo>,
    txs_available_tx: Sender<()>,
    txs_available_rx: Receiver<()>,
    quit_tx: Sender<()>,
    quit_rx: Receiver<()>,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,

    finalize_mtx: Mutex<()>,
    finalize_cond: Condvar,
}

impl ConsensusState {
    pub fn new(
        config: ConsensusConfig,
        state: State,
        executor: BlockExecutor,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, ConsensusError> {
        if !state.is_pipelined() {
            return Err(ConsensusError::NotPipelined);
        }

        let (peer_tx, peer_rx) = bounded(MSG_QUEUE_SIZE);
        let (internal_tx, internal_rx) = bounded(MSG_QUEUE_SIZE);
        let (tock_tx, tock_rx) = bounded(TOCK_QUEUE_SIZE);
        let (new_height_tx, new_height_rx) = bounded(16);
        let (stats_tx, stats_rx) = bounded(MSG_QUEUE_SIZE);
        let (txs_available_tx, txs_available_rx) = bounded(16);
        let (quit_tx, quit_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);

        let chain_id = state.chain_id.clone();
        let cs = Arc::new(Self {
            config,
            chain_id,
            state: RwLock::new(state.clone()),
            executor,
            priv_validator: Mutex::new(None),
            round_states: RwLock::new(BTreeMap::new()),
            tickers: Mutex::new(BTreeMap::new()),
            wal: Mutex::new(None),
            replay_mode: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            event_bus: EventBus::new(),
            metrics,
            peer_tx,
            peer_rx,
            internal_tx,
            internal_rx,
            tock_tx,
            tock_rx,
            new_height_tx,
            new_height_rx,
            stats_tx,
            stats_rx,
            txs_available_tx,
            txs_available_rx,
            quit_tx,
            quit_rx,
            done_tx: Mutex::new(Some(done_tx)),
            done_rx,
            finalize_mtx: Mutex::new(()),
            finalize_cond: Condvar::new(),
        });

        cs.update_height(state.last_block_height + 1, None);
        cs.reconstruct_last_commit();
        Ok(cs)
    }

    // ----------------------------------------------------------------
    // Public interface
    // ----------------------------------------------------------------

    pub fn set_priv_validator(&self, pv: FilePrivValidator) {
        *self.priv_validator.lock().unwrap() = Some(pv);
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Sender side of the mempool's "txs available" signal.
    pub fn txs_available_sender(&self) -> Sender<()> {
        self.txs_available_tx.clone()
    }

    /// Added votes and block parts, for reactor statistics.
    pub fn stats_receiver(&self) -> Receiver<MsgInfo> {
        self.stats_rx.clone()
    }

    pub fn get_state(&self) -> State {
        self.state.read().unwrap().clone()
    }

    pub fn get_last_height(&self) -> u64 {
        self.state.read().unwrap().last_block_height
    }

    pub fn get_validators(&self) -> (u64, Vec<Validator>) {
        let state = self.state.read().unwrap();
        (
            state.last_block_height,
            state.validators.validators().to_vec(),
        )
    }

    /// Snapshot of one live height's round state.
    pub fn get_round_state(&self, height: u64) -> Option<RoundState> {
        let rs = self.get_round_state_arc(height)?;
        let guard = rs.lock().unwrap();
        Some(guard.clone())
    }

    pub fn live_heights(&self) -> Vec<u64> {
        self.round_states.read().unwrap().keys().copied().collect()
    }

    /// The justification for `height`: the locally seen commit while the
    /// canonical one is still in flight, the embedded one afterwards.
    pub fn load_commit(&self, height: u64) -> Option<Commit> {
        let len_ulb = self.get_state().len_ulb();
        self.executor
            .block_store()
            .load_commit(height, len_ulb)
            .ok()
            .flatten()
    }

    /// Open the WAL, replay the suffix past the last end-of-height marker,
    /// start the receive routine, and schedule the first round.
    pub fn start(self: &Arc<Self>, wal_path: Option<&Path>) -> Result<(), ConsensusError> {
        let height = self.get_last_height() + 1;
        self.ensure_ticker(height);

        if let Some(path) = wal_path {
            let wal = Wal::open(path)?;
            *self.wal.lock().unwrap() = Some(wal);
            self.catchup_replay(path, height)?;
        }

        let cs = Arc::clone(self);
        std::thread::spawn(move || cs.receive_routine());

        self.schedule_new_height_round0(self.get_last_height() + 1);
        Ok(())
    }

    /// Graceful shutdown: the receive routine stops all tickers, flushes the
    /// WAL and closes the done channel.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.finalize_cond.notify_all();
        let _ = self.quit_tx.try_send(());
    }

    /// Block until the receive routine has exited.
    pub fn wait(&self) {
        let _ = self.done_rx.recv();
    }

    pub fn add_vote(&self, vote: Vote, peer_id: &str) {
        let mi = MsgInfo {
            msg: ConsensusMessage::Vote(vote),
            peer_id: peer_id.to_string(),
        };
        self.enqueue(mi);
    }

    pub fn set_proposal(&self, proposal: Proposal, peer_id: &str) {
        let mi = MsgInfo {
            msg: ConsensusMessage::Proposal(proposal),
            peer_id: peer_id.to_string(),
        };
        self.enqueue(mi);
    }

    pub fn add_proposal_block_part(&self, height: u64, round: u32, part: Part, peer_id: &str) {
        let mi = MsgInfo {
            msg: ConsensusMessage::BlockPart {
                height,
                round,
                part,
            },
            peer_id: peer_id.to_string(),
        };
        self.enqueue(mi);
    }

    pub fn set_proposal_and_block(
        &self,
        proposal: Proposal,
        block: &Block,
        parts: &PartSet,
        peer_id: &str,
    ) {
        let height = proposal.height;
        let round = proposal.round;
        debug!(height, round, hash = %block.hash(), "set_proposal_and_block");
        self.set_proposal(proposal, peer_id);
        for i in 0..parts.total() {
            if let Some(part) = parts.get_part(i) {
                self.add_proposal_block_part(height, round, part.clone(), peer_id);
            }
        }
    }

    fn enqueue(&self, mi: MsgInfo) {
        if mi.is_internal() {
            let _ = self.internal_tx.send(mi);
        } else {
            let _ = self.peer_tx.send(mi);
        }
    }

    // ----------------------------------------------------------------
    // Round-state map management (dispatcher only)
    // ----------------------------------------------------------------

    fn get_round_state_arc(&self, height: u64) -> Option<Arc<Mutex<RoundState>>> {
        self.round_states.read().unwrap().get(&height).cloned()
    }

    fn ensure_ticker(&self, height: u64) {
        let mut tickers = self.tickers.lock().unwrap();
        tickers
            .entry(height)
            .or_insert_with(|| TimeoutTicker::new(self.tock_tx.clone()));
    }

    fn update_height(&self, height: u64, ulb_hint: Option<(VoteSet, crate::types::ValidatorSet)>) {
        self.metrics.height.set(height as i64);
        self.update_new_height(height, ulb_hint);
    }

    /// Create the round state for a fresh height, wiring its LastCommit from
    /// the ULB height's precommits. A hint carries those precommits when the
    /// caller already holds the ULB entry's lock.
    fn update_new_height(
        &self,
        height: u64,
        ulb_hint: Option<(VoteSet, crate::types::ValidatorSet)>,
    ) {
        if self.round_states.read().unwrap().contains_key(&height) {
            self.ensure_ticker(height);
            return;
        }

        let state = self.get_state();
        let len_ulb = state.len_ulb();

        let (ulb_precommits, ulb_validators) = match ulb_hint {
            Some((votes, vals)) => (Some(votes), Some(vals)),
            None if height > len_ulb => {
                let ulb_height = height - len_ulb;
                match self.get_round_state_arc(ulb_height) {
                    // A missing ULB entry happens on restart; recovery comes
                    // through reconstruct_last_commit.
                    None => (None, None),
                    Some(ulb_arc) => {
                        let ulb = ulb_arc.lock().unwrap();
                        match ulb.commit_round {
                            Some(commit_round) => {
                                let precommits = ulb
                                    .votes
                                    .precommits(commit_round)
                                    .expect("commit round must have precommits");
                                if !precommits.has_two_thirds_majority() {
                                    panic!(
                                        "update_new_height called but the ULB commit round has no +2/3"
                                    );
                                }
                                (Some(precommits.clone()), Some(ulb.validators.clone()))
                            }
                            None => (None, None),
                        }
                    }
                }
            }
            None => (None, None),
        };

        let validators = self
            .executor
            .state_store()
            .load_validators(height)
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("cannot load validators for height {}", height));

        let mut rs = RoundState::new(&self.chain_id, height, validators, now_ms());
        rs.last_commit = ulb_precommits;
        rs.last_validators = ulb_validators;
        let event = rs.round_step_event();

        // Load-or-store: a concurrent creator wins and keeps its entry.
        self.round_states
            .write()
            .unwrap()
            .entry(height)
            .or_insert_with(|| Arc::new(Mutex::new(rs)));
        self.ensure_ticker(height);

        self.wal_write(WalRecord::RoundStep(event));
        if !self.replay_mode.load(Ordering::Relaxed) {
            self.event_bus.publish(Event::NewRoundStep(event));
        }
    }

    /// Drop the round state and ticker of a height that slid out of the
    /// pipeline window.
    fn cleanup_finalized_round_state(&self, height: u64) {
        if self.executor.block_store().height() < height {
            panic!("cleanup of height {} before it finalized", height);
        }
        if let Some(ticker) = self.tickers.lock().unwrap().remove(&height) {
            ticker.stop();
        }
        self.round_states.write().unwrap().remove(&height);
    }

    /// Advance the signer watermark to a finalized height; nothing at or
    /// below it may ever be signed again.
    fn pin_immutable_height(&self, height: u64) {
        if let Some(pv) = self.priv_validator.lock().unwrap().as_mut() {
            if let Err(e) = pv.set_immutable_height(height) {
                panic!("cannot pin signer immutable height {}: {}", height, e);
            }
        }
    }

    /// Fire NewRound(0) for `height` once its ULB height has committed; this
    /// is what keeps the pipeline window at len_ulb + 1 heights.
    fn schedule_new_height_round0(self: &Arc<Self>, height: u64) {
        let state = self.get_state();
        if state.last_block_height >= height {
            return;
        }
        let len_ulb = state.len_ulb();
        let cs = Arc::clone(self);
        std::thread::spawn(move || {
            if height > len_ulb {
                let ulb_height = height - len_ulb;
                while ulb_height > cs.get_last_height() {
                    if cs.stopped.load(Ordering::Relaxed) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            let _ = cs.new_height_tx.send(height);
        });
    }

    fn schedule_round0(&self, height: u64) {
        let start_time_ms = self
            .get_round_state_arc(height)
            .map(|rs| rs.lock().unwrap().start_time_ms)
            .unwrap_or_else(now_ms);
        let sleep = start_time_ms.saturating_sub(now_ms());
        self.schedule_timeout(Duration::from_millis(sleep), height, 0, Step::NewHeight);
    }

    fn schedule_timeout(&self, duration: Duration, height: u64, round: u32, step: Step) {
        let tickers = self.tickers.lock().unwrap();
        let ticker = tickers
            .get(&height)
            .unwrap_or_else(|| panic!("no ticker for height {}", height));
        ticker.schedule(TimeoutInfo {
            duration_ms: duration.as_millis() as u64,
            height,
            round,
            step,
        });
    }

    /// Push our own proposal, block part, or vote back into the dispatcher.
    fn send_internal_message(&self, mi: MsgInfo) {
        if self.internal_tx.try_send(mi.clone()).is_err() {
            info!("internal msg queue is full; using a background send");
            let tx = self.internal_tx.clone();
            std::thread::spawn(move || {
                let _ = tx.send(mi);
            });
        }
    }

    /// Rebuild the pipeline's in-flight LastCommits from the stored seen
    /// commits after a restart.
    fn reconstruct_last_commit(&self) {
        let state = self.get_state();
        if state.last_block_height == 0 {
            return;
        }
        let len_ulb = state.len_ulb();
        let start = state.last_block_height.saturating_sub(len_ulb) + 1;

        for height in start..=state.last_block_height {
            if height < 1 {
                continue;
            }
            let validators = self
                .executor
                .state_store()
                .load_validators(height)
                .ok()
                .flatten()
                .unwrap_or_else(|| {
                    panic!("cannot load validators for reconstructed height {}", height)
                });
            let seen_commit = self
                .executor
                .block_store()
                .load_seen_commit(height)
                .ok()
                .flatten()
                .unwrap_or_else(|| panic!("cannot load seen commit for height {}", height));
            let precommits =
                VoteSet::from_commit(&self.chain_id, height, &seen_commit, &validators)
                    .expect("stored seen commit must reconstruct");
            if !precommits.has_two_thirds_majority() {
                panic!("failed to reconstruct LastCommit: no +2/3 majority");
            }

            let restore_height = height + len_ulb;
            self.update_height(restore_height, None);
            if let Some(rs_arc) = self.get_round_state_arc(restore_height) {
                let mut rs = rs_arc.lock().unwrap();
                rs.last_commit = Some(precommits);
                rs.last_validators = Some(validators);
            }
        }
    }

    /// Promote the committed state and open the next height. The hint carries
    /// the ULB precommits when the caller already holds that entry's lock.
    fn update_to_state(
        &self,
        new_state: State,
        ulb_hint: Option<(VoteSet, crate::types::ValidatorSet)>,
    ) {
        {
            let mut st = self.state.write().unwrap();
            if !st.is_empty() && new_state.last_block_height <= st.last_block_height {
                info!(
                    new_height = new_state.last_block_height + 1,
                    old_height = st.last_block_height + 1,
                    "Ignoring state promotion to an older height"
                );
                return;
            }
            *st = new_state.clone();
        }
        self.update_height(new_state.last_block_height + 1, ulb_hint);
    }

    fn new_step(&self, rs: &RoundState) {
        let event = rs.round_step_event();
        self.wal_write(WalRecord::RoundStep(event));
        if !self.replay_mode.load(Ordering::Relaxed) {
            self.event_bus.publish(Event::NewRoundStep(event));
        }
    }

    fn wal_write(&self, record: WalRecord) {
        if let Some(wal) = self.wal.lock().unwrap().as_mut() {
            if let Err(e) = wal.write(&record) {
                error!(error = %e, "WAL write failed");
            }
        }
    }

    /// Fsync write; internal-origin records must be durable before their
    /// effects leave this node.
    fn wal_write_sync(&self, record: WalRecord) {
        if let Some(wal) = self.wal.lock().unwrap().as_mut() {
            let start = std::time::Instant::now();
            if let Err(e) = wal.write_sync(&record) {
                panic!(
                    "failed to write consensus WAL: {}; check your FS and restart the node",
                    e
                );
            }
            self.metrics
                .wal_write_duration
                .observe(start.elapsed().as_secs_f64());
        }
    }

    fn wal_flush(&self) {
        if let Some(wal) = self.wal.lock().unwrap().as_mut() {
            if let Err(e) = wal.flush_and_sync() {
                error!(error = %e, "WAL flush failed");
            }
        }
    }

    // ----------------------------------------------------------------
    // Replay
    // ----------------------------------------------------------------

    /// Re-feed the WAL suffix after the last end-of-height marker. Malformed
    /// records refuse startup; signer regressions are skipped and replay
    /// continues.
    fn catchup_replay(self: &Arc<Self>, path: &Path, height: u64) -> Result<(), WalError> {
        let records = Wal::read_all(path)?;
        let suffix = suffix_for_height(records, height)?;
        if suffix.is_empty() {
            return Ok(());
        }

        info!(height, records = suffix.len(), "Replaying consensus WAL");
        self.replay_mode.store(true, Ordering::Relaxed);
        for record in suffix {
            match record {
                WalRecord::Message(mi) => self.handle_msg(mi),
                WalRecord::Timeout(ti) => self.handle_timeout(ti),
                WalRecord::RoundStep(_) => {}
                WalRecord::EndHeight(_) => {}
            }
        }
        self.replay_mode.store(false, Ordering::Relaxed);
        Ok(())
    }

    // ----------------------------------------------------------------
    // The receive routine
    // ----------------------------------------------------------------

    /// The single dispatcher loop. Drains one of the queues, writes the WAL
    /// in consumption order, and hands the input to a helper thread. A panic
    /// here halts the engine rather than risk an invalid signature.
    fn receive_routine(self: Arc<Self>) {
        let cs = Arc::clone(&self);
        let result = catch_unwind(AssertUnwindSafe(move || loop {
            crossbeam_channel::select! {
                recv(cs.txs_available_rx) -> msg => {
                    if msg.is_err() { break; }
                    let inner = Arc::clone(&cs);
                    std::thread::spawn(move || inner.handle_txs_available());
                }
                recv(cs.peer_rx) -> msg => {
                    let Ok(mi) = msg else { break };
                    cs.wal_write(WalRecord::Message(mi.clone()));
                    let inner = Arc::clone(&cs);
                    std::thread::spawn(move || inner.handle_msg(mi));
                }
                recv(cs.internal_rx) -> msg => {
                    let Ok(mi) = msg else { break };
                    cs.wal_write_sync(WalRecord::Message(mi.clone()));
                    let inner = Arc::clone(&cs);
                    std::thread::spawn(move || inner.handle_msg(mi));
                }
                recv(cs.tock_rx) -> msg => {
                    let Ok(ti) = msg else { break };
                    cs.metrics.timeouts.inc();
                    cs.wal_write(WalRecord::Timeout(ti));
                    let inner = Arc::clone(&cs);
                    std::thread::spawn(move || inner.handle_timeout(ti));
                }
                recv(cs.new_height_rx) -> msg => {
                    let Ok(height) = msg else { break };
                    if cs.get_round_state_arc(height).is_none() {
                        cs.update_height(height, None);
                    }
                    cs.schedule_round0(height);
                }
                recv(cs.quit_rx) -> _ => {
                    break;
                }
            }
        }));

        if let Err(e) = result {
            error!(?e, "CONSENSUS FAILURE!!!");
        }

        // In-flight helpers writing to the internal queue drop silently now.
        self.stopped.store(true, Ordering::Relaxed);
        self.finalize_cond.notify_all();
        for (_, ticker) in self.tickers.lock().unwrap().iter() {
            ticker.stop();
        }
        self.wal_flush();
        *self.done_tx.lock().unwrap() = None;
    }

    // ----------------------------------------------------------------
    // Input handlers (helper threads)
    // ----------------------------------------------------------------

    fn handle_msg(self: &Arc<Self>, mi: MsgInfo) {
        let peer_id = mi.peer_id.clone();
        let result: Result<bool, ConsensusMsgError> = match mi.msg.clone() {
            ConsensusMessage::Proposal(proposal) => {
                self.metrics.proposals_received.inc();
                self.set_proposal_inner(proposal).map(|_| false)
            }
            ConsensusMessage::BlockPart {
                height,
                round,
                part,
            } => self.add_proposal_block_part_inner(height, round, part, &peer_id),
            ConsensusMessage::Vote(vote) => {
                self.metrics.votes_received.inc();
                self.try_add_vote(vote, &peer_id)
            }
        };

        match result {
            Ok(true) => {
                let _ = self.stats_tx.try_send(mi);
            }
            Ok(false) => {}
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "Error handling consensus message");
            }
        }
    }

    fn handle_timeout(self: &Arc<Self>, ti: TimeoutInfo) {
        debug!(timeout = %ti, "Received tock");

        let Some(rs_arc) = self.get_round_state_arc(ti.height) else {
            return;
        };
        let mut rs = rs_arc.lock().unwrap();

        // Timeouts must be for the current round and step or later.
        if ti.round < rs.round || (ti.round == rs.round && ti.step < rs.step) {
            debug!(
                height = rs.height,
                round = rs.round,
                step = ?rs.step,
                "Ignoring tock because we're ahead"
            );
            return;
        }

        match ti.step {
            Step::NewHeight => {
                self.enter_new_round(&mut rs, 0);
            }
            Step::NewRound => {
                self.enter_propose(&mut rs, 0);
            }
            Step::Propose => {
                self.publish(Event::TimeoutPropose {
                    height: ti.height,
                    round: ti.round,
                });
                self.enter_prevote(&mut rs, ti.round);
            }
            Step::PrevoteWait => {
                self.publish(Event::TimeoutWait {
                    height: ti.height,
                    round: ti.round,
                });
                self.enter_precommit(&mut rs, ti.round);
            }
            Step::PrecommitWait => {
                self.publish(Event::TimeoutWait {
                    height: ti.height,
                    round: ti.round,
                });
                self.enter_precommit(&mut rs, ti.round);
                self.enter_new_round(&mut rs, ti.round + 1);
            }
            _ => panic!("invalid timeout step: {:?}", ti.step),
        }
    }

    fn handle_txs_available(self: &Arc<Self>) {
        let height = self.get_last_height() + 1;
        let Some(rs_arc) = self.get_round_state_arc(height) else {
            return;
        };
        let mut rs = rs_arc.lock().unwrap();

        // Only relevant while round 0 is waiting on transactions.
        if rs.round != 0 {
            return;
        }

        match rs.step {
            Step::NewHeight => {
                if self.need_proof_block(height) {
                    return;
                }
                let sleep = rs.start_time_ms.saturating_sub(now_ms()) + 1;
                self.schedule_timeout(
                    Duration::from_millis(sleep),
                    height,
                    0,
                    Step::NewRound,
                );
            }
            Step::NewRound => {
                self.enter_propose(&mut rs, 0);
            }
            _ => {}
        }
    }

    fn publish(&self, event: Event) {
        if !self.replay_mode.load(Ordering::Relaxed) {
            self.event_bus.publish(event);
        }
    }

    // ----------------------------------------------------------------
    // State transitions
    // ----------------------------------------------------------------

    fn enter_new_round(self: &Arc<Self>, rs: &mut RoundState, round: u32) {
        let height = rs.height;
        if round < rs.round || (rs.round == round && rs.step != Step::NewHeight) {
            debug!(
                height,
                round,
                current_round = rs.round,
                current_step = ?rs.step,
                "enter_new_round: invalid args"
            );
            return;
        }
        info!(height, round, current_round = rs.round, "enter_new_round");

        if rs.round < round {
            rs.validators.increment_proposer_priority(round - rs.round);
        }

        rs.round = round;
        rs.step = Step::NewRound;
        if round != 0 {
            info!(height, round, "Resetting proposal info");
            // Release txs held by the dead round's proposal.
            if let Some(block) = &rs.proposal_block {
                let state = self.get_state();
                self.executor.unreserve_block(&state, block);
            }
            rs.proposal = None;
            rs.proposal_block = None;
            rs.proposal_block_parts = None;
        }
        rs.votes.set_round(round + 1);
        rs.triggered_timeout_precommit = false;

        let proposer = rs
            .validators
            .get_proposer()
            .map(|v| v.address)
            .unwrap_or(crate::types::Address::ZERO);
        self.publish(Event::NewRound {
            height,
            round,
            proposer,
        });
        self.metrics.rounds.set(round as i64);

        // Back-pressure: if the ULB height is burning rounds, give it air
        // before this height starts its round 0.
        let state = self.get_state();
        let len_ulb = state.len_ulb();
        if height > len_ulb {
            let ulb_height = height - len_ulb;
            let ulb_round = self
                .get_round_state_arc(ulb_height)
                .map(|ulb| ulb.lock().unwrap().round)
                .unwrap_or(0);
            if ulb_round > 0 && round == 0 {
                info!(ulb_height, ulb_round, "Backing off for ULB consensus failure");
                std::thread::sleep(self.config.previous_failure(ulb_round));
            }
        }

        let wait_for_txs =
            self.config.wait_for_txs() && round == 0 && !self.need_proof_block(height);
        if wait_for_txs {
            if self.config.create_empty_blocks_interval_ms > 0 {
                self.schedule_timeout(
                    Duration::from_millis(self.config.create_empty_blocks_interval_ms),
                    height,
                    round,
                    Step::NewRound,
                );
            }
        } else {
            self.enter_propose(rs, round);
        }
    }

    /// True on the first height and whenever the predecessor changed the app
    /// hash, so the fresh digest gets signed without waiting for txs.
    fn need_proof_block(&self, height: u64) -> bool {
        if height == 1 {
            return true;
        }
        let state = self.get_state();
        match self.executor.block_store().load_block_meta(height - 1) {
            Ok(Some(meta)) => state.app_hash != meta.header.app_hash,
            _ => false,
        }
    }

    fn enter_propose(self: &Arc<Self>, rs: &mut RoundState, round: u32) {
        let height = rs.height;
        if round < rs.round || (rs.round == round && rs.step >= Step::Propose) {
            debug!(
                height,
                round,
                current_round = rs.round,
                current_step = ?rs.step,
                "enter_propose: invalid args"
            );
            return;
        }
        info!(height, round, "enter_propose");

        // If the full proposal doesn't arrive in time, prevote nil.
        self.schedule_timeout(self.config.propose(round), height, round, Step::Propose);

        let our_address = self.priv_validator.lock().unwrap().as_ref().map(|pv| pv.address());
        if let Some(address) = our_address {
            if rs.validators.has_address(&address) {
                if self.is_proposer(rs, &address) {
                    info!(height, round, "enter_propose: our turn to propose");
                    self.decide_proposal(rs, height, round);
                } else {
                    debug!(height, round, "enter_propose: not our turn to propose");
                }
            } else {
                debug!(height, round, "This node is not a validator");
            }
        }

        rs.round = round;
        rs.step = Step::Propose;
        self.new_step(rs);

        if self.is_proposal_complete(rs) {
            let r = rs.round;
            self.enter_prevote(rs, r);
        }
    }

    fn is_proposer(&self, rs: &RoundState, address: &crate::types::Address) -> bool {
        rs.validators
            .get_proposer()
            .map(|v| v.address == *address)
            .unwrap_or(false)
    }

    fn decide_proposal(self: &Arc<Self>, rs: &mut RoundState, height: u64, round: u32) {
        let (block, parts) = if let (Some(block), Some(parts)) =
            (rs.valid_block.clone(), rs.valid_block_parts.clone())
        {
            // A block that already had a polka; re-propose it if its link to
            // the previous height still holds.
            if self.validate_previous_block(&block).is_ok() {
                (block, parts)
            } else {
                match self.create_proposal_block(rs, height) {
                    Some(bp) => bp,
                    None => return,
                }
            }
        } else {
            match self.create_proposal_block(rs, height) {
                Some(bp) => bp,
                None => return,
            }
        };

        // Flush the WAL first, or we may not recompute the same proposal to
        // sign and the signer would refuse.
        self.wal_flush();

        let block_id = block.block_id(parts.header());
        let pol_round = rs.valid_round.map(|r| r as i32).unwrap_or(-1);
        let mut proposal = Proposal::new(height, round, pol_round, block_id, now_ms());

        let signed = {
            let mut pv = self.priv_validator.lock().unwrap();
            match pv.as_mut() {
                None => return,
                Some(pv) => pv.sign_proposal(&self.chain_id, &mut proposal),
            }
        };

        match signed {
            Ok(()) => {
                self.send_internal_message(MsgInfo::internal(ConsensusMessage::Proposal(
                    proposal.clone(),
                )));
                // Handlers run in parallel; give the proposal a head start
                // over its parts.
                std::thread::sleep(Duration::from_millis(100));
                for i in 0..parts.total() {
                    if let Some(part) = parts.get_part(i) {
                        self.send_internal_message(MsgInfo::internal(
                            ConsensusMessage::BlockPart {
                                height,
                                round,
                                part: part.clone(),
                            },
                        ));
                    }
                }
                info!(height, round, "Signed proposal");
            }
            Err(e) => {
                if !self.replay_mode.load(Ordering::Relaxed) {
                    error!(height, round, error = %e, "enter_propose: error signing proposal");
                }
            }
        }
    }

    /// We have the full proposal, and its POL prevotes if it claims any.
    fn is_proposal_complete(&self, rs: &RoundState) -> bool {
        let Some(proposal) = &rs.proposal else {
            return false;
        };
        if rs.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round < 0 {
            return true;
        }
        rs.votes
            .prevotes(proposal.pol_round as u32)
            .map(|v| v.has_two_thirds_majority())
            .unwrap_or(false)
    }

    /// Materialize the candidate block for `height`, resolving the ULB
    /// references (commit, app hash, results hash) and the predecessor link.
    fn create_proposal_block(
        self: &Arc<Self>,
        rs: &RoundState,
        height: u64,
    ) -> Option<(Block, PartSet)> {
        let state = self.get_state();
        let len_ulb = state.len_ulb();
        let store = self.executor.state_store();

        let validators = store
            .load_validators(height)
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("cannot load validators for height {}", height));

        let (ulb_commit, ulb_validators, next_validators_hash, app_hash, results_hash);
        if height <= len_ulb {
            // Pipeline warm-up: no ULB output to reference yet.
            ulb_commit = Commit::empty();
            ulb_validators = crate::types::ValidatorSet::empty();
            next_validators_hash = crate::types::ValidatorSet::empty().hash();
            app_hash = state.app_hash;
            results_hash = crate::types::Hash::ZERO;
        } else if rs
            .last_commit
            .as_ref()
            .map(|lc| lc.has_two_thirds_majority())
            .unwrap_or(false)
        {
            let ulb_height = height - len_ulb;
            ulb_commit = rs.last_commit.as_ref().unwrap().make_commit();
            ulb_validators = rs
                .last_validators
                .clone()
                .expect("last commit implies last validators");
            app_hash = store
                .load_app_hash(ulb_height)
                .ok()
                .flatten()
                .unwrap_or_else(|| panic!("cannot load ULB app hash for height {}", ulb_height));
            results_hash = store
                .load_tx_results(ulb_height)
                .ok()
                .flatten()
                .unwrap_or_else(|| panic!("cannot load ULB results for height {}", ulb_height))
                .results_hash();
            let next_height = ulb_height + len_ulb + 1;
            next_validators_hash = store
                .load_validators(next_height)
                .ok()
                .flatten()
                .unwrap_or_else(|| {
                    panic!("cannot load next validators for height {}", next_height)
                })
                .hash();
        } else {
            error!(
                height,
                "enter_propose: cannot propose anything, no commit for the ULB block"
            );
            return None;
        }

        let prev_block_id = if height == 1 {
            BlockId::zero()
        } else if state.last_block_height >= height - 1 {
            match self.executor.block_store().load_block_meta(height - 1) {
                Ok(Some(meta)) => meta.block_id,
                _ => panic!("create_proposal_block requires the committed previous block"),
            }
        } else if let Some(prev_arc) = self.get_round_state_arc(height - 1) {
            let prev = prev_arc.lock().unwrap();
            match (&prev.proposal_block, &prev.proposal_block_parts) {
                (Some(block), Some(parts)) => block.block_id(parts.header()),
                // The previous height moved on to new rounds and dropped its
                // proposal; nothing to link against.
                _ => {
                    info!(height, "consensus of previous proposal block failed; skip proposing");
                    return None;
                }
            }
        } else {
            info!(height, "no round state at previous height; skip proposing");
            return None;
        };

        let time_ms = if height == 1 {
            state.last_block_time_ms
        } else if height <= len_ulb {
            now_ms()
        } else {
            ulb_validators.median_time(&ulb_commit)
        };

        let proposer_address = self
            .priv_validator
            .lock()
            .unwrap()
            .as_ref()
            .map(|pv| pv.address())?;

        Some(self.executor.create_proposal_block(
            height,
            prev_block_id,
            &state,
            ulb_commit,
            validators.hash(),
            next_validators_hash,
            app_hash,
            results_hash,
            time_ms,
            proposer_address,
        ))
    }

    /// Check a progressing block's link to its predecessor: against the
    /// committed meta when the predecessor finalized, against the live
    /// proposal block otherwise.
    fn validate_previous_block(&self, block: &Block) -> Result<(), ValidationError> {
        let prev_height = block.header.height - 1;
        let state = self.get_state();

        if prev_height > state.last_block_height {
            let prev_id = match self.get_round_state_arc(prev_height) {
                Some(prev_arc) => {
                    let prev = prev_arc.lock().unwrap();
                    match (&prev.proposal_block, &prev.proposal_block_parts) {
                        (Some(b), Some(p)) => b.block_id(p.header()),
                        _ => {
                            return Err(ValidationError::MissingHeightData {
                                height: prev_height,
                            })
                        }
                    }
                }
                None => {
                    return Err(ValidationError::MissingHeightData {
                        height: prev_height,
                    })
                }
            };
            if block.header.prev_block_id != prev_id {
                return Err(ValidationError::LastBlockIdMismatch {
                    expected: prev_id,
                    got: block.header.prev_block_id.clone(),
                });
            }
        } else if prev_height > 0 {
            let meta = self
                .executor
                .block_store()
                .load_block_meta(prev_height)
                .ok()
                .flatten()
                .unwrap_or_else(|| panic!("cannot find committed block meta {}", prev_height));
            if block.header.prev_block_id != meta.block_id {
                return Err(ValidationError::LastBlockIdMismatch {
                    expected: meta.block_id,
                    got: block.header.prev_block_id.clone(),
                });
            }
        }
        Ok(())
    }

    fn enter_prevote(self: &Arc<Self>, rs: &mut RoundState, round: u32) {
        let height = rs.height;
        if round < rs.round || (rs.round == round && rs.step >= Step::Prevote) {
            debug!(
                height,
                round,
                current_round = rs.round,
                current_step = ?rs.step,
                "enter_prevote: invalid args"
            );
            return;
        }
        info!(height, round, "enter_prevote");

        self.do_prevote(rs, round);

        rs.round = round;
        rs.step = Step::Prevote;
        self.new_step(rs);
    }

    fn do_prevote(self: &Arc<Self>, rs: &mut RoundState, round: u32) {
        let height = rs.height;

        // If locked, prevote the locked block while its predecessor link
        // still holds; otherwise release the lock.
        if let Some(locked) = rs.locked_block.clone() {
            match self.validate_previous_block(&locked) {
                Ok(()) => {
                    info!(height, round, "enter_prevote: block was locked");
                    let block_id = locked.block_id(
                        rs.locked_block_parts
                            .as_ref()
                            .expect("locked block has parts")
                            .header(),
                    );
                    self.sign_add_vote(rs, VoteType::Prevote, Some(block_id));
                    return;
                }
                Err(e) => {
                    info!(height, round, error = %e, "enter_prevote: locked block's predecessor is invalid; unlocking");
                    rs.locked_round = None;
                    rs.locked_block = None;
                    rs.locked_block_parts = None;
                    self.publish(Event::Unlock { height, round });
                }
            }
        }

        let Some(block) = rs.proposal_block.clone() else {
            info!(height, round, "enter_prevote: proposal block is nil");
            self.sign_add_vote(rs, VoteType::Prevote, None);
            return;
        };

        let state = self.get_state();
        if let Err(e) = self.executor.validate_block(&state, &block) {
            if matches!(e, ValidationError::LastBlockIdMismatch { .. }) {
                rs.valid_round = None;
                rs.valid_block = None;
                rs.valid_block_parts = None;
                info!(height, round, error = %e, "enter_prevote: proposal block is invalid");
            } else {
                error!(height, round, error = %e, "enter_prevote: proposal block is invalid");
            }
            self.sign_add_vote(rs, VoteType::Prevote, None);
            return;
        }

        if let Err(e) = self.validate_previous_block(&block) {
            info!(height, round, error = %e, "enter_prevote: previous block is invalid");
            rs.valid_round = None;
            rs.valid_block = None;
            rs.valid_block_parts = None;
            self.sign_add_vote(rs, VoteType::Prevote, None);
            return;
        }

        info!(height, round, "enter_prevote: proposal block is valid");
        let block_id = block.block_id(
            rs.proposal_block_parts
                .as_ref()
                .expect("proposal block has parts")
                .header(),
        );
        self.sign_add_vote(rs, VoteType::Prevote, Some(block_id));
    }

    fn enter_prevote_wait(self: &Arc<Self>, rs: &mut RoundState, round: u32) {
        let height = rs.height;
        if round < rs.round || (rs.round == round && rs.step >= Step::PrevoteWait) {
            debug!(
                height,
                round,
                current_round = rs.round,
                current_step = ?rs.step,
                "enter_prevote_wait: invalid args"
            );
            return;
        }
        let any = rs
            .votes
            .prevotes(round)
            .map(|v| v.has_two_thirds_any())
            .unwrap_or(false);
        if !any {
            panic!(
                "enter_prevote_wait({}/{}) without +2/3 prevotes for any block",
                height, round
            );
        }
        info!(height, round, "enter_prevote_wait");

        rs.round = round;
        rs.step = Step::PrevoteWait;
        self.new_step(rs);

        self.schedule_timeout(self.config.prevote(round), height, round, Step::PrevoteWait);
    }

    fn enter_precommit(self: &Arc<Self>, rs: &mut RoundState, round: u32) {
        let height = rs.height;
        if round < rs.round || (rs.round == round && rs.step >= Step::Precommit) {
            debug!(
                height,
                round,
                current_round = rs.round,
                current_step = ?rs.step,
                "enter_precommit: invalid args"
            );
            return;
        }
        info!(height, round, "enter_precommit");

        let maj23 = rs.votes.prevotes(round).and_then(|v| v.two_thirds_majority());

        let finish = |cs: &Arc<Self>, rs: &mut RoundState| {
            rs.round = round;
            rs.step = Step::Precommit;
            cs.new_step(rs);
        };

        // No polka: precommit nil.
        let Some(maj_block_id) = maj23 else {
            if rs.locked_block.is_some() {
                info!(height, round, "enter_precommit: no +2/3 prevotes while locked; precommitting nil");
            } else {
                info!(height, round, "enter_precommit: no +2/3 prevotes; precommitting nil");
            }
            self.sign_add_vote(rs, VoteType::Precommit, None);
            finish(self, rs);
            return;
        };

        self.publish(Event::Polka { height, round });

        // The latest POL round should be this one.
        if let Some((pol_round, _)) = rs.votes.pol_info() {
            if pol_round < round {
                panic!("POL round should be {} but got {}", round, pol_round);
            }
        }

        // +2/3 prevoted nil: release any lock and precommit nil.
        let Some(block_id) = maj_block_id else {
            if rs.locked_block.is_none() {
                info!(height, round, "enter_precommit: +2/3 prevoted for nil");
            } else {
                info!(height, round, "enter_precommit: +2/3 prevoted for nil; unlocking");
                rs.locked_round = None;
                rs.locked_block = None;
                rs.locked_block_parts = None;
                self.publish(Event::Unlock { height, round });
            }
            self.sign_add_vote(rs, VoteType::Precommit, None);
            finish(self, rs);
            return;
        };

        // Already locked on this block: relock.
        if rs
            .locked_block
            .as_ref()
            .map(|b| b.hash() == block_id.hash)
            .unwrap_or(false)
        {
            if let Err(e) = self.validate_previous_block(rs.locked_block.as_ref().unwrap()) {
                info!(height, round, error = %e, "enter_precommit: locked block's predecessor is invalid; unlocking");
                rs.locked_round = None;
                rs.locked_block = None;
                rs.locked_block_parts = None;
                self.publish(Event::Unlock { height, round });
                self.sign_add_vote(rs, VoteType::Precommit, None);
                finish(self, rs);
                return;
            }
            info!(height, round, "enter_precommit: relocking");
            rs.locked_round = Some(round);
            self.publish(Event::Relock { height, round });
            self.sign_add_vote(rs, VoteType::Precommit, Some(block_id));
            finish(self, rs);
            return;
        }

        // Polka for the proposal block: validate, lock, precommit it.
        if rs
            .proposal_block
            .as_ref()
            .map(|b| b.hash() == block_id.hash)
            .unwrap_or(false)
        {
            let block = rs.proposal_block.clone().unwrap();
            let state = self.get_state();
            if let Err(e) = self.executor.validate_block(&state, &block) {
                if matches!(e, ValidationError::LastBlockIdMismatch { .. }) {
                    rs.valid_round = None;
                    rs.valid_block = None;
                    rs.valid_block_parts = None;
                    self.sign_add_vote(rs, VoteType::Precommit, None);
                    finish(self, rs);
                    return;
                }
                panic!("enter_precommit: +2/3 prevoted for an invalid block: {}", e);
            }
            if let Err(e) = self.validate_previous_block(&block) {
                info!(height, round, error = %e, "enter_precommit: previous block is invalid");
                rs.valid_round = None;
                rs.valid_block = None;
                rs.valid_block_parts = None;
                self.sign_add_vote(rs, VoteType::Precommit, None);
                finish(self, rs);
                return;
            }

            info!(height, round, hash = %block_id.hash, "enter_precommit: locking");
            rs.locked_round = Some(round);
            rs.locked_block = rs.proposal_block.clone();
            rs.locked_block_parts = rs.proposal_block_parts.clone();
            self.publish(Event::Lock { height, round });
            self.sign_add_vote(rs, VoteType::Precommit, Some(block_id));
            finish(self, rs);
            return;
        }

        // Polka for a block we don't have: unlock, fetch it, precommit nil.
        rs.locked_round = None;
        rs.locked_block = None;
        rs.locked_block_parts = None;
        let has_header = rs
            .proposal_block_parts
            .as_ref()
            .map(|p| p.has_header(&block_id.parts_header))
            .unwrap_or(false);
        if !has_header {
            if let Some(block) = &rs.proposal_block {
                let state = self.get_state();
                self.executor.unreserve_block(&state, block);
            }
            rs.proposal_block = None;
            rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts_header));
        }
        self.publish(Event::Unlock { height, round });
        self.sign_add_vote(rs, VoteType::Precommit, None);
        finish(self, rs);
    }

    fn enter_precommit_wait(self: &Arc<Self>, rs: &mut RoundState, round: u32) {
        let height = rs.height;
        if round < rs.round || (rs.round == round && rs.triggered_timeout_precommit) {
            debug!(
                height,
                round,
                current_round = rs.round,
                triggered = rs.triggered_timeout_precommit,
                "enter_precommit_wait: invalid args"
            );
            return;
        }
        let any = rs
            .votes
            .precommits(round)
            .map(|v| v.has_two_thirds_any())
            .unwrap_or(false);
        if !any {
            panic!(
                "enter_precommit_wait({}/{}) without +2/3 precommits for any block",
                height, round
            );
        }
        info!(height, round, "enter_precommit_wait");

        rs.triggered_timeout_precommit = true;
        self.new_step(rs);

        self.schedule_timeout(
            self.config.precommit(round),
            height,
            round,
            Step::PrecommitWait,
        );
    }

    /// Returns true when the caller should attempt finalization after
    /// releasing the height's lock.
    fn enter_commit(self: &Arc<Self>, rs: &mut RoundState, commit_round: u32) -> bool {
        let height = rs.height;
        if commit_round != rs.round || rs.step >= Step::Commit {
            debug!(
                height,
                commit_round,
                current_round = rs.round,
                current_step = ?rs.step,
                "enter_commit: invalid args"
            );
            return false;
        }
        info!(height, commit_round, "enter_commit");

        let block_id = match rs
            .votes
            .precommits(commit_round)
            .and_then(|v| v.two_thirds_majority())
        {
            Some(Some(id)) => id,
            _ => panic!("enter_commit expects +2/3 precommits for a block"),
        };

        // The locked block becomes the proposal block if it is the one
        // committed; otherwise set up to fetch the committed block.
        if rs
            .locked_block
            .as_ref()
            .map(|b| b.hash() == block_id.hash)
            .unwrap_or(false)
        {
            info!(height, hash = %block_id.hash, "Commit is for the locked block");
            rs.proposal_block = rs.locked_block.clone();
            rs.proposal_block_parts = rs.locked_block_parts.clone();
        }

        let have_block = rs
            .proposal_block
            .as_ref()
            .map(|b| b.hash() == block_id.hash)
            .unwrap_or(false);
        if !have_block {
            let has_header = rs
                .proposal_block_parts
                .as_ref()
                .map(|p| p.has_header(&block_id.parts_header))
                .unwrap_or(false);
            if !has_header {
                info!(height, commit = %block_id.hash, "Commit is for a block we don't know about");
                if let Some(block) = &rs.proposal_block {
                    let state = self.get_state();
                    self.executor.unreserve_block(&state, block);
                }
                rs.proposal_block = None;
                rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts_header));
                self.publish(Event::ValidBlock {
                    height,
                    round: rs.round,
                });
            }
        }

        rs.step = Step::Commit;
        self.new_step(rs);
        true
    }

    /// If we have the committed block and its +2/3, finalize.
    fn try_finalize_commit(self: &Arc<Self>, height: u64) {
        let Some(rs_arc) = self.get_round_state_arc(height) else {
            return;
        };
        {
            let rs = rs_arc.lock().unwrap();
            let block_id = match rs
                .votes
                .precommits(rs.round)
                .and_then(|v| v.two_thirds_majority())
            {
                Some(Some(id)) => id,
                _ => {
                    error!(height, "finalize attempt without +2/3 for a block");
                    return;
                }
            };
            let have_block = rs
                .proposal_block
                .as_ref()
                .map(|b| b.hash() == block_id.hash)
                .unwrap_or(false);
            if !have_block {
                info!(height, "finalize attempt without the commit block; waiting");
                return;
            }
        }
        self.finalize_commit(height);
    }

    /// Finalize `height`: strictly ordered behind height - 1 via the
    /// condition variable, then validate, persist, mark the WAL, apply, and
    /// promote.
    fn finalize_commit(self: &Arc<Self>, height: u64) {
        let mut gate = self.finalize_mtx.lock().unwrap();
        loop {
            let last = self.get_last_height();
            if last + 1 == height {
                break;
            }
            if last >= height {
                return; // already finalized (replay)
            }
            if self.stopped.load(Ordering::Relaxed) {
                return;
            }
            debug!(
                finalizing = height,
                finalized = last,
                "Previous block is not finalized yet"
            );
            let (g, _) = self
                .finalize_cond
                .wait_timeout(gate, Duration::from_millis(100))
                .unwrap();
            gate = g;
        }

        let Some(rs_arc) = self.get_round_state_arc(height) else {
            return;
        };
        let mut rs = rs_arc.lock().unwrap();
        if rs.step != Step::Commit {
            debug!(height, step = ?rs.step, "finalize_commit: not in commit step");
            return;
        }

        let block_id = match rs
            .votes
            .precommits(rs.round)
            .and_then(|v| v.two_thirds_majority())
        {
            Some(Some(id)) => id,
            _ => panic!("cannot finalize commit: no +2/3 majority for a block"),
        };
        let block = rs
            .proposal_block
            .clone()
            .expect("finalize requires the proposal block");
        let parts = rs
            .proposal_block_parts
            .clone()
            .expect("finalize requires the block parts");
        if !parts.has_header(&block_id.parts_header) {
            panic!("expected proposal block parts header to be the commit header");
        }
        if block.hash() != block_id.hash {
            panic!("cannot finalize commit: proposal block does not hash to the commit hash");
        }

        let state = self.get_state();
        if let Err(e) = self.executor.validate_block(&state, &block) {
            if matches!(e, ValidationError::LastBlockIdMismatch { .. }) {
                info!(height, error = %e, "finalize_commit: previous block is invalid; unlocking");
                rs.locked_round = None;
                rs.locked_block = None;
                rs.locked_block_parts = None;
                self.publish(Event::Unlock {
                    height,
                    round: rs.round,
                });
                let next_round = rs.round + 1;
                self.enter_new_round(&mut rs, next_round);
                return;
            }
            panic!("+2/3 committed an invalid block: {}", e);
        }

        info!(
            height,
            txs = block.txs.len(),
            hash = %block.hash(),
            app_hash = %block.header.app_hash,
            "Finalizing commit of block"
        );

        // Respect the commit interval of the previous height.
        if block.header.height > 1 && !self.config.skip_timeout_commit {
            let prev_commit_ms = self
                .get_round_state_arc(height - 1)
                .and_then(|prev| prev.lock().unwrap().commit_time_ms);
            if let Some(prev_ms) = prev_commit_ms {
                let deadline = prev_ms + self.config.timeout_commit_ms;
                let now = now_ms();
                if deadline > now {
                    std::thread::sleep(Duration::from_millis(deadline - now));
                }
            }
        }

        let len_ulb = state.len_ulb();

        if self.executor.block_store().height() < block.header.height {
            // The seen commit is the local justification; the canonical one
            // arrives embedded in block height + len_ulb.
            let seen_commit = rs
                .votes
                .precommits(rs.round)
                .expect("commit round has precommits")
                .make_commit();
            if let Err(e) =
                self.executor
                    .block_store()
                    .save_block(&block, &parts.header(), &seen_commit, len_ulb)
            {
                panic!("failed to save block {}: {}", height, e);
            }
        } else {
            info!(height, "Calling finalize_commit on an already stored block");
        }

        // The end-of-height marker commits this block in the WAL; replay
        // starts after the latest one.
        self.wal_write_sync(WalRecord::EndHeight(height));

        let new_state = match self.executor.apply_block(&state, &block_id, &block) {
            Ok(s) => s,
            Err(e) => {
                error!(height, error = %e, "Error on apply_block; halting. Restart recovery will re-apply");
                std::process::exit(1);
            }
        };

        rs.commit_round = Some(rs.round);
        rs.commit_time_ms = Some(now_ms());

        self.record_metrics(&rs, &block);

        // Seed the next height's LastCommit. With len_ulb == 1 its ULB is
        // this very height, whose lock we hold, so pass the data down.
        let next_ulb_height = (height + 1).saturating_sub(len_ulb);
        let ulb_hint = if next_ulb_height == height {
            let precommits = rs
                .votes
                .precommits(rs.round)
                .expect("commit round has precommits")
                .clone();
            Some((precommits, rs.validators.clone()))
        } else {
            None
        };

        self.update_to_state(new_state, ulb_hint);

        drop(rs);

        // The just-finalized height can never be signed again.
        self.pin_immutable_height(height);

        // Retire the height that slid out of the pipeline window.
        if height > len_ulb {
            self.cleanup_finalized_round_state(height - len_ulb);
        }

        self.finalize_cond.notify_all();
        drop(gate);
    }

    fn record_metrics(&self, rs: &RoundState, block: &Block) {
        self.metrics.validators.set(rs.validators.len() as i64);
        self.metrics
            .validators_power
            .set(rs.validators.total_power() as i64);

        if let Some(last_validators) = &rs.last_validators {
            let mut missing = 0i64;
            let mut missing_power = 0i64;
            for (i, val) in last_validators.validators().iter().enumerate() {
                let vote = block.last_commit.precommits.get(i).and_then(|v| v.as_ref());
                if vote.is_none() {
                    missing += 1;
                    missing_power += val.voting_power as i64;
                }
            }
            self.metrics.missing_validators.set(missing);
            self.metrics.missing_validators_power.set(missing_power);
        }

        self.metrics
            .byzantine_validators
            .set(block.evidence.len() as i64);
        let byzantine_power: i64 = block
            .evidence
            .iter()
            .map(|ev| rs.validators.voting_power_of(&ev.address()) as i64)
            .sum();
        self.metrics
            .byzantine_validators_power
            .set(byzantine_power);

        if block.header.height > 1 {
            if let Ok(Some(prev_meta)) = self
                .executor
                .block_store()
                .load_block_meta(block.header.height - 1)
            {
                let interval =
                    block.header.time_ms.saturating_sub(prev_meta.header.time_ms) as f64 / 1000.0;
                self.metrics.block_interval_seconds.observe(interval);
            }
        }

        self.metrics.num_txs.set(block.txs.len() as i64);
        self.metrics
            .block_size_bytes
            .set(block.size_bytes() as i64);
        self.metrics
            .committed_height
            .set(block.header.height as i64);
    }

    // ----------------------------------------------------------------
    // Message ingestion
    // ----------------------------------------------------------------

    fn set_proposal_inner(&self, proposal: Proposal) -> Result<(), ConsensusMsgError> {
        let Some(rs_arc) = self.get_round_state_arc(proposal.height) else {
            return Ok(());
        };
        let mut rs = rs_arc.lock().unwrap();

        // Already have one for this round.
        if rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != rs.height || proposal.round != rs.round {
            return Ok(());
        }

        // POL round must be -1 or in [0, proposal.round).
        if proposal.pol_round < -1
            || (proposal.pol_round >= 0 && proposal.pol_round >= proposal.round as i32)
        {
            return Err(ConsensusMsgError::InvalidProposalPOLRound);
        }

        let proposer = rs
            .validators
            .get_proposer()
            .ok_or(ConsensusMsgError::InvalidProposalSignature)?;
        if !proposer.pub_key.verify(
            &proposal.sign_bytes(&self.chain_id),
            &proposal.signature,
        ) {
            return Err(ConsensusMsgError::InvalidProposalSignature);
        }

        if rs.proposal_block_parts.is_none() {
            rs.proposal_block_parts =
                Some(PartSet::from_header(proposal.block_id.parts_header));
        }
        info!(height = proposal.height, round = proposal.round, "Received proposal");
        rs.proposal = Some(proposal);
        Ok(())
    }

    fn add_proposal_block_part_inner(
        self: &Arc<Self>,
        height: u64,
        round: u32,
        part: Part,
        peer_id: &str,
    ) -> Result<bool, ConsensusMsgError> {
        let Some(rs_arc) = self.get_round_state_arc(height) else {
            return Ok(false);
        };
        let mut rs = rs_arc.lock().unwrap();

        let Some(parts) = rs.proposal_block_parts.as_mut() else {
            // We've moved past this round, or never got the proposal; not
            // necessarily a bad peer.
            info!(height, round, index = part.index, peer = %peer_id,
                "Received a block part when we're not expecting any");
            return Ok(false);
        };

        let added = parts.add_part(part)?;
        if !(added && parts.is_complete()) {
            return Ok(added);
        }

        // Complete: decode under the consensus size cap.
        let state = self.get_state();
        let bytes = parts.assemble()?;
        if bytes.len() as u64 > state.consensus_params.block.max_bytes {
            return Err(ConsensusMsgError::BlockTooLarge);
        }
        let block: Block =
            serde_json::from_slice(&bytes).map_err(|_| ConsensusMsgError::BlockDecode)?;
        info!(height = block.header.height, hash = %block.hash(), "Received complete proposal block");
        rs.proposal_block = Some(block.clone());

        self.publish(Event::CompleteProposal {
            height,
            round: rs.round,
            block_id: block.block_id(rs.proposal_block_parts.as_ref().unwrap().header()),
        });

        // Hold the contained txs while this proposal is pending.
        self.executor.reserve_block(&state, &block);

        // A complete block at H unblocks proposing at H + 1.
        self.schedule_new_height_round0(height + 1);

        // Update valid block if a polka already arrived for it.
        let maj23 = rs
            .votes
            .prevotes(rs.round)
            .and_then(|v| v.two_thirds_majority());
        let has_two_thirds = maj23.is_some();
        if let Some(Some(block_id)) = maj23 {
            if rs.valid_round.map(|vr| vr < rs.round).unwrap_or(true)
                && block.hash() == block_id.hash
                && self.validate_previous_block(&block).is_ok()
            {
                info!(height, round = rs.round, hash = %block.hash(), "Updating valid block to new proposal block");
                rs.valid_round = Some(rs.round);
                rs.valid_block = rs.proposal_block.clone();
                rs.valid_block_parts = rs.proposal_block_parts.clone();
            }
        }

        let mut try_finalize = false;
        if rs.step <= Step::Propose && self.is_proposal_complete(&rs) {
            let r = rs.round;
            self.enter_prevote(&mut rs, r);
            if has_two_thirds {
                self.enter_precommit(&mut rs, r);
            }
        } else if rs.step == Step::Commit {
            try_finalize = true;
        }
        drop(rs);

        if try_finalize {
            self.try_finalize_commit(height);
        }
        Ok(true)
    }

    /// Add a vote; conflicting signatures become evidence for the pool, and
    /// a conflict carrying our own address halts the engine.
    fn try_add_vote(self: &Arc<Self>, vote: Vote, peer_id: &str) -> Result<bool, ConsensusMsgError> {
        match self.add_vote_inner(vote.clone(), peer_id) {
            Ok(added) => Ok(added),
            Err(VoteSetError::Conflicting(evidence)) => {
                self.metrics.equivocations.inc();
                let our_address = self
                    .priv_validator
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|pv| pv.address());
                if our_address == Some(vote.validator_address) {
                    error!(
                        height = vote.height,
                        round = vote.round,
                        "Found conflicting vote from ourselves; halting"
                    );
                    self.stop();
                    return Err(ConsensusMsgError::ConflictingVotes(evidence));
                }
                self.executor.evpool().add_evidence((*evidence).clone());
                Err(ConsensusMsgError::ConflictingVotes(evidence))
            }
            Err(VoteSetError::HeightMismatch { .. }) => {
                Err(ConsensusMsgError::VoteHeightMismatch)
            }
            Err(e) => {
                // Bad peer, benign race, or a stale vote; either way the main
                // loop keeps going.
                info!(error = %e, "Error attempting to add vote");
                Err(ConsensusMsgError::AddingVote)
            }
        }
    }

    fn add_vote_inner(self: &Arc<Self>, vote: Vote, _peer_id: &str) -> Result<bool, VoteSetError> {
        debug!(
            height = vote.height,
            round = vote.round,
            vote_type = ?vote.vote_type,
            index = vote.validator_index,
            "add_vote"
        );

        let Some(rs_arc) = self.get_round_state_arc(vote.height) else {
            return Ok(false);
        };
        let mut rs = rs_arc.lock().unwrap();

        let vote_round = vote.round;
        let vote_type = vote.vote_type;
        let added = rs.votes.add_vote(vote.clone())?;
        if !added {
            return Ok(false);
        }

        self.publish(Event::Vote(vote.clone()));

        let height = rs.height;
        let mut try_finalize = false;
        let mut enter_next_height = false;

        match vote_type {
            VoteType::Prevote => {
                let maj23 = rs
                    .votes
                    .prevotes(vote_round)
                    .and_then(|v| v.two_thirds_majority());
                let has_any = rs
                    .votes
                    .prevotes(vote_round)
                    .map(|v| v.has_two_thirds_any())
                    .unwrap_or(false);

                if let Some(maj_block_id) = maj23.clone() {
                    // Unlock on a more recent polka for a different block.
                    let locked_matches = match (&rs.locked_block, &maj_block_id) {
                        (Some(locked), Some(id)) => locked.hash() == id.hash,
                        _ => false,
                    };
                    if rs.locked_block.is_some()
                        && rs.locked_round.map(|lr| lr < vote_round).unwrap_or(true)
                        && vote_round <= rs.round
                        && !locked_matches
                    {
                        info!(height, pol_round = vote_round, "Unlocking because of POL");
                        rs.locked_round = None;
                        rs.locked_block = None;
                        rs.locked_block_parts = None;
                        self.publish(Event::Unlock {
                            height,
                            round: vote_round,
                        });
                    }

                    // Track the freshest polka block as the valid block.
                    if let Some(block_id) = &maj_block_id {
                        if rs.valid_round.map(|vr| vr < vote_round).unwrap_or(true)
                            && vote_round == rs.round
                        {
                            let proposal_matches = rs
                                .proposal_block
                                .as_ref()
                                .map(|b| b.hash() == block_id.hash)
                                .unwrap_or(false);
                            if proposal_matches {
                                info!(height, pol_round = vote_round, "Updating valid block because of POL");
                                rs.valid_round = Some(vote_round);
                                rs.valid_block = rs.proposal_block.clone();
                                rs.valid_block_parts = rs.proposal_block_parts.clone();
                            } else {
                                info!(height, "Valid block we don't know about; fetching");
                                if let Some(block) = &rs.proposal_block {
                                    let state = self.get_state();
                                    self.executor.unreserve_block(&state, block);
                                }
                                rs.proposal_block = None;
                            }
                            let has_header = rs
                                .proposal_block_parts
                                .as_ref()
                                .map(|p| p.has_header(&block_id.parts_header))
                                .unwrap_or(false);
                            if !has_header {
                                rs.proposal_block_parts =
                                    Some(PartSet::from_header(block_id.parts_header));
                            }
                            self.publish(Event::ValidBlock {
                                height,
                                round: vote_round,
                            });
                        }
                    }
                }

                // Round-skip on +2/3 prevotes for anything at a future round.
                if rs.round < vote_round && has_any {
                    self.enter_new_round(&mut rs, vote_round);
                } else if rs.round == vote_round && rs.step >= Step::Prevote {
                    let is_nil_polka = matches!(maj23, Some(None));
                    if maj23.is_some() && (self.is_proposal_complete(&rs) || is_nil_polka) {
                        self.enter_precommit(&mut rs, vote_round);
                    } else if has_any {
                        self.enter_prevote_wait(&mut rs, vote_round);
                    }
                } else if let Some(proposal) = rs.proposal.clone() {
                    if proposal.pol_round >= 0
                        && proposal.pol_round as u32 == vote_round
                        && self.is_proposal_complete(&rs)
                    {
                        let r = rs.round;
                        self.enter_prevote(&mut rs, r);
                    }
                }
            }
            VoteType::Precommit => {
                let maj23 = rs
                    .votes
                    .precommits(vote_round)
                    .and_then(|v| v.two_thirds_majority());
                let has_any = rs
                    .votes
                    .precommits(vote_round)
                    .map(|v| v.has_two_thirds_any())
                    .unwrap_or(false);
                let has_all = rs
                    .votes
                    .precommits(vote_round)
                    .map(|v| v.has_all())
                    .unwrap_or(false);

                match maj23 {
                    Some(maj_block_id) => {
                        // The majority may come from a round ahead of us.
                        self.enter_new_round(&mut rs, vote_round);
                        self.enter_precommit(&mut rs, vote_round);
                        if maj_block_id.is_some() {
                            try_finalize = self.enter_commit(&mut rs, vote_round);
                            if self.config.skip_timeout_commit && has_all {
                                enter_next_height = true;
                            }
                        } else {
                            self.enter_precommit_wait(&mut rs, vote_round);
                        }
                    }
                    None => {
                        if rs.round <= vote_round && has_any {
                            self.enter_new_round(&mut rs, vote_round);
                            self.enter_precommit_wait(&mut rs, vote_round);
                        }
                    }
                }
            }
        }

        drop(rs);

        if try_finalize {
            self.try_finalize_commit(height);
        }
        if enter_next_height {
            if let Some(next_arc) = self.get_round_state_arc(height + 1) {
                let mut next = next_arc.lock().unwrap();
                self.enter_new_round(&mut next, 0);
            }
        }

        Ok(true)
    }

    // ----------------------------------------------------------------
    // Signing
    // ----------------------------------------------------------------

    /// BFT time: never before the referenced block's time plus the iota.
    fn vote_time(&self, rs: &RoundState) -> u64 {
        let now = now_ms();
        let state = self.get_state();
        let iota = state.consensus_params.block.time_iota_ms;
        let min_vote_time = if let Some(locked) = &rs.locked_block {
            locked.header.time_ms + iota
        } else if let Some(proposal) = &rs.proposal_block {
            proposal.header.time_ms + iota
        } else {
            now
        };
        now.max(min_vote_time)
    }

    /// Sign a vote and push it onto the internal queue. Returns None when we
    /// are not a validator of this height or signing was refused.
    fn sign_add_vote(
        &self,
        rs: &RoundState,
        vote_type: VoteType,
        block_id: Option<BlockId>,
    ) -> Option<Vote> {
        // Flush buffered records first, or replay might not recompute the
        // same vote the signer already recorded.
        self.wal_flush();

        let mut pv_guard = self.priv_validator.lock().unwrap();
        let pv = pv_guard.as_mut()?;
        let address = pv.address();
        let (validator_index, _) = rs.validators.get_by_address(&address)?;

        let mut vote = Vote {
            vote_type,
            height: rs.height,
            round: rs.round,
            block_id,
            timestamp_ms: self.vote_time(rs),
            validator_address: address,
            validator_index,
            signature: Vec::new(),
        };

        match pv.sign_vote(&self.chain_id, &mut vote) {
            Ok(()) => {
                drop(pv_guard);
                self.send_internal_message(MsgInfo::internal(ConsensusMessage::Vote(
                    vote.clone(),
                )));
                info!(
                    height = vote.height,
                    round = vote.round,
                    vote_type = ?vote.vote_type,
                    "Signed and pushed vote"
                );
                Some(vote)
            }
            Err(e) => {
                if !self.replay_mode.load(Ordering::Relaxed) {
                    error!(
                        height = rs.height,
                        round = rs.round,
                        error = %e,
                        "Error signing vote"
                    );
                } else if e.is_regression() {
                    // Replay walked into an older round; the live state is
                    // already past it.
                    debug!(height = rs.height, round = rs.round, "Skipping re-sign during replay");
                }
                None
            }
        }
    }
}
