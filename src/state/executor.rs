use std::sync::{Arc, Mutex};

use tracing::info;

use crate::state::validation::{validate_block, ValidationError};
use crate::state::State;
use crate::storage::{BlockStore, StateStore, StoreError, TxResults};
use crate::types::block::max_evidence_per_block;
use crate::types::{
    Address, Block, BlockId, Commit, DuplicateVoteEvidence, Hash, PartSet, ValidatorSet,
    ValidatorUpdate,
};

/// Output of applying a committed block to the application.
#[derive(Clone, Debug)]
pub struct ApplyResult {
    pub app_hash: Hash,
    pub tx_results: TxResults,
    pub validator_updates: Vec<ValidatorUpdate>,
}

/// The replicated application. Executes committed blocks and returns the new
/// application digest; everything else about it is out of this engine's
/// hands.
pub trait Application: Send + Sync {
    fn apply_block(
        &self,
        state: &State,
        block_id: &BlockId,
        block: &Block,
    ) -> anyhow::Result<ApplyResult>;
}

/// Mempool seam. Reservation is a soft hold on the txs carried by a pending
/// proposal, released if the proposal dies.
pub trait Mempool: Send + Sync {
    fn reap_txs(&self, max_bytes: usize) -> Vec<Vec<u8>>;
    fn reserve_block(&self, state: &State, block: &Block);
    fn unreserve_block(&self, state: &State, block: &Block);
}

/// Evidence pool seam.
pub trait EvidencePool: Send + Sync {
    fn add_evidence(&self, evidence: DuplicateVoteEvidence);
    fn is_committed(&self, evidence: &DuplicateVoteEvidence) -> bool;
    fn pending_evidence(&self, max: u64) -> Vec<DuplicateVoteEvidence>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("application failed: {0}")]
    App(#[from] anyhow::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("missing validators for height {0}")]
    MissingValidators(u64),
}

/// Creates, validates and applies blocks against the stores and the
/// application, and promotes `State` on finalize.
pub struct BlockExecutor {
    state_store: Arc<StateStore>,
    block_store: Arc<BlockStore>,
    app: Arc<dyn Application>,
    mempool: Arc<dyn Mempool>,
    evpool: Arc<dyn EvidencePool>,
    max_reap_bytes: usize,
}

impl BlockExecutor {
    pub fn new(
        state_store: Arc<StateStore>,
        block_store: Arc<BlockStore>,
        app: Arc<dyn Application>,
        mempool: Arc<dyn Mempool>,
        evpool: Arc<dyn EvidencePool>,
    ) -> Self {
        Self {
            state_store,
            block_store,
            app,
            mempool,
            evpool,
            max_reap_bytes: 1024 * 1024,
        }
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.state_store
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.block_store
    }

    pub fn evpool(&self) -> &Arc<dyn EvidencePool> {
        &self.evpool
    }

    pub fn validate_block(&self, state: &State, block: &Block) -> Result<(), ValidationError> {
        validate_block(
            &self.block_store,
            &self.state_store,
            Some(self.evpool.as_ref()),
            state,
            block,
        )
    }

    pub fn reserve_block(&self, state: &State, block: &Block) {
        self.mempool.reserve_block(state, block);
    }

    pub fn unreserve_block(&self, state: &State, block: &Block) {
        self.mempool.unreserve_block(state, block);
    }

    /// Materialize a candidate block for `height`. The ULB references and the
    /// validator-set hashes are resolved by the caller (the coordinator owns
    /// the live round states); this assembles and hashes the result.
    #[allow(clippy::too_many_arguments)]
    pub fn create_proposal_block(
        &self,
        height: u64,
        prev_block_id: BlockId,
        state: &State,
        ulb_commit: Commit,
        validators_hash: Hash,
        next_validators_hash: Hash,
        app_hash: Hash,
        last_results_hash: Hash,
        time_ms: u64,
        proposer_address: Address,
    ) -> (Block, PartSet) {
        let txs = self.mempool.reap_txs(self.max_reap_bytes);
        let evidence = self
            .evpool
            .pending_evidence(max_evidence_per_block(state.consensus_params.block.max_bytes));

        let header = crate::types::Header {
            version: state.version,
            chain_id: state.chain_id.clone(),
            height,
            time_ms,
            num_txs: txs.len() as u64,
            prev_block_id,
            last_commit_hash: ulb_commit.hash(),
            data_hash: Block::compute_data_hash(&txs),
            validators_hash,
            next_validators_hash,
            consensus_hash: state.consensus_params.hash(),
            app_hash,
            last_results_hash,
            evidence_hash: Block::compute_evidence_hash(&evidence),
            proposer_address,
        };
        let block = Block {
            header,
            txs,
            evidence,
            last_commit: ulb_commit,
        };
        let parts = block.make_part_set();
        (block, parts)
    }

    /// Execute a finalized block against the application, persist its
    /// outputs, schedule the post-update validator set, and return the
    /// promoted state.
    pub fn apply_block(
        &self,
        state: &State,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<State, ExecError> {
        let height = block.header.height;
        let result = self.app.apply_block(state, block_id, block)?;

        self.state_store.save_app_hash(height, result.app_hash)?;
        self.state_store.save_tx_results(height, &result.tx_results)?;

        // The set produced by this block's updates becomes active a full
        // pipeline window later.
        let update_height = height + state.len_ulb() + 2;
        if self
            .state_store
            .load_validators(update_height)?
            .is_none()
        {
            let base_height = update_height - 1;
            let base = self
                .state_store
                .load_validators(base_height)?
                .ok_or(ExecError::MissingValidators(base_height))?;
            let mut next = base.apply_updates(&result.validator_updates);
            next.increment_proposer_priority(1);
            self.state_store.save_validators(update_height, &next)?;
        }

        let next_validators: ValidatorSet = self
            .state_store
            .load_validators(height + 1)?
            .ok_or(ExecError::MissingValidators(height + 1))?;

        let new_state = State {
            version: state.version,
            chain_id: state.chain_id.clone(),
            last_block_height: height,
            last_block_id: block_id.clone(),
            last_block_time_ms: block.header.time_ms,
            validators: next_validators,
            consensus_params: state.consensus_params,
            app_hash: result.app_hash,
            last_results_hash: result.tx_results.results_hash(),
        };
        self.state_store.save_state(&new_state)?;

        info!(
            height,
            txs = block.txs.len(),
            app_hash = %result.app_hash,
            "Applied block"
        );
        Ok(new_state)
    }
}

/// Application that accepts every block and never changes the digest.
pub struct NoopApplication;

impl Application for NoopApplication {
    fn apply_block(
        &self,
        state: &State,
        _block_id: &BlockId,
        block: &Block,
    ) -> anyhow::Result<ApplyResult> {
        Ok(ApplyResult {
            app_hash: state.app_hash,
            tx_results: TxResults {
                results: block
                    .txs
                    .iter()
                    .map(|_| crate::storage::TxResult::default())
                    .collect(),
            },
            validator_updates: Vec::new(),
        })
    }
}

/// Mempool with no transactions and no reservations.
pub struct NoopMempool;

impl Mempool for NoopMempool {
    fn reap_txs(&self, _max_bytes: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }
    fn reserve_block(&self, _state: &State, _block: &Block) {}
    fn unreserve_block(&self, _state: &State, _block: &Block) {}
}

/// In-memory evidence pool.
#[derive(Default)]
pub struct MemoryEvidencePool {
    inner: Mutex<MemoryEvidenceInner>,
}

#[derive(Default)]
struct MemoryEvidenceInner {
    pending: Vec<DuplicateVoteEvidence>,
    committed: Vec<DuplicateVoteEvidence>,
}

impl MemoryEvidencePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_committed(&self, evidence: &[DuplicateVoteEvidence]) {
        let mut inner = self.inner.lock().unwrap();
        for ev in evidence {
            inner.pending.retain(|p| p != ev);
            if !inner.committed.contains(ev) {
                inner.committed.push(ev.clone());
            }
        }
    }
}

impl EvidencePool for MemoryEvidencePool {
    fn add_evidence(&self, evidence: DuplicateVoteEvidence) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.pending.contains(&evidence) && !inner.committed.contains(&evidence) {
            inner.pending.push(evidence);
        }
    }

    fn is_committed(&self, evidence: &DuplicateVoteEvidence) -> bool {
        self.inner.lock().unwrap().committed.contains(evidence)
    }

    fn pending_evidence(&self, max: u64) -> Vec<DuplicateVoteEvidence> {
        let inner = self.inner.lock().unwrap();
        inner.pending.iter().take(max as usize).cloned().collect()
    }
}
