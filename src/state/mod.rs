pub mod executor;
pub mod validation;

pub use executor::{
    Application, ApplyResult, BlockExecutor, EvidencePool, ExecError, Mempool,
    MemoryEvidencePool, NoopApplication, NoopMempool,
};
pub use validation::{validate_block, verify_evidence, ValidationError};

use serde::{Deserialize, Serialize};

use crate::types::{BlockId, ConsensusMode, ConsensusParams, Genesis, Hash, ValidatorSet};

/// Immutable snapshot of the committed chain, promoted atomically on
/// finalize. `last_block_height` only ever grows by one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub version: u64,
    pub chain_id: String,
    pub last_block_height: u64,
    pub last_block_id: BlockId,
    pub last_block_time_ms: u64,
    /// Validator set for height last_block_height + 1.
    pub validators: ValidatorSet,
    pub consensus_params: ConsensusParams,
    /// Application digest committed for last_block_height.
    pub app_hash: Hash,
    /// Results digest committed for last_block_height.
    pub last_results_hash: Hash,
}

impl State {
    pub fn from_genesis(genesis: &Genesis) -> Self {
        Self {
            version: 1,
            chain_id: genesis.chain_id.clone(),
            last_block_height: 0,
            last_block_id: BlockId::zero(),
            last_block_time_ms: genesis.genesis_time_ms,
            validators: genesis.validator_set(),
            consensus_params: genesis.consensus_params,
            app_hash: genesis.app_hash,
            last_results_hash: Hash::ZERO,
        }
    }

    pub fn len_ulb(&self) -> u64 {
        self.consensus_params.len_ulb()
    }

    pub fn is_pipelined(&self) -> bool {
        matches!(
            self.consensus_params.mode,
            ConsensusMode::Pipelined { .. }
        )
    }

    pub fn is_empty(&self) -> bool {
        self.chain_id.is_empty()
    }
}
