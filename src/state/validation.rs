use crate::state::executor::EvidencePool;
use crate::state::State;
use crate::storage::{BlockStore, StateStore, StoreError};
use crate::types::block::max_evidence_per_block;
use crate::types::validator::CommitVerifyError;
use crate::types::{
    Address, Block, BlockError, BlockId, ConsensusMode, DuplicateVoteEvidence, EvidenceError,
    Hash,
};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("block basic validation failed: {0}")]
    Basic(#[from] BlockError),
    #[error("wrong block version: expected {expected}, got {got}")]
    WrongVersion { expected: u64, got: u64 },
    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChainId { expected: String, got: String },
    #[error("wrong block height: expected over {last}, got {got}")]
    HeightNotAboveCommitted { last: u64, got: u64 },
    #[error("wrong block height: expected {expected}, got {got}")]
    WrongHeight { expected: u64, got: u64 },
    #[error("last block id mismatch: expected {expected:?}, got {got:?}")]
    LastBlockIdMismatch { expected: BlockId, got: BlockId },
    #[error("wrong app hash: expected {expected}, got {got}")]
    WrongAppHash { expected: Hash, got: Hash },
    #[error("wrong last results hash: expected {expected}, got {got}")]
    WrongLastResultsHash { expected: Hash, got: Hash },
    #[error("wrong consensus hash: expected {expected}, got {got}")]
    WrongConsensusHash { expected: Hash, got: Hash },
    #[error("wrong validators hash: expected {expected}, got {got}")]
    WrongValidatorsHash { expected: Hash, got: Hash },
    #[error("wrong next validators hash: expected {expected}, got {got}")]
    WrongNextValidatorsHash { expected: Hash, got: Hash },
    #[error("block within the pipeline warm-up cannot carry last commit precommits")]
    NonEmptyLastCommit,
    #[error("commit verification failed: {0}")]
    InvalidCommit(#[from] CommitVerifyError),
    #[error("block time {got} not greater than reference block time {reference}")]
    TimeNotMonotonic { reference: u64, got: u64 },
    #[error("invalid block time: expected {expected}, got {got}")]
    WrongMedianTime { expected: u64, got: u64 },
    #[error("block time {got} is not the genesis time {expected}")]
    WrongGenesisTime { expected: u64, got: u64 },
    #[error("too much evidence: max {max}, got {got}")]
    EvidenceOverflow { max: u64, got: u64 },
    #[error("invalid evidence: {0}")]
    EvidenceInvalid(#[from] EvidenceError),
    #[error("evidence was already committed")]
    EvidenceCommitted,
    #[error("proposer address {0} is not a validator")]
    InvalidProposerAddress(Address),
    #[error("missing stored data for height {height}")]
    MissingHeightData { height: u64 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Validate a proposed block against committed state and the stores.
/// Checks run in a fixed order; the first failure is returned.
pub fn validate_block(
    block_store: &BlockStore,
    state_store: &StateStore,
    evpool: Option<&dyn EvidencePool>,
    state: &State,
    block: &Block,
) -> Result<(), ValidationError> {
    match state.consensus_params.mode {
        ConsensusMode::Pipelined { len_ulb } => {
            validate_block_pipelined(block_store, state_store, evpool, state, block, len_ulb)
        }
        ConsensusMode::Classical => {
            validate_block_classical(block_store, state_store, evpool, state, block)
        }
    }
}

fn validate_block_pipelined(
    block_store: &BlockStore,
    state_store: &StateStore,
    evpool: Option<&dyn EvidencePool>,
    state: &State,
    block: &Block,
    len_ulb: u64,
) -> Result<(), ValidationError> {
    block.validate_basic()?;

    if block.header.version != state.version {
        return Err(ValidationError::WrongVersion {
            expected: state.version,
            got: block.header.version,
        });
    }
    if block.header.chain_id != state.chain_id {
        return Err(ValidationError::WrongChainId {
            expected: state.chain_id.clone(),
            got: block.header.chain_id.clone(),
        });
    }

    // Pipelined: the block may run ahead of the committed height by up to
    // len_ulb, but never behind it.
    if block.header.height <= state.last_block_height {
        return Err(ValidationError::HeightNotAboveCommitted {
            last: state.last_block_height,
            got: block.header.height,
        });
    }

    // Progressing predecessors are checked by the round machine; only the
    // committed case is decidable here.
    let prev_height = block.header.height - 1;
    if prev_height > 0 && prev_height <= state.last_block_height {
        let prev_meta = block_store
            .load_block_meta(prev_height)?
            .ok_or(ValidationError::MissingHeightData { height: prev_height })?;
        if block.header.prev_block_id != prev_meta.block_id {
            return Err(ValidationError::LastBlockIdMismatch {
                expected: prev_meta.block_id,
                got: block.header.prev_block_id.clone(),
            });
        }
    }

    // App digest and results digest both come from the ULB height.
    if block.header.height > len_ulb {
        let ulb_height = block.header.height - len_ulb;
        let ulb_app_hash = state_store
            .load_app_hash(ulb_height)?
            .ok_or(ValidationError::MissingHeightData { height: ulb_height })?;
        if block.header.app_hash != ulb_app_hash {
            return Err(ValidationError::WrongAppHash {
                expected: ulb_app_hash,
                got: block.header.app_hash,
            });
        }
        let ulb_results = state_store
            .load_tx_results(ulb_height)?
            .ok_or(ValidationError::MissingHeightData { height: ulb_height })?;
        if block.header.last_results_hash != ulb_results.results_hash() {
            return Err(ValidationError::WrongLastResultsHash {
                expected: ulb_results.results_hash(),
                got: block.header.last_results_hash,
            });
        }
    }

    let consensus_hash = state.consensus_params.hash();
    if block.header.consensus_hash != consensus_hash {
        return Err(ValidationError::WrongConsensusHash {
            expected: consensus_hash,
            got: block.header.consensus_hash,
        });
    }

    // The first len_ulb + 1 heights are all bound to the genesis set.
    let val_height = if block.header.height <= len_ulb + 1 {
        1
    } else {
        block.header.height
    };
    let validators = state_store
        .load_validators(val_height)?
        .ok_or(ValidationError::MissingHeightData { height: val_height })?;
    if block.header.validators_hash != validators.hash() {
        return Err(ValidationError::WrongValidatorsHash {
            expected: validators.hash(),
            got: block.header.validators_hash,
        });
    }

    if block.header.height >= len_ulb + 1 {
        let next_height = block.header.height + 1;
        let next_validators = state_store
            .load_validators(next_height)?
            .ok_or(ValidationError::MissingHeightData { height: next_height })?;
        if block.header.next_validators_hash != next_validators.hash() {
            return Err(ValidationError::WrongNextValidatorsHash {
                expected: next_validators.hash(),
                got: block.header.next_validators_hash,
            });
        }
    }

    // LastCommit: empty within the warm-up, otherwise sized by and verified
    // under the ULB validator set against the ULB block id.
    if block.header.height <= len_ulb {
        if !block.last_commit.precommits.is_empty() {
            return Err(ValidationError::NonEmptyLastCommit);
        }
    } else {
        let ulb_height = block.header.height - len_ulb;
        let ulb_validators = state_store
            .load_validators(ulb_height)?
            .ok_or(ValidationError::MissingHeightData { height: ulb_height })?;
        let ulb_meta = block_store
            .load_block_meta(ulb_height)?
            .ok_or(ValidationError::MissingHeightData { height: ulb_height })?;
        ulb_validators.verify_commit(
            &state.chain_id,
            &ulb_meta.block_id,
            ulb_height,
            &block.last_commit,
        )?;

        // Block time is the weighted median of the ULB commit, strictly
        // after the ULB block.
        if block.header.time_ms <= ulb_meta.header.time_ms {
            return Err(ValidationError::TimeNotMonotonic {
                reference: ulb_meta.header.time_ms,
                got: block.header.time_ms,
            });
        }
        let median = ulb_validators.median_time(&block.last_commit);
        if block.header.time_ms != median {
            return Err(ValidationError::WrongMedianTime {
                expected: median,
                got: block.header.time_ms,
            });
        }
    }

    if block.header.height == 1 && block.header.time_ms != state.last_block_time_ms {
        return Err(ValidationError::WrongGenesisTime {
            expected: state.last_block_time_ms,
            got: block.header.time_ms,
        });
    }

    validate_evidence(state_store, evpool, state, block)?;

    // The proposing round is unknown here, so only membership is checkable;
    // the address length is enforced by the type.
    if !state.validators.has_address(&block.header.proposer_address) {
        return Err(ValidationError::InvalidProposerAddress(
            block.header.proposer_address,
        ));
    }

    Ok(())
}

fn validate_block_classical(
    block_store: &BlockStore,
    state_store: &StateStore,
    evpool: Option<&dyn EvidencePool>,
    state: &State,
    block: &Block,
) -> Result<(), ValidationError> {
    block.validate_basic()?;

    if block.header.version != state.version {
        return Err(ValidationError::WrongVersion {
            expected: state.version,
            got: block.header.version,
        });
    }
    if block.header.chain_id != state.chain_id {
        return Err(ValidationError::WrongChainId {
            expected: state.chain_id.clone(),
            got: block.header.chain_id.clone(),
        });
    }
    if block.header.height != state.last_block_height + 1 {
        return Err(ValidationError::WrongHeight {
            expected: state.last_block_height + 1,
            got: block.header.height,
        });
    }
    if block.header.prev_block_id != state.last_block_id {
        return Err(ValidationError::LastBlockIdMismatch {
            expected: state.last_block_id.clone(),
            got: block.header.prev_block_id.clone(),
        });
    }
    if block.header.app_hash != state.app_hash {
        return Err(ValidationError::WrongAppHash {
            expected: state.app_hash,
            got: block.header.app_hash,
        });
    }
    if block.header.last_results_hash != state.last_results_hash {
        return Err(ValidationError::WrongLastResultsHash {
            expected: state.last_results_hash,
            got: block.header.last_results_hash,
        });
    }
    let consensus_hash = state.consensus_params.hash();
    if block.header.consensus_hash != consensus_hash {
        return Err(ValidationError::WrongConsensusHash {
            expected: consensus_hash,
            got: block.header.consensus_hash,
        });
    }
    if block.header.validators_hash != state.validators.hash() {
        return Err(ValidationError::WrongValidatorsHash {
            expected: state.validators.hash(),
            got: block.header.validators_hash,
        });
    }

    if block.header.height == 1 {
        if !block.last_commit.precommits.is_empty() {
            return Err(ValidationError::NonEmptyLastCommit);
        }
        if block.header.time_ms != state.last_block_time_ms {
            return Err(ValidationError::WrongGenesisTime {
                expected: state.last_block_time_ms,
                got: block.header.time_ms,
            });
        }
    } else {
        let prev_height = block.header.height - 1;
        let prev_validators = state_store
            .load_validators(prev_height)?
            .ok_or(ValidationError::MissingHeightData { height: prev_height })?;
        let prev_meta = block_store
            .load_block_meta(prev_height)?
            .ok_or(ValidationError::MissingHeightData { height: prev_height })?;
        prev_validators.verify_commit(
            &state.chain_id,
            &prev_meta.block_id,
            prev_height,
            &block.last_commit,
        )?;
        if block.header.time_ms <= state.last_block_time_ms {
            return Err(ValidationError::TimeNotMonotonic {
                reference: state.last_block_time_ms,
                got: block.header.time_ms,
            });
        }
    }

    validate_evidence(state_store, evpool, state, block)?;

    if !state.validators.has_address(&block.header.proposer_address) {
        return Err(ValidationError::InvalidProposerAddress(
            block.header.proposer_address,
        ));
    }

    Ok(())
}

fn validate_evidence(
    state_store: &StateStore,
    evpool: Option<&dyn EvidencePool>,
    state: &State,
    block: &Block,
) -> Result<(), ValidationError> {
    let max = max_evidence_per_block(state.consensus_params.block.max_bytes);
    let got = block.evidence.len() as u64;
    if got > max {
        return Err(ValidationError::EvidenceOverflow { max, got });
    }
    for ev in &block.evidence {
        verify_evidence(state_store, state, ev)?;
        if let Some(pool) = evpool {
            if pool.is_committed(ev) {
                return Err(ValidationError::EvidenceCommitted);
            }
        }
    }
    Ok(())
}

/// Full evidence verification: recency, membership at the evidence height,
/// and both signatures under the accused key.
pub fn verify_evidence(
    state_store: &StateStore,
    state: &State,
    evidence: &DuplicateVoteEvidence,
) -> Result<(), EvidenceError> {
    let age = state.last_block_height.saturating_sub(evidence.height());
    if age > state.consensus_params.evidence.max_age {
        return Err(EvidenceError::Stale {
            evidence_height: evidence.height(),
            min_height: state
                .last_block_height
                .saturating_sub(state.consensus_params.evidence.max_age),
        });
    }

    let validators = state_store
        .load_validators(evidence.height())
        .ok()
        .flatten();
    let is_member = validators
        .map(|v| v.has_address(&evidence.address()))
        .unwrap_or(false);
    if !is_member {
        return Err(EvidenceError::NotAValidator {
            address: evidence.address(),
            height: evidence.height(),
        });
    }

    evidence.verify(&state.chain_id)
}
