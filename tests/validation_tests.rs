//! Block-validator tests against a hand-committed chain, including the
//! validator-hash binding vectors around the pipeline warm-up boundary.

use std::sync::Arc;

use pipebft::crypto::Keypair;
use pipebft::state::{validate_block, verify_evidence, State, ValidationError};
use pipebft::storage::{BlockStore, StateStore, TxResults};
use pipebft::types::{
    Block, BlockId, Commit, CommitSig, ConsensusMode, ConsensusParams, DuplicateVoteEvidence,
    EvidenceError, Genesis, GenesisValidator, Hash, Header, PartSetHeader, Validator,
    ValidatorSet, Vote, VoteType,
};

const CHAIN_ID: &str = "test-chain";
const GENESIS_TIME: u64 = 1_700_000_000_000;

fn make_keypair(seed: u8) -> Keypair {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    Keypair::from_seed(bytes)
}

fn make_genesis(n: u8) -> Genesis {
    Genesis {
        chain_id: CHAIN_ID.to_string(),
        genesis_time_ms: GENESIS_TIME,
        consensus_params: ConsensusParams::default(),
        validators: (1..=n)
            .map(|seed| GenesisValidator {
                pub_key: make_keypair(seed).public_key(),
                voting_power: 1,
                name: format!("val{}", seed),
            })
            .collect(),
        app_hash: Hash([0xaa; 32]),
    }
}

/// Keypairs in validator-set (sorted-address) order.
fn ordered_keypairs(n: u8, vset: &ValidatorSet) -> Vec<Keypair> {
    let keypairs: Vec<Keypair> = (1..=n).map(make_keypair).collect();
    vset.validators()
        .iter()
        .map(|v| {
            let kp = keypairs
                .iter()
                .find(|kp| kp.address() == v.address)
                .unwrap();
            Keypair::from_seed(kp.seed_bytes())
        })
        .collect()
}

struct Fixture {
    block_store: Arc<BlockStore>,
    state_store: Arc<StateStore>,
    state: State,
    keypairs: Vec<Keypair>,
}

fn test_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("pipebft_test_validation_{}", name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

impl Fixture {
    fn new(name: &str, n: u8, commit_heights: u64) -> Self {
        let dir = test_dir(name);
        let block_store = Arc::new(BlockStore::open(&dir.join("blocks")).unwrap());
        let state_store = Arc::new(StateStore::open(&dir.join("state")).unwrap());

        let genesis = make_genesis(n);
        let state = state_store.bootstrap(&genesis).unwrap();
        let keypairs = ordered_keypairs(n, &state.validators);

        let mut fixture = Self {
            block_store,
            state_store,
            state,
            keypairs,
        };
        for _ in 0..commit_heights {
            fixture.commit_next();
        }
        fixture
    }

    fn len_ulb(&self) -> u64 {
        self.state.len_ulb()
    }

    fn commit_sigs(&self, height: u64, block_id: &BlockId) -> Commit {
        let base = self.block_time(height) + 10;
        let precommits = self
            .keypairs
            .iter()
            .enumerate()
            .map(|(i, kp)| {
                let mut vote = Vote {
                    vote_type: VoteType::Precommit,
                    height,
                    round: 0,
                    block_id: Some(block_id.clone()),
                    timestamp_ms: base + i as u64,
                    validator_address: kp.address(),
                    validator_index: i as u32,
                    signature: Vec::new(),
                };
                vote.signature = kp.sign(&vote.sign_bytes(CHAIN_ID));
                Some(CommitSig::from_vote(&vote))
            })
            .collect();
        Commit {
            block_id: block_id.clone(),
            precommits,
        }
    }

    fn block_time(&self, height: u64) -> u64 {
        if height == 1 {
            GENESIS_TIME
        } else {
            self.block_store
                .load_block_meta(height)
                .unwrap()
                .map(|m| m.header.time_ms)
                // Not yet committed: recompute the candidate time.
                .unwrap_or_else(|| self.candidate_time(height))
        }
    }

    fn candidate_time(&self, height: u64) -> u64 {
        let k = self.len_ulb();
        if height == 1 {
            GENESIS_TIME
        } else if height <= k {
            GENESIS_TIME + height
        } else {
            let ulb_height = height - k;
            let ulb_meta = self.block_store.load_block_meta(ulb_height).unwrap().unwrap();
            let commit = self.build_ulb_commit(height);
            self.validators_at(ulb_height).median_time(&commit).max(ulb_meta.header.time_ms + 1)
        }
    }

    fn validators_at(&self, height: u64) -> ValidatorSet {
        self.state_store.load_validators(height).unwrap().unwrap()
    }

    fn build_ulb_commit(&self, height: u64) -> Commit {
        let k = self.len_ulb();
        if height <= k {
            return Commit::empty();
        }
        let ulb_height = height - k;
        let ulb_meta = self.block_store.load_block_meta(ulb_height).unwrap().unwrap();
        self.commit_sigs(ulb_height, &ulb_meta.block_id)
    }

    /// Assemble the next candidate block exactly the way the proposer does.
    fn build_block(&self, height: u64) -> Block {
        let k = self.len_ulb();
        let last_commit = self.build_ulb_commit(height);
        let (app_hash, last_results_hash) = if height > k {
            let ulb = height - k;
            (
                self.state_store.load_app_hash(ulb).unwrap().unwrap(),
                self.state_store
                    .load_tx_results(ulb)
                    .unwrap()
                    .unwrap()
                    .results_hash(),
            )
        } else {
            (self.state.app_hash, Hash::ZERO)
        };

        let val_height = if height <= k + 1 { 1 } else { height };
        let validators_hash = self.validators_at(val_height).hash();
        let next_validators_hash = if height >= k + 1 {
            self.validators_at(height + 1).hash()
        } else {
            ValidatorSet::empty().hash()
        };

        let prev_block_id = if height == 1 {
            BlockId::zero()
        } else {
            self.block_store
                .load_block_meta(height - 1)
                .unwrap()
                .unwrap()
                .block_id
        };

        let header = Header {
            version: self.state.version,
            chain_id: CHAIN_ID.to_string(),
            height,
            time_ms: self.candidate_time(height),
            num_txs: 0,
            prev_block_id,
            last_commit_hash: last_commit.hash(),
            data_hash: Block::compute_data_hash(&[]),
            validators_hash,
            next_validators_hash,
            consensus_hash: self.state.consensus_params.hash(),
            app_hash,
            last_results_hash,
            evidence_hash: Hash::ZERO,
            proposer_address: self.keypairs[0].address(),
        };
        Block {
            header,
            txs: vec![],
            evidence: vec![],
            last_commit,
        }
    }

    /// Commit the candidate for last_block_height + 1 and advance state the
    /// way finalize + apply do.
    fn commit_next(&mut self) {
        let height = self.state.last_block_height + 1;
        let block = self.build_block(height);
        let parts = block.make_part_set();
        let block_id = block.block_id(parts.header());
        let seen_commit = self.commit_sigs(height, &block_id);

        self.block_store
            .save_block(&block, &parts.header(), &seen_commit, self.len_ulb())
            .unwrap();
        self.state_store
            .save_app_hash(height, self.state.app_hash)
            .unwrap();
        self.state_store
            .save_tx_results(height, &TxResults::default())
            .unwrap();

        let update_height = height + self.len_ulb() + 2;
        if self
            .state_store
            .load_validators(update_height)
            .unwrap()
            .is_none()
        {
            let mut next = self.validators_at(update_height - 1);
            next.increment_proposer_priority(1);
            self.state_store
                .save_validators(update_height, &next)
                .unwrap();
        }

        self.state.last_block_height = height;
        self.state.last_block_id = block_id;
        self.state.last_block_time_ms = block.header.time_ms;
        self.state.validators = self.validators_at(height + 1);
        self.state.last_results_hash = TxResults::default().results_hash();
    }

    fn validate(&self, block: &Block) -> Result<(), ValidationError> {
        validate_block(&self.block_store, &self.state_store, None, &self.state, block)
    }
}

// ---------------------------------------------------------------------------
// Happy paths: vectors for H in {1, k+1, k+2} with k = 1
// ---------------------------------------------------------------------------

#[test]
fn test_valid_genesis_block() {
    let fx = Fixture::new("genesis_ok", 4, 0);
    let block = fx.build_block(1);
    fx.validate(&block).unwrap();
}

#[test]
fn test_valid_block_at_warmup_boundary() {
    // k = 1: height 2 is the first with a real LastCommit, still clamped to
    // the genesis validator set.
    let fx = Fixture::new("boundary_ok", 4, 1);
    let block = fx.build_block(2);
    fx.validate(&block).unwrap();
}

#[test]
fn test_valid_block_past_warmup() {
    let fx = Fixture::new("past_warmup_ok", 4, 2);
    let block = fx.build_block(3);
    fx.validate(&block).unwrap();
}

// ---------------------------------------------------------------------------
// Ordered checks
// ---------------------------------------------------------------------------

#[test]
fn test_basic_consistency_failure() {
    let fx = Fixture::new("basic", 4, 2);
    let mut block = fx.build_block(3);
    block.header.num_txs = 9;
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::Basic(_)
    ));
}

#[test]
fn test_wrong_version_and_chain_id() {
    let fx = Fixture::new("version", 4, 2);
    let mut block = fx.build_block(3);
    block.header.version = 99;
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::WrongVersion { .. }
    ));

    let mut block = fx.build_block(3);
    block.header.chain_id = "other-chain".to_string();
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::WrongChainId { .. }
    ));
}

#[test]
fn test_height_must_exceed_committed() {
    let fx = Fixture::new("height", 4, 2);
    let mut block = fx.build_block(3);
    block.header.height = 2;
    // Height is checked before any store lookups for height 2 fields.
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::HeightNotAboveCommitted { last: 2, got: 2 }
    ));
}

#[test]
fn test_last_block_id_mismatch() {
    let fx = Fixture::new("prev_id", 4, 2);
    let mut block = fx.build_block(3);
    block.header.prev_block_id = BlockId {
        hash: Hash([9u8; 32]),
        parts_header: PartSetHeader {
            total: 1,
            hash: Hash([9u8; 32]),
        },
    };
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::LastBlockIdMismatch { .. }
    ));
}

#[test]
fn test_ulb_app_hash_and_results_hash() {
    let fx = Fixture::new("ulb_refs", 4, 2);
    let mut block = fx.build_block(3);
    block.header.app_hash = Hash([1u8; 32]);
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::WrongAppHash { .. }
    ));

    let mut block = fx.build_block(3);
    block.header.last_results_hash = Hash([1u8; 32]);
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::WrongLastResultsHash { .. }
    ));
}

#[test]
fn test_consensus_hash_binding() {
    let fx = Fixture::new("consensus_hash", 4, 2);
    let mut block = fx.build_block(3);
    block.header.consensus_hash = Hash([2u8; 32]);
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::WrongConsensusHash { .. }
    ));
}

/// Past the warm-up, the validators hash binds to the block's own height;
/// a set change at that height must be reflected.
#[test]
fn test_validators_hash_binds_to_own_height_past_warmup() {
    let mut fx = Fixture::new("vals_own_height", 4, 2);

    // Height 3 gets an enlarged set; keep the proposer a member and give
    // height 4 the same membership for the next-validators link.
    let mut grown: Vec<Validator> = fx.state.validators.validators().to_vec();
    grown.push(Validator::new(make_keypair(9).public_key(), 1));
    let grown = ValidatorSet::new(grown);
    fx.state_store.save_validators(3, &grown).unwrap();
    fx.state_store.save_validators(4, &grown).unwrap();
    fx.state.validators = grown.clone();

    let block = fx.build_block(3);
    assert_eq!(block.header.validators_hash, grown.hash());
    fx.validate(&block).unwrap();

    let mut wrong = block.clone();
    wrong.header.validators_hash = fx.validators_at(1).hash();
    assert!(matches!(
        fx.validate(&wrong).unwrap_err(),
        ValidationError::WrongValidatorsHash { .. }
    ));
}

/// Within the warm-up (H <= k + 1) the binding is clamped to height 1's set
/// even if the store carries a different set for H.
#[test]
fn test_validators_hash_clamped_during_warmup() {
    let mut fx = Fixture::new("vals_clamped", 4, 1);

    let mut grown: Vec<Validator> = fx.state.validators.validators().to_vec();
    grown.push(Validator::new(make_keypair(9).public_key(), 1));
    let grown = ValidatorSet::new(grown);
    fx.state_store.save_validators(2, &grown).unwrap();
    fx.state.validators = grown.clone();

    // The builder clamps to height 1, so the candidate carries the genesis
    // set's hash and passes.
    let block = fx.build_block(2);
    assert_eq!(block.header.validators_hash, fx.validators_at(1).hash());
    fx.validate(&block).unwrap();

    // Carrying height 2's own (grown) hash must fail.
    let mut wrong = block.clone();
    wrong.header.validators_hash = grown.hash();
    assert!(matches!(
        fx.validate(&wrong).unwrap_err(),
        ValidationError::WrongValidatorsHash { .. }
    ));
}

#[test]
fn test_next_validators_hash_binding() {
    let fx = Fixture::new("next_vals", 4, 2);
    let mut block = fx.build_block(3);
    block.header.next_validators_hash = Hash([3u8; 32]);
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::WrongNextValidatorsHash { .. }
    ));
}

#[test]
fn test_warmup_block_cannot_carry_precommits() {
    let fx = Fixture::new("warmup_commit", 4, 0);
    let mut block = fx.build_block(1);
    let fake_id = BlockId {
        hash: Hash([5u8; 32]),
        parts_header: PartSetHeader {
            total: 1,
            hash: Hash([5u8; 32]),
        },
    };
    let commit = fx.commit_sigs(1, &fake_id);
    block.header.last_commit_hash = commit.hash();
    block.last_commit = commit;
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::NonEmptyLastCommit
    ));
}

#[test]
fn test_tampered_commit_signature() {
    let fx = Fixture::new("bad_commit_sig", 4, 2);
    let mut block = fx.build_block(3);
    if let Some(sig) = block.last_commit.precommits[0].as_mut() {
        sig.signature[0] ^= 0xff;
    }
    block.header.last_commit_hash = block.last_commit.hash();
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::InvalidCommit(_)
    ));
}

#[test]
fn test_block_time_must_be_ulb_median() {
    let fx = Fixture::new("median_time", 4, 2);
    let mut block = fx.build_block(3);
    block.header.time_ms += 5;
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::WrongMedianTime { .. }
    ));

    let mut block = fx.build_block(3);
    block.header.time_ms = fx.block_time(2); // not after the ULB block
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::TimeNotMonotonic { .. }
    ));
}

#[test]
fn test_genesis_block_time_must_match_genesis() {
    let fx = Fixture::new("genesis_time", 4, 0);
    let mut block = fx.build_block(1);
    block.header.time_ms = GENESIS_TIME + 7;
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::WrongGenesisTime { .. }
    ));
}

#[test]
fn test_unknown_proposer_rejected() {
    let fx = Fixture::new("proposer", 4, 2);
    let mut block = fx.build_block(3);
    block.header.proposer_address = make_keypair(42).address();
    assert!(matches!(
        fx.validate(&block).unwrap_err(),
        ValidationError::InvalidProposerAddress(_)
    ));
}

// ---------------------------------------------------------------------------
// Evidence verification
// ---------------------------------------------------------------------------

fn make_evidence(kp: &Keypair, height: u64) -> DuplicateVoteEvidence {
    let mut vote_a = Vote {
        vote_type: VoteType::Prevote,
        height,
        round: 0,
        block_id: Some(BlockId {
            hash: Hash([1u8; 32]),
            parts_header: PartSetHeader {
                total: 1,
                hash: Hash([1u8; 32]),
            },
        }),
        timestamp_ms: 5,
        validator_address: kp.address(),
        validator_index: 0,
        signature: Vec::new(),
    };
    vote_a.signature = kp.sign(&vote_a.sign_bytes(CHAIN_ID));
    let mut vote_b = vote_a.clone();
    vote_b.block_id = Some(BlockId {
        hash: Hash([2u8; 32]),
        parts_header: PartSetHeader {
            total: 1,
            hash: Hash([2u8; 32]),
        },
    });
    vote_b.signature = kp.sign(&vote_b.sign_bytes(CHAIN_ID));
    DuplicateVoteEvidence {
        pub_key: kp.public_key(),
        vote_a,
        vote_b,
    }
}

/// MaxAge = 100 at committed height 500: evidence from 350 is stale, from
/// 410 it is accepted when the accused was in the set.
#[test]
fn test_evidence_age_window() {
    let fx = Fixture::new("evidence_age", 4, 0);
    let mut state = fx.state.clone();
    state.last_block_height = 500;
    state.consensus_params = ConsensusParams {
        evidence: pipebft::types::EvidenceParams { max_age: 100 },
        ..state.consensus_params
    };

    let kp = &fx.keypairs[0];
    let member_set = fx.validators_at(1);
    fx.state_store.save_validators(350, &member_set).unwrap();
    fx.state_store.save_validators(410, &member_set).unwrap();

    let stale = make_evidence(kp, 350);
    assert!(matches!(
        verify_evidence(&fx.state_store, &state, &stale).unwrap_err(),
        EvidenceError::Stale { .. }
    ));

    let fresh = make_evidence(kp, 410);
    verify_evidence(&fx.state_store, &state, &fresh).unwrap();
}

#[test]
fn test_evidence_from_non_member_rejected() {
    let fx = Fixture::new("evidence_member", 4, 0);
    let outsider = make_keypair(77);
    let ev = make_evidence(&outsider, 1);
    assert!(matches!(
        verify_evidence(&fx.state_store, &fx.state, &ev).unwrap_err(),
        EvidenceError::NotAValidator { .. }
    ));
}

#[test]
fn test_evidence_bad_signature_rejected() {
    let fx = Fixture::new("evidence_sig", 4, 0);
    let mut ev = make_evidence(&fx.keypairs[0], 1);
    ev.vote_b.signature[0] ^= 0xff;
    assert!(matches!(
        verify_evidence(&fx.state_store, &fx.state, &ev).unwrap_err(),
        EvidenceError::BadSignature
    ));
}

// ---------------------------------------------------------------------------
// Classical mode
// ---------------------------------------------------------------------------

#[test]
fn test_classical_mode_requires_sequential_height() {
    let fx = Fixture::new("classical", 4, 0);
    let mut state = fx.state.clone();
    state.consensus_params.mode = ConsensusMode::Classical;

    let mut block = fx.build_block(1);
    // Classical blocks bind the consensus hash of the classical params.
    block.header.consensus_hash = state.consensus_params.hash();
    block.header.height = 2;
    let err =
        validate_block(&fx.block_store, &fx.state_store, None, &state, &block).unwrap_err();
    assert!(matches!(err, ValidationError::WrongHeight { expected: 1, got: 2 }));
}
