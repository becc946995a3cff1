//! Block store and validator/app store tests, including the seen-commit /
//! canonical-commit switch.

use std::path::PathBuf;

use pipebft::crypto::Keypair;
use pipebft::storage::{BlockStore, StateStore, TxResult, TxResults};
use pipebft::types::{
    Block, BlockId, Commit, CommitSig, ConsensusParams, Genesis, GenesisValidator, Hash, Header,
    Validator, ValidatorSet,
};

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pipebft_test_store_{}", name));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn make_keypair(seed: u8) -> Keypair {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    Keypair::from_seed(bytes)
}

fn make_block(height: u64, last_commit: Commit) -> Block {
    let txs = vec![vec![height as u8]];
    Block {
        header: Header {
            version: 1,
            chain_id: "test-chain".to_string(),
            height,
            time_ms: 1000 + height,
            num_txs: txs.len() as u64,
            prev_block_id: BlockId::zero(),
            last_commit_hash: last_commit.hash(),
            data_hash: Block::compute_data_hash(&txs),
            validators_hash: Hash::ZERO,
            next_validators_hash: Hash::ZERO,
            consensus_hash: Hash::ZERO,
            app_hash: Hash([height as u8; 32]),
            last_results_hash: Hash::ZERO,
            evidence_hash: Hash::ZERO,
            proposer_address: make_keypair(1).address(),
        },
        txs,
        evidence: vec![],
        last_commit,
    }
}

fn commit_for(height: u64, block_id: &BlockId) -> Commit {
    Commit {
        block_id: block_id.clone(),
        precommits: vec![Some(CommitSig {
            validator_address: make_keypair(1).address(),
            height,
            round: 0,
            block_id: Some(block_id.clone()),
            timestamp_ms: 2000 + height,
            signature: vec![height as u8; 4],
        })],
    }
}

/// Commit `heights` blocks with k = 1, chaining each block's LastCommit to
/// the previous height's commit.
fn committed_store(name: &str, heights: u64) -> (BlockStore, Vec<BlockId>) {
    let store = BlockStore::open(&test_dir(name).join("blocks")).unwrap();
    let mut ids = Vec::new();
    let mut prev_commit: Option<Commit> = None;

    for h in 1..=heights {
        let last_commit = prev_commit.take().unwrap_or_else(Commit::empty);
        let block = make_block(h, last_commit);
        let parts = block.make_part_set();
        let block_id = block.block_id(parts.header());
        let seen = commit_for(h, &block_id);
        store.save_block(&block, &parts.header(), &seen, 1).unwrap();
        prev_commit = Some(seen);
        ids.push(block_id);
    }
    (store, ids)
}

#[test]
fn test_save_and_load_block() {
    let (store, ids) = committed_store("save_load", 2);
    assert_eq!(store.height(), 2);

    let block1 = store.load_block(1).unwrap().unwrap();
    assert_eq!(block1.header.height, 1);
    assert_eq!(block1.txs, vec![vec![1u8]]);

    let meta1 = store.load_block_meta(1).unwrap().unwrap();
    assert_eq!(meta1.block_id, ids[0]);
    assert_eq!(meta1.header.app_hash, Hash([1u8; 32]));

    assert!(store.load_block(9).unwrap().is_none());
}

#[test]
fn test_load_commit_switches_at_pipeline_window() {
    let (store, ids) = committed_store("commit_switch", 3);

    // Height 3 is within the window: only the seen commit exists.
    let seen3 = store.load_commit(3, 1).unwrap().unwrap();
    assert_eq!(seen3.block_id, ids[2]);
    assert!(store.load_block_commit(3, 1).unwrap().is_none());

    // Height 1 is past the window: the canonical commit is block 2's
    // LastCommit.
    let canonical1 = store.load_commit(1, 1).unwrap().unwrap();
    assert_eq!(canonical1.block_id, ids[0]);
    let embedded = store.load_block(2).unwrap().unwrap().last_commit;
    assert_eq!(canonical1, embedded);
}

#[test]
fn test_seen_commits_outside_window_are_dropped() {
    let (store, _) = committed_store("seen_prune", 3);
    // Saving height 3 drops the seen commit of height 1 (k + 1 = 2 behind).
    assert!(store.load_seen_commit(1).unwrap().is_none());
    assert!(store.load_seen_commit(2).unwrap().is_some());
    assert!(store.load_seen_commit(3).unwrap().is_some());
}

#[test]
fn test_prune_below_keeps_window() {
    let (store, _) = committed_store("prune", 5);
    let pruned = store.prune_below(4).unwrap();
    assert_eq!(pruned, 3);
    assert!(store.load_block(3).unwrap().is_none());
    assert!(store.load_block(4).unwrap().is_some());
    assert_eq!(store.height(), 5);
}

#[test]
fn test_state_store_round_trip() {
    let dir = test_dir("state_round_trip");
    let store = StateStore::open(&dir.join("state")).unwrap();

    let vset = ValidatorSet::new(vec![Validator::new(make_keypair(1).public_key(), 3)]);
    store.save_validators(7, &vset).unwrap();
    assert_eq!(store.load_validators(7).unwrap().unwrap(), vset);
    assert!(store.load_validators(8).unwrap().is_none());

    store.save_app_hash(7, Hash([7u8; 32])).unwrap();
    assert_eq!(store.load_app_hash(7).unwrap(), Some(Hash([7u8; 32])));

    let results = TxResults {
        results: vec![TxResult {
            code: 0,
            data: vec![1, 2],
        }],
    };
    store.save_tx_results(7, &results).unwrap();
    let loaded = store.load_tx_results(7).unwrap().unwrap();
    assert_eq!(loaded, results);
    assert_eq!(loaded.results_hash(), results.results_hash());
}

#[test]
fn test_bootstrap_seeds_initial_validator_window() {
    let dir = test_dir("bootstrap");
    let store = StateStore::open(&dir.join("state")).unwrap();

    let genesis = Genesis {
        chain_id: "test-chain".to_string(),
        genesis_time_ms: 1_700_000_000_000,
        consensus_params: ConsensusParams::default(),
        validators: vec![
            GenesisValidator {
                pub_key: make_keypair(1).public_key(),
                voting_power: 1,
                name: String::new(),
            },
            GenesisValidator {
                pub_key: make_keypair(2).public_key(),
                voting_power: 1,
                name: String::new(),
            },
        ],
        app_hash: Hash::ZERO,
    };

    let state = store.bootstrap(&genesis).unwrap();
    assert_eq!(state.last_block_height, 0);
    assert_eq!(state.len_ulb(), 1);

    // Heights 1 ..= len_ulb + 2 are seeded; membership is identical but the
    // proposer rotation differs per height.
    for h in 1..=3 {
        let vset = store.load_validators(h).unwrap().unwrap();
        assert_eq!(vset.len(), 2);
    }
    assert!(store.load_validators(4).unwrap().is_none());

    let p1 = store
        .load_validators(1)
        .unwrap()
        .unwrap()
        .get_proposer()
        .unwrap()
        .address;
    let p2 = store
        .load_validators(2)
        .unwrap()
        .unwrap()
        .get_proposer()
        .unwrap()
        .address;
    assert_ne!(p1, p2, "successive heights rotate the proposer");

    let reloaded = store.load_state().unwrap().unwrap();
    assert_eq!(reloaded, state);
}
