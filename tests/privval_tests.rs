//! Signer-state store unit tests: regression rules, signature reuse, and the
//! persisted JSON format.

use pipebft::crypto::Keypair;
use pipebft::privval::{FilePrivValidator, PrivvalError, SignStateStore, SignStep};
use pipebft::types::{BlockId, Hash, PartSetHeader, Vote, VoteType};

fn temp_state_path(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("pipebft_test_privval");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.json", name));
    let _ = std::fs::remove_file(&path);
    path
}

fn make_keypair(seed: u8) -> Keypair {
    let mut bytes = [0u8; 32];
    bytes[0] = seed;
    Keypair::from_seed(bytes)
}

fn make_block_id(seed: u8) -> BlockId {
    BlockId {
        hash: Hash([seed; 32]),
        parts_header: PartSetHeader {
            total: 1,
            hash: Hash([seed; 32]),
        },
    }
}

fn make_vote(height: u64, round: u32, vote_type: VoteType, block_id: Option<BlockId>) -> Vote {
    Vote {
        vote_type,
        height,
        round,
        block_id,
        timestamp_ms: 1_700_000_000_000,
        validator_address: make_keypair(1).address(),
        validator_index: 0,
        signature: Vec::new(),
    }
}

#[test]
fn test_check_hrs_fresh_height() {
    let store = SignStateStore::new(temp_state_path("fresh"));
    let (reuse, prior) = store.check_hrs(5, 0, SignStep::Prevote).unwrap();
    assert!(!reuse);
    assert!(prior.is_none());
}

#[test]
fn test_check_hrs_height_at_or_below_watermark() {
    let mut store = SignStateStore::new(temp_state_path("watermark"));
    store.set_immutable_height(10).unwrap();

    let err = store.check_hrs(10, 0, SignStep::Prevote).unwrap_err();
    assert!(matches!(err, PrivvalError::HeightRegression { .. }));
    let err = store.check_hrs(3, 0, SignStep::Prevote).unwrap_err();
    assert!(matches!(err, PrivvalError::HeightRegression { .. }));

    // Heights above the watermark are fine.
    assert!(store.check_hrs(11, 0, SignStep::Prevote).is_ok());
}

#[test]
fn test_round_and_step_regression() {
    let mut store = SignStateStore::new(temp_state_path("regression"));
    store
        .store(7, 2, SignStep::Precommit, vec![1, 2, 3], vec![9, 9])
        .unwrap();

    let err = store.check_hrs(7, 1, SignStep::Precommit).unwrap_err();
    assert!(matches!(err, PrivvalError::RoundRegression { .. }));

    let err = store.check_hrs(7, 2, SignStep::Prevote).unwrap_err();
    assert!(matches!(err, PrivvalError::StepRegression { .. }));

    // Later round and later step both pass.
    assert!(store.check_hrs(7, 3, SignStep::Prevote).is_ok());
    let (reuse, _) = store.check_hrs(7, 2, SignStep::Precommit).unwrap();
    assert!(reuse, "exact HRS match with sign bytes should request reuse");
}

#[test]
fn test_parallel_heights_are_independent() {
    let mut store = SignStateStore::new(temp_state_path("parallel"));
    store
        .store(5, 3, SignStep::Precommit, vec![5], vec![5])
        .unwrap();
    store
        .store(6, 0, SignStep::Prevote, vec![6], vec![6])
        .unwrap();

    // Height 6 progressing at round 0 must not be affected by height 5
    // being at round 3.
    assert!(store.check_hrs(6, 0, SignStep::Precommit).is_ok());
    let err = store.check_hrs(5, 0, SignStep::Prevote).unwrap_err();
    assert!(matches!(err, PrivvalError::RoundRegression { .. }));
}

#[test]
fn test_immutable_height_monotonic_and_prunes() {
    let mut store = SignStateStore::new(temp_state_path("prune"));
    for h in 1..=5 {
        store
            .store(h, 0, SignStep::Prevote, vec![h as u8], vec![h as u8])
            .unwrap();
    }

    store.set_immutable_height(3).unwrap();
    assert!(!store.height_sign_states.contains_key(&3));
    assert!(!store.height_sign_states.contains_key(&1));
    assert!(store.height_sign_states.contains_key(&4));

    let err = store.set_immutable_height(2).unwrap_err();
    assert!(matches!(err, PrivvalError::ImmutableHeightRegression { .. }));
}

#[test]
fn test_reset_clears_heights_but_not_watermark() {
    let mut store = SignStateStore::new(temp_state_path("reset"));
    store
        .store(4, 0, SignStep::Prevote, vec![1], vec![1])
        .unwrap();
    store.set_immutable_height(2).unwrap();
    store.reset().unwrap();
    assert!(store.height_sign_states.is_empty());
    assert_eq!(store.immutable_height, 2);
}

#[test]
fn test_json_round_trip_uses_stringified_heights() {
    let path = temp_state_path("json");
    let mut store = SignStateStore::new(path.clone());
    store
        .store(12, 1, SignStep::Precommit, vec![0xab, 0xcd], vec![0x01])
        .unwrap();
    store.set_immutable_height(9).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(
        raw.contains("\"12\""),
        "height map must be keyed by stringified heights: {}",
        raw
    );
    assert!(raw.contains("\"immutable_height\": 9"));
    assert!(raw.contains("\"abcd\""), "byte fields are hex encoded");

    let reloaded = SignStateStore::load(&path).unwrap();
    assert_eq!(reloaded.immutable_height, 9);
    let ss = reloaded.height_sign_states.get(&12).unwrap();
    assert_eq!(ss.round, 1);
    assert_eq!(ss.step, SignStep::Precommit);
    assert_eq!(ss.sign_bytes.as_deref(), Some(&[0xab, 0xcd][..]));
    assert_eq!(ss.signature.as_deref(), Some(&[0x01][..]));
}

#[test]
fn test_sign_vote_then_identical_resign_reuses_signature() {
    let kp = make_keypair(1);
    let mut pv = FilePrivValidator::new(kp, SignStateStore::new(temp_state_path("resign")));

    let mut vote = make_vote(3, 0, VoteType::Precommit, Some(make_block_id(7)));
    vote.validator_address = pv.address();
    pv.sign_vote("test-chain", &mut vote).unwrap();
    let first_sig = vote.signature.clone();
    assert!(!first_sig.is_empty());

    // Crash-before-broadcast: the same request must yield identical bytes.
    let mut again = vote.clone();
    again.signature = Vec::new();
    pv.sign_vote("test-chain", &mut again).unwrap();
    assert_eq!(again.signature, first_sig);
    assert_eq!(again.timestamp_ms, vote.timestamp_ms);
}

#[test]
fn test_sign_vote_timestamp_only_difference_is_patched() {
    let kp = make_keypair(2);
    let mut pv = FilePrivValidator::new(kp, SignStateStore::new(temp_state_path("ts_patch")));

    let mut vote = make_vote(3, 0, VoteType::Prevote, Some(make_block_id(9)));
    vote.validator_address = pv.address();
    pv.sign_vote("test-chain", &mut vote).unwrap();

    let mut later = vote.clone();
    later.signature = Vec::new();
    later.timestamp_ms = vote.timestamp_ms + 250;
    pv.sign_vote("test-chain", &mut later).unwrap();

    // Timestamp rewinds to the recorded one; the signature is reused.
    assert_eq!(later.timestamp_ms, vote.timestamp_ms);
    assert_eq!(later.signature, vote.signature);
}

#[test]
fn test_sign_vote_conflicting_payload_is_rejected() {
    let kp = make_keypair(3);
    let mut pv = FilePrivValidator::new(kp, SignStateStore::new(temp_state_path("conflict")));

    let mut vote = make_vote(3, 0, VoteType::Prevote, Some(make_block_id(1)));
    vote.validator_address = pv.address();
    pv.sign_vote("test-chain", &mut vote).unwrap();

    // Same (height, round, step) but a different block: refuse.
    let mut other = make_vote(3, 0, VoteType::Prevote, Some(make_block_id(2)));
    other.validator_address = pv.address();
    let err = pv.sign_vote("test-chain", &mut other).unwrap_err();
    assert!(matches!(err, PrivvalError::ConflictingData));
}

#[test]
fn test_sign_proposal_round_regression_rejected() {
    let kp = make_keypair(4);
    let mut pv =
        FilePrivValidator::new(kp, SignStateStore::new(temp_state_path("prop_regress")));

    let mut p1 = pipebft::types::Proposal::new(8, 2, -1, make_block_id(1), 1000);
    pv.sign_proposal("test-chain", &mut p1).unwrap();

    let mut p0 = pipebft::types::Proposal::new(8, 1, -1, make_block_id(2), 1000);
    let err = pv.sign_proposal("test-chain", &mut p0).unwrap_err();
    assert!(matches!(err, PrivvalError::RoundRegression { .. }));
}
