//! Fast-sync block pool tests: the two-block peek discipline and the
//! caught-up rule.

use pipebft::pool::BlockPool;
use pipebft::types::{Block, BlockId, Commit, Hash, Header};

fn make_block(height: u64) -> Block {
    Block {
        header: Header {
            version: 1,
            chain_id: "test-chain".to_string(),
            height,
            time_ms: 1000 + height,
            num_txs: 0,
            prev_block_id: BlockId::zero(),
            last_commit_hash: Hash::ZERO,
            data_hash: Hash::ZERO,
            validators_hash: Hash::ZERO,
            next_validators_hash: Hash::ZERO,
            consensus_hash: Hash::ZERO,
            app_hash: Hash::ZERO,
            last_results_hash: Hash::ZERO,
            evidence_hash: Hash::ZERO,
            proposer_address: pipebft::types::Address::ZERO,
        },
        txs: vec![],
        evidence: vec![],
        last_commit: Commit::empty(),
    }
}

#[test]
fn test_peek_two_blocks_at_pipeline_offsets() {
    let pool = BlockPool::new(10, 2);
    pool.set_peer_height("peer1", 20);

    pool.add_block("peer1", make_block(10));
    let (first, second) = pool.peek_two_blocks();
    assert_eq!(first.map(|b| b.header.height), Some(10));
    assert!(second.is_none(), "second peek needs height + len_ulb");

    pool.add_block("peer1", make_block(11));
    let (_, second) = pool.peek_two_blocks();
    assert!(second.is_none(), "height 11 is not the justifying block");

    pool.add_block("peer1", make_block(12));
    let (first, second) = pool.peek_two_blocks();
    assert_eq!(first.map(|b| b.header.height), Some(10));
    assert_eq!(second.map(|b| b.header.height), Some(12));
}

#[test]
fn test_pop_advances_cursor() {
    let pool = BlockPool::new(5, 1);
    pool.set_peer_height("peer1", 10);
    pool.add_block("peer1", make_block(5));
    pool.add_block("peer1", make_block(6));

    assert_eq!(pool.pop_request().map(|b| b.header.height), Some(5));
    assert_eq!(pool.height(), 6);

    let (first, second) = pool.peek_two_blocks();
    assert_eq!(first.map(|b| b.header.height), Some(6));
    assert!(second.is_none());
}

#[test]
fn test_stale_blocks_rejected() {
    let pool = BlockPool::new(5, 1);
    pool.set_peer_height("peer1", 10);
    assert!(!pool.add_block("peer1", make_block(4)), "below the cursor");
    assert!(pool.add_block("peer1", make_block(5)));
}

#[test]
fn test_redo_request_drops_block_and_names_peer() {
    let pool = BlockPool::new(5, 1);
    pool.set_peer_height("bad-peer", 10);
    pool.add_block("bad-peer", make_block(5));

    assert_eq!(pool.redo_request(5).as_deref(), Some("bad-peer"));
    let (first, _) = pool.peek_two_blocks();
    assert!(first.is_none());
}

#[test]
fn test_caught_up_requires_peers() {
    let pool = BlockPool::new(100, 1);
    assert!(!pool.is_caught_up(), "no peers means not caught up");
}

/// Syncing H needs block H + len_ulb to verify its commit, so caught-up
/// tolerates a gap of len_ulb behind the best peer.
#[test]
fn test_caught_up_within_pipeline_window() {
    let pool = BlockPool::new(99, 2);
    pool.set_peer_height("peer1", 101);
    assert!(pool.is_caught_up(), "99 >= 101 - 2");

    pool.set_peer_height("peer2", 120);
    assert!(!pool.is_caught_up(), "99 < 120 - 2");
}

#[test]
fn test_remove_peer_drops_its_blocks() {
    let pool = BlockPool::new(5, 1);
    pool.set_peer_height("peer1", 10);
    pool.set_peer_height("peer2", 8);
    pool.add_block("peer1", make_block(5));

    pool.remove_peer("peer1");
    let (first, _) = pool.peek_two_blocks();
    assert!(first.is_none());
    assert_eq!(pool.max_peer_height(), 8);
}
