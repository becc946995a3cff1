//! WAL framing, durability, and replay-boundary tests.

use pipebft::consensus::replay::suffix_for_height;
use pipebft::consensus::round_state::RoundStepEvent;
use pipebft::consensus::{ConsensusMessage, MsgInfo, Step, TimeoutInfo};
use pipebft::storage::{Wal, WalError, WalRecord};
use pipebft::types::{BlockId, Hash, PartSetHeader, Vote, VoteType};

fn temp_wal_path(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("pipebft_test_wal");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.wal", name));
    let _ = std::fs::remove_file(&path);
    path
}

fn vote_record(height: u64, round: u32) -> WalRecord {
    WalRecord::Message(MsgInfo {
        msg: ConsensusMessage::Vote(Vote {
            vote_type: VoteType::Prevote,
            height,
            round,
            block_id: Some(BlockId {
                hash: Hash([7u8; 32]),
                parts_header: PartSetHeader {
                    total: 1,
                    hash: Hash([7u8; 32]),
                },
            }),
            timestamp_ms: 42,
            validator_address: pipebft::types::Address::ZERO,
            validator_index: 0,
            signature: vec![1, 2, 3],
        }),
        peer_id: String::new(),
    })
}

#[test]
fn test_wal_write_and_read_round_trip() {
    let path = temp_wal_path("round_trip");
    let mut wal = Wal::open(&path).unwrap();

    let records = vec![
        WalRecord::RoundStep(RoundStepEvent {
            height: 1,
            round: 0,
            step: Step::NewHeight,
        }),
        vote_record(1, 0),
        WalRecord::Timeout(TimeoutInfo {
            duration_ms: 1000,
            height: 1,
            round: 0,
            step: Step::Propose,
        }),
        WalRecord::EndHeight(1),
    ];
    for r in &records {
        wal.write(r).unwrap();
    }
    wal.flush_and_sync().unwrap();
    drop(wal);

    let read = Wal::read_all(&path).unwrap();
    assert_eq!(read, records);
}

#[test]
fn test_wal_read_nonexistent_is_empty() {
    let path = std::env::temp_dir().join("pipebft_wal_does_not_exist_12345.wal");
    let records = Wal::read_all(&path).unwrap();
    assert!(records.is_empty());
}

#[test]
fn test_wal_write_sync_survives_reopen() {
    let path = temp_wal_path("sync");
    let mut wal = Wal::open(&path).unwrap();
    wal.write_sync(&vote_record(3, 1)).unwrap();
    drop(wal);

    // Append more through a fresh handle; both batches must be visible.
    let mut wal = Wal::open(&path).unwrap();
    wal.write_sync(&WalRecord::EndHeight(3)).unwrap();
    drop(wal);

    let read = Wal::read_all(&path).unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(read[1], WalRecord::EndHeight(3));
}

#[test]
fn test_wal_torn_tail_is_tolerated() {
    let path = temp_wal_path("torn_tail");
    let mut wal = Wal::open(&path).unwrap();
    wal.write(&vote_record(1, 0)).unwrap();
    wal.write(&WalRecord::EndHeight(1)).unwrap();
    wal.flush_and_sync().unwrap();
    drop(wal);

    // Simulate a crash mid-write: a truncated trailing line.
    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("deadbeef");
    std::fs::write(&path, contents).unwrap();

    let read = Wal::read_all(&path).unwrap();
    assert_eq!(read.len(), 2, "torn tail is dropped, prefix survives");
}

#[test]
fn test_wal_mid_file_corruption_refuses() {
    let path = temp_wal_path("mid_corrupt");
    let mut wal = Wal::open(&path).unwrap();
    wal.write(&vote_record(1, 0)).unwrap();
    wal.write(&vote_record(1, 1)).unwrap();
    wal.flush_and_sync().unwrap();
    drop(wal);

    // Flip a byte in the first line.
    let contents = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = contents.lines().map(|s| s.to_string()).collect();
    let flipped = if lines[0].as_bytes()[10] == b'0' { "1" } else { "0" };
    lines[0].replace_range(10..11, flipped);
    std::fs::write(&path, lines.join("\n")).unwrap();

    let err = Wal::read_all(&path).unwrap_err();
    assert!(matches!(err, WalError::DataCorruption));
}

#[test]
fn test_records_since_last_end_height() {
    let path = temp_wal_path("since_end");
    let mut wal = Wal::open(&path).unwrap();
    wal.write(&vote_record(1, 0)).unwrap();
    wal.write(&WalRecord::EndHeight(1)).unwrap();
    wal.write(&vote_record(2, 0)).unwrap();
    wal.write(&WalRecord::EndHeight(2)).unwrap();
    wal.write(&vote_record(3, 0)).unwrap();
    wal.write(&vote_record(3, 1)).unwrap();
    wal.flush_and_sync().unwrap();
    drop(wal);

    let (next_height, suffix) = Wal::records_since_last_end_height(&path).unwrap();
    assert_eq!(next_height, 3);
    assert_eq!(suffix.len(), 2);
    assert_eq!(suffix[0], vote_record(3, 0));
}

#[test]
fn test_suffix_for_height_selects_after_marker() {
    let records = vec![
        vote_record(1, 0),
        WalRecord::EndHeight(1),
        vote_record(2, 0),
    ];
    let suffix = suffix_for_height(records, 2).unwrap();
    assert_eq!(suffix, vec![vote_record(2, 0)]);
}

#[test]
fn test_suffix_for_height_fresh_chain() {
    let records = vec![vote_record(1, 0), vote_record(1, 1)];
    let suffix = suffix_for_height(records, 1).unwrap();
    assert_eq!(suffix.len(), 2);

    // Empty WAL at any height replays nothing.
    let suffix = suffix_for_height(Vec::new(), 17).unwrap();
    assert!(suffix.is_empty());
}

#[test]
fn test_suffix_for_height_stale_marker_is_ignored() {
    // Already committed past the requested height: nothing to replay.
    let records = vec![WalRecord::EndHeight(5)];
    let suffix = suffix_for_height(records, 4).unwrap();
    assert!(suffix.is_empty());
}

#[test]
fn test_suffix_for_height_missing_marker_refuses() {
    let records = vec![vote_record(1, 0), WalRecord::EndHeight(1)];
    // Wants EndHeight(3), the WAL only proves EndHeight(1).
    let err = suffix_for_height(records, 4).unwrap_err();
    assert!(matches!(err, WalError::DataCorruption));
}
