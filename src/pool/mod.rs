use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::Block;

/// Fast-sync block pool. Blocks are fetched ahead of the apply cursor, and
/// validated pairwise: the commit for the block at the cursor lives in the
/// block one pipeline window above it.
pub struct BlockPool {
    len_ulb: u64,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    /// Next height to apply.
    height: u64,
    received: BTreeMap<u64, (String, Block)>,
    peers: BTreeMap<String, u64>,
    max_peer_height: u64,
    start_time: Instant,
}

impl BlockPool {
    pub fn new(start_height: u64, len_ulb: u64) -> Self {
        assert!(len_ulb > 0, "pipeline length must be positive");
        Self {
            len_ulb,
            inner: Mutex::new(PoolInner {
                height: start_height,
                received: BTreeMap::new(),
                peers: BTreeMap::new(),
                max_peer_height: 0,
                start_time: Instant::now(),
            }),
        }
    }

    pub fn height(&self) -> u64 {
        self.inner.lock().unwrap().height
    }

    pub fn max_peer_height(&self) -> u64 {
        self.inner.lock().unwrap().max_peer_height
    }

    pub fn set_peer_height(&self, peer_id: &str, height: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.insert(peer_id.to_string(), height);
        if height > inner.max_peer_height {
            inner.max_peer_height = height;
        }
    }

    pub fn remove_peer(&self, peer_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.remove(peer_id);
        inner.received.retain(|_, v| v.0 != peer_id);
        inner.max_peer_height = inner.peers.values().copied().max().unwrap_or(0);
    }

    /// Accept a fetched block if it falls in the window the pool still
    /// needs: [height, max_peer_height].
    pub fn add_block(&self, peer_id: &str, block: Block) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let h = block.header.height;
        if h < inner.height {
            return false;
        }
        inner.received.insert(h, (peer_id.to_string(), block));
        true
    }

    /// The blocks at (height, height + len_ulb). The second block's
    /// LastCommit is the justification for the first, mirroring the live
    /// protocol; the caller verifies it.
    pub fn peek_two_blocks(&self) -> (Option<Block>, Option<Block>) {
        let inner = self.inner.lock().unwrap();
        let first = inner.received.get(&inner.height).map(|(_, b)| b.clone());
        let second = inner
            .received
            .get(&(inner.height + self.len_ulb))
            .map(|(_, b)| b.clone());
        (first, second)
    }

    /// Advance the cursor past a verified first block.
    pub fn pop_request(&self) -> Option<Block> {
        let mut inner = self.inner.lock().unwrap();
        let height = inner.height;
        let popped = inner.received.remove(&height).map(|(_, b)| b);
        if popped.is_some() {
            inner.height += 1;
        }
        popped
    }

    /// Drop the block at `height` (failed verification) so it is re-fetched,
    /// and report which peer served it.
    pub fn redo_request(&self, height: u64) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.received.remove(&height).map(|(peer, _)| peer)
    }

    /// Caught up: at least one peer, and our height is within one pipeline
    /// window of the best peer. Syncing block H needs block H + len_ulb for
    /// its commit, so the last len_ulb heights cannot come from fast-sync.
    pub fn is_caught_up(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.peers.is_empty() {
            return false;
        }
        let received_or_timed_out =
            inner.height > 0 || inner.start_time.elapsed() > Duration::from_secs(5);
        let chain_is_longest = inner.max_peer_height == 0
            || inner.height >= inner.max_peer_height.saturating_sub(self.len_ulb);
        received_or_timed_out && chain_is_longest
    }
}
