use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use crate::storage::StoreError;
use crate::types::{Block, BlockMeta, Commit, PartSetHeader};

const CF_BLOCKS: &str = "blocks"; // key: height (u64 BE) -> JSON Block
const CF_METAS: &str = "metas"; // key: height (u64 BE) -> JSON BlockMeta
const CF_SEEN_COMMITS: &str = "seen_commits"; // key: height (u64 BE) -> JSON Commit
const CF_META: &str = "meta"; // key: "height" -> u64 BE

fn height_key(h: u64) -> [u8; 8] {
    h.to_be_bytes()
}

/// Durable height-keyed store of committed blocks, their part-set headers
/// (inside the BlockMeta's BlockId) and the locally seen commits.
///
/// The seen commit justifies a block until block H + len_ulb embeds the
/// canonical one; seen commits older than the pipeline window are dropped on
/// save.
pub struct BlockStore {
    db: DB,
}

impl BlockStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_METAS, Options::default()),
            ColumnFamilyDescriptor::new(CF_SEEN_COMMITS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db })
    }

    /// Max committed height, 0 if empty.
    pub fn height(&self) -> u64 {
        let cf = self.db.cf_handle(CF_META).unwrap();
        match self.db.get_cf(&cf, b"height") {
            Ok(Some(bytes)) if bytes.len() == 8 => u64::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            _ => 0,
        }
    }

    /// Atomically persist a committed block, its meta, and the seen commit.
    pub fn save_block(
        &self,
        block: &Block,
        parts_header: &PartSetHeader,
        seen_commit: &Commit,
        len_ulb: u64,
    ) -> Result<(), StoreError> {
        let height = block.header.height;
        let key = height_key(height);

        let meta = BlockMeta::new(block.block_id(*parts_header), block.header.clone());

        let cf_blocks = self.db.cf_handle(CF_BLOCKS).unwrap();
        let cf_metas = self.db.cf_handle(CF_METAS).unwrap();
        let cf_seen = self.db.cf_handle(CF_SEEN_COMMITS).unwrap();
        let cf_meta = self.db.cf_handle(CF_META).unwrap();

        let mut batch = rocksdb::WriteBatch::default();
        batch.put_cf(&cf_blocks, key, serde_json::to_vec(block)?);
        batch.put_cf(&cf_metas, key, serde_json::to_vec(&meta)?);
        batch.put_cf(&cf_seen, key, serde_json::to_vec(seen_commit)?);
        batch.put_cf(&cf_meta, b"height", key);

        // The canonical commit for this height is now embedded in the block
        // at height + len_ulb, so the seen commit beyond the window can go.
        if height > len_ulb + 1 {
            batch.delete_cf(&cf_seen, height_key(height - len_ulb - 1));
        }

        self.db.write(batch)?;
        Ok(())
    }

    pub fn load_block(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let cf = self.db.cf_handle(CF_BLOCKS).unwrap();
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    pub fn load_block_meta(&self, height: u64) -> Result<Option<BlockMeta>, StoreError> {
        let cf = self.db.cf_handle(CF_METAS).unwrap();
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    pub fn load_seen_commit(&self, height: u64) -> Result<Option<Commit>, StoreError> {
        let cf = self.db.cf_handle(CF_SEEN_COMMITS).unwrap();
        match self.db.get_cf(&cf, height_key(height))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }

    /// The canonical commit for `height`, embedded as the LastCommit of the
    /// block at `height + len_ulb`.
    pub fn load_block_commit(&self, height: u64, len_ulb: u64) -> Result<Option<Commit>, StoreError> {
        match self.load_block(height + len_ulb)? {
            None => Ok(None),
            Some(block) => Ok(Some(block.last_commit)),
        }
    }

    /// Within the pipeline window the local seen commit is the only
    /// justification; beyond it the canonical embedded commit exists.
    pub fn load_commit(&self, height: u64, len_ulb: u64) -> Result<Option<Commit>, StoreError> {
        if self.height().saturating_sub(height) <= len_ulb {
            self.load_seen_commit(height)
        } else {
            self.load_block_commit(height, len_ulb)
        }
    }

    /// Delete everything below `min_height`, keeping the retention window the
    /// pipeline needs. Returns the number of heights pruned.
    pub fn prune_below(&self, min_height: u64) -> Result<u64, StoreError> {
        let cf_blocks = self.db.cf_handle(CF_BLOCKS).unwrap();
        let cf_metas = self.db.cf_handle(CF_METAS).unwrap();
        let cf_seen = self.db.cf_handle(CF_SEEN_COMMITS).unwrap();

        let mut pruned = 0u64;
        for h in 1..min_height {
            let key = height_key(h);
            if self.db.get_cf(&cf_blocks, key)?.is_none() {
                continue;
            }
            let mut batch = rocksdb::WriteBatch::default();
            batch.delete_cf(&cf_blocks, key);
            batch.delete_cf(&cf_metas, key);
            batch.delete_cf(&cf_seen, key);
            self.db.write(batch)?;
            pruned += 1;
        }
        Ok(pruned)
    }
}
