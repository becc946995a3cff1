use serde::{Deserialize, Serialize};

use crate::crypto::hash::sha256;
use crate::types::{
    Address, CommitSig, DuplicateVoteEvidence, Hash, PartSet, PartSetHeader,
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Hash,
    pub parts_header: PartSetHeader,
}

impl BlockId {
    pub fn zero() -> Self {
        Self {
            hash: Hash::ZERO,
            parts_header: PartSetHeader {
                total: 0,
                hash: Hash::ZERO,
            },
        }
    }

    pub fn is_zero(&self) -> bool {
        self.hash.is_zero() && self.parts_header.is_zero()
    }
}

/// More-than-two-thirds precommit justification for a block. Entries are
/// indexed by validator position in the set that produced them; None marks an
/// absent or nil precommit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    pub precommits: Vec<Option<CommitSig>>,
}

impl Commit {
    pub fn empty() -> Self {
        Self {
            block_id: BlockId::zero(),
            precommits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.precommits.is_empty()
    }

    pub fn height(&self) -> Option<u64> {
        self.precommits
            .iter()
            .flatten()
            .next()
            .map(|cs| cs.height)
    }

    pub fn round(&self) -> Option<u32> {
        self.precommits.iter().flatten().next().map(|cs| cs.round)
    }

    pub fn hash(&self) -> Hash {
        if self.precommits.is_empty() {
            return Hash::ZERO;
        }
        let bytes = serde_json::to_vec(self).expect("commit serialize");
        sha256(&bytes)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u64,
    pub chain_id: String,
    pub height: u64,
    pub time_ms: u64,
    pub num_txs: u64,
    pub prev_block_id: BlockId,
    pub last_commit_hash: Hash,
    pub data_hash: Hash,
    pub validators_hash: Hash,
    pub next_validators_hash: Hash,
    pub consensus_hash: Hash,
    /// Application digest of height H - len_ulb.
    pub app_hash: Hash,
    /// Results digest of height H - len_ulb.
    pub last_results_hash: Hash,
    pub evidence_hash: Hash,
    pub proposer_address: Address,
}

impl Header {
    pub fn hash(&self) -> Hash {
        let bytes = serde_json::to_vec(self).expect("header serialize");
        sha256(&bytes)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("wrong num_txs: header says {header}, block has {actual}")]
    WrongNumTxs { header: u64, actual: u64 },
    #[error("wrong data hash")]
    WrongDataHash,
    #[error("wrong last commit hash")]
    WrongLastCommitHash,
    #[error("wrong evidence hash")]
    WrongEvidenceHash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Vec<u8>>,
    pub evidence: Vec<DuplicateVoteEvidence>,
    pub last_commit: Commit,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn block_id(&self, parts_header: PartSetHeader) -> BlockId {
        BlockId {
            hash: self.hash(),
            parts_header,
        }
    }

    pub fn make_part_set(&self) -> PartSet {
        let bytes = serde_json::to_vec(self).expect("block serialize");
        PartSet::from_data(&bytes)
    }

    pub fn compute_data_hash(txs: &[Vec<u8>]) -> Hash {
        if txs.is_empty() {
            return Hash::ZERO;
        }
        let mut bytes = Vec::new();
        for tx in txs {
            bytes.extend_from_slice(&(tx.len() as u32).to_be_bytes());
            bytes.extend_from_slice(tx);
        }
        sha256(&bytes)
    }

    pub fn compute_evidence_hash(evidence: &[DuplicateVoteEvidence]) -> Hash {
        if evidence.is_empty() {
            return Hash::ZERO;
        }
        let bytes = serde_json::to_vec(evidence).expect("evidence serialize");
        sha256(&bytes)
    }

    /// Internal consistency: the header's derived hashes and counts match the
    /// block's contents.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.header.num_txs != self.txs.len() as u64 {
            return Err(BlockError::WrongNumTxs {
                header: self.header.num_txs,
                actual: self.txs.len() as u64,
            });
        }
        if self.header.data_hash != Self::compute_data_hash(&self.txs) {
            return Err(BlockError::WrongDataHash);
        }
        if self.header.last_commit_hash != self.last_commit.hash() {
            return Err(BlockError::WrongLastCommitHash);
        }
        if self.header.evidence_hash != Self::compute_evidence_hash(&self.evidence) {
            return Err(BlockError::WrongEvidenceHash);
        }
        Ok(())
    }

    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(0)
    }
}

/// Approximate on-disk footprint of one evidence record, used to bound
/// evidence per block from the block size limit.
const MAX_EVIDENCE_BYTES: u64 = 512;

pub fn max_evidence_per_block(max_block_bytes: u64) -> u64 {
    (max_block_bytes / 10).max(MAX_EVIDENCE_BYTES) / MAX_EVIDENCE_BYTES
}

/// Stored alongside each committed block; enough to link and verify without
/// loading the full block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub header: Header,
}

impl BlockMeta {
    pub fn new(block_id: BlockId, header: Header) -> Self {
        Self { block_id, header }
    }
}
