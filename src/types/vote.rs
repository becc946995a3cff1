use serde::{Deserialize, Serialize};

use crate::types::{Address, BlockId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

/// A single signed vote. `block_id == None` is a nil vote.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    pub block_id: Option<BlockId>,
    pub timestamp_ms: u64,
    pub validator_address: Address,
    pub validator_index: u32,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Canonical signing payload. Field order is part of the persisted format.
#[derive(Serialize)]
struct CanonicalVote<'a> {
    chain_id: &'a str,
    vote_type: VoteType,
    height: u64,
    round: u32,
    block_id: &'a Option<BlockId>,
    timestamp_ms: u64,
}

impl Vote {
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let canonical = CanonicalVote {
            chain_id,
            vote_type: self.vote_type,
            height: self.height,
            round: self.round,
            block_id: &self.block_id,
            timestamp_ms: self.timestamp_ms,
        };
        serde_json::to_vec(&canonical).expect("canonical vote serialize")
    }

    pub fn is_nil(&self) -> bool {
        self.block_id.is_none()
    }
}

/// A precommit folded into a block's LastCommit. The vote type and validator
/// index are implied by position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSig {
    pub validator_address: Address,
    pub height: u64,
    pub round: u32,
    pub block_id: Option<BlockId>,
    pub timestamp_ms: u64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl CommitSig {
    pub fn from_vote(vote: &Vote) -> Self {
        Self {
            validator_address: vote.validator_address,
            height: vote.height,
            round: vote.round,
            block_id: vote.block_id.clone(),
            timestamp_ms: vote.timestamp_ms,
            signature: vote.signature.clone(),
        }
    }

    pub fn to_vote(&self, vote_type: VoteType, validator_index: u32) -> Vote {
        Vote {
            vote_type,
            height: self.height,
            round: self.round,
            block_id: self.block_id.clone(),
            timestamp_ms: self.timestamp_ms,
            validator_address: self.validator_address,
            validator_index,
            signature: self.signature.clone(),
        }
    }
}
