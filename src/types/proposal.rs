use serde::{Deserialize, Serialize};

use crate::types::BlockId;

/// Block proposal for a (height, round). `pol_round` is -1 unless the
/// proposed block already gathered a polka in an earlier round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub pol_round: i32,
    pub block_id: BlockId,
    pub timestamp_ms: u64,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct CanonicalProposal<'a> {
    chain_id: &'a str,
    height: u64,
    round: u32,
    pol_round: i32,
    block_id: &'a BlockId,
    timestamp_ms: u64,
}

impl Proposal {
    pub fn new(height: u64, round: u32, pol_round: i32, block_id: BlockId, timestamp_ms: u64) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp_ms,
            signature: Vec::new(),
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let canonical = CanonicalProposal {
            chain_id,
            height: self.height,
            round: self.round,
            pol_round: self.pol_round,
            block_id: &self.block_id,
            timestamp_ms: self.timestamp_ms,
        };
        serde_json::to_vec(&canonical).expect("canonical proposal serialize")
    }
}
