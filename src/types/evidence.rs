use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;
use crate::types::{Address, Vote};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EvidenceError {
    #[error("evidence from height {evidence_height} is too old; min height is {min_height}")]
    Stale {
        evidence_height: u64,
        min_height: u64,
    },
    #[error("address {address} was not a validator at height {height}")]
    NotAValidator { address: Address, height: u64 },
    #[error("votes are not for the same height/round/type")]
    MismatchedVotes,
    #[error("votes are for the same block")]
    SameBlockId,
    #[error("evidence public key does not match the vote addresses")]
    WrongAddress,
    #[error("bad signature on evidence vote")]
    BadSignature,
}

/// Proof that one validator signed two conflicting votes at the same
/// (height, round, type).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    pub pub_key: PublicKey,
    pub vote_a: Vote,
    pub vote_b: Vote,
}

impl DuplicateVoteEvidence {
    pub fn height(&self) -> u64 {
        self.vote_a.height
    }

    pub fn address(&self) -> Address {
        self.vote_a.validator_address
    }

    /// Internal consistency plus both signatures under the accused key.
    pub fn verify(&self, chain_id: &str) -> Result<(), EvidenceError> {
        let (a, b) = (&self.vote_a, &self.vote_b);
        if a.height != b.height || a.round != b.round || a.vote_type != b.vote_type {
            return Err(EvidenceError::MismatchedVotes);
        }
        if a.block_id == b.block_id {
            return Err(EvidenceError::SameBlockId);
        }
        let address = self.pub_key.address();
        if a.validator_address != address || b.validator_address != address {
            return Err(EvidenceError::WrongAddress);
        }
        if !self.pub_key.verify(&a.sign_bytes(chain_id), &a.signature) {
            return Err(EvidenceError::BadSignature);
        }
        if !self.pub_key.verify(&b.sign_bytes(chain_id), &b.signature) {
            return Err(EvidenceError::BadSignature);
        }
        Ok(())
    }
}
