use std::collections::BTreeMap;

use crate::types::{
    BlockId, Commit, CommitSig, DuplicateVoteEvidence, ValidatorSet, Vote, VoteType,
};

#[derive(Debug, thiserror::Error)]
pub enum VoteSetError {
    #[error("vote height {got}, expected {expected}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("vote round {got}, expected {expected}")]
    RoundMismatch { expected: u32, got: u32 },
    #[error("vote type {got:?}, expected {expected:?}")]
    TypeMismatch { expected: VoteType, got: VoteType },
    #[error("validator index {index} out of range")]
    InvalidValidatorIndex { index: u32 },
    #[error("validator address does not match index {index}")]
    InvalidValidatorAddress { index: u32 },
    #[error("invalid vote signature")]
    InvalidSignature,
    #[error("conflicting votes from validator {}", .0.address())]
    Conflicting(Box<DuplicateVoteEvidence>),
}

/// Signed votes of one (height, round, type), tallied by voting power.
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: ValidatorSet,
    votes: Vec<Option<Vote>>,
    sum: u64,
    votes_by_block: BTreeMap<Option<BlockId>, u64>,
    maj23: Option<Option<BlockId>>,
}

impl VoteSet {
    pub fn new(
        chain_id: &str,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        let n = validators.len();
        Self {
            chain_id: chain_id.to_string(),
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; n],
            sum: 0,
            votes_by_block: BTreeMap::new(),
            maj23: None,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn votes(&self) -> &[Option<Vote>] {
        &self.votes
    }

    /// Verify and tally one vote. Returns Ok(false) for an exact duplicate;
    /// a second vote for a different block at the same slot is an
    /// equivocation and yields `Conflicting` evidence.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height {
            return Err(VoteSetError::HeightMismatch {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.round != self.round {
            return Err(VoteSetError::RoundMismatch {
                expected: self.round,
                got: vote.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::TypeMismatch {
                expected: self.vote_type,
                got: vote.vote_type,
            });
        }

        let index = vote.validator_index;
        let Some(val) = self.validators.get_by_index(index) else {
            return Err(VoteSetError::InvalidValidatorIndex { index });
        };
        if val.address != vote.validator_address {
            return Err(VoteSetError::InvalidValidatorAddress { index });
        }
        if !val
            .pub_key
            .verify(&vote.sign_bytes(&self.chain_id), &vote.signature)
        {
            return Err(VoteSetError::InvalidSignature);
        }

        if let Some(existing) = &self.votes[index as usize] {
            if existing.block_id == vote.block_id {
                return Ok(false);
            }
            return Err(VoteSetError::Conflicting(Box::new(DuplicateVoteEvidence {
                pub_key: val.pub_key,
                vote_a: existing.clone(),
                vote_b: vote,
            })));
        }

        let power = val.voting_power;
        self.sum = self.sum.saturating_add(power);
        let tally = self
            .votes_by_block
            .entry(vote.block_id.clone())
            .or_insert(0);
        *tally = tally.saturating_add(power);
        if *tally >= self.validators.quorum_threshold() && self.maj23.is_none() {
            self.maj23 = Some(vote.block_id.clone());
        }
        self.votes[index as usize] = Some(vote);
        Ok(true)
    }

    pub fn get(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(|v| v.as_ref())
    }

    /// `Some(Some(id))`: +2/3 for a block. `Some(None)`: +2/3 for nil.
    /// `None`: no majority yet.
    pub fn two_thirds_majority(&self) -> Option<Option<BlockId>> {
        self.maj23.clone()
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    pub fn has_two_thirds_any(&self) -> bool {
        self.sum >= self.validators.quorum_threshold()
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_power()
    }

    /// Build the commit for the majority block. Callable only once +2/3
    /// precommitted a non-nil block.
    pub fn make_commit(&self) -> Commit {
        let block_id = match &self.maj23 {
            Some(Some(id)) => id.clone(),
            _ => panic!("make_commit requires +2/3 precommits for a block"),
        };
        let precommits = self
            .votes
            .iter()
            .map(|v| match v {
                Some(vote) if vote.block_id.as_ref() == Some(&block_id) => {
                    Some(CommitSig::from_vote(vote))
                }
                _ => None,
            })
            .collect();
        Commit {
            block_id,
            precommits,
        }
    }

    /// Rebuild the precommit set that produced `commit` (used to reconstruct
    /// the pipeline's LastCommit after a restart).
    pub fn from_commit(
        chain_id: &str,
        height: u64,
        commit: &Commit,
        validators: &ValidatorSet,
    ) -> Result<VoteSet, VoteSetError> {
        let mut set = VoteSet::new(
            chain_id,
            height,
            commit.round().unwrap_or(0),
            VoteType::Precommit,
            validators.clone(),
        );
        for (index, sig) in commit.precommits.iter().enumerate() {
            let Some(cs) = sig else { continue };
            let vote = cs.to_vote(VoteType::Precommit, index as u32);
            set.add_vote(vote)?;
        }
        Ok(set)
    }
}
