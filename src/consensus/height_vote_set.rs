use std::collections::BTreeMap;

use crate::consensus::vote_set::{VoteSet, VoteSetError};
use crate::types::{BlockId, ValidatorSet, Vote, VoteType};

#[derive(Clone, Debug)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// All vote sets of one height, keyed by round. Rounds are materialized up to
/// current+1 by `set_round`, and on demand when a vote for a later round
/// arrives (that is what makes round-skipping observable).
#[derive(Clone, Debug)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: ValidatorSet,
    round: u32,
    round_vote_sets: BTreeMap<u32, RoundVoteSet>,
}

impl HeightVoteSet {
    pub fn new(chain_id: &str, height: u64, validators: ValidatorSet) -> Self {
        let mut hvs = Self {
            chain_id: chain_id.to_string(),
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
        };
        hvs.ensure_round(0);
        hvs.ensure_round(1);
        hvs
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    fn ensure_round(&mut self, round: u32) {
        if self.round_vote_sets.contains_key(&round) {
            return;
        }
        let rvs = RoundVoteSet {
            prevotes: VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                VoteType::Prevote,
                self.validators.clone(),
            ),
            precommits: VoteSet::new(
                &self.chain_id,
                self.height,
                round,
                VoteType::Precommit,
                self.validators.clone(),
            ),
        };
        self.round_vote_sets.insert(round, rvs);
    }

    /// Track all rounds up to `round` + 1.
    pub fn set_round(&mut self, round: u32) {
        for r in 0..=round.saturating_add(1) {
            self.ensure_round(r);
        }
        if round > self.round {
            self.round = round;
        }
    }

    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        self.ensure_round(vote.round);
        let rvs = self
            .round_vote_sets
            .get_mut(&vote.round)
            .expect("round just ensured");
        match vote.vote_type {
            VoteType::Prevote => rvs.prevotes.add_vote(vote),
            VoteType::Precommit => rvs.precommits.add_vote(vote),
        }
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|r| &r.prevotes)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|r| &r.precommits)
    }

    /// Highest round (and block) with a prevote polka, if any.
    pub fn pol_info(&self) -> Option<(u32, Option<BlockId>)> {
        for (round, rvs) in self.round_vote_sets.iter().rev() {
            if let Some(block_id) = rvs.prevotes.two_thirds_majority() {
                return Some((*round, block_id));
            }
        }
        None
    }
}
