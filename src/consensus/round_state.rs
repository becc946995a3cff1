use serde::{Deserialize, Serialize};

use crate::consensus::height_vote_set::HeightVoteSet;
use crate::consensus::vote_set::VoteSet;
use crate::types::{Block, PartSet, Proposal, ValidatorSet};

/// Steps of the per-height round machine, in transition order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Step {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

/// Everything one in-flight height owns. Created when the height enters the
/// live window, destroyed len_ulb heights after it finalizes.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    pub start_time_ms: u64,

    pub validators: ValidatorSet,

    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,

    pub locked_round: Option<u32>,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,

    /// Most recent block that reached a polka in any round; seeds future
    /// proposals.
    pub valid_round: Option<u32>,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,

    pub votes: HeightVoteSet,

    pub commit_round: Option<u32>,
    pub commit_time_ms: Option<u64>,

    /// Precommits of the ULB height, embedded as this block's LastCommit.
    pub last_commit: Option<VoteSet>,
    pub last_validators: Option<ValidatorSet>,

    pub triggered_timeout_precommit: bool,
}

/// Round-step announcement, written to the WAL and published on the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStepEvent {
    pub height: u64,
    pub round: u32,
    pub step: Step,
}

impl RoundState {
    pub fn new(
        chain_id: &str,
        height: u64,
        validators: ValidatorSet,
        start_time_ms: u64,
    ) -> Self {
        let votes = HeightVoteSet::new(chain_id, height, validators.clone());
        Self {
            height,
            round: 0,
            step: Step::NewHeight,
            start_time_ms,
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: None,
            locked_block: None,
            locked_block_parts: None,
            valid_round: None,
            valid_block: None,
            valid_block_parts: None,
            votes,
            commit_round: None,
            commit_time_ms: None,
            last_commit: None,
            last_validators: None,
            triggered_timeout_precommit: false,
        }
    }

    pub fn round_step_event(&self) -> RoundStepEvent {
        RoundStepEvent {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }
}
