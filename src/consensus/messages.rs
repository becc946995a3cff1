use serde::{Deserialize, Serialize};

use crate::consensus::round_state::Step;
use crate::types::{Part, Proposal, Vote};

/// The three inputs that can drive a height's state machine, as received
/// from peers or produced by this node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    BlockPart { height: u64, round: u32, part: Part },
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn height(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal(p) => p.height,
            ConsensusMessage::BlockPart { height, .. } => *height,
            ConsensusMessage::Vote(v) => v.height,
        }
    }

    pub fn round(&self) -> u32 {
        match self {
            ConsensusMessage::Proposal(p) => p.round,
            ConsensusMessage::BlockPart { round, .. } => *round,
            ConsensusMessage::Vote(v) => v.round,
        }
    }
}

/// Message plus provenance. An empty peer id marks a self-originated message,
/// which gets the synchronous WAL treatment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer_id: String,
}

impl MsgInfo {
    pub fn internal(msg: ConsensusMessage) -> Self {
        Self {
            msg,
            peer_id: String::new(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.peer_id.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    pub duration_ms: u64,
    pub height: u64,
    pub round: u32,
    pub step: Step,
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}ms ; {}/{} {:?}",
            self.duration_ms, self.height, self.round, self.step
        )
    }
}
