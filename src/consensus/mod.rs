pub mod messages;
pub mod round_state;
pub mod vote_set;
pub mod height_vote_set;
pub mod ticker;
pub mod replay;
pub mod state;

pub use messages::{ConsensusMessage, MsgInfo, TimeoutInfo};
pub use round_state::{RoundState, Step};
pub use state::{ConsensusConfig, ConsensusError, ConsensusMsgError, ConsensusState};
