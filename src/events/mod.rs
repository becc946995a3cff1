use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::consensus::round_state::RoundStepEvent;
use crate::types::{Address, BlockId, Vote};

/// Everything the engine announces to the outside (reactors, websocket
/// subscribers). Broadcasting of our own votes and proposals rides on these.
#[derive(Clone, Debug)]
pub enum Event {
    NewRoundStep(RoundStepEvent),
    NewRound {
        height: u64,
        round: u32,
        proposer: Address,
    },
    CompleteProposal {
        height: u64,
        round: u32,
        block_id: BlockId,
    },
    Polka { height: u64, round: u32 },
    Relock { height: u64, round: u32 },
    Lock { height: u64, round: u32 },
    Unlock { height: u64, round: u32 },
    ValidBlock { height: u64, round: u32 },
    Vote(Vote),
    TimeoutPropose { height: u64, round: u32 },
    TimeoutWait { height: u64, round: u32 },
}

/// Fan-out bus. Publishing is best effort: subscribers that went away are
/// dropped on the next publish.
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: Event) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
