use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, never, Receiver, Sender};

use crate::consensus::messages::TimeoutInfo;

/// One timeout ticker per live height. A new schedule replaces the pending
/// one; the fired tock is delivered on the shared aggregated channel, where
/// the dispatcher filters anything stale.
pub struct TimeoutTicker {
    schedule_tx: Sender<TimeoutInfo>,
    stop_tx: Sender<()>,
}

impl TimeoutTicker {
    pub fn new(tock_tx: Sender<TimeoutInfo>) -> Self {
        let (schedule_tx, schedule_rx) = bounded::<TimeoutInfo>(16);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        std::thread::spawn(move || {
            run_ticker(schedule_rx, stop_rx, tock_tx);
        });

        Self {
            schedule_tx,
            stop_tx,
        }
    }

    pub fn schedule(&self, ti: TimeoutInfo) {
        let _ = self.schedule_tx.send(ti);
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

fn run_ticker(
    schedule_rx: Receiver<TimeoutInfo>,
    stop_rx: Receiver<()>,
    tock_tx: Sender<TimeoutInfo>,
) {
    let mut pending: Option<(Instant, TimeoutInfo)> = None;

    loop {
        let timer = match &pending {
            Some((deadline, _)) => crossbeam_channel::at(*deadline),
            None => never(),
        };

        crossbeam_channel::select! {
            recv(schedule_rx) -> msg => match msg {
                Ok(ti) => {
                    let deadline = Instant::now() + Duration::from_millis(ti.duration_ms);
                    pending = Some((deadline, ti));
                }
                Err(_) => return,
            },
            recv(stop_rx) -> _ => return,
            recv(timer) -> _ => {
                if let Some((_, ti)) = pending.take() {
                    if tock_tx.send(ti).is_err() {
                        return;
                    }
                }
            }
        }
    }
}
