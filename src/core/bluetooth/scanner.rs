//! Scan duration timer
//! A scan runs for a fixed time to bound radio and battery usage. The timer
//! only reports expiry; stopping the adapter scan is the manager's job.

use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::events::TimerEvent;

pub struct ScanTimer {
    duration: Duration,
    generation: u64,
    active: bool,
    cancel_token: CancellationToken,
    timers: mpsc::UnboundedSender<TimerEvent>,
}

impl ScanTimer {
    pub(crate) fn new(duration: Duration, timers: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            duration,
            generation: 0,
            active: false,
            cancel_token: CancellationToken::new(),
            timers,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Starts a new countdown, replacing any running one
    pub fn start(&mut self) {
        self.cancel();
        self.generation += 1;
        self.active = true;
        self.cancel_token = CancellationToken::new();

        let cancel_token = self.cancel_token.clone();
        let timers = self.timers.clone();
        let generation = self.generation;
        let duration = self.duration;

        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(duration) => {
                    debug!("Scan timer {} expired", generation);
                    let _ = timers.send(TimerEvent::ScanTimeout { generation });
                }
                _ = cancel_token.cancelled() => {
                    debug!("Scan timer {} cancelled", generation);
                }
            }
        });
        info!("Scan timer started for {:?}", self.duration);
    }

    pub fn cancel(&mut self) {
        if self.active {
            self.cancel_token.cancel();
            self.active = false;
        }
    }

    /// Accepts the timeout for `generation` if it belongs to the running countdown
    pub fn finish(&mut self, generation: u64) -> bool {
        if self.active && generation == self.generation {
            self.active = false;
            true
        } else {
            false
        }
    }
}

impl Drop for ScanTimer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
