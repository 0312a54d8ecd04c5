//! Per-peripheral RSSI polling timers
//! At most one timer per identity. Starting a timer for an identity that
//! already has one cancels the old timer first.

use std::collections::HashMap;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::events::TimerEvent;
use crate::core::bluetooth::types::{PeripheralId, PollingPolicy};

struct PollTimer {
    generation: u64,
    cancel_token: CancellationToken,
}

pub struct RssiPoller {
    timers: HashMap<PeripheralId, PollTimer>,
    next_generation: u64,
    ticks: mpsc::UnboundedSender<TimerEvent>,
}

impl RssiPoller {
    pub(crate) fn new(ticks: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            timers: HashMap::new(),
            next_generation: 0,
            ticks,
        }
    }

    /// Starts polling `id` every `policy.interval()` until `policy.timeout()` elapses
    pub fn start(&mut self, id: &PeripheralId, policy: PollingPolicy) {
        self.cancel(id);
        if policy.interval_secs == 0 {
            warn!("Ignoring RSSI polling for {} with a zero interval", id);
            return;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel_token = CancellationToken::new();
        self.timers.insert(
            id.clone(),
            PollTimer {
                generation,
                cancel_token: cancel_token.clone(),
            },
        );

        let ticks = self.ticks.clone();
        let peripheral = id.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let deadline = start + policy.timeout();
            let mut ticker = interval_at(start + policy.interval(), policy.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => {
                        debug!("RSSI polling for {} cancelled", peripheral);
                        break;
                    }
                    _ = sleep_until(deadline) => {
                        let _ = ticks.send(TimerEvent::PollExpired {
                            peripheral: peripheral.clone(),
                            generation,
                        });
                        break;
                    }
                    _ = ticker.tick() => {
                        let tick = TimerEvent::PollTick {
                            peripheral: peripheral.clone(),
                            generation,
                        };
                        if ticks.send(tick).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        info!(
            "Polling RSSI for {} every {}s for {}s",
            id, policy.interval_secs, policy.timeout_secs
        );
    }

    /// Stops polling `id`. Returns whether a timer was running.
    pub fn cancel(&mut self, id: &PeripheralId) -> bool {
        match self.timers.remove(id) {
            Some(timer) => {
                timer.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.cancel_token.cancel();
        }
    }

    pub fn is_active(&self, id: &PeripheralId) -> bool {
        self.timers.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    /// Whether a tick of `generation` comes from the live timer for `id`
    pub fn accepts(&self, id: &PeripheralId, generation: u64) -> bool {
        self.timers
            .get(id)
            .is_some_and(|timer| timer.generation == generation)
    }

    /// Forgets the timer for `id` once it has run out. Returns false for a
    /// stale expiry of a timer that was already replaced or cancelled.
    pub fn expire(&mut self, id: &PeripheralId, generation: u64) -> bool {
        if !self.accepts(id, generation) {
            return false;
        }
        self.timers.remove(id);
        info!("RSSI polling for {} timed out", id);
        true
    }
}

impl Drop for RssiPoller {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
