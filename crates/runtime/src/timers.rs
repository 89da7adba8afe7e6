//! Timer management for the consensus service.
//!
//! Each armed timer is a tokio task that sleeps and then pushes the matching
//! event into the service's timer channel. Timers get a dedicated channel so
//! a network flood can never starve the view timeout.

use palisade_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Consensus => Event::ConsensusTimer,
        TimerId::Recovery => Event::RecoveryTimer,
    }
}

/// Owns the active timer tasks.
pub struct TimerManager {
    timers: HashMap<TimerId, JoinHandle<()>>,
    timer_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(timer_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            timer_tx,
        }
    }

    /// Arm a timer. Re-arming an active id replaces it.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);

        let timer_tx = self.timer_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(?id, "timer fired");
            let _ = timer_tx.send(timer_event(id)).await;
        });
        self.timers.insert(id, handle);
        debug!(?id, ?duration, "timer set");
    }

    /// Disarm a timer. A no-op if it already fired or was never set.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            debug!(?id, "timer cancelled");
        }
    }

    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "timer cancelled (shutdown)");
        }
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
