//! Pause permit shared between the supervisor path and the data loop
//!
//! The transmit loop parks here before each send while playback is paused.
//! This is the only synchronization primitive shared across the two paths;
//! it is what the live-broadcast override uses to silence the playlist
//! engine. Waits are bounded so a shutdown request is honored quickly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::constants::MAX_SLEEP_GRANULARITY_MILLIS;

pub struct PauseGate {
    paused: Mutex<bool>,
    condvar: Condvar,
}

impl PauseGate {
    pub fn new() -> Self {
        Self {
            paused: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Block further sends. The data loop finishes framing its current
    /// chunk and then parks before the next one.
    pub fn pause(&self) {
        *self.paused.lock() = true;
    }

    /// Release the permit and wake the data loop
    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.condvar.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Park the calling loop while paused. Returns early when the
    /// keep-running flag clears.
    pub fn wait_while_paused(&self, keep_running: &AtomicBool) {
        let mut paused = self.paused.lock();
        while *paused && keep_running.load(Ordering::Acquire) {
            self.condvar.wait_for(
                &mut paused,
                Duration::from_millis(MAX_SLEEP_GRANULARITY_MILLIS),
            );
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}
