//! Pulse-once readiness signals.
//!
//! Acquirer read/write availability and transaction flush completion are all
//! "pulsed exactly once, observed by anyone" conditions. Pulsing is
//! idempotent so the wait-queue walk may re-pulse freely.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

pub struct Signal {
    pulsed: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Signal {
            pulsed: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn pulse(&self) {
        let mut pulsed = self.pulsed.lock();
        if !*pulsed {
            *pulsed = true;
            self.cv.notify_all();
        }
    }

    pub fn is_pulsed(&self) -> bool {
        *self.pulsed.lock()
    }

    pub fn wait(&self) {
        let mut pulsed = self.pulsed.lock();
        while !*pulsed {
            self.cv.wait(&mut pulsed);
        }
    }

    /// Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pulsed = self.pulsed.lock();
        if *pulsed {
            return true;
        }
        self.cv.wait_for(&mut pulsed, timeout);
        *pulsed
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::new()
    }
}
