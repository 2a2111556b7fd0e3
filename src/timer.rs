//! Silence Timer
//!
//! MS/TP timing is built on a single notion: milliseconds of silence since
//! the last octet was seen on the wire, in either direction. The timer is
//! monotonic, so wall-clock adjustments cannot break token timing, and it is
//! shared between the receive path (reset on every received octet), the
//! transmit path (reset after the last stop bit) and the master state
//! machine (threshold checks).

use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Shared monotonic silence timer.
#[derive(Debug, Clone)]
pub struct SilenceTimer {
    last_octet: Arc<Mutex<Instant>>,
}

impl SilenceTimer {
    /// Start a timer; silence begins accumulating immediately.
    pub fn new() -> Self {
        Self {
            last_octet: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Milliseconds since the last reset, saturating at `u32::MAX`.
    pub fn elapsed_ms(&self) -> u32 {
        let last = *self.last_octet.lock().unwrap();
        last.elapsed().as_millis().min(u32::MAX as u128) as u32
    }

    /// Reset to "an octet was just seen".
    pub fn reset(&self) {
        *self.last_octet.lock().unwrap() = Instant::now();
    }
}

impl Default for SilenceTimer {
    fn default() -> Self {
        Self::new()
    }
}
