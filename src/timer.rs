//! Deadline bookkeeping for the engine and per-packet pacing for UDP streams.

use std::time::{Duration, Instant};

/// A one-shot deadline against the monotonic clock.
///
/// Wall-clock jumps do not affect expiry. The engine treats a zero duration
/// as "never expires" by not arming a timer at all.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
    duration: Duration,
}

impl Timer {
    pub fn new(secs: u64, micros: u32) -> Self {
        Self::from_duration(Duration::new(secs, micros * 1000))
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self {
            start: Instant::now(),
            duration,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.start + self.duration
    }

    /// Re-arm from now with a fresh duration.
    pub fn update(&mut self, secs: u64, micros: u32) {
        self.start = Instant::now();
        self.duration = Duration::new(secs, micros * 1000);
    }

    pub fn remaining(&self) -> Duration {
        (self.start + self.duration).saturating_duration_since(Instant::now())
    }
}

/// Gates per-packet emission so a UDP stream hits its target rate.
///
/// For a target of `rate` bits/s and blocks of `blksize` bytes the
/// inter-packet interval is `8 * blksize / rate` seconds.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    interval: Duration,
    next_due: Instant,
}

impl Pacer {
    pub fn new(rate_bits_per_sec: u64, blksize: usize) -> Self {
        let secs = (8 * blksize) as f64 / rate_bits_per_sec as f64;
        Self {
            interval: Duration::from_secs_f64(secs),
            next_due: Instant::now(),
        }
    }

    /// True when the next packet may go out; re-arms the deadline on success.
    pub fn should_send(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.next_due {
            self.next_due = now + self.interval;
            true
        } else {
            false
        }
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
