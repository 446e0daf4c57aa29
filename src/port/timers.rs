//! Tick-driven interval timers.
//!
//! No per-timer signal: the engine delivers `tick(delta)` at the minimum
//! resolution (62.5 ms) and expiry is observed through the latching
//! `expired` query.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::time::Duration;

/// Timer identities, one bank entry each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TimerId {
    AnnounceInterval = 0,
    SyncInterval = 1,
    DelayReqInterval = 2,
    PDelayReqInterval = 3,
    AnnounceReceiptTimeout = 4,
    QualificationTimeout = 5,
    ForeignMasterTimeout = 6,
    LeapSecond = 7,
}

pub const TIMER_COUNT: usize = 8;

/// Engine tick granularity.
pub const TICK_RESOLUTION: Duration = Duration::from_micros(62_500);

#[derive(Debug, Clone, Copy, Default)]
struct Timer {
    running: bool,
    /// Reload value; zero means one-shot.
    interval: Duration,
    remaining: Duration,
    fired: bool,
}

/// A bank of interval timers advanced by `tick`.
#[derive(Debug)]
pub struct TimerBank {
    timers: [Timer; TIMER_COUNT],
    rng: ChaCha20Rng,
}

impl Default for TimerBank {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerBank {
    pub fn new() -> Self {
        TimerBank { timers: [Timer::default(); TIMER_COUNT], rng: ChaCha20Rng::from_entropy() }
    }

    #[cfg(test)]
    pub fn with_seed(seed: u64) -> Self {
        TimerBank { timers: [Timer::default(); TIMER_COUNT], rng: ChaCha20Rng::seed_from_u64(seed) }
    }

    /// Start (or restart) a periodic timer.
    pub fn start(&mut self, id: TimerId, interval: Duration) {
        let t = &mut self.timers[id as usize];
        t.running = true;
        t.interval = interval;
        t.remaining = interval;
        t.fired = false;
    }

    /// Start a one-shot timer drawn uniformly from `[0, 2 * interval]`.
    /// Mandatory for Delay_Req scheduling: randomising within twice the
    /// interval keeps slaves out of lockstep (1588 § 9.5.11.2).
    pub fn start_random(&mut self, id: TimerId, interval: Duration) {
        let upper = interval.as_secs_f64() * 2.0;
        let drawn = self.rng.gen_range(0.0..=upper);
        let t = &mut self.timers[id as usize];
        t.running = true;
        t.interval = Duration::ZERO;
        t.remaining = Duration::from_secs_f64(drawn);
        t.fired = false;
    }

    /// Idempotent stop.
    pub fn stop(&mut self, id: TimerId) {
        self.timers[id as usize] = Timer::default();
    }

    pub fn stop_all(&mut self) {
        self.timers = [Timer::default(); TIMER_COUNT];
    }

    pub fn running(&self, id: TimerId) -> bool {
        self.timers[id as usize].running
    }

    /// Latching: true exactly once per expiry.
    pub fn expired(&mut self, id: TimerId) -> bool {
        let t = &mut self.timers[id as usize];
        if t.fired {
            t.fired = false;
            true
        } else {
            false
        }
    }

    /// Advance every running timer. Periodic timers reload on expiry;
    /// one-shots stop.
    pub fn tick(&mut self, delta: Duration) {
        for t in self.timers.iter_mut() {
            if !t.running {
                continue;
            }
            if t.remaining > delta {
                t.remaining -= delta;
                continue;
            }
            t.fired = true;
            if t.interval > Duration::ZERO {
                // Reload, swallowing any overshoot beyond one period.
                let overshoot = delta - t.remaining;
                t.remaining = t.interval.saturating_sub(overshoot);
                if t.remaining.is_zero() {
                    t.remaining = t.interval;
                }
            } else {
                t.running = false;
                t.remaining = Duration::ZERO;
            }
        }
    }
}
