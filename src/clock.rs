//! Time sources.
//!
//! Nothing in the scheduling core reads the wall clock directly. Every
//! component takes an `Arc<dyn Clock>` so simulations and tests can drive
//! time themselves.

use std::sync::atomic::{AtomicI64, Ordering};

/// Milliseconds. Timeline times, queue times and history times all use this.
pub type Time = i64;

/// Source of the current time in milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Time;
}

/// Wall clock, milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Time {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that follows tokio's time driver.
///
/// Reports `origin` plus the time elapsed since construction as measured by
/// `tokio::time::Instant`, so a paused runtime (`start_paused = true`) moves
/// this clock exactly as far as the runtime's timers.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: Time,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(origin: Time) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Time {
        self.origin + self.started.elapsed().as_millis() as Time
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Time) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Time) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Time) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        self.now.load(Ordering::SeqCst)
    }
}
