use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Source of instrumentation timestamps, in nanoseconds.
pub trait Clock: Send + 'static {
    fn now_nanos(&mut self) -> u64;
}

/// Monotonic clock anchored to the Unix epoch when created.
///
/// Readings never go backwards, and stay comparable with wall-clock traces recorded by external
/// power meters as long as the system clock is not stepped during a run.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor_unix_nanos: u64,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let anchor_unix_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            anchor_unix_nanos,
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&mut self) -> u64 {
        self.anchor_unix_nanos + self.anchor.elapsed().as_nanos() as u64
    }
}

/// Deterministic clock advancing by a fixed step on every reading.
#[derive(Debug, Clone)]
pub struct SteppingClock {
    next: u64,
    step: u64,
}

impl SteppingClock {
    pub fn new(start: u64, step: u64) -> Self {
        Self { next: start, step }
    }
}

impl Clock for SteppingClock {
    fn now_nanos(&mut self) -> u64 {
        let now = self.next;
        self.next += self.step;
        now
    }
}
