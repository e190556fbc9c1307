use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start()
    }
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn restart(&mut self) {
        self.started = Instant::now();
    }
}

/// Fires at most once per interval.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    interval: Duration,
    stopwatch: Stopwatch,
}

impl RateLimit {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stopwatch: Stopwatch::start(),
        }
    }

    /// True if the interval has elapsed since the last time this returned true. Restarts the
    /// timer whenever it fires.
    pub fn due(&mut self) -> bool {
        if self.stopwatch.elapsed() < self.interval {
            return false;
        }
        self.stopwatch.restart();
        true
    }
}
