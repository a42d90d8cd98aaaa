//! # Timers
//!
//! Registry access timers and the frame clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Access latency counters of one registry
///
/// Lock-free so that timing an access never adds contention of its own.
#[derive(Debug, Default)]
pub struct AccessTimer {
    accesses: AtomicU64,
    total_ns: AtomicU64,
    interval_accesses: AtomicU64,
    interval_ns: AtomicU64,
}

impl AccessTimer {
    /// Create a new access timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing one access; recorded when the guard drops
    pub fn start(&self) -> AccessGuard<'_> {
        AccessGuard {
            start: Instant::now(),
            timer: self,
        }
    }

    /// Record one access
    pub fn record(&self, duration: Duration) {
        let ns = duration.as_nanos() as u64;
        self.accesses.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.interval_accesses.fetch_add(1, Ordering::Relaxed);
        self.interval_ns.fetch_add(ns, Ordering::Relaxed);
    }

    /// Cumulative and current-interval statistics
    pub fn stats(&self, name: &'static str) -> RegistryAccessStats {
        RegistryAccessStats {
            name,
            accesses: self.accesses.load(Ordering::Relaxed),
            total_ns: self.total_ns.load(Ordering::Relaxed),
            interval_accesses: self.interval_accesses.load(Ordering::Relaxed),
            interval_ns: self.interval_ns.load(Ordering::Relaxed),
        }
    }

    /// Statistics, starting a new interval
    pub fn take_interval(&self, name: &'static str) -> RegistryAccessStats {
        RegistryAccessStats {
            name,
            accesses: self.accesses.load(Ordering::Relaxed),
            total_ns: self.total_ns.load(Ordering::Relaxed),
            interval_accesses: self.interval_accesses.swap(0, Ordering::Relaxed),
            interval_ns: self.interval_ns.swap(0, Ordering::Relaxed),
        }
    }
}

/// RAII access guard
pub struct AccessGuard<'a> {
    start: Instant,
    timer: &'a AccessTimer,
}

impl<'a> Drop for AccessGuard<'a> {
    fn drop(&mut self) {
        self.timer.record(self.start.elapsed());
    }
}

/// Registry access statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryAccessStats {
    pub name: &'static str,
    /// Accesses since the registry was created
    pub accesses: u64,
    pub total_ns: u64,
    /// Accesses since the previous frame
    pub interval_accesses: u64,
    pub interval_ns: u64,
}

impl RegistryAccessStats {
    /// Average access latency over the last interval
    pub fn interval_avg_ns(&self) -> f64 {
        if self.interval_accesses == 0 {
            0.0
        } else {
            self.interval_ns as f64 / self.interval_accesses as f64
        }
    }
}

/// Wall-clock time between frame boundaries
pub struct FrameClock {
    /// Previous frame boundary
    last: Instant,
    /// Last frame time
    last_frame_time: Duration,
    /// Frame time history
    history: Vec<Duration>,
    /// Maximum history size
    max_history: usize,
}

impl FrameClock {
    /// Create a new frame clock
    pub fn new(max_history: usize) -> Self {
        Self {
            last: Instant::now(),
            last_frame_time: Duration::ZERO,
            history: Vec::with_capacity(max_history),
            max_history: max_history.max(1),
        }
    }

    /// Mark a frame boundary, returning the time since the previous one
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        self.last_frame_time = now - self.last;
        self.last = now;

        self.history.push(self.last_frame_time);
        if self.history.len() > self.max_history {
            self.history.remove(0);
        }
        self.last_frame_time
    }

    /// Get last frame time
    pub fn last_frame_time(&self) -> Duration {
        self.last_frame_time
    }

    /// Get current FPS
    pub fn current_fps(&self) -> f64 {
        if self.last_frame_time.as_secs_f64() > 0.0 {
            1.0 / self.last_frame_time.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Get average FPS over the history
    pub fn average_fps(&self) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }

        let total: Duration = self.history.iter().sum();
        let avg = total.as_secs_f64() / self.history.len() as f64;
        if avg > 0.0 {
            1.0 / avg
        } else {
            0.0
        }
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new(120)
    }
}
