//! # Host-Side Statistics
//!
//! CPU-side numbers attached to every published frame: frame time, registry
//! access latency and device memory usage.

pub mod memory_tracker;
pub mod timer;

pub use memory_tracker::*;
pub use timer::*;

/// CPU-side frame statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuStats {
    /// Wall-clock time since the previous frame boundary
    pub frame_time_ns: u64,
    pub fps: f64,
    pub average_fps: f64,
    /// When the frame was published
    pub captured_at: chrono::DateTime<chrono::Utc>,
    /// Access latency of every registry
    pub registry_access: Vec<RegistryAccessStats>,
}

impl CpuStats {
    /// Frame time in milliseconds
    pub fn frame_time_ms(&self) -> f64 {
        self.frame_time_ns as f64 / 1_000_000.0
    }
}
