//! # Timestamp Queries
//!
//! Per-command-buffer timestamp query pool. A pool is created on the first
//! `Begin` of a command buffer and recycled by every later `Begin`.

use std::sync::Arc;

use ash::vk;

use super::DeviceDispatch;
use crate::error::{ProfilerError, Result};

/// Convert a tick delta to nanoseconds
pub fn ticks_to_ns(ticks: u64, timestamp_period: f32) -> u64 {
    (ticks as f64 * timestamp_period as f64) as u64
}

/// Timestamp query pool owned by one command buffer
pub struct TimestampQueryPool {
    /// Device the pool was created on
    device: Arc<dyn DeviceDispatch>,
    /// Query pool handle
    pool: vk::QueryPool,
    /// Number of queries in pool
    capacity: u32,
    /// Next free query index
    used: u32,
}

impl TimestampQueryPool {
    /// Create a new query pool
    pub fn new(device: Arc<dyn DeviceDispatch>, capacity: u32) -> Result<Self> {
        let pool = device.create_query_pool(capacity).map_err(|e| {
            ProfilerError::ResourceExhausted(format!(
                "timestamp query pool of {} queries: {:?}",
                capacity, e
            ))
        })?;

        log::trace!("Created timestamp query pool {:?} ({} queries)", pool, capacity);

        Ok(Self {
            device,
            pool,
            capacity,
            used: 0,
        })
    }

    /// Reset all queries for a new recording
    pub fn reset(&mut self, command_buffer: vk::CommandBuffer) {
        self.device
            .cmd_reset_query_pool(command_buffer, self.pool, 0, self.capacity);
        self.used = 0;
    }

    /// Forget previously written queries without recording a reset
    ///
    /// Used by secondaries continuing a render pass, where resets are illegal.
    pub fn rewind(&mut self) {
        self.used = 0;
    }

    /// Record a timestamp, returning its query index
    ///
    /// Returns `None` once the pool is full.
    pub fn write(&mut self, command_buffer: vk::CommandBuffer) -> Option<u32> {
        if self.used >= self.capacity {
            return None;
        }

        let query = self.used;
        self.used += 1;

        self.device.cmd_write_timestamp(
            command_buffer,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            self.pool,
            query,
        );
        Some(query)
    }

    /// Number of queries written since the last reset
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Pool capacity
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Raw pool handle
    pub fn handle(&self) -> vk::QueryPool {
        self.pool
    }

    /// Nanoseconds per tick of the owning device
    pub fn timestamp_period(&self) -> f32 {
        self.device.timestamp_period()
    }

    /// Read back all written queries, blocking until they are available
    pub fn read_results(&self) -> Result<Vec<u64>> {
        let mut results = vec![0u64; self.used as usize];
        if results.is_empty() {
            return Ok(results);
        }

        self.device
            .get_timestamp_results(self.pool, 0, &mut results)?;
        Ok(results)
    }
}

impl Drop for TimestampQueryPool {
    fn drop(&mut self) {
        self.device.destroy_query_pool(self.pool);
    }
}

impl std::fmt::Debug for TimestampQueryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampQueryPool")
            .field("pool", &self.pool)
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish()
    }
}
