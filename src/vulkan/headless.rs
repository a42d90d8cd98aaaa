//! # Headless Device
//!
//! CPU-emulated [`DeviceDispatch`] used by tests, benchmarks and runs
//! without a GPU. Timestamp writes sample a shared monotonic tick clock at
//! record time, so command streams recorded in order resolve in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::{DeviceDispatch, MemoryTypeInfo};

/// Failures the headless device can be told to produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultInjection {
    /// `create_query_pool` fails with out-of-device-memory
    pub fail_query_pool_creation: bool,
    /// `create_fence` fails with out-of-host-memory
    pub fail_fence_creation: bool,
    /// `get_timestamp_results` fails with not-ready
    pub fail_readback: bool,
    /// Every wait reports device loss
    pub device_lost: bool,
}

/// Number of calls observed by the headless device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounters {
    pub query_pools_created: u64,
    pub query_pools_destroyed: u64,
    pub timestamps_written: u64,
    pub readbacks: u64,
    pub fence_signals: u64,
    pub fence_waits: u64,
    pub idle_waits: u64,
}

/// CPU-emulated device
pub struct HeadlessDevice {
    timestamp_period: f32,
    tick_step: u64,
    clock: AtomicU64,
    next_handle: AtomicU64,
    memory_types: Vec<MemoryTypeInfo>,
    memory_heap_count: u32,
    query_pools: Mutex<HashMap<vk::QueryPool, Vec<Option<u64>>>>,
    fences: Mutex<HashMap<vk::Fence, bool>>,
    faults: Mutex<FaultInjection>,
    counters: Mutex<CallCounters>,
}

impl HeadlessDevice {
    /// Create a device with a 1 ns timestamp period
    pub fn new() -> Self {
        Self::with_timestamp_period(1.0)
    }

    /// Create a device with the given timestamp period
    pub fn with_timestamp_period(timestamp_period: f32) -> Self {
        Self {
            timestamp_period,
            tick_step: 10,
            clock: AtomicU64::new(1_000),
            next_handle: AtomicU64::new(0x1000),
            // Typical discrete GPU layout: VRAM, host-visible VRAM window, system memory
            memory_types: vec![
                MemoryTypeInfo {
                    heap_index: 0,
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                },
                MemoryTypeInfo {
                    heap_index: 0,
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                        | vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                },
                MemoryTypeInfo {
                    heap_index: 1,
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT,
                },
            ],
            memory_heap_count: 2,
            query_pools: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            faults: Mutex::new(FaultInjection::default()),
            counters: Mutex::new(CallCounters::default()),
        }
    }

    /// Replace the injected faults
    pub fn set_faults(&self, faults: FaultInjection) {
        *self.faults.lock() = faults;
    }

    /// Get observed call counts
    pub fn counters(&self) -> CallCounters {
        *self.counters.lock()
    }

    /// Number of live query pools
    pub fn live_query_pools(&self) -> usize {
        self.query_pools.lock().len()
    }

    /// Advance the tick clock, emulating GPU work between two timestamps
    pub fn advance(&self, ticks: u64) {
        self.clock.fetch_add(ticks, Ordering::SeqCst);
    }

    fn next_raw_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceDispatch for HeadlessDevice {
    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    fn memory_types(&self) -> Vec<MemoryTypeInfo> {
        self.memory_types.clone()
    }

    fn memory_heap_count(&self) -> u32 {
        self.memory_heap_count
    }

    fn create_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool> {
        if self.faults.lock().fail_query_pool_creation {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }

        let pool = vk::QueryPool::from_raw(self.next_raw_handle());
        self.query_pools
            .lock()
            .insert(pool, vec![None; query_count as usize]);
        self.counters.lock().query_pools_created += 1;
        Ok(pool)
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        if self.query_pools.lock().remove(&pool).is_some() {
            self.counters.lock().query_pools_destroyed += 1;
        }
    }

    fn cmd_reset_query_pool(
        &self,
        _command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        if let Some(slots) = self.query_pools.lock().get_mut(&pool) {
            let first = first_query as usize;
            let last = (first + query_count as usize).min(slots.len());
            for slot in &mut slots[first.min(last)..last] {
                *slot = None;
            }
        }
    }

    fn cmd_write_timestamp(
        &self,
        _command_buffer: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        let ticks = self.clock.fetch_add(self.tick_step, Ordering::SeqCst);
        if let Some(slot) = self
            .query_pools
            .lock()
            .get_mut(&pool)
            .and_then(|slots| slots.get_mut(query as usize))
        {
            *slot = Some(ticks);
        }
        self.counters.lock().timestamps_written += 1;
    }

    fn get_timestamp_results(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()> {
        let faults = *self.faults.lock();
        if faults.device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        if faults.fail_readback {
            return Err(vk::Result::NOT_READY);
        }

        self.counters.lock().readbacks += 1;

        let pools = self.query_pools.lock();
        let slots = pools.get(&pool).ok_or(vk::Result::ERROR_UNKNOWN)?;

        for (i, result) in results.iter_mut().enumerate() {
            match slots.get(first_query as usize + i).copied().flatten() {
                Some(ticks) => *result = ticks,
                None => return Err(vk::Result::NOT_READY),
            }
        }
        Ok(())
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        if self.faults.lock().fail_fence_creation {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }

        let fence = vk::Fence::from_raw(self.next_raw_handle());
        self.fences.lock().insert(fence, false);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.lock().remove(&fence);
    }

    fn signal_fence_on_queue(&self, _queue: vk::Queue, fence: vk::Fence) -> VkResult<()> {
        if self.faults.lock().device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        let mut fences = self.fences.lock();
        let signaled = fences.get_mut(&fence).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if *signaled {
            // A fence must be unsignaled when handed to a submission
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        *signaled = true;
        self.counters.lock().fence_signals += 1;
        Ok(())
    }

    fn wait_and_reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        if self.faults.lock().device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        let mut fences = self.fences.lock();
        let signaled = fences.get_mut(&fence).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !*signaled {
            // Nothing will ever signal it on the headless device
            return Err(vk::Result::TIMEOUT);
        }
        *signaled = false;
        self.counters.lock().fence_waits += 1;
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        if self.faults.lock().device_lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        self.counters.lock().idle_waits += 1;
        Ok(())
    }
}
