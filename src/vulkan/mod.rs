//! # Vulkan Device Access
//!
//! The handful of device-level calls the profiler issues on its own behalf:
//! timestamp query pools, a submit fence and queue-idle waits.
//!
//! Everything goes through [`DeviceDispatch`] so that the capture core can
//! run on top of the next layer's dispatch table ([`AshDevice`]) or on a
//! CPU-emulated device ([`HeadlessDevice`]).

pub mod device;
pub mod headless;
pub mod query;

use ash::prelude::VkResult;
use ash::vk;

pub use device::AshDevice;
pub use headless::{FaultInjection, HeadlessDevice};
pub use query::{TimestampQueryPool, ticks_to_ns};

/// Memory type description used by the memory tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTypeInfo {
    /// Heap backing this memory type
    pub heap_index: u32,
    /// Property flags of the memory type
    pub property_flags: vk::MemoryPropertyFlags,
}

/// Device-level calls required by the profiler
///
/// Waits are blocking and have no timeout: once started they run until the
/// GPU signals or the device is lost.
pub trait DeviceDispatch: Send + Sync {
    /// Nanoseconds per timestamp tick
    fn timestamp_period(&self) -> f32;

    /// Memory types exposed by the physical device
    fn memory_types(&self) -> Vec<MemoryTypeInfo>;

    /// Number of memory heaps exposed by the physical device
    fn memory_heap_count(&self) -> u32;

    /// Create a timestamp query pool
    fn create_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool>;

    /// Destroy a timestamp query pool
    fn destroy_query_pool(&self, pool: vk::QueryPool);

    /// Record a query pool reset into a command buffer
    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    );

    /// Record a timestamp write into a command buffer
    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    );

    /// Read back 64-bit timestamps, waiting for them to become available
    fn get_timestamp_results(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()>;

    /// Create an unsignaled fence
    fn create_fence(&self) -> VkResult<vk::Fence>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);

    /// Submit zero command buffers to the queue, signaling the fence
    fn signal_fence_on_queue(&self, queue: vk::Queue, fence: vk::Fence) -> VkResult<()>;

    /// Block until the fence signals, then reset it
    fn wait_and_reset_fence(&self, fence: vk::Fence) -> VkResult<()>;

    /// Block until the device is idle
    fn device_wait_idle(&self) -> VkResult<()>;
}
