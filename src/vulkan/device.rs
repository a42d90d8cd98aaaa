//! # Vulkan Device
//!
//! [`DeviceDispatch`] on top of an `ash` device.
//!
//! Inside a layer the `ash::Device` must be loaded from the *next* layer's
//! `vkGetDeviceProcAddr`, otherwise the profiler's own calls would be
//! intercepted again.

use ash::prelude::VkResult;
use ash::vk;

use super::{DeviceDispatch, MemoryTypeInfo};

/// Vulkan device wrapper
pub struct AshDevice {
    /// Logical device
    device: ash::Device,
    /// Nanoseconds per timestamp tick
    timestamp_period: f32,
    /// Memory properties
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl AshDevice {
    /// Wrap a device, querying the physical device limits once
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::debug!(
            "Profiling device {:#06x}:{:#06x}, timestamp period {} ns",
            properties.vendor_id,
            properties.device_id,
            properties.limits.timestamp_period
        );

        Self {
            device,
            timestamp_period: properties.limits.timestamp_period,
            memory_properties,
        }
    }

    /// Get the raw device
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }
}

impl DeviceDispatch for AshDevice {
    fn timestamp_period(&self) -> f32 {
        self.timestamp_period
    }

    fn memory_types(&self) -> Vec<MemoryTypeInfo> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .map(|t| MemoryTypeInfo {
                heap_index: t.heap_index,
                property_flags: t.property_flags,
            })
            .collect()
    }

    fn memory_heap_count(&self) -> u32 {
        self.memory_properties.memory_heap_count
    }

    fn create_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool> {
        let pool_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(query_count);

        unsafe { self.device.create_query_pool(&pool_info, None) }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe {
            self.device.destroy_query_pool(pool, None);
        }
    }

    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        unsafe {
            self.device
                .cmd_reset_query_pool(command_buffer, pool, first_query, query_count);
        }
    }

    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe {
            self.device
                .cmd_write_timestamp(command_buffer, stage, pool, query);
        }
    }

    fn get_timestamp_results(
        &self,
        pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()> {
        unsafe {
            self.device.get_query_pool_results(
                pool,
                first_query,
                results,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let fence_info = vk::FenceCreateInfo::default();
        unsafe { self.device.create_fence(&fence_info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe {
            self.device.destroy_fence(fence, None);
        }
    }

    fn signal_fence_on_queue(&self, queue: vk::Queue, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.queue_submit(queue, &[], fence) }
    }

    fn wait_and_reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe {
            self.device.wait_for_fences(&[fence], true, u64::MAX)?;
            self.device.reset_fences(&[fence])
        }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}
