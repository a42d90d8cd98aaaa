//! # Memory Tracker
//!
//! Device memory allocation tracking per heap and per memory type.

use std::collections::HashMap;

use ash::vk;
use serde::Serialize;

use crate::vulkan::MemoryTypeInfo;

/// Device memory tracker
pub struct MemoryTracker {
    /// Memory types of the device
    memory_types: Vec<MemoryTypeInfo>,
    /// Usage per heap
    heaps: Vec<MemoryUsage>,
    /// Usage per memory type
    types: Vec<MemoryUsage>,
    /// Live allocations
    allocations: HashMap<vk::DeviceMemory, Allocation>,
    /// Total allocated bytes
    total_allocated: u64,
    /// Peak allocated bytes
    peak_allocated: u64,
    /// Bytes in device-local memory
    device_local_allocated: u64,
    /// Bytes in host-visible memory
    host_visible_allocated: u64,
    /// Allocation count
    allocation_count: u64,
    /// Deallocation count
    deallocation_count: u64,
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    size: u64,
    type_index: u32,
}

impl MemoryTracker {
    /// Create a tracker for the given device memory layout
    pub fn new(memory_types: Vec<MemoryTypeInfo>, heap_count: u32) -> Self {
        let type_count = memory_types.len();
        Self {
            memory_types,
            heaps: vec![MemoryUsage::default(); heap_count as usize],
            types: vec![MemoryUsage::default(); type_count],
            allocations: HashMap::new(),
            total_allocated: 0,
            peak_allocated: 0,
            device_local_allocated: 0,
            host_visible_allocated: 0,
            allocation_count: 0,
            deallocation_count: 0,
        }
    }

    /// Track an allocation
    pub fn allocate(&mut self, memory: vk::DeviceMemory, size: u64, type_index: u32) {
        if self.allocations.insert(memory, Allocation { size, type_index }).is_some() {
            log::warn!("Memory {:?} allocated twice without being freed", memory);
        }

        match self.memory_types.get(type_index as usize).copied() {
            Some(info) => {
                self.types[type_index as usize].allocate(size);
                if let Some(heap) = self.heaps.get_mut(info.heap_index as usize) {
                    heap.allocate(size);
                }
                if info.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                    self.device_local_allocated += size;
                }
                if info.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                    self.host_visible_allocated += size;
                }
            }
            None => log::warn!("Allocation from unknown memory type {}", type_index),
        }

        self.total_allocated += size;
        self.peak_allocated = self.peak_allocated.max(self.total_allocated);
        self.allocation_count += 1;
    }

    /// Track a deallocation
    pub fn free(&mut self, memory: vk::DeviceMemory) {
        let Some(allocation) = self.allocations.remove(&memory) else {
            // Freeing VK_NULL_HANDLE is legal, anything else was allocated before tracking began
            return;
        };
        let size = allocation.size;

        if let Some(info) = self.memory_types.get(allocation.type_index as usize).copied() {
            self.types[allocation.type_index as usize].free(size);
            if let Some(heap) = self.heaps.get_mut(info.heap_index as usize) {
                heap.free(size);
            }
            if info.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                self.device_local_allocated = self.device_local_allocated.saturating_sub(size);
            }
            if info.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                self.host_visible_allocated = self.host_visible_allocated.saturating_sub(size);
            }
        }

        self.total_allocated = self.total_allocated.saturating_sub(size);
        self.deallocation_count += 1;
    }

    /// Get memory statistics
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            total_allocated: self.total_allocated,
            peak_allocated: self.peak_allocated,
            device_local_allocated: self.device_local_allocated,
            host_visible_allocated: self.host_visible_allocated,
            allocation_count: self.allocation_count,
            deallocation_count: self.deallocation_count,
            live_allocations: self.allocations.len() as u64,
            heaps: self.heaps.clone(),
            types: self.types.clone(),
        }
    }
}

/// Usage of one heap or memory type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub current_allocated: u64,
    pub peak_allocated: u64,
    pub allocation_count: u64,
}

impl MemoryUsage {
    fn allocate(&mut self, size: u64) {
        self.current_allocated += size;
        self.peak_allocated = self.peak_allocated.max(self.current_allocated);
        self.allocation_count += 1;
    }

    fn free(&mut self, size: u64) {
        self.current_allocated = self.current_allocated.saturating_sub(size);
    }
}

/// Memory statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total_allocated: u64,
    pub peak_allocated: u64,
    pub device_local_allocated: u64,
    pub host_visible_allocated: u64,
    pub allocation_count: u64,
    pub deallocation_count: u64,
    pub live_allocations: u64,
    pub heaps: Vec<MemoryUsage>,
    pub types: Vec<MemoryUsage>,
}

impl MemoryStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!("Total Allocated: {}\n", format_bytes(self.total_allocated)));
        s.push_str(&format!("Peak Allocated:  {}\n", format_bytes(self.peak_allocated)));
        s.push_str(&format!("Device Local:    {}\n", format_bytes(self.device_local_allocated)));
        s.push_str(&format!("Host Visible:    {}\n", format_bytes(self.host_visible_allocated)));
        s.push_str(&format!("Allocations:     {}\n", self.allocation_count));
        s.push_str(&format!("Deallocations:   {}\n", self.deallocation_count));
        s.push_str("\nHeaps:\n");

        for (index, heap) in self.heaps.iter().enumerate() {
            s.push_str(&format!(
                "  {}: {} (peak: {})\n",
                index,
                format_bytes(heap.current_allocated),
                format_bytes(heap.peak_allocated)
            ));
        }

        s
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
