//! # Object Registries
//!
//! Concurrent handle-keyed maps holding the profiler's shadow state of
//! application objects. Each registry has its own lock; there is no
//! atomicity across registries.

pub mod pipeline;
pub mod render_pass;

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use crate::error::{ProfilerError, Result};
use crate::profiling::{AccessGuard, AccessTimer, RegistryAccessStats};

pub use pipeline::{PipelineDesc, ProfilerPipeline, ShaderStageDesc, ShaderTuple};
pub use render_pass::{
    AttachmentDesc, DepthStencilResolveDesc, RenderPassDesc, RenderPassMeta, SubpassDesc,
    SubpassMeta,
};

/// Lock-guarded map from a Vulkan handle to profiler state
pub struct ObjectRegistry<K, V> {
    /// Name used in errors and access statistics
    name: &'static str,
    map: Mutex<HashMap<K, V>>,
    timer: AccessTimer,
}

impl<K, V> ObjectRegistry<K, V>
where
    K: vk::Handle + Hash + Eq + Copy,
{
    /// Create an empty registry
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            map: Mutex::new(HashMap::new()),
            timer: AccessTimer::new(),
        }
    }

    /// Registry name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Insert or replace an entry
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let _timer = self.timer.start();
        self.map.lock().insert(key, value)
    }

    /// Remove an entry
    pub fn remove(&self, key: K) -> Option<V> {
        let _timer = self.timer.start();
        self.map.lock().remove(&key)
    }

    /// Look up an entry that must exist
    pub fn at(&self, key: K) -> Result<V>
    where
        V: Clone,
    {
        self.find(key).ok_or(ProfilerError::NotFound {
            kind: self.name,
            handle: key.as_raw(),
        })
    }

    /// Look up an entry
    pub fn find(&self, key: K) -> Option<V>
    where
        V: Clone,
    {
        let _timer = self.timer.start();
        self.map.lock().get(&key).cloned()
    }

    /// Check whether an entry exists
    pub fn contains(&self, key: K) -> bool {
        let _timer = self.timer.start();
        self.map.lock().contains_key(&key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the whole registry for bulk iteration
    ///
    /// The lock is held until the guard drops, so no other thread observes
    /// a partially processed registry.
    pub fn lock(&self) -> RegistryGuard<'_, K, V> {
        let timer = self.timer.start();
        RegistryGuard {
            map: self.map.lock(),
            _timer: timer,
        }
    }

    /// Remove and return all entries matching the predicate, under one lock
    pub fn remove_where<F>(&self, mut predicate: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut map = self.lock();
        let keys: Vec<K> = map
            .iter()
            .filter(|(k, v)| predicate(k, v))
            .map(|(k, _)| *k)
            .collect();

        keys.into_iter()
            .filter_map(|k| map.remove(&k).map(|v| (k, v)))
            .collect()
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Cumulative access statistics
    pub fn access_stats(&self) -> RegistryAccessStats {
        self.timer.stats(self.name)
    }

    /// Access statistics, starting a new interval
    pub fn take_access_interval(&self) -> RegistryAccessStats {
        self.timer.take_interval(self.name)
    }
}

/// Exclusive access to a whole registry
pub struct RegistryGuard<'a, K, V> {
    map: MutexGuard<'a, HashMap<K, V>>,
    _timer: AccessGuard<'a>,
}

impl<'a, K, V> Deref for RegistryGuard<'a, K, V> {
    type Target = HashMap<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.map
    }
}

impl<'a, K, V> DerefMut for RegistryGuard<'a, K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_insert_find_remove() {
        let registry: ObjectRegistry<vk::ShaderModule, u32> = ObjectRegistry::new("VkShaderModule");
        let module = vk::ShaderModule::from_raw(0x10);

        assert!(registry.find(module).is_none());
        registry.insert(module, 0xdead_beef);
        assert_eq!(registry.at(module), Ok(0xdead_beef));
        assert_eq!(registry.remove(module), Some(0xdead_beef));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_at_unregistered_is_not_found() {
        let registry: ObjectRegistry<vk::Pipeline, u32> = ObjectRegistry::new("VkPipeline");
        let err = registry.at(vk::Pipeline::from_raw(0x2a)).unwrap_err();

        assert_eq!(
            err,
            ProfilerError::NotFound {
                kind: "VkPipeline",
                handle: 0x2a
            }
        );
    }

    #[test]
    fn test_remove_where_only_matching() {
        let registry: ObjectRegistry<vk::CommandBuffer, u64> = ObjectRegistry::new("VkCommandBuffer");
        for raw in 1..=6u64 {
            registry.insert(vk::CommandBuffer::from_raw(raw), raw % 2);
        }

        let removed = registry.remove_where(|_, pool| *pool == 0);
        assert_eq!(removed.len(), 3);
        assert_eq!(registry.len(), 3);
        assert!(registry.contains(vk::CommandBuffer::from_raw(1)));
        assert!(!registry.contains(vk::CommandBuffer::from_raw(2)));
    }

    #[test]
    fn test_access_stats_count_operations() {
        let registry: ObjectRegistry<vk::RenderPass, u32> = ObjectRegistry::new("VkRenderPass");
        registry.insert(vk::RenderPass::from_raw(1), 1);
        registry.find(vk::RenderPass::from_raw(1));

        let stats = registry.take_access_interval();
        assert_eq!(stats.name, "VkRenderPass");
        assert_eq!(stats.interval_accesses, 2);
        assert_eq!(registry.access_stats().interval_accesses, 0);
    }
}
