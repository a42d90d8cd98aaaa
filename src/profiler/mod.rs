//! # Device Profiler
//!
//! Per-device orchestrator. Owns the object registries, the recorders of
//! all command buffers, the aggregator and the published frame data, and
//! drives submission handling and frame finalization.
//!
//! Lock order is aggregator, then a registry, then a recorder. The published
//! data lock is only held to swap or clone an `Arc`. GPU waits never happen
//! under a lock, except query readback waits inside a recorder and the
//! submit fence wait, which holds only the fence's own lock. At most one
//! recorder is locked at a time.

pub mod config;
pub mod metrics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};
use parking_lot::{Mutex, RwLock};

use crate::aggregator::{DataAggregator, SubmitBatch};
use crate::command_buffer::CommandBufferRecorder;
use crate::data::{Command, CommandBufferSnapshot, FrameAggregate};
use crate::error::{ProfilerError, Result};
use crate::profiling::{CpuStats, FrameClock, MemoryTracker};
use crate::registry::{
    ObjectRegistry, PipelineDesc, ProfilerPipeline, RenderPassDesc, RenderPassMeta, ShaderTuple,
};
use crate::util::hash::fingerprint32_words;
use crate::vulkan::DeviceDispatch;

pub use config::{ProfilerConfig, ProfilerMode, SyncMode};
pub use metrics::{MetricProperty, MetricsBackend, VendorMetrics};

type SharedRecorder = Arc<Mutex<CommandBufferRecorder>>;

/// Profiler of one logical device
pub struct DeviceProfiler {
    device: Arc<dyn DeviceDispatch>,
    config: RwLock<ProfilerConfig>,
    metrics: MetricsBackend,
    /// Vendor configuration acquired for the submission in flight
    performance_configuration: Mutex<Option<vk::PerformanceConfigurationINTEL>>,
    /// Signaled by an empty submission in submit sync mode
    submit_fence: vk::Fence,
    /// Held from fence signal to fence reset
    submit_fence_lock: Mutex<()>,

    command_buffers: ObjectRegistry<vk::CommandBuffer, SharedRecorder>,
    pipelines: ObjectRegistry<vk::Pipeline, Arc<ProfilerPipeline>>,
    render_passes: ObjectRegistry<vk::RenderPass, Arc<RenderPassMeta>>,
    shader_modules: ObjectRegistry<vk::ShaderModule, u32>,
    debug_names: RwLock<HashMap<(vk::ObjectType, u64), String>>,

    aggregator: Mutex<DataAggregator>,
    data: RwLock<Arc<FrameAggregate>>,
    memory: Mutex<MemoryTracker>,
    frame_clock: Mutex<FrameClock>,
    current_frame: AtomicU64,
}

impl DeviceProfiler {
    /// Activate profiling on a device
    ///
    /// Fails if the configuration is invalid or the submit fence cannot be
    /// created; nothing is left behind in that case.
    pub fn new(
        device: Arc<dyn DeviceDispatch>,
        config: ProfilerConfig,
        metrics: MetricsBackend,
    ) -> Result<Self> {
        config.validate()?;

        let submit_fence = device.create_fence().map_err(|e| {
            log::error!("Failed to create profiler fence: {:?}", e);
            ProfilerError::from(e)
        })?;

        let memory = MemoryTracker::new(device.memory_types(), device.memory_heap_count());
        let aggregator = DataAggregator::new(config.top_pipeline_count, device.timestamp_period());

        log::info!(
            "Device profiler activated (mode {:?}, sync {:?}, metrics {})",
            config.mode,
            config.sync_mode,
            metrics.name()
        );

        Ok(Self {
            device,
            config: RwLock::new(config),
            metrics,
            performance_configuration: Mutex::new(None),
            submit_fence,
            submit_fence_lock: Mutex::new(()),
            command_buffers: ObjectRegistry::new("VkCommandBuffer"),
            pipelines: ObjectRegistry::new("VkPipeline"),
            render_passes: ObjectRegistry::new("VkRenderPass"),
            shader_modules: ObjectRegistry::new("VkShaderModule"),
            debug_names: RwLock::new(HashMap::new()),
            aggregator: Mutex::new(aggregator),
            data: RwLock::new(Arc::new(FrameAggregate::default())),
            memory: Mutex::new(memory),
            frame_clock: Mutex::new(FrameClock::default()),
            current_frame: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Current configuration
    pub fn config(&self) -> ProfilerConfig {
        self.config.read().clone()
    }

    /// Sampling mode, applied from the next `begin_command_buffer`
    pub fn set_mode(&self, mode: ProfilerMode) {
        self.config.write().mode = mode;
    }

    /// Sampling mode from a raw API value
    pub fn set_mode_raw(&self, value: u32) -> Result<()> {
        self.set_mode(ProfilerMode::from_raw(value)?);
        Ok(())
    }

    pub fn mode(&self) -> ProfilerMode {
        self.config.read().mode
    }

    /// Synchronization policy
    pub fn set_sync_mode(&self, sync_mode: SyncMode) {
        self.config.write().sync_mode = sync_mode;
    }

    /// Synchronization policy from a raw API value
    pub fn set_sync_mode_raw(&self, value: u32) -> Result<()> {
        self.set_sync_mode(SyncMode::from_raw(value)?);
        Ok(())
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.config.read().sync_mode
    }

    /// Metrics reported by the vendor backend
    pub fn metric_properties(&self) -> Vec<metrics::MetricProperty> {
        self.metrics.metric_properties()
    }

    /// Index of the frame being recorded
    pub fn current_frame(&self) -> u64 {
        self.current_frame.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Command buffers
    // =========================================================================

    /// `vkAllocateCommandBuffers`
    pub fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        command_buffers: &[vk::CommandBuffer],
    ) {
        let query_capacity = self.config.read().queries_per_command_buffer;

        for &command_buffer in command_buffers {
            let recorder = CommandBufferRecorder::new(
                command_buffer,
                pool,
                level,
                self.device.clone(),
                query_capacity,
            );
            self.command_buffers
                .insert(command_buffer, Arc::new(Mutex::new(recorder)));
        }
    }

    /// `vkFreeCommandBuffers`
    ///
    /// Data of submissions not aggregated yet is flushed first.
    pub fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut aggregator = self.aggregator.lock();

        for &command_buffer in command_buffers {
            if let Some(recorder) = self.command_buffers.remove(command_buffer) {
                self.flush(&mut aggregator, command_buffer, &recorder);
            }
        }
    }

    /// `vkDestroyCommandPool`: frees every command buffer of the pool
    pub fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut aggregator = self.aggregator.lock();

        let freed = self
            .command_buffers
            .remove_where(|_, recorder| recorder.lock().pool() == pool);

        log::debug!("Freeing {} command buffers of pool {:?}", freed.len(), pool);

        for (command_buffer, recorder) in freed {
            self.flush(&mut aggregator, command_buffer, &recorder);
        }
    }

    /// `vkBeginCommandBuffer`
    pub fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> Result<()> {
        let recorder = match self.command_buffers.find(command_buffer) {
            Some(recorder) => recorder,
            None => {
                log::warn!(
                    "Command buffer {:?} was allocated before profiling started",
                    command_buffer
                );
                let recorder = Arc::new(Mutex::new(CommandBufferRecorder::new(
                    command_buffer,
                    vk::CommandPool::null(),
                    vk::CommandBufferLevel::PRIMARY,
                    self.device.clone(),
                    self.config.read().queries_per_command_buffer,
                )));
                self.command_buffers.insert(command_buffer, recorder.clone());
                recorder
            }
        };

        // Re-recording overwrites the queries of earlier submissions
        {
            let mut aggregator = self.aggregator.lock();
            if aggregator.has_pending(command_buffer) {
                self.flush(&mut aggregator, command_buffer, &recorder);
            }
        }

        let mode = self.mode();
        let result = recorder.lock().begin(mode, usage);
        result
    }

    /// `vkEndCommandBuffer`
    pub fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.with_recorder(command_buffer, |recorder| recorder.end());
    }

    /// Before `vkCmdBeginRenderPass`
    pub fn pre_begin_render_pass(&self, command_buffer: vk::CommandBuffer, render_pass: vk::RenderPass) {
        let meta = self.render_passes.find(render_pass);
        self.with_recorder(command_buffer, |recorder| {
            recorder.pre_begin_render_pass(render_pass, meta)
        });
    }

    /// After `vkCmdBeginRenderPass`
    pub fn post_begin_render_pass(&self, command_buffer: vk::CommandBuffer, contents: vk::SubpassContents) {
        self.with_recorder(command_buffer, |recorder| {
            recorder.post_begin_render_pass(contents)
        });
    }

    /// Before `vkCmdNextSubpass`
    pub fn pre_next_subpass(&self, command_buffer: vk::CommandBuffer) {
        self.with_recorder(command_buffer, |recorder| recorder.pre_next_subpass());
    }

    /// After `vkCmdNextSubpass`
    pub fn post_next_subpass(&self, command_buffer: vk::CommandBuffer, contents: vk::SubpassContents) {
        self.with_recorder(command_buffer, |recorder| recorder.post_next_subpass(contents));
    }

    /// Before `vkCmdEndRenderPass`
    pub fn pre_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.with_recorder(command_buffer, |recorder| recorder.pre_end_render_pass());
    }

    /// After `vkCmdEndRenderPass`
    pub fn post_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.with_recorder(command_buffer, |recorder| recorder.post_end_render_pass());
    }

    /// `vkCmdBindPipeline`
    pub fn bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        let pipeline = self.pipelines.find(pipeline).unwrap_or_else(|| {
            log::debug!("Binding unknown pipeline {:?}", pipeline);
            Arc::new(ProfilerPipeline::unknown(pipeline, bind_point))
        });
        self.with_recorder(command_buffer, |recorder| recorder.bind_pipeline(pipeline));
    }

    /// Before a traced command
    pub fn pre_command(&self, command_buffer: vk::CommandBuffer, command: Command) {
        self.with_recorder(command_buffer, |recorder| recorder.pre_command(command));
    }

    /// After a traced command
    pub fn post_command(&self, command_buffer: vk::CommandBuffer) {
        self.with_recorder(command_buffer, |recorder| recorder.post_command());
    }

    /// `vkCmdExecuteCommands`
    pub fn execute_commands(&self, command_buffer: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        self.with_recorder(command_buffer, |recorder| recorder.execute_commands(secondaries));
    }

    /// `vkCmdBeginDebugUtilsLabelEXT`
    pub fn begin_debug_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        self.with_recorder(command_buffer, |recorder| recorder.begin_debug_label(name, color));
    }

    /// `vkCmdEndDebugUtilsLabelEXT`
    pub fn end_debug_label(&self, command_buffer: vk::CommandBuffer) {
        self.with_recorder(command_buffer, |recorder| recorder.end_debug_label());
    }

    /// `vkCmdInsertDebugUtilsLabelEXT`
    pub fn insert_debug_label(&self, command_buffer: vk::CommandBuffer, name: &str, color: [f32; 4]) {
        self.with_recorder(command_buffer, |recorder| recorder.insert_debug_label(name, color));
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// `vkCreateShaderModule`
    pub fn create_shader_module(&self, module: vk::ShaderModule, code: &[u32]) {
        self.shader_modules.insert(module, fingerprint32_words(code));
    }

    /// `vkDestroyShaderModule`
    pub fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.shader_modules.remove(module);
    }

    /// `vkCreateGraphicsPipelines` / `vkCreateComputePipelines`
    ///
    /// Every referenced shader module must be registered.
    pub fn create_pipelines(&self, pipelines: &[vk::Pipeline], descs: &[PipelineDesc]) -> Result<()> {
        if pipelines.len() != descs.len() {
            return Err(ProfilerError::InvalidArgument(format!(
                "{} pipelines created from {} create infos",
                pipelines.len(),
                descs.len()
            )));
        }

        for (&handle, desc) in pipelines.iter().zip(descs) {
            let shader_tuple =
                ShaderTuple::from_desc(desc, |module| self.shader_modules.at(module))?;

            self.debug_names
                .write()
                .entry((vk::ObjectType::PIPELINE, handle.as_raw()))
                .or_insert_with(|| shader_tuple.default_name(desc.bind_point));

            self.pipelines.insert(
                handle,
                Arc::new(ProfilerPipeline {
                    handle,
                    bind_point: desc.bind_point,
                    shader_tuple,
                }),
            );
        }
        Ok(())
    }

    /// `vkDestroyPipeline`
    pub fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.pipelines.remove(pipeline);
        self.debug_names
            .write()
            .remove(&(vk::ObjectType::PIPELINE, pipeline.as_raw()));
    }

    /// Shadow state of a pipeline
    pub fn pipeline(&self, pipeline: vk::Pipeline) -> Result<Arc<ProfilerPipeline>> {
        self.pipelines.at(pipeline)
    }

    /// `vkCreateRenderPass`
    pub fn create_render_pass(&self, render_pass: vk::RenderPass, desc: &RenderPassDesc) {
        self.render_passes
            .insert(render_pass, Arc::new(RenderPassMeta::from_desc(desc)));
    }

    /// `vkDestroyRenderPass`
    pub fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.render_passes.remove(render_pass);
    }

    /// Implicit work of a render pass
    pub fn render_pass(&self, render_pass: vk::RenderPass) -> Result<Arc<RenderPassMeta>> {
        self.render_passes.at(render_pass)
    }

    /// `vkSetDebugUtilsObjectNameEXT`
    pub fn set_debug_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        self.debug_names
            .write()
            .insert((object_type, handle), name.to_string());
    }

    /// Debug name of an object
    pub fn object_name(&self, object_type: vk::ObjectType, handle: u64) -> Option<String> {
        self.debug_names.read().get(&(object_type, handle)).cloned()
    }

    /// `vkAllocateMemory`
    pub fn on_allocate_memory(&self, memory: vk::DeviceMemory, size: u64, type_index: u32) {
        if self.config.read().track_memory {
            self.memory.lock().allocate(memory, size, type_index);
        }
    }

    /// `vkFreeMemory`
    pub fn on_free_memory(&self, memory: vk::DeviceMemory) {
        if self.config.read().track_memory {
            self.memory.lock().free(memory);
        }
    }

    // =========================================================================
    // Submission and frames
    // =========================================================================

    /// Before `vkQueueSubmit`
    pub fn pre_submit(&self, queue: vk::Queue) -> Result<()> {
        let Some(vendor) = self.metrics.vendor() else {
            return Ok(());
        };

        let mut slot = self.performance_configuration.lock();
        assert!(
            slot.is_none(),
            "performance configuration acquired twice without release"
        );
        *slot = Some(vendor.acquire_configuration(queue)?);
        Ok(())
    }

    /// After `vkQueueSubmit`
    ///
    /// `submits` holds the command buffers of each submit info in order. In
    /// submit sync mode this blocks until the submission has executed.
    pub fn post_submit(&self, queue: vk::Queue, submits: &[&[vk::CommandBuffer]]) -> Result<()> {
        let sync_mode = self.sync_mode();

        let wait = if sync_mode == SyncMode::Submit {
            self.wait_for_queue(queue)
        } else {
            Ok(())
        };

        {
            let mut aggregator = self.aggregator.lock();

            for &command_buffer in submits.iter().flat_map(|submit| submit.iter()) {
                match self.command_buffers.find(command_buffer) {
                    Some(recorder) => self.submit_recorder(&recorder),
                    None => log::warn!("Submitted unknown command buffer {:?}", command_buffer),
                }
            }

            aggregator.append_submit(SubmitBatch::new(
                queue,
                submits.iter().map(|submit| submit.to_vec()).collect(),
            ));

            if sync_mode == SyncMode::Submit {
                aggregator.aggregate(|command_buffer| self.resolve(command_buffer));
            }
        }

        if let Some(vendor) = self.metrics.vendor() {
            if let Some(configuration) = self.performance_configuration.lock().take() {
                vendor.release_configuration(configuration);
            }
        }

        wait
    }

    /// Frame boundary: aggregate, publish and start the next frame
    ///
    /// In present sync mode this blocks until the device is idle.
    pub fn finish_frame(&self) -> Result<()> {
        let wait = if self.sync_mode() == SyncMode::Present {
            self.device.device_wait_idle().map_err(ProfilerError::from)
        } else {
            Ok(())
        };

        let mut frame = {
            let mut aggregator = self.aggregator.lock();
            aggregator.aggregate(|command_buffer| self.resolve(command_buffer));
            let frame = aggregator.get_aggregated_data();
            aggregator.reset();
            frame
        };

        frame.frame_index = self.current_frame();

        {
            let names = self.debug_names.read();
            for pipeline in &mut frame.top_pipelines {
                pipeline.name = names
                    .get(&(vk::ObjectType::PIPELINE, pipeline.handle.as_raw()))
                    .cloned();
            }
        }

        frame.cpu = {
            let mut clock = self.frame_clock.lock();
            let frame_time = clock.tick();
            CpuStats {
                frame_time_ns: frame_time.as_nanos() as u64,
                fps: clock.current_fps(),
                average_fps: clock.average_fps(),
                captured_at: chrono::Utc::now(),
                registry_access: vec![
                    self.command_buffers.take_access_interval(),
                    self.pipelines.take_access_interval(),
                    self.render_passes.take_access_interval(),
                    self.shader_modules.take_access_interval(),
                ],
            }
        };

        if self.config.read().track_memory {
            frame.memory = self.memory.lock().stats();
            log::trace!("Device memory of frame {}:\n{}", frame.frame_index, frame.memory.format());
        }

        log::debug!(
            "Frame {} published: {} command buffers, {} ns GPU time",
            frame.frame_index,
            frame.command_buffers().count(),
            frame.gpu_time_ns()
        );

        *self.data.write() = Arc::new(frame);
        self.current_frame.fetch_add(1, Ordering::SeqCst);

        wait
    }

    /// Data of the last finished frame
    pub fn get_data(&self) -> Arc<FrameAggregate> {
        self.data.read().clone()
    }

    /// Block until everything submitted to the queue so far has executed
    ///
    /// The fence is shared by all queues, so one signal and wait pair runs
    /// at a time.
    fn wait_for_queue(&self, queue: vk::Queue) -> Result<()> {
        let _fence = self.submit_fence_lock.lock();
        self.device.signal_fence_on_queue(queue, self.submit_fence)?;
        self.device.wait_and_reset_fence(self.submit_fence)?;
        Ok(())
    }

    /// Mark a command buffer and every secondary it executes as submitted
    fn submit_recorder(&self, recorder: &SharedRecorder) {
        let secondaries = {
            let mut recorder = recorder.lock();
            recorder.submit();
            recorder.secondary_command_buffers()
        };

        for secondary in secondaries {
            match self.command_buffers.find(secondary) {
                Some(recorder) => self.submit_recorder(&recorder),
                None => log::debug!("Executed unknown secondary {:?}", secondary),
            }
        }
    }

    fn resolve(&self, command_buffer: vk::CommandBuffer) -> Option<CommandBufferSnapshot> {
        self.command_buffers
            .find(command_buffer)
            .map(|recorder| self.resolve_recorder(&recorder))
    }

    /// Resolve a recorder with its executed secondaries grafted in
    ///
    /// Secondaries are resolved first so that no two recorders are locked
    /// at the same time.
    fn resolve_recorder(&self, recorder: &SharedRecorder) -> CommandBufferSnapshot {
        let handles = recorder.lock().secondary_command_buffers();

        let mut secondaries: HashMap<vk::CommandBuffer, CommandBufferSnapshot> = HashMap::new();
        for handle in handles {
            if secondaries.contains_key(&handle) {
                continue;
            }
            if let Some(snapshot) = self.resolve(handle) {
                secondaries.insert(handle, snapshot);
            }
        }

        let snapshot = recorder
            .lock()
            .resolve_with(|handle| secondaries.get(&handle).cloned());
        snapshot
    }

    /// Hand every pending submission of a command buffer to the aggregator
    fn flush(&self, aggregator: &mut DataAggregator, command_buffer: vk::CommandBuffer, recorder: &SharedRecorder) {
        while aggregator.has_pending(command_buffer) {
            let snapshot = self.resolve_recorder(recorder);
            aggregator.append_data(command_buffer, snapshot);
        }
    }

    fn with_recorder<F>(&self, command_buffer: vk::CommandBuffer, f: F)
    where
        F: FnOnce(&mut CommandBufferRecorder),
    {
        match self.command_buffers.find(command_buffer) {
            Some(recorder) => f(&mut recorder.lock()),
            None => log::trace!("Ignoring command on unknown {:?}", command_buffer),
        }
    }
}

impl Drop for DeviceProfiler {
    fn drop(&mut self) {
        self.command_buffers.clear();
        self.device.destroy_fence(self.submit_fence);
        log::info!("Device profiler deactivated after {} frames", self.current_frame());
    }
}
