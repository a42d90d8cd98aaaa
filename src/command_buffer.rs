//! # Command Buffer Recorder
//!
//! Turns the command stream of one command buffer into a region tree.
//!
//! Regions live in an arena indexed by [`NodeId`]; the open regions form an
//! explicit stack whose kinds strictly increase from the root `CommandBuffer`
//! region outwards. Each timed region writes a begin timestamp when opened
//! and an end timestamp when closed, so nesting in the tree is nesting in
//! the GPU timeline.
//!
//! Subpasses whose contents come from secondary command buffers admit no
//! command but `vkCmdExecuteCommands`, so no query is written inside them.
//! The snapshots of the executed secondaries are grafted into the region
//! that executed them when the recording is resolved.
//!
//! ```text
//! Initial -> Recording -> Ended -> Submitted -> DataReady
//!               ^                      |            |
//!               +----------------------+------------+   (begin)
//! ```

use std::sync::Arc;

use ash::vk::{self, Handle};

use crate::data::{
    Command, CommandBufferSnapshot, DebugLabelOp, DrawcallStats, GpuTimestamp, InternalPipeline,
    PipelineSource, Region, RegionDetail, RegionKind, Timestamp,
};
use crate::error::Result;
use crate::profiler::ProfilerMode;
use crate::registry::{ProfilerPipeline, RenderPassMeta, ShaderTuple};
use crate::vulkan::{ticks_to_ns, DeviceDispatch, TimestampQueryPool};

/// Index of a region in the recorder's arena
pub type NodeId = usize;

/// Recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Initial,
    Recording,
    Ended,
    Submitted,
    DataReady,
}

struct RegionNode {
    kind: RegionKind,
    handle: Option<u64>,
    children: Vec<NodeId>,
    begin_query: Option<u32>,
    end_query: Option<u32>,
    /// Counters of commands recorded directly in this region
    stats: DrawcallStats,
    detail: RegionDetail,
    /// Secondaries executed directly in this region
    secondaries: Vec<vk::CommandBuffer>,
}

struct ActiveRenderPass {
    meta: Option<Arc<RenderPassMeta>>,
    subpass: u32,
    contents: vk::SubpassContents,
}

/// Recorder of one command buffer
pub struct CommandBufferRecorder {
    handle: vk::CommandBuffer,
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    device: Arc<dyn DeviceDispatch>,
    query_capacity: u32,
    /// Created on first begin, recycled afterwards
    query_pool: Option<TimestampQueryPool>,
    state: RecorderState,
    /// Latched at begin
    mode: ProfilerMode,
    /// False for secondaries continuing a render pass
    timed: bool,
    nodes: Vec<RegionNode>,
    stack: Vec<NodeId>,
    /// Timed regions on the stack, each holding a reserved end query
    open_timed: u32,
    render_pass: Option<ActiveRenderPass>,
    graphics_pipeline: Option<Arc<ProfilerPipeline>>,
    compute_pipeline: Option<Arc<ProfilerPipeline>>,
    snapshot: Option<CommandBufferSnapshot>,
    exhausted_warned: bool,
}

impl CommandBufferRecorder {
    /// Create a recorder for a freshly allocated command buffer
    pub fn new(
        handle: vk::CommandBuffer,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        device: Arc<dyn DeviceDispatch>,
        query_capacity: u32,
    ) -> Self {
        Self {
            handle,
            pool,
            level,
            device,
            query_capacity: query_capacity.max(2),
            query_pool: None,
            state: RecorderState::Initial,
            mode: ProfilerMode::default(),
            timed: true,
            nodes: Vec::new(),
            stack: Vec::new(),
            open_timed: 0,
            render_pass: None,
            graphics_pipeline: None,
            compute_pipeline: None,
            snapshot: None,
            exhausted_warned: false,
        }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Pool the command buffer was allocated from
    pub fn pool(&self) -> vk::CommandPool {
        self.pool
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Sampling mode of the current recording
    pub fn mode(&self) -> ProfilerMode {
        self.mode
    }

    /// Timestamp queries written by the current recording
    pub fn queries_written(&self) -> u32 {
        self.query_pool.as_ref().map_or(0, |pool| pool.used())
    }

    /// Start a new recording
    ///
    /// Fails with `ResourceExhausted` if the query pool cannot be created.
    pub fn begin(&mut self, mode: ProfilerMode, usage: vk::CommandBufferUsageFlags) -> Result<()> {
        self.state = RecorderState::Initial;
        self.mode = mode;
        self.timed = !(self.level == vk::CommandBufferLevel::SECONDARY
            && usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE));

        self.nodes.clear();
        self.stack.clear();
        self.open_timed = 0;
        self.render_pass = None;
        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.snapshot = None;
        self.exhausted_warned = false;

        if self.timed {
            if self.query_pool.is_none() {
                self.query_pool = Some(TimestampQueryPool::new(
                    self.device.clone(),
                    self.query_capacity,
                )?);
            }
            if let Some(pool) = self.query_pool.as_mut() {
                pool.reset(self.handle);
            }
        } else if let Some(pool) = self.query_pool.as_mut() {
            pool.rewind();
        }

        self.open(
            RegionKind::CommandBuffer,
            Some(self.handle.as_raw()),
            RegionDetail::None,
        );
        self.state = RecorderState::Recording;
        Ok(())
    }

    /// Finish the recording, closing every open region
    pub fn end(&mut self) {
        if !self.is_recording() {
            return;
        }

        #[cfg(feature = "validation")]
        if self.render_pass.is_some() {
            log::warn!("Command buffer {:?} ended inside a render pass", self.handle);
        }

        while !self.stack.is_empty() {
            self.close_top();
        }
        self.render_pass = None;

        #[cfg(feature = "validation")]
        assert_eq!(self.open_timed, 0, "unbalanced timestamp queries");

        self.state = RecorderState::Ended;
    }

    /// Before `vkCmdBeginRenderPass`: the begin query lands outside the pass
    pub fn pre_begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        meta: Option<Arc<RenderPassMeta>>,
    ) {
        if !self.is_recording() {
            return;
        }

        self.close_to(RegionKind::RenderPass);
        if self.mode.records(RegionKind::RenderPass) {
            self.open(
                RegionKind::RenderPass,
                Some(render_pass.as_raw()),
                RegionDetail::None,
            );
        }

        if let (Some(meta), Some(stats)) = (meta.as_ref(), self.top_stats()) {
            stats.clear_color_implicit_count += meta.clear_color_count as u64;
            stats.clear_depth_stencil_implicit_count += meta.clear_depth_stencil_count as u64;
        }

        self.render_pass = Some(ActiveRenderPass {
            meta,
            subpass: 0,
            contents: vk::SubpassContents::INLINE,
        });
    }

    /// After `vkCmdBeginRenderPass`: opens subpass 0
    pub fn post_begin_render_pass(&mut self, contents: vk::SubpassContents) {
        if !self.is_recording() {
            return;
        }
        self.open_subpass(0, contents);
    }

    /// Before `vkCmdNextSubpass`: closes the current subpass
    pub fn pre_next_subpass(&mut self) {
        if !self.is_recording() {
            return;
        }
        self.end_subpass();
    }

    /// After `vkCmdNextSubpass`: opens the next subpass
    pub fn post_next_subpass(&mut self, contents: vk::SubpassContents) {
        if !self.is_recording() {
            return;
        }

        let index = match self.render_pass.as_mut() {
            Some(render_pass) => {
                render_pass.subpass += 1;
                render_pass.subpass
            }
            None => return,
        };
        self.open_subpass(index, contents);
    }

    /// Before `vkCmdEndRenderPass`: closes the last subpass inside the pass
    pub fn pre_end_render_pass(&mut self) {
        if !self.is_recording() {
            return;
        }
        self.end_subpass();
    }

    /// After `vkCmdEndRenderPass`: the end query lands outside the pass
    pub fn post_end_render_pass(&mut self) {
        if !self.is_recording() {
            return;
        }
        self.close_to(RegionKind::RenderPass);
        self.render_pass = None;
    }

    /// `vkCmdBindPipeline`
    ///
    /// Graphics pipelines bound inside a render pass open their region right
    /// away; anything else opens lazily at the next command using it.
    pub fn bind_pipeline(&mut self, pipeline: Arc<ProfilerPipeline>) {
        if !self.is_recording() {
            return;
        }

        match pipeline.bind_point {
            vk::PipelineBindPoint::GRAPHICS => {
                self.graphics_pipeline = Some(pipeline.clone());
                if self.render_pass.is_some() && !self.in_secondary_subpass() {
                    self.ensure_pipeline(
                        PipelineSource::Application(pipeline.handle),
                        pipeline.shader_tuple,
                    );
                }
            }
            vk::PipelineBindPoint::COMPUTE => self.compute_pipeline = Some(pipeline),
            other => log::trace!("Ignoring pipeline bound to {:?}", other),
        }
    }

    /// Before a traced command
    pub fn pre_command(&mut self, command: Command) {
        if !self.is_recording() {
            return;
        }

        if self.in_secondary_subpass() {
            if let Some(stats) = self.top_stats() {
                stats.record(&command);
            }
            return;
        }

        let (source, shader_tuple) = match command.internal_pipeline() {
            Some(internal) => (PipelineSource::Internal(internal), ShaderTuple::default()),
            None => {
                let bound = match command.bind_point() {
                    Some(vk::PipelineBindPoint::COMPUTE) => self.compute_pipeline.as_ref(),
                    _ => self.graphics_pipeline.as_ref(),
                };
                match bound {
                    Some(pipeline) => (
                        PipelineSource::Application(pipeline.handle),
                        pipeline.shader_tuple,
                    ),
                    None => (
                        PipelineSource::Internal(InternalPipeline::Unbound),
                        ShaderTuple::default(),
                    ),
                }
            }
        };

        self.ensure_pipeline(source, shader_tuple);

        if self.mode.records(RegionKind::Drawcall) {
            self.open(
                RegionKind::Drawcall,
                None,
                RegionDetail::Drawcall { command },
            );
        }

        if let Some(stats) = self.top_stats() {
            stats.record(&command);
        }
    }

    /// After a traced command
    pub fn post_command(&mut self) {
        if !self.is_recording() {
            return;
        }
        if self.top_kind() == Some(RegionKind::Drawcall) {
            self.close_top();
        }
    }

    /// `vkCmdExecuteCommands`
    ///
    /// The secondaries are attached to the innermost open subpass, or to the
    /// innermost open region when no subpass is recorded.
    pub fn execute_commands(&mut self, secondaries: &[vk::CommandBuffer]) {
        if !self.is_recording() {
            return;
        }

        self.pre_command(Command::ExecuteCommands {
            command_buffer_count: secondaries.len() as u32,
        });

        let parent = self
            .stack
            .iter()
            .rev()
            .find(|&&id| self.nodes[id].kind == RegionKind::Subpass)
            .or_else(|| self.stack.last())
            .copied();
        if let Some(parent) = parent {
            self.nodes[parent].secondaries.extend_from_slice(secondaries);
        }

        self.post_command();
    }

    /// Secondaries executed by the current recording, in execution order
    pub fn secondary_command_buffers(&self) -> Vec<vk::CommandBuffer> {
        self.nodes
            .iter()
            .flat_map(|node| node.secondaries.iter().copied())
            .collect()
    }

    /// `vkCmdBeginDebugUtilsLabelEXT`
    pub fn begin_debug_label(&mut self, name: &str, color: [f32; 4]) {
        self.insert_marker(name, color, DebugLabelOp::Begin);
    }

    /// `vkCmdEndDebugUtilsLabelEXT`
    pub fn end_debug_label(&mut self) {
        self.insert_marker("", [0.0; 4], DebugLabelOp::End);
    }

    /// `vkCmdInsertDebugUtilsLabelEXT`
    pub fn insert_debug_label(&mut self, name: &str, color: [f32; 4]) {
        self.insert_marker(name, color, DebugLabelOp::Insert);
    }

    /// The command buffer was handed to a queue
    pub fn submit(&mut self) {
        match self.state {
            RecorderState::Ended | RecorderState::Submitted | RecorderState::DataReady => {
                // A resubmission overwrites the previous query results
                self.snapshot = None;
                self.state = RecorderState::Submitted;
            }
            state => log::warn!(
                "Command buffer {:?} submitted in state {:?}",
                self.handle,
                state
            ),
        }
    }

    /// Read back timestamps and produce the snapshot
    ///
    /// Blocks until the GPU has written the queries. A failed readback or a
    /// command buffer that was never submitted yields a snapshot marked
    /// incomplete instead of an error. Executed secondaries are grafted as
    /// incomplete placeholders; see [`resolve_with`](Self::resolve_with).
    pub fn resolve(&mut self) -> CommandBufferSnapshot {
        self.resolve_with(|_| None)
    }

    /// Read back timestamps, taking the snapshots of executed secondaries
    /// from `secondary`
    pub fn resolve_with<F>(&mut self, mut secondary: F) -> CommandBufferSnapshot
    where
        F: FnMut(vk::CommandBuffer) -> Option<CommandBufferSnapshot>,
    {
        match self.state {
            RecorderState::DataReady => {
                if let Some(snapshot) = &self.snapshot {
                    return snapshot.clone();
                }
            }
            RecorderState::Submitted => {}
            _ => return self.incomplete(),
        }

        let results = if self.timed {
            match self.query_pool.as_ref().map(|pool| pool.read_results()) {
                Some(Ok(results)) => Some(results),
                Some(Err(e)) => {
                    log::warn!("Timestamp readback of {:?} failed: {}", self.handle, e);
                    None
                }
                None => None,
            }
        } else {
            Some(Vec::new())
        };

        let snapshot = self.build_snapshot(results.as_deref(), &mut secondary);
        self.snapshot = Some(snapshot.clone());
        self.state = RecorderState::DataReady;
        snapshot
    }

    fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    fn incomplete(&self) -> CommandBufferSnapshot {
        CommandBufferSnapshot {
            level: self.level,
            ..CommandBufferSnapshot::incomplete(self.handle)
        }
    }

    fn in_secondary_subpass(&self) -> bool {
        self.render_pass.as_ref().map_or(false, |render_pass| {
            render_pass.contents == vk::SubpassContents::SECONDARY_COMMAND_BUFFERS
        })
    }

    fn top_kind(&self) -> Option<RegionKind> {
        self.stack.last().map(|&id| self.nodes[id].kind)
    }

    fn top_stats(&mut self) -> Option<&mut DrawcallStats> {
        let id = *self.stack.last()?;
        Some(&mut self.nodes[id].stats)
    }

    fn stack_contains(&self, kind: RegionKind) -> bool {
        self.stack.iter().any(|&id| self.nodes[id].kind == kind)
    }

    /// Open a region as a child of the stack top
    fn open(&mut self, kind: RegionKind, handle: Option<u64>, detail: RegionDetail) -> NodeId {
        let begin_query = self.write_begin_query();
        let id = self.nodes.len();

        self.nodes.push(RegionNode {
            kind,
            handle,
            children: Vec::new(),
            begin_query,
            end_query: None,
            stats: DrawcallStats::default(),
            detail,
            secondaries: Vec::new(),
        });
        if let Some(&parent) = self.stack.last() {
            self.nodes[parent].children.push(id);
        }
        self.stack.push(id);

        #[cfg(feature = "validation")]
        assert!(
            self.stack
                .windows(2)
                .all(|w| self.nodes[w[0]].kind < self.nodes[w[1]].kind),
            "region stack out of order"
        );

        id
    }

    /// Write a begin query if the pool can still take its end query too
    fn write_begin_query(&mut self) -> Option<u32> {
        if !self.timed || self.in_secondary_subpass() {
            return None;
        }
        let pool = self.query_pool.as_mut()?;

        let free = pool.capacity() - pool.used();
        if free < self.open_timed + 2 {
            if !self.exhausted_warned {
                log::warn!(
                    "Command buffer {:?} ran out of timestamp queries ({}), remaining regions are untimed",
                    self.handle,
                    pool.capacity()
                );
                self.exhausted_warned = true;
            }
            return None;
        }

        let query = pool.write(self.handle)?;
        self.open_timed += 1;
        Some(query)
    }

    fn close_top(&mut self) {
        let Some(id) = self.stack.pop() else {
            return;
        };

        if self.nodes[id].begin_query.is_some() {
            self.open_timed -= 1;
            let handle = self.handle;
            self.nodes[id].end_query = self
                .query_pool
                .as_mut()
                .and_then(|pool| pool.write(handle));
        }
    }

    /// Close every open region of `kind` or finer
    fn close_to(&mut self, kind: RegionKind) {
        while let Some(top) = self.top_kind() {
            if top < kind {
                break;
            }
            self.close_top();
        }
    }

    fn open_subpass(&mut self, index: u32, contents: vk::SubpassContents) {
        if let Some(render_pass) = self.render_pass.as_mut() {
            render_pass.contents = contents;
        }
        if self.mode.records(RegionKind::Subpass) {
            self.open(
                RegionKind::Subpass,
                None,
                RegionDetail::Subpass {
                    index: Some(index),
                    contents,
                },
            );
        }
    }

    /// Close the current subpass, counting its implicit resolves
    fn end_subpass(&mut self) {
        self.close_to(RegionKind::Pipeline);

        let resolves = self.render_pass.as_ref().map_or(0, |render_pass| {
            render_pass
                .meta
                .as_ref()
                .map_or(0, |meta| meta.subpass_resolve_count(render_pass.subpass))
        });
        if let Some(stats) = self.top_stats() {
            stats.resolve_implicit_count += resolves as u64;
        }

        self.close_to(RegionKind::Subpass);
    }

    /// Make sure commands outside render passes land in an implicit one
    fn ensure_subpass(&mut self) {
        if self.render_pass.is_some() {
            return;
        }

        if self.mode.records(RegionKind::RenderPass) && !self.stack_contains(RegionKind::RenderPass)
        {
            self.open(RegionKind::RenderPass, None, RegionDetail::None);
        }
        if self.mode.records(RegionKind::Subpass) && !self.stack_contains(RegionKind::Subpass) {
            self.open(
                RegionKind::Subpass,
                None,
                RegionDetail::Subpass {
                    index: None,
                    contents: vk::SubpassContents::INLINE,
                },
            );
        }
    }

    /// Make the pipeline region of `source` the stack top
    fn ensure_pipeline(&mut self, source: PipelineSource, shader_tuple: ShaderTuple) {
        self.close_to(RegionKind::Drawcall);
        self.ensure_subpass();

        if !self.mode.records(RegionKind::Pipeline) {
            return;
        }

        if let Some(&top) = self.stack.last() {
            if let RegionDetail::Pipeline { source: current, .. } = &self.nodes[top].detail {
                if *current == source {
                    return;
                }
            }
        }

        self.close_to(RegionKind::Pipeline);

        let handle = match source {
            PipelineSource::Application(pipeline) => Some(pipeline.as_raw()),
            PipelineSource::Internal(_) => None,
        };
        self.open(
            RegionKind::Pipeline,
            handle,
            RegionDetail::Pipeline {
                source,
                shader_tuple,
            },
        );
    }

    /// Untimed marker at the current stack position
    fn insert_marker(&mut self, name: &str, color: [f32; 4], op: DebugLabelOp) {
        if !self.is_recording() || !self.mode.records(RegionKind::Drawcall) {
            return;
        }
        let Some(&parent) = self.stack.last() else {
            return;
        };

        let id = self.nodes.len();
        self.nodes.push(RegionNode {
            kind: RegionKind::Drawcall,
            handle: None,
            children: Vec::new(),
            begin_query: None,
            end_query: None,
            stats: DrawcallStats::default(),
            detail: RegionDetail::DebugLabel {
                name: name.to_string(),
                color,
                op,
            },
            secondaries: Vec::new(),
        });
        self.nodes[parent].children.push(id);
    }

    fn build_snapshot<F>(&self, results: Option<&[u64]>, secondary: &mut F) -> CommandBufferSnapshot
    where
        F: FnMut(vk::CommandBuffer) -> Option<CommandBufferSnapshot>,
    {
        if self.nodes.is_empty() {
            return self.incomplete();
        }

        let period = self.device.timestamp_period();
        CommandBufferSnapshot {
            handle: self.handle,
            level: self.level,
            region: self.build_region(0, results, period, secondary),
            complete: results.is_some(),
        }
    }

    fn build_region<F>(
        &self,
        id: NodeId,
        results: Option<&[u64]>,
        period: f32,
        secondary: &mut F,
    ) -> Region
    where
        F: FnMut(vk::CommandBuffer) -> Option<CommandBufferSnapshot>,
    {
        let node = &self.nodes[id];

        let children: Vec<Region> = node
            .children
            .iter()
            .map(|&child| self.build_region(child, results, period, &mut *secondary))
            .collect();

        let secondaries: Vec<CommandBufferSnapshot> = node
            .secondaries
            .iter()
            .map(|&handle| {
                secondary(handle)
                    .unwrap_or_else(|| CommandBufferSnapshot::incomplete_secondary(handle))
            })
            .collect();

        let mut stats = node.stats;
        for child in &children {
            stats += child.stats;
        }
        for executed in &secondaries {
            stats += executed.region.stats;
        }

        Region {
            kind: node.kind,
            handle: node.handle,
            begin: resolve_timestamp(node.begin_query, results, period),
            end: resolve_timestamp(node.end_query, results, period),
            stats,
            detail: node.detail.clone(),
            children,
            secondaries,
        }
    }
}

fn resolve_timestamp(query: Option<u32>, results: Option<&[u64]>, period: f32) -> Timestamp {
    let Some(query) = query else {
        return Timestamp::Untimed;
    };

    results
        .and_then(|results| results.get(query as usize))
        .map_or(Timestamp::Incomplete, |&ticks| {
            Timestamp::Resolved(GpuTimestamp {
                ticks,
                ns: ticks_to_ns(ticks, period),
            })
        })
}
