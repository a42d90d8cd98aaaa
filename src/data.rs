//! # Region Hierarchy
//!
//! The timed region tree produced by the recorders and merged by the
//! aggregator: frame, submit batch, submit, command buffer, render pass,
//! subpass, pipeline and drawcall.

use std::ops::AddAssign;

use ash::vk::{self, Handle};
use serde::Serialize;

use crate::profiling::{CpuStats, MemoryStats};
use crate::registry::ShaderTuple;
use crate::vulkan::ticks_to_ns;

/// Resolved GPU timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct GpuTimestamp {
    pub ticks: u64,
    pub ns: u64,
}

/// Begin or end timestamp of a region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Timestamp {
    /// Written but not read back yet
    #[default]
    Pending,
    Resolved(GpuTimestamp),
    /// Never resolved (not submitted, readback failure, device loss)
    Incomplete,
    /// No query was written for this region
    Untimed,
}

impl Timestamp {
    /// Raw ticks if resolved
    pub fn ticks(&self) -> Option<u64> {
        match self {
            Timestamp::Resolved(ts) => Some(ts.ticks),
            _ => None,
        }
    }

    /// Check if the timestamp was read back
    pub fn is_resolved(&self) -> bool {
        matches!(self, Timestamp::Resolved(_))
    }
}

/// Level of a region in the hierarchy, outermost first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RegionKind {
    Frame,
    SubmitBatch,
    Submit,
    CommandBuffer,
    RenderPass,
    Subpass,
    Pipeline,
    Drawcall,
}

/// Traced command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Draw,
    DrawIndexed,
    DrawIndirect,
    DrawIndexedIndirect,
    Dispatch,
    DispatchIndirect,
    CopyBuffer,
    CopyBufferToImage,
    CopyImage,
    CopyImageToBuffer,
    ClearAttachments { attachment_count: u32 },
    ClearColorImage,
    ClearDepthStencilImage,
    ResolveImage,
    BlitImage,
    FillBuffer,
    UpdateBuffer,
    PipelineBarrier {
        memory_barrier_count: u32,
        buffer_barrier_count: u32,
        image_barrier_count: u32,
    },
    ExecuteCommands { command_buffer_count: u32 },
}

impl Command {
    /// Internal pipeline the command is grouped under, `None` for draws and dispatches
    pub fn internal_pipeline(&self) -> Option<InternalPipeline> {
        match self {
            Command::Draw
            | Command::DrawIndexed
            | Command::DrawIndirect
            | Command::DrawIndexedIndirect
            | Command::Dispatch
            | Command::DispatchIndirect => None,
            Command::CopyBuffer
            | Command::CopyBufferToImage
            | Command::CopyImage
            | Command::CopyImageToBuffer => Some(InternalPipeline::Copy),
            Command::ClearAttachments { .. }
            | Command::ClearColorImage
            | Command::ClearDepthStencilImage => Some(InternalPipeline::Clear),
            Command::ResolveImage => Some(InternalPipeline::Resolve),
            Command::BlitImage => Some(InternalPipeline::Blit),
            Command::FillBuffer | Command::UpdateBuffer => Some(InternalPipeline::Transfer),
            Command::PipelineBarrier { .. } => Some(InternalPipeline::Barrier),
            Command::ExecuteCommands { .. } => Some(InternalPipeline::ExecuteCommands),
        }
    }

    /// Bind point whose pipeline executes the command
    pub fn bind_point(&self) -> Option<vk::PipelineBindPoint> {
        match self {
            Command::Draw
            | Command::DrawIndexed
            | Command::DrawIndirect
            | Command::DrawIndexedIndirect => Some(vk::PipelineBindPoint::GRAPHICS),
            Command::Dispatch | Command::DispatchIndirect => Some(vk::PipelineBindPoint::COMPUTE),
            _ => None,
        }
    }
}

/// Pseudo-pipelines grouping commands that do not run an application pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InternalPipeline {
    Copy,
    Clear,
    Resolve,
    Blit,
    Transfer,
    Barrier,
    ExecuteCommands,
    /// Draw or dispatch without a bound pipeline
    Unbound,
}

/// Who owns the pipeline of a pipeline region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineSource {
    Application(vk::Pipeline),
    Internal(InternalPipeline),
}

/// Debug label operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DebugLabelOp {
    Begin,
    End,
    Insert,
}

/// Kind-specific payload of a region
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RegionDetail {
    #[default]
    None,
    /// `index` is `None` for the implicit subpass outside render passes
    Subpass {
        index: Option<u32>,
        contents: vk::SubpassContents,
    },
    Pipeline {
        source: PipelineSource,
        shader_tuple: ShaderTuple,
    },
    Drawcall {
        command: Command,
    },
    /// Untimed marker in drawcall position
    DebugLabel {
        name: String,
        color: [f32; 4],
        op: DebugLabelOp,
    },
}

/// Per-operation-type counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrawcallStats {
    pub draw_count: u64,
    pub draw_indirect_count: u64,
    pub dispatch_count: u64,
    pub dispatch_indirect_count: u64,
    pub copy_buffer_count: u64,
    pub copy_buffer_to_image_count: u64,
    pub copy_image_count: u64,
    pub copy_image_to_buffer_count: u64,
    pub clear_color_count: u64,
    pub clear_depth_stencil_count: u64,
    pub clear_attachments_count: u64,
    pub clear_color_implicit_count: u64,
    pub clear_depth_stencil_implicit_count: u64,
    pub resolve_count: u64,
    pub resolve_implicit_count: u64,
    pub blit_image_count: u64,
    pub fill_buffer_count: u64,
    pub update_buffer_count: u64,
    pub pipeline_barrier_count: u64,
    pub execute_commands_count: u64,
}

impl DrawcallStats {
    /// Count one command
    pub fn record(&mut self, command: &Command) {
        match command {
            Command::Draw | Command::DrawIndexed => self.draw_count += 1,
            Command::DrawIndirect | Command::DrawIndexedIndirect => self.draw_indirect_count += 1,
            Command::Dispatch => self.dispatch_count += 1,
            Command::DispatchIndirect => self.dispatch_indirect_count += 1,
            Command::CopyBuffer => self.copy_buffer_count += 1,
            Command::CopyBufferToImage => self.copy_buffer_to_image_count += 1,
            Command::CopyImage => self.copy_image_count += 1,
            Command::CopyImageToBuffer => self.copy_image_to_buffer_count += 1,
            Command::ClearAttachments { attachment_count } => {
                self.clear_attachments_count += *attachment_count as u64
            }
            Command::ClearColorImage => self.clear_color_count += 1,
            Command::ClearDepthStencilImage => self.clear_depth_stencil_count += 1,
            Command::ResolveImage => self.resolve_count += 1,
            Command::BlitImage => self.blit_image_count += 1,
            Command::FillBuffer => self.fill_buffer_count += 1,
            Command::UpdateBuffer => self.update_buffer_count += 1,
            Command::PipelineBarrier { .. } => self.pipeline_barrier_count += 1,
            Command::ExecuteCommands { command_buffer_count } => {
                self.execute_commands_count += *command_buffer_count as u64
            }
        }
    }

    /// Draws of any kind
    pub fn total_draws(&self) -> u64 {
        self.draw_count + self.draw_indirect_count
    }

    /// Dispatches of any kind
    pub fn total_dispatches(&self) -> u64 {
        self.dispatch_count + self.dispatch_indirect_count
    }
}

impl AddAssign for DrawcallStats {
    fn add_assign(&mut self, rhs: Self) {
        self.draw_count += rhs.draw_count;
        self.draw_indirect_count += rhs.draw_indirect_count;
        self.dispatch_count += rhs.dispatch_count;
        self.dispatch_indirect_count += rhs.dispatch_indirect_count;
        self.copy_buffer_count += rhs.copy_buffer_count;
        self.copy_buffer_to_image_count += rhs.copy_buffer_to_image_count;
        self.copy_image_count += rhs.copy_image_count;
        self.copy_image_to_buffer_count += rhs.copy_image_to_buffer_count;
        self.clear_color_count += rhs.clear_color_count;
        self.clear_depth_stencil_count += rhs.clear_depth_stencil_count;
        self.clear_attachments_count += rhs.clear_attachments_count;
        self.clear_color_implicit_count += rhs.clear_color_implicit_count;
        self.clear_depth_stencil_implicit_count += rhs.clear_depth_stencil_implicit_count;
        self.resolve_count += rhs.resolve_count;
        self.resolve_implicit_count += rhs.resolve_implicit_count;
        self.blit_image_count += rhs.blit_image_count;
        self.fill_buffer_count += rhs.fill_buffer_count;
        self.update_buffer_count += rhs.update_buffer_count;
        self.pipeline_barrier_count += rhs.pipeline_barrier_count;
        self.execute_commands_count += rhs.execute_commands_count;
    }
}

/// One node of the region tree
///
/// `stats` covers the whole subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub kind: RegionKind,
    /// Raw handle of the object the region belongs to
    pub handle: Option<u64>,
    pub begin: Timestamp,
    pub end: Timestamp,
    pub stats: DrawcallStats,
    pub detail: RegionDetail,
    /// Children in issue order
    pub children: Vec<Region>,
    /// Secondary command buffers executed in this region, in execution order
    pub secondaries: Vec<CommandBufferSnapshot>,
}

impl Region {
    /// Create an empty region
    pub fn new(kind: RegionKind, handle: Option<u64>) -> Self {
        Self {
            kind,
            handle,
            begin: Timestamp::Pending,
            end: Timestamp::Pending,
            stats: DrawcallStats::default(),
            detail: RegionDetail::None,
            children: Vec::new(),
            secondaries: Vec::new(),
        }
    }

    /// Region enclosing the given children, spanning their resolved timestamps
    pub fn spanning(kind: RegionKind, handle: Option<u64>, children: Vec<Region>) -> Self {
        let mut region = Region::new(kind, handle);

        let begin = children.iter().filter_map(|c| match c.begin {
            Timestamp::Resolved(ts) if c.end.is_resolved() => Some(ts),
            _ => None,
        });
        let end = children.iter().filter_map(|c| match c.end {
            Timestamp::Resolved(ts) if c.begin.is_resolved() => Some(ts),
            _ => None,
        });

        match (begin.min(), end.max()) {
            (Some(begin), Some(end)) => {
                region.begin = Timestamp::Resolved(begin);
                region.end = Timestamp::Resolved(end);
            }
            _ => {
                region.begin = Timestamp::Incomplete;
                region.end = Timestamp::Incomplete;
            }
        }

        for child in &children {
            region.stats += child.stats;
        }
        region.children = children;
        region
    }

    /// Duration in ticks, zero unless both ends resolved
    pub fn duration_ticks(&self) -> u64 {
        match (self.begin.ticks(), self.end.ticks()) {
            (Some(begin), Some(end)) => end.saturating_sub(begin),
            _ => 0,
        }
    }

    /// Check if both timestamps were read back
    pub fn is_resolved(&self) -> bool {
        self.begin.is_resolved() && self.end.is_resolved()
    }

    /// Pre-order walk over the subtree, including executed secondaries
    pub fn walk<F: FnMut(&Region)>(&self, f: &mut F) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
        for secondary in &self.secondaries {
            secondary.region.walk(f);
        }
    }

    /// Count regions of a kind in the subtree
    pub fn count(&self, kind: RegionKind) -> usize {
        let mut count = 0;
        self.walk(&mut |region| {
            if region.kind == kind {
                count += 1;
            }
        });
        count
    }
}

/// Finalized region tree of one command buffer
#[derive(Debug, Clone, PartialEq)]
pub struct CommandBufferSnapshot {
    pub handle: vk::CommandBuffer,
    pub level: vk::CommandBufferLevel,
    /// Root `CommandBuffer` region
    pub region: Region,
    /// False if any timed region failed to resolve
    pub complete: bool,
}

impl CommandBufferSnapshot {
    /// Placeholder for a command buffer whose data never became available
    pub fn incomplete(handle: vk::CommandBuffer) -> Self {
        let mut region = Region::new(RegionKind::CommandBuffer, Some(handle.as_raw()));
        region.begin = Timestamp::Incomplete;
        region.end = Timestamp::Incomplete;

        Self {
            handle,
            level: vk::CommandBufferLevel::PRIMARY,
            region,
            complete: false,
        }
    }

    /// Placeholder for an executed secondary without data
    pub fn incomplete_secondary(handle: vk::CommandBuffer) -> Self {
        Self {
            level: vk::CommandBufferLevel::SECONDARY,
            ..Self::incomplete(handle)
        }
    }

    /// GPU ticks of the command buffer
    pub fn duration_ticks(&self) -> u64 {
        self.region.duration_ticks()
    }
}

/// One submit of a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitData {
    pub command_buffers: Vec<CommandBufferSnapshot>,
}

/// One queue submission call
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitBatchData {
    pub queue: vk::Queue,
    pub submits: Vec<SubmitData>,
}

/// Aggregated data of one application pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub handle: vk::Pipeline,
    pub shader_tuple: ShaderTuple,
    /// Debug name, application-provided or derived from the shader tuple
    pub name: Option<String>,
    pub total_ticks: u64,
    pub stats: DrawcallStats,
}

/// Published result of one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameAggregate {
    pub frame_index: u64,
    /// Nanoseconds per tick
    pub timestamp_period: f32,
    /// Sum of command buffer GPU time
    pub total_ticks: u64,
    pub stats: DrawcallStats,
    /// Submission order
    pub submit_batches: Vec<SubmitBatchData>,
    /// Longest application pipelines, longest first
    pub top_pipelines: Vec<PipelineSummary>,
    /// Command buffers that contributed no data
    pub incomplete_command_buffers: u32,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
}

impl FrameAggregate {
    /// Total GPU time in nanoseconds
    pub fn gpu_time_ns(&self) -> u64 {
        ticks_to_ns(self.total_ticks, self.timestamp_period)
    }

    /// Iterate all command buffer snapshots in submission order
    pub fn command_buffers(&self) -> impl Iterator<Item = &CommandBufferSnapshot> {
        self.submit_batches
            .iter()
            .flat_map(|batch| batch.submits.iter())
            .flat_map(|submit| submit.command_buffers.iter())
    }

    /// Materialize the full frame region tree
    pub fn frame_region(&self) -> Region {
        let batches = self
            .submit_batches
            .iter()
            .map(|batch| {
                let submits = batch
                    .submits
                    .iter()
                    .map(|submit| {
                        let command_buffers =
                            submit.command_buffers.iter().map(|cb| cb.region.clone()).collect();
                        Region::spanning(RegionKind::Submit, None, command_buffers)
                    })
                    .collect();
                Region::spanning(RegionKind::SubmitBatch, Some(batch.queue.as_raw()), submits)
            })
            .collect();

        Region::spanning(RegionKind::Frame, Some(self.frame_index), batches)
    }

    /// Summary for exporters
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

impl Serialize for FrameAggregate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let top_pipelines: Vec<PipelineJson<'_>> = self
            .top_pipelines
            .iter()
            .map(|p| PipelineJson {
                handle: format!("{:#x}", p.handle.as_raw()),
                name: p.name.as_deref(),
                shader_hash: format!("{:08x}", p.shader_tuple.hash),
                time_ns: ticks_to_ns(p.total_ticks, self.timestamp_period),
                stats: &p.stats,
            })
            .collect();

        let mut state = serializer.serialize_struct("FrameAggregate", 11)?;
        state.serialize_field("frame_index", &self.frame_index)?;
        state.serialize_field("captured_at", &self.cpu.captured_at.to_rfc3339())?;
        state.serialize_field("gpu_time_ns", &self.gpu_time_ns())?;
        state.serialize_field("frame_time_ns", &self.cpu.frame_time_ns)?;
        state.serialize_field("fps", &self.cpu.fps)?;
        state.serialize_field("command_buffer_count", &self.command_buffers().count())?;
        state.serialize_field("incomplete_command_buffers", &self.incomplete_command_buffers)?;
        state.serialize_field("stats", &self.stats)?;
        state.serialize_field("top_pipelines", &top_pipelines)?;
        state.serialize_field("memory", &self.memory)?;
        state.serialize_field("registry_access", &self.cpu.registry_access)?;
        state.end()
    }
}

#[derive(Serialize)]
struct PipelineJson<'a> {
    handle: String,
    name: Option<&'a str>,
    shader_hash: String,
    time_ns: u64,
    stats: &'a DrawcallStats,
}
