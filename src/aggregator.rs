//! # Data Aggregator
//!
//! Folds the command buffer snapshots of every submission in a frame into
//! one [`FrameAggregate`]. Submissions are appended in order with
//! placeholders; snapshot data fills the placeholders as it becomes
//! available, in submission order per command buffer.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use ash::vk;

use crate::data::{
    CommandBufferSnapshot, DrawcallStats, FrameAggregate, PipelineSource, PipelineSummary,
    Region, RegionDetail, RegionKind, SubmitBatchData, SubmitData,
};
use crate::registry::ShaderTuple;

/// One `vkQueueSubmit` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitBatch {
    pub queue: vk::Queue,
    /// Command buffers of each `VkSubmitInfo`, in order
    pub submits: Vec<Vec<vk::CommandBuffer>>,
}

impl SubmitBatch {
    pub fn new(queue: vk::Queue, submits: Vec<Vec<vk::CommandBuffer>>) -> Self {
        Self { queue, submits }
    }

    /// Batch with a single submit
    pub fn single(queue: vk::Queue, command_buffers: &[vk::CommandBuffer]) -> Self {
        Self::new(queue, vec![command_buffers.to_vec()])
    }
}

enum Slot {
    Pending(vk::CommandBuffer),
    Ready(CommandBufferSnapshot),
}

struct PendingBatch {
    queue: vk::Queue,
    submits: Vec<Vec<Slot>>,
}

/// Running totals of one application pipeline
struct PipelineTotals {
    shader_tuple: ShaderTuple,
    total_ticks: u64,
    stats: DrawcallStats,
}

/// Per-frame data aggregator
pub struct DataAggregator {
    batches: Vec<PendingBatch>,
    total_ticks: u64,
    stats: DrawcallStats,
    pipelines: HashMap<vk::Pipeline, PipelineTotals>,
    incomplete_command_buffers: u32,
    top_pipeline_count: usize,
    timestamp_period: f32,
}

impl DataAggregator {
    /// Create an empty aggregator
    pub fn new(top_pipeline_count: usize, timestamp_period: f32) -> Self {
        Self {
            batches: Vec::new(),
            total_ticks: 0,
            stats: DrawcallStats::default(),
            pipelines: HashMap::new(),
            incomplete_command_buffers: 0,
            top_pipeline_count,
            timestamp_period,
        }
    }

    /// Append a submission whose data is not available yet
    pub fn append_submit(&mut self, batch: SubmitBatch) {
        self.batches.push(PendingBatch {
            queue: batch.queue,
            submits: batch
                .submits
                .into_iter()
                .map(|cbs| cbs.into_iter().map(Slot::Pending).collect())
                .collect(),
        });
    }

    /// Supply the data of the earliest pending submission of a command buffer
    ///
    /// Returns false if the command buffer has no pending submission.
    pub fn append_data(&mut self, command_buffer: vk::CommandBuffer, snapshot: CommandBufferSnapshot) -> bool {
        let Some((batch, submit, index)) = self.find_pending(command_buffer) else {
            log::debug!("Dropping data of {:?}: no pending submission", command_buffer);
            return false;
        };

        self.fold(&snapshot);
        self.batches[batch].submits[submit][index] = Slot::Ready(snapshot);
        true
    }

    /// Check whether a command buffer still has pending submissions
    pub fn has_pending(&self, command_buffer: vk::CommandBuffer) -> bool {
        self.pending().any(|handle| handle == command_buffer)
    }

    /// Command buffers with pending submissions, in submission order
    pub fn pending_command_buffers(&self) -> Vec<vk::CommandBuffer> {
        let mut handles: Vec<vk::CommandBuffer> = Vec::new();
        for handle in self.pending() {
            if !handles.contains(&handle) {
                handles.push(handle);
            }
        }
        handles
    }

    /// Resolve every pending submission
    ///
    /// `resolver` supplies the snapshot of a command buffer, or `None` if the
    /// command buffer is gone; the slot then becomes an incomplete snapshot.
    /// Calling this again without new submissions changes nothing.
    pub fn aggregate<F>(&mut self, mut resolver: F)
    where
        F: FnMut(vk::CommandBuffer) -> Option<CommandBufferSnapshot>,
    {
        for handle in self.pending_command_buffers() {
            // Every pending slot of the command buffer receives the same data
            while self.has_pending(handle) {
                let snapshot = resolver(handle)
                    .unwrap_or_else(|| CommandBufferSnapshot::incomplete(handle));
                self.append_data(handle, snapshot);
            }
        }
    }

    /// Get the data accumulated so far without resetting it
    ///
    /// Pending submissions are not included.
    pub fn get_aggregated_data(&self) -> FrameAggregate {
        let submit_batches = self
            .batches
            .iter()
            .map(|batch| SubmitBatchData {
                queue: batch.queue,
                submits: batch
                    .submits
                    .iter()
                    .map(|slots| SubmitData {
                        command_buffers: slots
                            .iter()
                            .filter_map(|slot| match slot {
                                Slot::Ready(snapshot) => Some(snapshot.clone()),
                                Slot::Pending(_) => None,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let mut top = TopN::new(self.top_pipeline_count);
        for (handle, totals) in &self.pipelines {
            top.push(totals.total_ticks, (*handle, totals));
        }
        let top_pipelines = top
            .into_sorted_vec()
            .into_iter()
            .map(|(ticks, (handle, totals))| PipelineSummary {
                handle,
                shader_tuple: totals.shader_tuple,
                name: None,
                total_ticks: ticks,
                stats: totals.stats,
            })
            .collect();

        FrameAggregate {
            timestamp_period: self.timestamp_period,
            total_ticks: self.total_ticks,
            stats: self.stats,
            submit_batches,
            top_pipelines,
            incomplete_command_buffers: self.incomplete_command_buffers,
            ..Default::default()
        }
    }

    /// Clear all accumulated state for the next frame
    pub fn reset(&mut self) {
        self.batches.clear();
        self.total_ticks = 0;
        self.stats = DrawcallStats::default();
        self.pipelines.clear();
        self.incomplete_command_buffers = 0;
    }

    fn find_pending(&self, command_buffer: vk::CommandBuffer) -> Option<(usize, usize, usize)> {
        for (b, batch) in self.batches.iter().enumerate() {
            for (s, submit) in batch.submits.iter().enumerate() {
                let index = submit
                    .iter()
                    .position(|slot| matches!(slot, Slot::Pending(handle) if *handle == command_buffer));
                if let Some(index) = index {
                    return Some((b, s, index));
                }
            }
        }
        None
    }

    fn pending(&self) -> impl Iterator<Item = vk::CommandBuffer> + '_ {
        self.batches
            .iter()
            .flat_map(|batch| batch.submits.iter())
            .flat_map(|submit| submit.iter())
            .filter_map(|slot| match slot {
                Slot::Pending(handle) => Some(*handle),
                Slot::Ready(_) => None,
            })
    }

    /// Add one snapshot to the running totals; incomplete data adds nothing
    fn fold(&mut self, snapshot: &CommandBufferSnapshot) {
        if !snapshot.complete {
            self.incomplete_command_buffers += 1;
            return;
        }

        self.total_ticks += snapshot.duration_ticks();
        self.stats += snapshot.region.stats;
        self.fold_pipelines(&snapshot.region);
    }

    fn fold_pipelines(&mut self, region: &Region) {
        if region.kind == RegionKind::Pipeline {
            if let RegionDetail::Pipeline {
                source: PipelineSource::Application(handle),
                shader_tuple,
            } = &region.detail
            {
                let totals = self.pipelines.entry(*handle).or_insert_with(|| PipelineTotals {
                    shader_tuple: *shader_tuple,
                    total_ticks: 0,
                    stats: DrawcallStats::default(),
                });
                totals.total_ticks += region.duration_ticks();
                totals.stats += region.stats;
            }
            return;
        }

        for child in &region.children {
            self.fold_pipelines(child);
        }
        for secondary in &region.secondaries {
            self.fold_pipelines(&secondary.region);
        }
    }
}

/// Bounded ranking of the `capacity` largest keys
///
/// Keeps a min-heap of the current candidates; a newcomer displaces the
/// smallest one only if its key is strictly larger, so earlier entries win
/// ties.
pub struct TopN<T> {
    capacity: usize,
    heap: BinaryHeap<Reverse<Entry<T>>>,
    seq: u64,
}

struct Entry<T> {
    key: u64,
    seq: u64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Among equal keys the later entry ranks lower
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> TopN<T> {
    /// Create an empty ranking
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity + 1),
            seq: 0,
        }
    }

    /// Offer a candidate
    pub fn push(&mut self, key: u64, value: T) {
        if self.capacity == 0 {
            return;
        }

        let entry = Entry {
            key,
            seq: self.seq,
            value,
        };
        self.seq += 1;

        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(entry));
        } else if let Some(mut min) = self.heap.peek_mut() {
            if key > min.0.key {
                *min = Reverse(entry);
            }
        }
    }

    /// Number of retained candidates
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Retained candidates, largest key first
    pub fn into_sorted_vec(self) -> Vec<(u64, T)> {
        // Ascending order of Reverse is descending order of entries
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(entry)| (entry.key, entry.value))
            .collect()
    }
}
