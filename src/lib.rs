//! # vkprof core
//!
//! Per-frame GPU profiling core of a Vulkan layer.
//!
//! The layer front-end forwards intercepted Vulkan calls to a
//! [`DeviceProfiler`], which records timestamp queries around regions of
//! every command buffer, resolves them after submission and aggregates them
//! into one [`FrameAggregate`] per frame.
//!
//! ## Modules
//!
//! - **command_buffer**: region tree recording and timestamp placement
//! - **aggregator**: per-frame folding of command buffer snapshots
//! - **registry**: shadow state of pipelines, render passes and shaders
//! - **profiler**: the device profiler, its configuration and vendor metrics
//! - **profiling**: CPU-side frame timing and memory tracking
//! - **vulkan**: device dispatch, timestamp query pools, headless device

pub mod aggregator;
pub mod command_buffer;
pub mod data;
pub mod error;
pub mod profiler;
pub mod profiling;
pub mod registry;
pub mod util;
pub mod vulkan;

pub use aggregator::{DataAggregator, SubmitBatch, TopN};
pub use command_buffer::{CommandBufferRecorder, RecorderState};
pub use data::{
    Command, CommandBufferSnapshot, DrawcallStats, FrameAggregate, PipelineSummary, Region,
    RegionDetail, RegionKind, Timestamp,
};
pub use error::{ProfilerError, Result};
pub use profiler::{
    DeviceProfiler, MetricProperty, MetricsBackend, ProfilerConfig, ProfilerMode, SyncMode,
    VendorMetrics,
};
pub use vulkan::{AshDevice, DeviceDispatch, HeadlessDevice};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = "vkprof";

/// Install the log subscriber
///
/// Safe to call more than once; only the first call installs it.
pub fn init_logging() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .try_init();
}
