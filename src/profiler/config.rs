//! # Profiler Configuration
//!
//! Configuration parsed from the JSON handed over by the layer front-end.

use serde::{Deserialize, Serialize};

use crate::data::RegionKind;
use crate::error::{ProfilerError, Result};

/// Sampling granularity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerMode {
    #[default]
    PerDrawcall,
    PerPipeline,
    PerRenderPass,
    PerCommandBuffer,
    PerSubmit,
    PerFrame,
}

impl ProfilerMode {
    /// Convert a raw API value
    pub fn from_raw(value: u32) -> Result<Self> {
        match value {
            0 => Ok(ProfilerMode::PerDrawcall),
            1 => Ok(ProfilerMode::PerPipeline),
            2 => Ok(ProfilerMode::PerRenderPass),
            3 => Ok(ProfilerMode::PerCommandBuffer),
            4 => Ok(ProfilerMode::PerSubmit),
            5 => Ok(ProfilerMode::PerFrame),
            _ => Err(ProfilerError::InvalidArgument(format!(
                "profiler mode {}",
                value
            ))),
        }
    }

    /// Check whether regions of a kind are recorded in this mode
    ///
    /// Command buffer regions are always recorded since snapshots are rooted
    /// at them; submit and frame spans are derived from command buffers.
    pub fn records(&self, kind: RegionKind) -> bool {
        let finest = match self {
            ProfilerMode::PerDrawcall => RegionKind::Drawcall,
            ProfilerMode::PerPipeline => RegionKind::Pipeline,
            ProfilerMode::PerRenderPass => RegionKind::RenderPass,
            ProfilerMode::PerCommandBuffer | ProfilerMode::PerSubmit | ProfilerMode::PerFrame => {
                RegionKind::CommandBuffer
            }
        };
        kind <= finest
    }
}

/// When the CPU waits for the GPU before reading timestamps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Wait for the device to go idle once per frame
    #[default]
    Present,
    /// Wait for every submission to complete
    Submit,
}

impl SyncMode {
    /// Convert a raw API value
    pub fn from_raw(value: u32) -> Result<Self> {
        match value {
            0 => Ok(SyncMode::Present),
            1 => Ok(SyncMode::Submit),
            _ => Err(ProfilerError::InvalidArgument(format!("sync mode {}", value))),
        }
    }
}

/// Profiler configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Sampling granularity
    pub mode: ProfilerMode,

    /// Synchronization policy
    #[serde(rename = "syncMode")]
    pub sync_mode: SyncMode,

    /// Timestamp queries available to one command buffer recording
    #[serde(rename = "queriesPerCommandBuffer")]
    pub queries_per_command_buffer: u32,

    /// Length of the top pipeline list
    #[serde(rename = "topPipelineCount")]
    pub top_pipeline_count: usize,

    /// Track device memory allocations
    #[serde(rename = "trackMemory")]
    pub track_memory: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            mode: ProfilerMode::PerDrawcall,
            sync_mode: SyncMode::Present,
            queries_per_command_buffer: 4096,
            top_pipeline_count: 10,
            track_memory: true,
        }
    }
}

impl ProfilerConfig {
    /// Smallest pool that still times the command buffer itself
    pub const MIN_QUERIES_PER_COMMAND_BUFFER: u32 = 2;

    /// Parse config from bytes (JSON)
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            log::warn!("Empty config data, using defaults");
            return Ok(Self::default());
        }

        let config: Self = serde_json::from_slice(data)
            .map_err(|e| ProfilerError::InvalidArgument(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.queries_per_command_buffer < Self::MIN_QUERIES_PER_COMMAND_BUFFER {
            return Err(ProfilerError::InvalidArgument(format!(
                "queriesPerCommandBuffer must be at least {}, got {}",
                Self::MIN_QUERIES_PER_COMMAND_BUFFER,
                self.queries_per_command_buffer
            )));
        }
        Ok(())
    }
}
