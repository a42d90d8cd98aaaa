//! # Profiler Errors
//!
//! Error taxonomy shared by the registries, recorders and the device profiler.

use ash::vk;
use thiserror::Error;

/// Profiler result alias
pub type Result<T> = std::result::Result<T, ProfilerError>;

/// Profiler error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProfilerError {
    /// Query pool or device object allocation failed
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Registry lookup on a handle that was never registered
    #[error("{kind} {handle:#x} is not registered")]
    NotFound { kind: &'static str, handle: u64 },

    /// Unsupported configuration value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Timestamps that never resolved
    #[error("timestamp data incomplete: {0}")]
    Incomplete(String),

    /// Underlying GPU context failure
    #[error("device lost")]
    DeviceLost,

    /// Any other Vulkan status
    #[error("vulkan call failed: {0:?}")]
    Vk(vk::Result),
}

impl ProfilerError {
    /// Convert to the status code reported to the interception shim
    pub fn as_vk_result(&self) -> vk::Result {
        match self {
            ProfilerError::ResourceExhausted(_) => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ProfilerError::NotFound { .. } => vk::Result::ERROR_UNKNOWN,
            ProfilerError::InvalidArgument(_) => vk::Result::ERROR_VALIDATION_FAILED_EXT,
            ProfilerError::Incomplete(_) => vk::Result::INCOMPLETE,
            ProfilerError::DeviceLost => vk::Result::ERROR_DEVICE_LOST,
            ProfilerError::Vk(result) => *result,
        }
    }

    /// Whether the error invalidates the whole device profiler
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProfilerError::DeviceLost)
    }
}

impl From<vk::Result> for ProfilerError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_TOO_MANY_OBJECTS => {
                ProfilerError::ResourceExhausted(format!("{:?}", result))
            }
            vk::Result::ERROR_DEVICE_LOST => ProfilerError::DeviceLost,
            vk::Result::NOT_READY | vk::Result::INCOMPLETE | vk::Result::TIMEOUT => {
                ProfilerError::Incomplete(format!("{:?}", result))
            }
            other => ProfilerError::Vk(other),
        }
    }
}
