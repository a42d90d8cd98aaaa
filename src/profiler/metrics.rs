//! # Vendor Metrics Backends
//!
//! Hardware performance counter backends are selected once when the
//! profiler is created. The profiler only manages the lifetime of the
//! backend's per-queue performance configuration; collecting counter
//! values is up to the backend.

use ash::vk;
use serde::Serialize;

use crate::error::Result;

/// Description of one hardware metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricProperty {
    pub name: String,
    pub category: String,
    pub description: String,
    pub unit: String,
}

/// Vendor performance counter backend
pub trait VendorMetrics: Send + Sync {
    /// Metrics the backend can report
    fn metric_properties(&self) -> Vec<MetricProperty>;

    /// Acquire the exclusive performance configuration for a submission
    fn acquire_configuration(&self, queue: vk::Queue) -> Result<vk::PerformanceConfigurationINTEL>;

    /// Release a configuration returned by `acquire_configuration`
    fn release_configuration(&self, configuration: vk::PerformanceConfigurationINTEL);
}

/// Metrics backend of a device
#[derive(Default)]
pub enum MetricsBackend {
    #[default]
    None,
    /// VK_INTEL_performance_query with the Metrics Discovery library
    IntelMetricsDiscovery(Box<dyn VendorMetrics>),
    /// VK_KHR_performance_query
    KhrPerformanceQuery(Box<dyn VendorMetrics>),
}

impl MetricsBackend {
    /// The active backend, if any
    pub fn vendor(&self) -> Option<&dyn VendorMetrics> {
        match self {
            MetricsBackend::None => None,
            MetricsBackend::IntelMetricsDiscovery(backend)
            | MetricsBackend::KhrPerformanceQuery(backend) => Some(backend.as_ref()),
        }
    }

    /// Check whether a backend is active
    pub fn is_active(&self) -> bool {
        self.vendor().is_some()
    }

    /// Backend name for logging
    pub fn name(&self) -> &'static str {
        match self {
            MetricsBackend::None => "none",
            MetricsBackend::IntelMetricsDiscovery(_) => "Intel Metrics Discovery",
            MetricsBackend::KhrPerformanceQuery(_) => "VK_KHR_performance_query",
        }
    }

    /// Metrics of the active backend, empty without one
    pub fn metric_properties(&self) -> Vec<MetricProperty> {
        self.vendor()
            .map(|vendor| vendor.metric_properties())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for MetricsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
