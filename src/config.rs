// config.rs — engine configuration.
//
// A plain struct with sensible defaults. Loading it from files or the
// command line is left to the embedding application.

use crate::error::{EngineError, Result};

/// Largest workgroup the top-K kernel supports (its scratch arrays are
/// sized for this many invocations).
pub const MAX_REDUCTION_WORKGROUP: u32 = 256;

/// Configuration for a [`ComputeSession`](crate::gpu::session::ComputeSession)
/// and the spectral pipelines built on it.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of submission channels in the queue pool. Must be ≥ 1.
    pub queue_count: usize,
    /// Backends the adapter search may use.
    pub backends: wgpu::Backends,
    /// 1D workgroup size for element-wise kernels. Power of two.
    pub workgroup_size: u32,
    /// Collect per-stage timings. Device timestamps are requested when the
    /// adapter supports them.
    pub profiling: bool,
    /// Fraction (0, 1] of the device's max buffer size one batch may use
    /// before the job is split into sub-batches.
    pub memory_usage_limit: f64,
    /// Fraction (0, 1] of the rows per sub-batch when splitting.
    pub batch_size_ratio: f64,
    /// Sample rate used to convert interpolated bins to Hz.
    pub sample_rate_hz: f64,
    /// Return the windowed complex spectrum and magnitudes with the peaks.
    pub keep_spectrum: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            queue_count: 4,
            backends: wgpu::Backends::PRIMARY,
            workgroup_size: 256,
            profiling: true,
            memory_usage_limit: 0.8,
            batch_size_ratio: 0.1,
            sample_rate_hz: 12.0e6,
            keep_spectrum: false,
        }
    }
}

impl EngineConfig {
    /// Reject out-of-range values. Called by `ComputeSession::new`.
    pub fn validate(&self) -> Result<()> {
        if self.queue_count < 1 {
            return Err(EngineError::config("queue_count", "must be at least 1"));
        }
        if !self.workgroup_size.is_power_of_two() {
            return Err(EngineError::config(
                "workgroup_size",
                format!("must be a power of two, got {}", self.workgroup_size),
            ));
        }
        if !(self.memory_usage_limit > 0.0 && self.memory_usage_limit <= 1.0) {
            return Err(EngineError::config(
                "memory_usage_limit",
                format!("must be in (0, 1], got {}", self.memory_usage_limit),
            ));
        }
        if !(self.batch_size_ratio > 0.0 && self.batch_size_ratio <= 1.0) {
            return Err(EngineError::config(
                "batch_size_ratio",
                format!("must be in (0, 1], got {}", self.batch_size_ratio),
            ));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(EngineError::config(
                "sample_rate_hz",
                format!("must be positive, got {}", self.sample_rate_hz),
            ));
        }
        Ok(())
    }

    /// Workgroup size for the top-K kernel: the configured size, capped at
    /// [`MAX_REDUCTION_WORKGROUP`].
    pub fn reduction_workgroup(&self) -> u32 {
        self.workgroup_size.min(MAX_REDUCTION_WORKGROUP)
    }
}
