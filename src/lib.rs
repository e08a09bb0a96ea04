// beamfft: batched spectral peak extraction on the GPU.
//
// M rows of N complex samples go in; per row, the K strongest bins of a
// zero-padded, frequency-centered spectrum come out, with phase and an
// interpolated frequency for the strongest one.
//
// Host modules are the reference implementation and run without a device.
// `gpu` holds the wgpu compute layer built on them.

pub mod cache;
pub mod config;
pub mod error;
pub mod job;
pub mod peaks;
pub mod pipeline;
pub mod profiling;
pub mod registry;
pub mod spectrum;
pub mod transform;

pub mod gpu;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use job::{BatchJob, JobShape};
pub use peaks::{Peak, RowPeaks, SENTINEL_INDEX};
pub use pipeline::{SpectralPipeline, SpectralResult};
pub use profiling::{ProfilingReport, Stage};
pub use transform::{RustFftBackend, TransformBackend};
