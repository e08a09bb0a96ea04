// gpu/mod.rs — wgpu compute layer.
//
// Everything that touches the device lives here. The device-free logic it
// drives (caches, registry, gather/scatter rules, top-K reference, job
// planning) lives in the parent crate, and every kernel is validated
// against those host references.
//
//   session     owns device, queue pool, program/kernel caches, registry
//   device      adapter selection, limits, error scopes, workgroup size
//   queue       submission channels and completion tokens
//   buffer      typed device buffers (owned / external / pinned)
//   program     WGSL compile and compute pipelines
//   timestamps  device-side pass timing
//   pipeline    gather → transform → scatter → top-K on the device

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod program;
pub mod queue;
pub mod session;
pub mod timestamps;

pub use buffer::{AccessMode, GpuBuffer, PendingRead};
pub use device::{DeviceContext, WorkgroupSize};
pub use pipeline::{GpuSpectralPipeline, PipelineStats};
pub use queue::{CommandQueue, Completion, QueuePool, SubmissionChannel};
pub use session::{ComputeSession, SessionStats};
