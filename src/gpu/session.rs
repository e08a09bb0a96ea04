// gpu/session.rs — the compute session.
//
// One explicitly constructed object owns everything that must exist once
// per process: the device context, the queue pool, the program and kernel
// caches, and the named buffer registry. The entry point creates it and
// passes `&ComputeSession` to whatever needs device access.

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;
use num_complex::Complex32;

use crate::cache::{CacheStats, KernelCache, ProgramCache, ProgramId};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::gpu::buffer::{AccessMode, GpuBuffer};
use crate::gpu::device::{DeviceContext, WorkgroupSize};
use crate::gpu::program::{BindingKind, Kernel, ShaderProgram};
use crate::gpu::queue::{CommandQueue, QueuePool};
use crate::registry::BufferRegistry;

/// Snapshot of session bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionStats {
    pub programs: CacheStats,
    pub kernels: CacheStats,
    /// Registry entries, live or awaiting cleanup.
    pub registry_entries: usize,
    pub queues: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "programs [{}] kernels [{}] registry {} queues {}",
            self.programs, self.kernels, self.registry_entries, self.queues
        )
    }
}

pub struct ComputeSession {
    config: EngineConfig,
    context: DeviceContext,
    queues: QueuePool<CommandQueue>,
    programs: ProgramCache<ShaderProgram>,
    kernels: KernelCache<Kernel>,
    buffers: BufferRegistry<GpuBuffer<Complex32>>,
}

impl ComputeSession {
    /// Validate `config`, open the device and create the queue pool.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let context = DeviceContext::new(&config)?;
        let queues = QueuePool::new();
        queues.initialize(&context, config.queue_count)?;
        log::info!(
            "compute session ready: {} queue(s) on {}",
            config.queue_count,
            context.adapter_info
        );
        Ok(ComputeSession {
            config,
            context,
            queues,
            programs: ProgramCache::new(),
            kernels: KernelCache::new(),
            buffers: BufferRegistry::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    pub fn queues(&self) -> &QueuePool<CommandQueue> {
        &self.queues
    }

    // ---- programs and kernels ----------------------------------------------

    /// Compile a WGSL template, or return the cached program for it. The
    /// template's `{{WG_SIZE}}` is replaced with the session workgroup size
    /// first, so the cache key is the specialized text.
    pub fn load_program(&self, label: &str, template: &str) -> Result<Arc<ShaderProgram>> {
        self.load_program_sized(label, template, self.context.workgroup_size)
    }

    /// [`load_program`](Self::load_program) with an explicit workgroup size.
    pub fn load_program_sized(
        &self,
        label: &str,
        template: &str,
        workgroup: WorkgroupSize,
    ) -> Result<Arc<ShaderProgram>> {
        let source = workgroup.specialize(template);
        let (_, program) = self.programs.get_or_compile(&source, |id, src| {
            ShaderProgram::compile(&self.context, id, label, src)
        })?;
        Ok(program)
    }

    /// Cached kernel for `entry_point` of `program`.
    pub fn kernel(
        &self,
        program: &ShaderProgram,
        entry_point: &str,
        bindings: &[BindingKind],
    ) -> Result<Arc<Kernel>> {
        self.kernels.get_or_create(program.id, entry_point, || {
            Kernel::create(&self.context, program, entry_point, bindings)
        })
    }

    /// Drop the kernels built from `program`; returns how many.
    pub fn clear_kernels_for_program(&self, program: ProgramId) -> usize {
        self.kernels.clear_for_program(program)
    }

    /// Drop all compiled programs and kernels. Both are rebuilt on the
    /// next lookup.
    pub fn clear_caches(&self) {
        self.kernels.clear_all();
        self.programs.clear();
    }

    // ---- queues ----------------------------------------------------------------

    pub fn next_queue(&self) -> Result<Arc<CommandQueue>> {
        self.queues.next_queue()
    }

    pub fn finish_all(&self) -> Result<()> {
        self.queues.finish_all()
    }

    // ---- buffers ---------------------------------------------------------------

    pub fn create_buffer<T: Pod>(&self, len: usize, access: AccessMode) -> Result<GpuBuffer<T>> {
        GpuBuffer::new(&self.context, len, access)
    }

    pub fn create_buffer_with_data<T: Pod>(
        &self,
        data: &[T],
        access: AccessMode,
    ) -> Result<GpuBuffer<T>> {
        GpuBuffer::with_data(&self.context, data, access)
    }

    pub fn create_pinned<T: Pod>(&self, len: usize, access: AccessMode) -> Result<GpuBuffer<T>> {
        GpuBuffer::new_pinned(&self.context, len, access)
    }

    pub fn wrap_external<T: Pod>(
        &self,
        buffer: Arc<wgpu::Buffer>,
        len: usize,
        access: AccessMode,
    ) -> Result<GpuBuffer<T>> {
        GpuBuffer::wrap_external(&self.context, buffer, len, access)
    }

    // ---- named registry --------------------------------------------------------

    pub fn registry(&self) -> &BufferRegistry<GpuBuffer<Complex32>> {
        &self.buffers
    }

    pub fn register_buffer(&self, key: impl Into<String>, buffer: &Arc<GpuBuffer<Complex32>>) {
        self.buffers.register(key, buffer);
    }

    pub fn named_buffer(&self, key: &str) -> Option<Arc<GpuBuffer<Complex32>>> {
        self.buffers.get(key)
    }

    /// Shared complex buffer of `len` elements under `key`, allocated on
    /// first use. A live entry is returned as is, whatever its length.
    pub fn get_or_create_named(
        &self,
        key: &str,
        len: usize,
        access: AccessMode,
    ) -> Result<Arc<GpuBuffer<Complex32>>> {
        self.buffers.get_or_create(key, || GpuBuffer::new(&self.context, len, access))
    }

    pub fn cleanup_expired(&self) -> usize {
        self.buffers.cleanup_expired()
    }

    pub fn statistics(&self) -> SessionStats {
        SessionStats {
            programs: self.programs.stats(),
            kernels: self.kernels.stats(),
            registry_entries: self.buffers.len(),
            queues: self.queues.len(),
        }
    }
}

impl fmt::Debug for ComputeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeSession")
            .field("adapter", &self.context.adapter_info.name)
            .field("stats", &self.statistics())
            .finish()
    }
}
