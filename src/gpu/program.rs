// gpu/program.rs — compiled WGSL programs and kernels.
//
// A `ShaderProgram` is one compiled WGSL module, identified by the hash of
// its source (cache::program_id). A `Kernel` is one entry point of a
// program turned into a compute pipeline, with an explicit bind group
// layout described by a list of `BindingKind`s (binding i ↔ kinds[i]).
//
// Compile errors: wgpu reports shader and pipeline errors through the
// Validation error scope. Both are turned into `EngineError::Compile`,
// carrying the compiler's diagnostic text.
//
// Dispatch: `Kernel::record` builds the bind group and records one compute
// pass into a caller-owned encoder, so several kernels can share one
// submission. Each bound buffer is checked against its binding kind
// (a ReadOnly buffer cannot be bound for writing, and so on).

use std::borrow::Cow;

use crate::cache::ProgramId;
use crate::error::{EngineError, Result};
use crate::gpu::buffer::AccessMode;
use crate::gpu::device::DeviceContext;

/// One compiled WGSL module.
#[derive(Debug)]
pub struct ShaderProgram {
    pub id: ProgramId,
    pub label: String,
    pub module: wgpu::ShaderModule,
}

impl ShaderProgram {
    /// Compile `source`. `id` is its program-cache key.
    pub fn compile(ctx: &DeviceContext, id: ProgramId, label: &str, source: &str) -> Result<Self> {
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
        });
        if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(compile_error(label, err));
        }
        Ok(ShaderProgram { id, label: label.to_string(), module })
    }
}

fn compile_error(label: &str, err: wgpu::Error) -> EngineError {
    let diagnostics = match err {
        wgpu::Error::Validation { description, .. } => description,
        other => other.to_string(),
    };
    EngineError::Compile { label: label.to_string(), diagnostics }
}

/// Kind of resource at one binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `var<storage, read>`
    StorageRead,
    /// `var<storage, read_write>`
    StorageReadWrite,
    /// `var<uniform>`
    Uniform,
}

impl BindingKind {
    fn layout_entry(self, binding: u32) -> wgpu::BindGroupLayoutEntry {
        let ty = match self {
            BindingKind::StorageRead => wgpu::BufferBindingType::Storage { read_only: true },
            BindingKind::StorageReadWrite => wgpu::BufferBindingType::Storage { read_only: false },
            BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
        };
        wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer { ty, has_dynamic_offset: false, min_binding_size: None },
            count: None,
        }
    }

    /// Whether a buffer with `access` may sit in this slot.
    pub fn accepts(self, access: AccessMode) -> bool {
        match self {
            BindingKind::StorageRead => access.kernel_reads(),
            BindingKind::StorageReadWrite => access.kernel_writes(),
            BindingKind::Uniform => true,
        }
    }
}

/// A resource bound to a kernel slot for one dispatch.
pub struct Bound<'a> {
    pub resource: wgpu::BindingResource<'a>,
    /// Access mode of the bound buffer; `None` for params uniforms.
    pub access: Option<AccessMode>,
}

impl<'a> Bound<'a> {
    pub fn buffer<T: bytemuck::Pod>(buf: &'a crate::gpu::buffer::GpuBuffer<T>) -> Self {
        Bound { resource: buf.binding(), access: Some(buf.access()) }
    }

    pub fn uniform(buf: &'a wgpu::Buffer) -> Self {
        Bound { resource: buf.as_entire_binding(), access: None }
    }
}

/// One entry point of a program as a compute pipeline.
#[derive(Debug)]
pub struct Kernel {
    pub program: ProgramId,
    pub entry_point: String,
    pub bindings: Vec<BindingKind>,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

impl Kernel {
    /// Build the pipeline for `entry_point` with one bind group laid out as
    /// `bindings`.
    pub fn create(
        ctx: &DeviceContext,
        program: &ShaderProgram,
        entry_point: &str,
        bindings: &[BindingKind],
    ) -> Result<Self> {
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
            .iter()
            .enumerate()
            .map(|(i, kind)| kind.layout_entry(i as u32))
            .collect();
        let layout = ctx.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(entry_point),
            entries: &entries,
        });
        let pipeline_layout = ctx.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(entry_point),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = ctx.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry_point),
            layout: Some(&pipeline_layout),
            module: &program.module,
            entry_point,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(err) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(compile_error(&format!("{}::{entry_point}", program.label), err));
        }
        Ok(Kernel {
            program: program.id,
            entry_point: entry_point.to_string(),
            bindings: bindings.to_vec(),
            pipeline,
            layout,
        })
    }

    /// Record one dispatch of `groups` workgroups into `encoder`.
    pub fn record(
        &self,
        ctx: &DeviceContext,
        encoder: &mut wgpu::CommandEncoder,
        bound: &[Bound<'_>],
        groups: (u32, u32),
        timestamp_writes: Option<wgpu::ComputePassTimestampWrites<'_>>,
    ) -> Result<()> {
        if bound.len() != self.bindings.len() {
            return Err(EngineError::ShapeMismatch {
                op: "bind resources",
                expected: self.bindings.len(),
                actual: bound.len(),
            });
        }
        for (slot, (kind, b)) in self.bindings.iter().zip(bound).enumerate() {
            if let Some(access) = b.access {
                if !kind.accepts(access) {
                    return Err(EngineError::config(
                        "binding access",
                        format!(
                            "{}: slot {slot} is {kind:?} but the buffer is {access:?}",
                            self.entry_point
                        ),
                    ));
                }
            }
        }

        let entries: Vec<wgpu::BindGroupEntry> = bound
            .iter()
            .enumerate()
            .map(|(i, b)| wgpu::BindGroupEntry { binding: i as u32, resource: b.resource.clone() })
            .collect();
        let bind_group = ctx.guarded("create bind group", 0, || {
            ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&self.entry_point),
                layout: &self.layout,
                entries: &entries,
            })
        })?;

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(&self.entry_point),
            timestamp_writes,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups.0, groups.1, 1);
        log::trace!("{}: dispatched {}×{} workgroups", self.entry_point, groups.0, groups.1);
        Ok(())
    }
}
