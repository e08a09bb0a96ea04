// gpu/device.rs — device context: adapter, device, queue and limits.
//
// Responsibilities:
//   - Pick an adapter with tiered selection (real GPU first, software last).
//   - Request the device with buffer limits raised to what the adapter
//     supports, plus TIMESTAMP_QUERY when profiling and available.
//   - Provide `WorkgroupSize`, baked into WGSL templates at `{{WG_SIZE}}`.
//   - Turn wgpu's asynchronous error reporting into `Result`s.
//
// ADAPTER SELECTION:
// `request_adapter` may hand back a software rasterizer (llvmpipe) on
// machines that also have a real GPU. We enumerate explicitly:
//   1. DiscreteGpu / IntegratedGpu / VirtualGpu / Other
//   2. anything, including Cpu, as a last resort (logged)
//
// ERROR SCOPES:
// wgpu validates lazily and reports errors through error scopes or the
// uncaptured-error handler, whose default panics. `guarded` wraps one
// operation in OutOfMemory + Validation scopes and maps what it catches to
// `EngineError::ResourceExhausted` / `EngineError::Device`. Everything not
// caught by a scope goes to a handler that logs it; this is where release
// failures of dropped buffers end up.
//
// Error scopes are a per-device stack. Operations guarded from several
// threads at once can see each other's errors; the caller serializes
// device work that needs precise attribution.

use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Maximum workgroups per dispatch dimension guaranteed by wgpu.
pub const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// 1D workgroup size for element-wise kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize(pub u32);

impl WorkgroupSize {
    /// Bake the size into a WGSL template by replacing `{{WG_SIZE}}`.
    ///
    /// naga does not accept `override` expressions inside
    /// `@workgroup_size()` yet, so the size is substituted into the source.
    /// Each distinct size is a distinct source text and therefore a
    /// distinct program-cache entry.
    pub fn specialize(&self, template: &str) -> String {
        template.replace("{{WG_SIZE}}", &self.0.to_string())
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} invocations", self.0)
    }
}

/// Workgroup grid covering `groups` workgroups without exceeding the
/// per-dimension limit. Kernels rebuild the linear id as
/// `gid.y * (num_workgroups.x * WG_SIZE) + gid.x` and bounds-check it.
pub fn grid_for_groups(groups: u32) -> (u32, u32) {
    if groups <= MAX_GROUPS_PER_DIM {
        (groups.max(1), 1)
    } else {
        (MAX_GROUPS_PER_DIM, groups.div_ceil(MAX_GROUPS_PER_DIM))
    }
}

/// Adapter identity, for logging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The process's compute device. Created once by `ComputeSession::new`
/// and never mutated afterwards.
///
/// # Field drop order
/// `_instance` is declared last so the `wgpu::Instance` outlives the
/// device and queue; some Vulkan layers crash when the instance goes first.
pub struct DeviceContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_info: AdapterInfo,
    pub limits: wgpu::Limits,
    pub workgroup_size: WorkgroupSize,
    timestamps: bool,
    _instance: wgpu::Instance,
}

impl DeviceContext {
    /// Select an adapter and create the device per `config`.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        pollster::block_on(Self::init_async(config))
    }

    async fn init_async(config: &EngineConfig) -> Result<Self> {
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: config.backends,
            flags,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(config.backends);
        for a in &adapters {
            let info = a.get_info();
            log::info!("adapter: {} ({:?}, {:?})", info.name, info.backend, info.device_type);
        }

        let mut fallback = None;
        let mut chosen = None;
        for a in adapters {
            if matches!(
                a.get_info().device_type,
                wgpu::DeviceType::DiscreteGpu
                    | wgpu::DeviceType::IntegratedGpu
                    | wgpu::DeviceType::VirtualGpu
                    | wgpu::DeviceType::Other
            ) {
                chosen = Some(a);
                break;
            }
            fallback.get_or_insert(a);
        }
        let adapter = match (chosen, fallback) {
            (Some(a), _) => a,
            (None, Some(a)) => {
                log::warn!("no hardware adapter; falling back to {}", a.get_info().name);
                a
            }
            (None, None) => return Err(EngineError::NoSuitableAdapter),
        };

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let supported = adapter.limits();
        let limits = wgpu::Limits {
            max_buffer_size: supported.max_buffer_size,
            max_storage_buffer_binding_size: supported.max_storage_buffer_binding_size,
            ..wgpu::Limits::default()
        };

        let timestamps = config.profiling
            && adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let required_features = if timestamps {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };
        if config.profiling && !timestamps {
            log::warn!("adapter lacks TIMESTAMP_QUERY; stage timings use host clocks");
        }

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("beamfft"),
                    required_features,
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        device.on_uncaptured_error(Box::new(|e| {
            log::error!("uncaptured device error: {e}");
        }));

        if config.workgroup_size > limits.max_compute_invocations_per_workgroup
            || config.workgroup_size > limits.max_compute_workgroup_size_x
        {
            return Err(EngineError::config(
                "workgroup_size",
                format!(
                    "{} exceeds device limit of {} invocations",
                    config.workgroup_size, limits.max_compute_invocations_per_workgroup
                ),
            ));
        }

        let ctx = DeviceContext {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
            workgroup_size: WorkgroupSize(config.workgroup_size),
            timestamps,
            _instance: instance,
        };
        log::info!("{ctx}");
        Ok(ctx)
    }

    /// True when compute passes can carry timestamp writes.
    pub fn supports_timestamps(&self) -> bool {
        self.timestamps
    }

    /// Largest single buffer the device accepts.
    pub fn max_buffer_bytes(&self) -> u64 {
        self.limits.max_buffer_size
    }

    /// Largest range one storage binding may cover.
    pub fn max_binding_bytes(&self) -> u64 {
        self.limits.max_storage_buffer_binding_size as u64
    }

    /// Reject an allocation the device limits cannot hold, before asking
    /// the driver.
    pub fn check_allocation(&self, op: &'static str, bytes: u64) -> Result<()> {
        let limit = self.max_buffer_bytes().min(self.max_binding_bytes());
        if bytes > limit {
            return Err(EngineError::ResourceExhausted {
                op,
                bytes,
                detail: format!("device limit is {limit} bytes"),
            });
        }
        Ok(())
    }

    /// Grid for a 1D kernel over `n` invocations at the context's
    /// workgroup size.
    pub fn dispatch_linear(&self, n: u32) -> (u32, u32) {
        grid_for_groups(n.div_ceil(self.workgroup_size.0))
    }

    /// Run `f` inside error scopes; see [`guarded`].
    pub fn guarded<R>(&self, op: &'static str, bytes: u64, f: impl FnOnce() -> R) -> Result<R> {
        guarded(&self.device, op, bytes, f)
    }
}

impl fmt::Display for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceContext {{ adapter: {}, workgroup: {}, timestamps: {} }}",
            self.adapter_info, self.workgroup_size, self.timestamps
        )
    }
}

/// Run `f` with OutOfMemory and Validation error scopes pushed and turn
/// anything they catch into an error naming `op`. `bytes` is reported for
/// allocation failures (0 when not an allocation).
pub fn guarded<R>(
    device: &wgpu::Device,
    op: &'static str,
    bytes: u64,
    f: impl FnOnce() -> R,
) -> Result<R> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let out = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());

    if let Some(e) = oom {
        return Err(EngineError::ResourceExhausted { op, bytes, detail: e.to_string() });
    }
    if let Some(e) = validation {
        return Err(device_error(op, e));
    }
    Ok(out)
}

pub(crate) fn device_error(op: &'static str, e: wgpu::Error) -> EngineError {
    match e {
        wgpu::Error::Validation { description, .. } => EngineError::Device { op, detail: description },
        other => EngineError::Device { op, detail: other.to_string() },
    }
}
