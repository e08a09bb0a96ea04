// gpu/buffer.rs — typed device buffers.
//
// `GpuBuffer<T>` is a fixed-length array of `T` in device memory with one
// read/write interface over three kinds of storage:
//
//   owned      allocated here, destroyed exactly once on drop
//   external   wraps a caller's `Arc<wgpu::Buffer>`; never destroyed here
//   pinned     owned, plus a persistent MAP_READ staging buffer reused by
//              every read instead of a fresh one per read
//
// Blocking reads copy into staging, map, and wait on `poll(Wait)`. Blocking
// writes go through `queue.write_buffer` and wait for the submission. The
// async variants return a token instead of waiting. The caller must wait
// on that token before touching the same buffer again; nothing here
// orders async work.
//
// A buffer is move-only. It is not `Clone`: two owners of one allocation
// would destroy it twice. It is not internally synchronized either, so
// mutation needs `&mut self`.
//
// READBACK PATTERN:
//   encoder.copy_buffer_to_buffer(src → staging)
//   queue.submit(...)
//   staging.slice(..).map_async(Read, |r| tx.send(r))
//   device.poll(Maintain::Wait)
//   rx.recv()? → get_mapped_range() → copy out → drop view → unmap()

use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::mpsc;
use std::sync::Arc;

use bytemuck::Pod;
use num_complex::Complex32;

use crate::error::{EngineError, Result};
use crate::gpu::device::{guarded, DeviceContext};
use crate::gpu::queue::{CommandQueue, Completion};

/// How kernels may use a buffer. Host reads and writes are always allowed;
/// the mode constrains which kernel bindings accept the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Kernels only read (inputs).
    ReadOnly,
    /// Kernels only write (outputs).
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn kernel_reads(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn kernel_writes(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// Ownership of the underlying allocation.
pub enum Storage {
    Owned(wgpu::Buffer),
    External(Arc<wgpu::Buffer>),
}

impl Storage {
    fn raw(&self) -> &wgpu::Buffer {
        match self {
            Storage::Owned(b) => b,
            Storage::External(b) => b.as_ref(),
        }
    }
}

/// Usage flags every buffer created here carries.
pub const BUFFER_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

/// Round `bytes` up to the 4-byte copy granularity.
fn copy_size(bytes: u64) -> u64 {
    bytes.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

/// A typed array in device memory.
pub struct GpuBuffer<T: Pod = Complex32> {
    storage: Storage,
    staging: Option<wgpu::Buffer>,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    len: usize,
    access: AccessMode,
    dirty: bool,
    _marker: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Allocate `len` zeroed elements.
    pub fn new(ctx: &DeviceContext, len: usize, access: AccessMode) -> Result<Self> {
        let raw = Self::allocate(ctx, len, "GpuBuffer")?;
        Ok(Self::from_parts(ctx, Storage::Owned(raw), None, len, access))
    }

    /// Allocate and upload `data` in one step.
    pub fn with_data(ctx: &DeviceContext, data: &[T], access: AccessMode) -> Result<Self> {
        let mut buf = Self::new(ctx, data.len(), access)?;
        buf.write_all(data)?;
        Ok(buf)
    }

    /// Allocate `len` elements plus a persistent staging buffer for reads.
    pub fn new_pinned(ctx: &DeviceContext, len: usize, access: AccessMode) -> Result<Self> {
        let raw = Self::allocate(ctx, len, "GpuBuffer (pinned)")?;
        let bytes = copy_size((len * size_of::<T>()) as u64);
        let staging = ctx.guarded("allocate pinned staging", bytes, || {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("GpuBuffer pinned staging"),
                size: bytes,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        Ok(Self::from_parts(ctx, Storage::Owned(raw), Some(staging), len, access))
    }

    /// Wrap a buffer owned elsewhere. The buffer must hold at least `len`
    /// elements and allow copies in both directions; it is never destroyed
    /// by this wrapper.
    pub fn wrap_external(
        ctx: &DeviceContext,
        buffer: Arc<wgpu::Buffer>,
        len: usize,
        access: AccessMode,
    ) -> Result<Self> {
        let needed = (len * size_of::<T>()) as u64;
        if buffer.size() < needed {
            return Err(EngineError::ShapeMismatch {
                op: "wrap_external",
                expected: len,
                actual: buffer.size() as usize / size_of::<T>(),
            });
        }
        let usage = buffer.usage();
        if !usage.contains(wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST) {
            return Err(EngineError::config(
                "external buffer usage",
                format!("needs COPY_SRC | COPY_DST, has {usage:?}"),
            ));
        }
        Ok(Self::from_parts(ctx, Storage::External(buffer), None, len, access))
    }

    fn allocate(ctx: &DeviceContext, len: usize, label: &'static str) -> Result<wgpu::Buffer> {
        if len == 0 {
            return Err(EngineError::config("buffer length", "must be at least 1 element"));
        }
        let bytes = copy_size((len * size_of::<T>()) as u64);
        ctx.check_allocation("allocate", bytes)?;
        ctx.guarded("allocate", bytes, || {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes,
                usage: BUFFER_USAGE,
                mapped_at_creation: false,
            })
        })
    }

    fn from_parts(
        ctx: &DeviceContext,
        storage: Storage,
        staging: Option<wgpu::Buffer>,
        len: usize,
        access: AccessMode,
    ) -> Self {
        GpuBuffer {
            storage,
            staging,
            device: Arc::clone(&ctx.device),
            queue: Arc::clone(&ctx.queue),
            len,
            access,
            dirty: false,
            _marker: PhantomData,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Logical size in bytes (`len × size_of::<T>()`).
    pub fn size_bytes(&self) -> u64 {
        (self.len * size_of::<T>()) as u64
    }

    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn is_external(&self) -> bool {
        matches!(self.storage, Storage::External(_))
    }

    pub fn is_pinned(&self) -> bool {
        self.staging.is_some()
    }

    /// True when a kernel wrote the buffer since the last host read.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record a device-side write (called after dispatching a kernel that
    /// writes this buffer).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn raw(&self) -> &wgpu::Buffer {
        self.storage.raw()
    }

    /// Binding over the logical range (excludes alignment padding).
    pub fn binding(&self) -> wgpu::BindingResource<'_> {
        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: self.raw(),
            offset: 0,
            size: wgpu::BufferSize::new(copy_size(self.size_bytes())),
        })
    }

    // -----------------------------------------------------------------------
    // Blocking transfers
    // -----------------------------------------------------------------------

    /// Copy the whole buffer to the host.
    pub fn read_all(&mut self) -> Result<Vec<T>> {
        self.read_partial(self.len)
    }

    /// Copy the first `count` elements to the host. Fails if `count`
    /// exceeds the buffer length.
    pub fn read_partial(&mut self, count: usize) -> Result<Vec<T>> {
        if count > self.len {
            return Err(EngineError::ShapeMismatch {
                op: "read_partial",
                expected: self.len,
                actual: count,
            });
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let bytes = (count * size_of::<T>()) as u64;
        let span = copy_size(bytes);

        let temp;
        let staging = match &self.staging {
            Some(s) => s,
            None => {
                temp = self.staging_buffer("read staging", span)?;
                &temp
            }
        };

        guarded(&self.device, "read", span, || {
            let mut encoder = self.device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor { label: Some("GpuBuffer read") },
            );
            encoder.copy_buffer_to_buffer(self.storage.raw(), 0, staging, 0, span);
            self.queue.submit(std::iter::once(encoder.finish()));
        })?;

        let out = map_and_copy::<T>(&self.device, staging, span, count, "read")?;
        self.dirty = false;
        Ok(out)
    }

    /// Upload `data` to the start of the buffer and wait for it to land.
    /// Fails if `data` is longer than the buffer. Clears the dirty flag.
    pub fn write_all(&mut self, data: &[T]) -> Result<()> {
        self.stage_write(data, "write")?;
        // Staged writes ride on the next submit.
        self.queue.submit(std::iter::empty());
        Completion::after_submitted(&self.device, &self.queue).wait();
        self.dirty = false;
        Ok(())
    }

    /// Device-side copy of `other` into this buffer (lengths must match).
    pub fn copy_from(&mut self, other: &GpuBuffer<T>) -> Result<()> {
        if other.len != self.len {
            return Err(EngineError::ShapeMismatch {
                op: "copy_from",
                expected: self.len,
                actual: other.len,
            });
        }
        let span = copy_size(self.size_bytes());
        guarded(&self.device, "copy", span, || {
            let mut encoder = self.device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor { label: Some("GpuBuffer copy") },
            );
            encoder.copy_buffer_to_buffer(other.raw(), 0, self.storage.raw(), 0, span);
            self.queue.submit(std::iter::once(encoder.finish()));
        })?;
        self.device.poll(wgpu::Maintain::Wait);
        self.dirty = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Async transfers
    // -----------------------------------------------------------------------

    /// Stage `data` and submit it on `queue` without waiting. The buffer
    /// must not be reused until the returned token completes.
    pub fn write_all_async(&mut self, data: &[T], queue: &CommandQueue) -> Result<Completion> {
        self.stage_write(data, "write_async")?;
        let token = queue.submit(std::iter::empty());
        self.dirty = false;
        Ok(token)
    }

    /// Start a full read on `queue`. The copy is taken when the device
    /// reaches it, so later writes to this buffer must wait on
    /// [`PendingRead::completion`] first.
    pub fn read_all_async(&mut self, queue: &CommandQueue) -> Result<PendingRead<T>> {
        let bytes = self.size_bytes();
        let span = copy_size(bytes);
        let staging = self.staging_buffer("async read staging", span)?;

        let mut encoder = self.device.create_command_encoder(
            &wgpu::CommandEncoderDescriptor { label: Some("GpuBuffer read_async") },
        );
        encoder.copy_buffer_to_buffer(self.storage.raw(), 0, &staging, 0, span);
        let completion = queue.submit(std::iter::once(encoder.finish()));

        let (tx, rx) = mpsc::channel();
        staging.slice(..span).map_async(wgpu::MapMode::Read, move |r| {
            let _ = tx.send(r);
        });
        self.dirty = false;
        Ok(PendingRead {
            staging,
            span,
            count: self.len,
            device: Arc::clone(&self.device),
            mapped: rx,
            completion,
            _marker: PhantomData,
        })
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn stage_write(&self, data: &[T], op: &'static str) -> Result<()> {
        if data.len() > self.len {
            return Err(EngineError::ShapeMismatch { op, expected: self.len, actual: data.len() });
        }
        if data.is_empty() {
            return Ok(());
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        guarded(&self.device, op, bytes.len() as u64, || {
            if bytes.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
                self.queue.write_buffer(self.storage.raw(), 0, bytes);
            } else {
                let mut padded = bytes.to_vec();
                padded.resize(copy_size(bytes.len() as u64) as usize, 0);
                self.queue.write_buffer(self.storage.raw(), 0, &padded);
            }
        })
    }

    fn staging_buffer(&self, label: &'static str, span: u64) -> Result<wgpu::Buffer> {
        guarded(&self.device, "allocate staging", span, || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: span,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })
    }
}

impl<T: Pod> Drop for GpuBuffer<T> {
    fn drop(&mut self) {
        // Release failures surface through the device's uncaptured-error
        // handler, which logs them.
        if let Storage::Owned(buf) = &self.storage {
            log::trace!("releasing {} bytes", buf.size());
            buf.destroy();
        }
        if let Some(staging) = &self.staging {
            staging.destroy();
        }
    }
}

impl<T: Pod> std::fmt::Debug for GpuBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("len", &self.len)
            .field("access", &self.access)
            .field("external", &self.is_external())
            .field("pinned", &self.is_pinned())
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// An in-flight [`GpuBuffer::read_all_async`].
pub struct PendingRead<T: Pod> {
    staging: wgpu::Buffer,
    span: u64,
    count: usize,
    device: Arc<wgpu::Device>,
    mapped: mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
    completion: Completion,
    _marker: PhantomData<T>,
}

impl<T: Pod> PendingRead<T> {
    /// Token for the device-side copy.
    pub fn completion(&self) -> &Completion {
        &self.completion
    }

    /// Block until the data is on the host.
    pub fn wait(self) -> Result<Vec<T>> {
        self.device.poll(wgpu::Maintain::Wait);
        recv_mapped(&self.mapped, "read_async")?;
        let out = copy_out::<T>(&self.staging, self.span, self.count);
        self.staging.destroy();
        Ok(out)
    }
}

fn recv_mapped(
    rx: &mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>,
    op: &'static str,
) -> Result<()> {
    match rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(EngineError::Map { op, source }),
        Err(_) => Err(EngineError::Device { op, detail: "map callback was dropped".into() }),
    }
}

fn copy_out<T: Pod>(staging: &wgpu::Buffer, span: u64, count: usize) -> Vec<T> {
    let slice = staging.slice(..span);
    let mapped = slice.get_mapped_range();
    let out = bytemuck::cast_slice::<u8, T>(&mapped[..count * size_of::<T>()]).to_vec();
    drop(mapped);
    staging.unmap();
    out
}

/// Map `staging`, wait, and copy `count` elements out.
pub(crate) fn map_and_copy<T: Pod>(
    device: &wgpu::Device,
    staging: &wgpu::Buffer,
    span: u64,
    count: usize,
    op: &'static str,
) -> Result<Vec<T>> {
    let (tx, rx) = mpsc::channel();
    staging.slice(..span).map_async(wgpu::MapMode::Read, move |r| {
        let _ = tx.send(r);
    });
    device.poll(wgpu::Maintain::Wait);
    recv_mapped(&rx, op)?;
    Ok(copy_out::<T>(staging, span, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::tests::{run_gpu_test_in_subprocess, test_context};
    use crate::gpu::queue::{QueuePool, SubmissionChannel};

    #[test]
    fn access_modes() {
        assert!(AccessMode::ReadOnly.kernel_reads() && !AccessMode::ReadOnly.kernel_writes());
        assert!(!AccessMode::WriteOnly.kernel_reads() && AccessMode::WriteOnly.kernel_writes());
        assert!(AccessMode::ReadWrite.kernel_reads() && AccessMode::ReadWrite.kernel_writes());
    }

    #[test]
    fn copy_size_rounds_to_four() {
        assert_eq!(copy_size(0), 0);
        assert_eq!(copy_size(1), 4);
        assert_eq!(copy_size(8), 8);
        assert_eq!(copy_size(10), 12);
    }

    // ---- Inner GPU tests ----------------------------------------------------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_write_then_read_round_trip() {
        let ctx = test_context();
        for n in [1usize, 3, 64, 1000, 4097] {
            let data: Vec<Complex32> =
                (0..n).map(|i| Complex32::new(i as f32, -(i as f32) * 0.5)).collect();
            let mut buf = GpuBuffer::<Complex32>::new(&ctx, n, AccessMode::ReadWrite).unwrap();
            buf.write_all(&data).unwrap();
            assert_eq!(buf.read_all().unwrap(), data, "n={n}");
        }
        // Odd byte counts go through the padded path.
        let bytes: Vec<u8> = (0..7).collect();
        let mut buf = GpuBuffer::<u8>::with_data(&ctx, &bytes, AccessMode::ReadWrite).unwrap();
        assert_eq!(buf.read_all().unwrap(), bytes);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_read_partial_and_bounds() {
        let ctx = test_context();
        let data: Vec<f32> = (0..100).map(|i| i as f32).collect();
        let mut buf = GpuBuffer::new_pinned(&ctx, 100, AccessMode::ReadWrite).unwrap();
        assert!(buf.is_pinned());
        buf.write_all(&data).unwrap();
        assert_eq!(buf.read_partial(10).unwrap(), data[..10].to_vec());
        assert_eq!(buf.read_partial(100).unwrap(), data);
        assert!(matches!(
            buf.read_partial(101),
            Err(EngineError::ShapeMismatch { expected: 100, actual: 101, .. })
        ));
        assert!(matches!(
            buf.write_all(&vec![0.0; 101]),
            Err(EngineError::ShapeMismatch { .. })
        ));
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_external_buffer_is_not_destroyed() {
        let ctx = test_context();
        let raw = Arc::new(ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("external"),
            size: 64,
            usage: BUFFER_USAGE,
            mapped_at_creation: false,
        }));
        {
            let mut wrapped =
                GpuBuffer::<f32>::wrap_external(&ctx, Arc::clone(&raw), 16, AccessMode::ReadWrite)
                    .unwrap();
            assert!(wrapped.is_external());
            wrapped.write_all(&[1.5; 16]).unwrap();
        }
        // Still usable after the wrapper is gone.
        let mut again =
            GpuBuffer::<f32>::wrap_external(&ctx, raw, 16, AccessMode::ReadOnly).unwrap();
        assert_eq!(again.read_all().unwrap(), vec![1.5; 16]);

        let small = Arc::new(ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("small"),
            size: 16,
            usage: BUFFER_USAGE,
            mapped_at_creation: false,
        }));
        assert!(GpuBuffer::<f32>::wrap_external(&ctx, small, 8, AccessMode::ReadWrite).is_err());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_async_writes_across_queues() {
        let ctx = test_context();
        let pool = QueuePool::new();
        pool.initialize(&ctx, 4).unwrap();

        let mut buffers: Vec<GpuBuffer<f32>> = (0..1000)
            .map(|_| GpuBuffer::new(&ctx, 16, AccessMode::ReadWrite).unwrap())
            .collect();
        for (i, buf) in buffers.iter_mut().enumerate() {
            let q = pool.next_queue().unwrap();
            buf.write_all_async(&[i as f32; 16], &q).unwrap();
        }
        pool.finish_all().unwrap();
        for i in 0..4 {
            assert_eq!(pool.queue(i).unwrap().outstanding(), 0);
        }
        for (i, buf) in buffers.iter_mut().enumerate() {
            assert_eq!(buf.read_all().unwrap(), vec![i as f32; 16], "buffer {i}");
        }

        let q = pool.queue(0).unwrap();
        let pending = buffers[7].read_all_async(&q).unwrap();
        q.finish().unwrap();
        assert_eq!(pending.wait().unwrap(), vec![7.0; 16]);
        println!("GPU_TEST_OK");
    }

    // ---- Outer wrappers -----------------------------------------------------

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_write_then_read_round_trip() {
        let out = run_gpu_test_in_subprocess("gpu::buffer::tests::inner_write_then_read_round_trip");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_read_partial_and_bounds() {
        let out = run_gpu_test_in_subprocess("gpu::buffer::tests::inner_read_partial_and_bounds");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_external_buffer_is_not_destroyed() {
        let out =
            run_gpu_test_in_subprocess("gpu::buffer::tests::inner_external_buffer_is_not_destroyed");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_async_writes_across_queues() {
        let out = run_gpu_test_in_subprocess("gpu::buffer::tests::inner_async_writes_across_queues");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
