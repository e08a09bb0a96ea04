// gpu/pipeline.rs — device spectral peak extraction.
//
// Per sub-batch of rows:
//
//   input (M×N, caller's buffer)
//     ──pad_gather──▶  padded   (rows×L)          [pre-process]
//     ──backend─────▶  spectrum (rows×L)          [transform]
//     ──shift_scatter▶ window + magnitude (rows×OutLen)  [post-process]
//     ──top_k───────▶  peaks (rows×K) + offsets (rows)   [reduction]
//     ──readback────▶  host RowPeaks                     [download]
//
// The transform stage bridges to a host `TransformBackend`: the padded rows
// are read back, transformed, and uploaded into the spectrum buffer. The
// kernels on either side of it are the gather and scatter callbacks.
//
// SUB-BATCHING:
// A job whose estimated footprint exceeds `memory_usage_limit` of the
// device's max buffer size, or whose largest buffer would not fit one
// storage binding, is split. Rows per batch start at
// `batch_rows(rows, batch_size_ratio)` and are halved until the batch fits.
// The gather kernel reads the caller's input in place through `row_offset`,
// so the input is never copied per batch.
//
// TIMING:
// With device timestamps, the three kernel passes are timed on the device
// and everything else on the host. Without them every stage is host-timed
// around its submit-and-wait.

use std::mem::size_of;
use std::sync::Arc;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};
use num_complex::Complex32;
use wgpu::util::DeviceExt;

use crate::cache::CacheStats;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::gpu::buffer::{AccessMode, GpuBuffer};
use crate::gpu::device::{grid_for_groups, DeviceContext, WorkgroupSize};
use crate::gpu::program::{BindingKind, Bound, Kernel};
use crate::gpu::queue::CommandQueue;
use crate::gpu::session::{ComputeSession, SessionStats};
use crate::gpu::timestamps::GpuTimer;
use crate::job::{
    batch_fits, batch_rows, estimate_device_bytes, plan_sub_batches, BatchJob, SubBatch,
};
use crate::peaks::{Peak, RowPeaks};
use crate::pipeline::{finish_row, SpectralResult};
use crate::profiling::{ProfilingCollector, Stage};
use crate::spectrum::{SpectrumLayout, WindowedSpectrum};
use crate::transform::{PlanCache, TransformBackend};

const PAD_GATHER_WGSL: &str = include_str!("../shaders/pad_gather.wgsl");
const SHIFT_SCATTER_WGSL: &str = include_str!("../shaders/shift_scatter.wgsl");
const TOP_K_WGSL: &str = include_str!("../shaders/top_k.wgsl");

/// Widest output window the top-K kernel holds in workgroup memory.
pub const MAX_DEVICE_WINDOW: usize = 2048;

/// Uniform shared by the three kernels. Matches `Params` in the shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SpectrumParams {
    rows: u32,
    input_len: u32,
    transform_len: u32,
    out_len: u32,
    max_peaks: u32,
    row_offset: u32,
    _pad0: u32,
    _pad1: u32,
}

fn to_u32(op: &'static str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| EngineError::ResourceExhausted {
        op,
        bytes: value as u64,
        detail: "index space exceeds 32 bits".into(),
    })
}

impl SpectrumParams {
    fn new(job: &BatchJob, batch: SubBatch) -> Result<Self> {
        Ok(SpectrumParams {
            rows: to_u32("params", batch.rows)?,
            input_len: to_u32("params", job.input_len)?,
            transform_len: to_u32("params", job.transform_len())?,
            out_len: to_u32("params", job.out_len)?,
            max_peaks: to_u32("params", job.max_peaks)?,
            row_offset: to_u32("params", batch.first_row)?,
            _pad0: 0,
            _pad1: 0,
        })
    }
}

/// Pipeline statistics: the session's caches plus this pipeline's plans.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineStats {
    pub session: SessionStats,
    pub plans: CacheStats,
}

/// Spectral peak extraction on the session's device.
pub struct GpuSpectralPipeline<B: TransformBackend> {
    backend: B,
    plans: PlanCache<B::Plan>,
    gather: Arc<Kernel>,
    scatter: Arc<Kernel>,
    top_k: Arc<Kernel>,
    config: EngineConfig,
}

/// Device buffers for one sub-batch.
struct BatchBuffers {
    padded: GpuBuffer<Complex32>,
    spectrum: GpuBuffer<Complex32>,
    window: GpuBuffer<Complex32>,
    magnitude: GpuBuffer<f32>,
    peaks: GpuBuffer<Peak>,
    offsets: GpuBuffer<f32>,
    params: wgpu::Buffer,
}

impl<B: TransformBackend> GpuSpectralPipeline<B> {
    /// Compile the kernels (or fetch them from the session caches).
    pub fn new(session: &ComputeSession, backend: B) -> Result<Self> {
        Self::with_config(session, backend, session.config().clone())
    }

    /// Like [`new`](Self::new), with pipeline settings (profiling, memory
    /// budget, sample rate, spectrum output) taken from `config` instead of
    /// the session's.
    pub fn with_config(session: &ComputeSession, backend: B, config: EngineConfig) -> Result<Self> {
        use BindingKind::{StorageRead as R, StorageReadWrite as RW, Uniform as U};
        config.validate()?;

        let gather_prog = session.load_program("pad_gather", PAD_GATHER_WGSL)?;
        let scatter_prog = session.load_program("shift_scatter", SHIFT_SCATTER_WGSL)?;
        let top_k_prog = session.load_program_sized(
            "top_k",
            TOP_K_WGSL,
            WorkgroupSize(session.config().reduction_workgroup()),
        )?;

        let gather = session.kernel(&gather_prog, "pad_gather", &[R, RW, U])?;
        let scatter = session.kernel(&scatter_prog, "shift_scatter", &[R, RW, RW, U])?;
        let top_k = session.kernel(&top_k_prog, "top_k", &[R, R, RW, RW, U])?;
        log::debug!("spectral pipeline ready on backend `{}`", backend.name());

        Ok(GpuSpectralPipeline {
            backend,
            plans: PlanCache::new(),
            gather,
            scatter,
            top_k,
            config,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn plans(&self) -> &PlanCache<B::Plan> {
        &self.plans
    }

    pub fn statistics(&self, session: &ComputeSession) -> PipelineStats {
        PipelineStats { session: session.statistics(), plans: self.plans.stats() }
    }

    /// Upload `input` (M·N samples, row-major) and run `job` on it. The
    /// upload is charged to [`Stage::Upload`].
    pub fn process_host(
        &self,
        session: &ComputeSession,
        job: &BatchJob,
        input: &[Complex32],
    ) -> Result<SpectralResult> {
        check_job(job, input.len())?;
        let mut prof = ProfilingCollector::new(self.config.profiling);
        let buffer = prof.time(Stage::Upload, || {
            GpuBuffer::with_data(session.context(), input, AccessMode::ReadOnly)
        })?;
        self.run(session, job, &buffer, prof)
    }

    /// Run `job` on an input batch already on the device.
    pub fn process(
        &self,
        session: &ComputeSession,
        job: &BatchJob,
        input: &GpuBuffer<Complex32>,
    ) -> Result<SpectralResult> {
        check_job(job, input.len())?;
        self.run(session, job, input, ProfilingCollector::new(self.config.profiling))
    }

    fn run(
        &self,
        session: &ComputeSession,
        job: &BatchJob,
        input: &GpuBuffer<Complex32>,
        mut prof: ProfilingCollector,
    ) -> Result<SpectralResult> {
        if !input.access().kernel_reads() {
            return Err(EngineError::config("input access", "input buffer is write-only"));
        }
        let ctx = session.context();
        ctx.check_allocation("bind input", input.size_bytes())?;

        let batches = self.plan_batches(ctx, job)?;
        let per_batch = batches.first().map_or(0, |b| b.rows);
        if batches.len() > 1 {
            log::debug!(
                "job `{}`: {} rows split into {} sub-batches of ≤{} rows",
                job.task_id,
                job.rows,
                batches.len(),
                per_batch
            );
        }

        let queue = session.next_queue()?;
        let mut rows = Vec::with_capacity(job.rows);
        let mut spectrum: Option<WindowedSpectrum> = None;
        for batch in &batches {
            let (done, window) = self.run_batch(ctx, &queue, job, *batch, input, &mut prof)?;
            rows.extend(done);
            spectrum = match (spectrum.take(), window) {
                (Some(mut all), Some(more)) => {
                    all.extend(more);
                    Some(all)
                }
                (all, more) => all.or(more),
            };
        }

        Ok(SpectralResult {
            task_id: job.task_id.clone(),
            module_name: job.module_name.clone(),
            rows,
            profiling: prof.finish(),
            spectrum,
            sub_batches: batches.len(),
        })
    }

    fn plan_batches(&self, ctx: &DeviceContext, job: &BatchJob) -> Result<Vec<SubBatch>> {
        let budget = (ctx.max_buffer_bytes() as f64 * self.config.memory_usage_limit) as u64;
        let binding = ctx.max_buffer_bytes().min(ctx.max_binding_bytes());
        plan_batches(job, budget, binding, self.config.batch_size_ratio)
    }

    fn allocate(&self, ctx: &DeviceContext, job: &BatchJob, batch: SubBatch) -> Result<BatchBuffers> {
        let rw = AccessMode::ReadWrite;
        let padded_len = batch.rows * job.transform_len();
        let window_len = batch.rows * job.out_len;
        let params = SpectrumParams::new(job, batch)?;
        let params = ctx.guarded("allocate params", size_of::<SpectrumParams>() as u64, || {
            ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("SpectrumParams"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            })
        })?;
        Ok(BatchBuffers {
            padded: GpuBuffer::new(ctx, padded_len, rw)?,
            spectrum: GpuBuffer::new(ctx, padded_len, rw)?,
            window: GpuBuffer::new(ctx, window_len, rw)?,
            magnitude: GpuBuffer::new(ctx, window_len, rw)?,
            peaks: GpuBuffer::new(ctx, batch.rows * job.max_peaks, rw)?,
            offsets: GpuBuffer::new(ctx, batch.rows, AccessMode::WriteOnly)?,
            params,
        })
    }

    fn run_batch(
        &self,
        ctx: &DeviceContext,
        queue: &CommandQueue,
        job: &BatchJob,
        batch: SubBatch,
        input: &GpuBuffer<Complex32>,
        prof: &mut ProfilingCollector,
    ) -> Result<(Vec<RowPeaks>, Option<WindowedSpectrum>)> {
        let sub = job.with_rows(batch.rows);
        let shape = sub.shape();
        let layout = SpectrumLayout::for_job(&sub);
        let mut bufs = self.allocate(ctx, job, batch)?;
        let mut timer = if prof.is_enabled() { GpuTimer::new(ctx, 3) } else { None };

        // Gather: zero-padded rows.
        let elements = to_u32("dispatch", batch.rows * job.transform_len())?;
        submit_stage(ctx, queue, Stage::PreProcess, &mut timer, prof, |encoder, ts| {
            self.gather.record(
                ctx,
                encoder,
                &[Bound::buffer(input), Bound::buffer(&bufs.padded), Bound::uniform(&bufs.params)],
                ctx.dispatch_linear(elements),
                ts,
            )
        })?;
        bufs.padded.mark_dirty();

        // Transform through the backend.
        let t0 = Instant::now();
        let padded = bufs.padded.read_all()?;
        let plan = self.plans.get_or_plan(&shape, || self.backend.plan(&shape))?;
        let mut transformed = vec![Complex32::new(0.0, 0.0); padded.len()];
        self.backend.execute(&plan, &padded, &mut transformed)?;
        bufs.spectrum.write_all(&transformed)?;
        prof.record(Stage::Transform, t0.elapsed().as_secs_f64() * 1e3);

        // Scatter: shift, truncate, magnitude.
        submit_stage(ctx, queue, Stage::PostProcess, &mut timer, prof, |encoder, ts| {
            encoder.clear_buffer(bufs.window.raw(), 0, None);
            encoder.clear_buffer(bufs.magnitude.raw(), 0, None);
            self.scatter.record(
                ctx,
                encoder,
                &[
                    Bound::buffer(&bufs.spectrum),
                    Bound::buffer(&bufs.window),
                    Bound::buffer(&bufs.magnitude),
                    Bound::uniform(&bufs.params),
                ],
                ctx.dispatch_linear(elements),
                ts,
            )
        })?;
        bufs.window.mark_dirty();
        bufs.magnitude.mark_dirty();

        // Top-K: one workgroup per row.
        let row_groups = to_u32("dispatch", batch.rows)?;
        submit_stage(ctx, queue, Stage::Reduction, &mut timer, prof, |encoder, ts| {
            self.top_k.record(
                ctx,
                encoder,
                &[
                    Bound::buffer(&bufs.window),
                    Bound::buffer(&bufs.magnitude),
                    Bound::buffer(&bufs.peaks),
                    Bound::buffer(&bufs.offsets),
                    Bound::uniform(&bufs.params),
                ],
                grid_for_groups(row_groups),
                ts,
            )
        })?;
        bufs.peaks.mark_dirty();
        bufs.offsets.mark_dirty();

        if let Some(timer) = timer.as_mut() {
            let mut encoder = ctx.device.create_command_encoder(
                &wgpu::CommandEncoderDescriptor { label: Some("resolve timestamps") },
            );
            timer.resolve(&mut encoder);
            queue.submit(std::iter::once(encoder.finish())).wait();
            for (stage, ms) in timer.collect(ctx)? {
                prof.record(stage, ms);
            }
        }

        // Download.
        let t0 = Instant::now();
        let peaks = bufs.peaks.read_all()?;
        let offsets = bufs.offsets.read_all()?;
        let spectrum = if self.config.keep_spectrum {
            Some(WindowedSpectrum {
                rows: batch.rows,
                out_len: job.out_len,
                complex: bufs.window.read_all()?,
                magnitude: bufs.magnitude.read_all()?,
            })
        } else {
            None
        };
        prof.record(Stage::Download, t0.elapsed().as_secs_f64() * 1e3);

        let rows = peaks
            .chunks_exact(job.max_peaks)
            .zip(offsets)
            .enumerate()
            .map(|(i, (row_peaks, offset))| {
                finish_row(
                    batch.first_row + i,
                    row_peaks.to_vec(),
                    offset,
                    &layout,
                    self.config.sample_rate_hz,
                )
            })
            .collect();
        Ok((rows, spectrum))
    }
}

/// Host-side checks run before any device work.
fn check_job(job: &BatchJob, input_len: usize) -> Result<()> {
    job.validate()?;
    job.check_input(input_len)?;
    if job.out_len > MAX_DEVICE_WINDOW {
        return Err(EngineError::config(
            "out_len",
            format!("{} exceeds the device window limit of {MAX_DEVICE_WINDOW}", job.out_len),
        ));
    }
    Ok(())
}

/// Largest row count per batch for `job` under a `budget`-byte footprint
/// with no buffer larger than `binding_limit`. All rows when the job fits;
/// otherwise `batch_rows(rows, ratio)` halved until it does.
pub fn rows_per_batch(job: &BatchJob, budget: u64, binding_limit: u64, ratio: f64) -> Result<usize> {
    let fits = |rows: usize| batch_fits(job, rows, budget, binding_limit);

    if fits(job.rows) {
        return Ok(job.rows);
    }
    let mut rows = batch_rows(job.rows, ratio);
    while rows > 1 && !fits(rows) {
        rows /= 2;
    }
    if !fits(rows) {
        return Err(EngineError::ResourceExhausted {
            op: "plan sub-batches",
            bytes: estimate_device_bytes(&job.with_rows(1)),
            detail: format!("a single row does not fit the {budget}-byte budget"),
        });
    }
    Ok(rows)
}

/// Sub-batches for `job`. Every batch, including a merged tail, stays
/// within `budget` and `binding_limit`.
pub fn plan_batches(
    job: &BatchJob,
    budget: u64,
    binding_limit: u64,
    ratio: f64,
) -> Result<Vec<SubBatch>> {
    let per_batch = rows_per_batch(job, budget, binding_limit, ratio)?;
    Ok(plan_sub_batches(job.rows, per_batch, |rows| {
        batch_fits(job, rows, budget, binding_limit)
    }))
}

/// Record one kernel stage into a fresh encoder, submit it on `queue` and
/// wait. The pass carries device timestamps when `timer` is present;
/// otherwise the host time of the submit-and-wait is charged to `stage`.
fn submit_stage<F>(
    ctx: &DeviceContext,
    queue: &CommandQueue,
    stage: Stage,
    timer: &mut Option<GpuTimer>,
    prof: &mut ProfilingCollector,
    record: F,
) -> Result<()>
where
    F: FnOnce(&mut wgpu::CommandEncoder, Option<wgpu::ComputePassTimestampWrites<'_>>) -> Result<()>,
{
    let t0 = Instant::now();
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(stage.name()) });
    let device_timed = timer.is_some();
    record(&mut encoder, timer.as_mut().and_then(|t| t.pass(stage)))?;
    ctx.guarded("submit", 0, || queue.submit(std::iter::once(encoder.finish())))?
        .wait();
    if !device_timed {
        prof.record(stage, t0.elapsed().as_secs_f64() * 1e3);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::tests::run_gpu_test_in_subprocess;
    use crate::gpu::session::tests::test_session;
    use crate::peaks::select_top_k;
    use crate::pipeline::SpectralPipeline;
    use crate::transform::RustFftBackend;

    #[test]
    fn whole_job_when_it_fits() {
        let job = BatchJob::new(16, 256, 128, 3);
        let need = estimate_device_bytes(&job);
        assert_eq!(rows_per_batch(&job, need, u64::MAX, 0.1).unwrap(), 16);
    }

    #[test]
    fn split_halves_until_batch_fits() {
        let job = BatchJob::new(100, 256, 128, 3);
        let budget = estimate_device_bytes(&job.with_rows(7));
        // batch_rows(100, 0.5) = 50 → 25 → 12 → 6
        assert_eq!(rows_per_batch(&job, budget, u64::MAX, 0.5).unwrap(), 6);
    }

    #[test]
    fn binding_limit_also_splits() {
        let job = BatchJob::new(10, 256, 128, 3);
        let row_bytes = (job.transform_len() * size_of::<Complex32>()) as u64;
        let rows = rows_per_batch(&job, u64::MAX, 4 * row_bytes, 1.0).unwrap();
        assert_eq!(rows, 2); // 10 → 5 → 2
    }

    #[test]
    fn single_row_too_big_is_exhaustion() {
        let job = BatchJob::new(4, 256, 128, 3);
        assert!(matches!(
            rows_per_batch(&job, 16, u64::MAX, 0.5),
            Err(EngineError::ResourceExhausted { op: "plan sub-batches", .. })
        ));
    }

    fn assert_plan_within_limits(job: &BatchJob, plan: &[SubBatch], budget: u64, binding: u64) {
        let mut next = 0;
        for batch in plan {
            assert_eq!(batch.first_row, next);
            assert!(
                batch_fits(job, batch.rows, budget, binding),
                "batch of {} rows exceeds the device limits",
                batch.rows
            );
            next += batch.rows;
        }
        assert_eq!(next, job.rows);
    }

    #[test]
    fn tail_is_not_merged_past_binding_limit() {
        let job = BatchJob::new(10, 256, 128, 3);
        let row_bytes = (job.transform_len() * size_of::<Complex32>()) as u64;
        let binding = 3 * row_bytes;
        let plan = plan_batches(&job, u64::MAX, binding, 1.0).unwrap();
        assert_eq!(plan.iter().map(|b| b.rows).collect::<Vec<_>>(), vec![2, 2, 2, 2, 2]);
        assert_plan_within_limits(&job, &plan, u64::MAX, binding);
    }

    #[test]
    fn tail_is_not_merged_past_memory_budget() {
        let job = BatchJob::new(14, 256, 128, 3);
        let budget = estimate_device_bytes(&job.with_rows(7));
        let plan = plan_batches(&job, budget, u64::MAX, 0.45).unwrap();
        assert_eq!(plan.iter().map(|b| b.rows).collect::<Vec<_>>(), vec![6, 6, 2]);
        assert_plan_within_limits(&job, &plan, budget, u64::MAX);
    }

    #[test]
    fn tail_is_merged_when_it_still_fits() {
        let job = BatchJob::new(22, 256, 128, 3);
        let budget = estimate_device_bytes(&job.with_rows(12));
        let plan = plan_batches(&job, budget, u64::MAX, 0.46).unwrap();
        assert_eq!(plan.iter().map(|b| b.rows).collect::<Vec<_>>(), vec![10, 12]);
        assert_plan_within_limits(&job, &plan, budget, u64::MAX);
    }

    #[test]
    fn params_layout_matches_shader() {
        assert_eq!(size_of::<SpectrumParams>(), 32);
        let job = BatchJob::new(6, 100, 64, 3);
        let p = SpectrumParams::new(&job, SubBatch { first_row: 4, rows: 2 }).unwrap();
        assert_eq!((p.rows, p.input_len, p.transform_len), (2, 100, 256));
        assert_eq!((p.out_len, p.max_peaks, p.row_offset), (64, 3, 4));
    }

    fn tone_rows(rows: usize, n: usize) -> Vec<Complex32> {
        let mut out = Vec::with_capacity(rows * n);
        for r in 0..rows {
            let bin = 3.0 + 5.0 * r as f32;
            for t in 0..n {
                let ph = std::f32::consts::TAU * bin * t as f32 / n as f32;
                out.push(Complex32::new(ph.cos(), ph.sin()) * (1.0 + r as f32));
            }
        }
        out
    }

    // Magnitudes may differ from the host in the last bits, which can swap
    // near-equal leakage bins. The strongest index must agree exactly; the
    // rest is compared by value.
    fn assert_matches_host(gpu: &SpectralResult, host: &SpectralResult) {
        assert_eq!(gpu.rows.len(), host.rows.len());
        for (g, h) in gpu.rows.iter().zip(&host.rows) {
            assert_eq!(g.row, h.row);
            assert_eq!(g.peaks.len(), h.peaks.len());
            assert_eq!(
                g.strongest().map(|p| p.index),
                h.strongest().map(|p| p.index),
                "row {}",
                g.row
            );
            for (gp, hp) in g.peaks.iter().zip(&h.peaks) {
                assert_eq!(gp.is_valid(), hp.is_valid(), "row {}", g.row);
                let tol = 1e-3 * hp.magnitude.max(1.0);
                assert!((gp.magnitude - hp.magnitude).abs() <= tol, "row {}", g.row);
            }
        }
    }

    // ---- Inner GPU tests ----------------------------------------------------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_matches_host_reference() {
        let session = test_session();
        let gpu = GpuSpectralPipeline::new(&session, RustFftBackend::new()).unwrap();
        let host = SpectralPipeline::new(RustFftBackend::new(), session.config());

        let job = BatchJob::new(4, 256, 128, 3).with_task("t-1", "beam");
        let input = tone_rows(4, 256);
        let g = gpu.process_host(&session, &job, &input).unwrap();
        let h = host.process(&job, &input).unwrap();
        assert_matches_host(&g, &h);
        assert_eq!(g.task_id, "t-1");
        assert_eq!(g.sub_batches, 1);
        for (g, h) in g.rows.iter().zip(&h.rows) {
            let (gi, hi) = (g.refined_index.unwrap(), h.refined_index.unwrap());
            assert!((gi - hi).abs() < 1e-3);
        }
        println!("{}", g.profiling);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_odd_window_and_sentinels() {
        let session = test_session();
        let gpu = GpuSpectralPipeline::new(&session, RustFftBackend::new()).unwrap();
        let host = SpectralPipeline::new(RustFftBackend::new(), session.config());

        // Row 1 is silent, so all of its slots are sentinels.
        let mut input = tone_rows(2, 64);
        input[64..].iter_mut().for_each(|c| *c = Complex32::new(0.0, 0.0));
        let job = BatchJob::new(2, 64, 33, 4);
        let g = gpu.process_host(&session, &job, &input).unwrap();
        let h = host.process(&job, &input).unwrap();
        assert_matches_host(&g, &h);
        assert!(g.rows[1].peaks.iter().all(|p| !p.is_valid()));
        assert!(g.rows[1].refined_index.is_none());
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_sub_batches_preserve_row_order() {
        let session = test_session();
        let job = BatchJob::new(9, 128, 64, 2);
        // Budget for three rows forces a split.
        let three = estimate_device_bytes(&job.with_rows(3)) as f64;
        let config = EngineConfig {
            memory_usage_limit: three / session.context().max_buffer_bytes() as f64,
            batch_size_ratio: 0.5,
            keep_spectrum: true,
            ..EngineConfig::default()
        };
        let gpu = GpuSpectralPipeline::with_config(&session, RustFftBackend::new(), config.clone())
            .unwrap();
        let host = SpectralPipeline::new(RustFftBackend::new(), &config);

        let input = tone_rows(9, 128);
        let device_input = session.create_buffer_with_data(&input, AccessMode::ReadOnly).unwrap();
        let g = gpu.process(&session, &job, &device_input).unwrap();
        let h = host.process(&job, &input).unwrap();
        assert!(g.sub_batches > 1);
        assert_matches_host(&g, &h);
        let spectrum = g.spectrum.unwrap();
        assert_eq!(spectrum.rows, 9);
        assert_eq!(spectrum.magnitude.len(), 9 * 64);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_rejects_bad_jobs_before_dispatch() {
        let session = test_session();
        let gpu = GpuSpectralPipeline::new(&session, RustFftBackend::new()).unwrap();
        let wrong = vec![Complex32::new(0.0, 0.0); 10];
        assert!(matches!(
            gpu.process_host(&session, &BatchJob::new(2, 8, 8, 1), &wrong),
            Err(EngineError::ShapeMismatch { expected: 16, actual: 10, .. })
        ));
        let wide = BatchJob::new(1, 4096, 4096, 1);
        let input = vec![Complex32::new(0.0, 0.0); 4096];
        assert!(matches!(
            gpu.process_host(&session, &wide, &input),
            Err(EngineError::Config { param: "out_len", .. })
        ));
        assert_eq!(gpu.plans().stats().misses, 0);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_plan_reused_across_calls() {
        let session = test_session();
        let gpu = GpuSpectralPipeline::new(&session, RustFftBackend::new()).unwrap();
        let job = BatchJob::new(2, 32, 16, 2);
        let input = tone_rows(2, 32);
        gpu.process_host(&session, &job, &input).unwrap();
        gpu.process_host(&session, &job, &input).unwrap();
        let stats = gpu.statistics(&session);
        assert_eq!((stats.plans.misses, stats.plans.hits), (1, 1));
        // A second pipeline on the same session reuses the compiled kernels.
        let before = stats.session.kernels.hits;
        GpuSpectralPipeline::new(&session, RustFftBackend::new()).unwrap();
        assert_eq!(session.statistics().kernels.hits, before + 3);
        println!("GPU_TEST_OK");
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_top_k_matches_host_selection() {
        let session = test_session();
        let gpu = GpuSpectralPipeline::new(&session, RustFftBackend::new()).unwrap();
        let ctx = session.context();
        let wg = session.config().reduction_workgroup() as usize;
        let (rows, n, k) = (3, 2 * wg + 16, 8);

        let mut mags = vec![0.0f32; rows * n];
        // Row 0: equal maxima in two lanes; the lower index sits in the higher lane.
        mags[9] = 4.0;
        mags[5 + wg] = 4.0;
        mags[n - 1] = 2.0;
        // Row 1: equal maxima swept by one lane.
        for i in [7, 7 + wg, 7 + 2 * wg] {
            mags[n + i] = 3.0;
        }
        // Row 2: 1..=n shuffled.
        for i in 0..n {
            mags[2 * n + i] = ((i * 97) % n + 1) as f32;
        }
        let window: Vec<Complex32> = mags.iter().map(|&m| Complex32::new(m, 0.0)).collect();

        let job = BatchJob::new(rows, n, n, k);
        let params = SpectrumParams::new(&job, SubBatch { first_row: 0, rows }).unwrap();
        let params = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("top_k params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let window_buf = GpuBuffer::with_data(ctx, &window, AccessMode::ReadOnly).unwrap();
        let mag_buf = GpuBuffer::with_data(ctx, &mags, AccessMode::ReadOnly).unwrap();
        let mut peaks = GpuBuffer::<Peak>::new(ctx, rows * k, AccessMode::ReadWrite).unwrap();
        let offsets = GpuBuffer::<f32>::new(ctx, rows, AccessMode::ReadWrite).unwrap();

        let mut encoder = ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("top_k") });
        gpu.top_k
            .record(
                ctx,
                &mut encoder,
                &[
                    Bound::buffer(&window_buf),
                    Bound::buffer(&mag_buf),
                    Bound::buffer(&peaks),
                    Bound::buffer(&offsets),
                    Bound::uniform(&params),
                ],
                grid_for_groups(rows as u32),
                None,
            )
            .unwrap();
        session.next_queue().unwrap().submit(std::iter::once(encoder.finish())).wait();
        peaks.mark_dirty();
        let got = peaks.read_all().unwrap();

        for row in 0..rows {
            let span = row * n..(row + 1) * n;
            let want = select_top_k(&window[span.clone()], &mags[span], k);
            for (g, w) in got[row * k..(row + 1) * k].iter().zip(&want) {
                assert_eq!((g.index, g.magnitude), (w.index, w.magnitude), "row {row}");
                assert!((g.phase_degrees - w.phase_degrees).abs() < 1e-3, "row {row}");
            }
        }

        let indices = |row: usize, count: usize| {
            got[row * k..row * k + count].iter().map(|p| p.index as usize).collect::<Vec<_>>()
        };
        assert_eq!(indices(0, 3), vec![9, 5 + wg, n - 1]);
        assert!(!got[3].is_valid());
        assert_eq!(indices(1, 3), vec![7, 7 + wg, 7 + 2 * wg]);
        assert!(!got[k + 3].is_valid());
        let top: Vec<f32> = got[2 * k..3 * k].iter().map(|p| p.magnitude).collect();
        let expected: Vec<f32> = (n - k + 1..=n).rev().map(|m| m as f32).collect();
        assert_eq!(top, expected);
        println!("GPU_TEST_OK");
    }

    // ---- Outer wrappers -----------------------------------------------------

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_gpu_matches_host_reference() {
        let out =
            run_gpu_test_in_subprocess("gpu::pipeline::tests::inner_gpu_matches_host_reference");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_odd_window_and_sentinels() {
        let out = run_gpu_test_in_subprocess("gpu::pipeline::tests::inner_odd_window_and_sentinels");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_sub_batches_preserve_row_order() {
        let out =
            run_gpu_test_in_subprocess("gpu::pipeline::tests::inner_sub_batches_preserve_row_order");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_rejects_bad_jobs_before_dispatch() {
        let out =
            run_gpu_test_in_subprocess("gpu::pipeline::tests::inner_rejects_bad_jobs_before_dispatch");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_plan_reused_across_calls() {
        let out = run_gpu_test_in_subprocess("gpu::pipeline::tests::inner_plan_reused_across_calls");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }

    #[test]
    #[ignore = "requires a real GPU"]
    fn test_top_k_matches_host_selection() {
        let out =
            run_gpu_test_in_subprocess("gpu::pipeline::tests::inner_top_k_matches_host_selection");
        assert!(out.contains("GPU_TEST_OK"), "inner test did not print GPU_TEST_OK:\n{out}");
    }
}
