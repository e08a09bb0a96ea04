// pipeline.rs — host reference spectral peak extraction.
//
// Same stages as gpu::pipeline, with the gather and scatter callbacks run
// as explicit host passes:
//
//   input ──gather──▶ padded (M×L) ──backend──▶ spectrum (M×L)
//         ──scatter──▶ window + magnitudes (M×OutLen) ──top-K──▶ peaks
//
// The GPU pipeline is validated against this one.

use num_complex::Complex32;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::job::BatchJob;
use crate::peaks::{select_top_k, Peak, RowPeaks};
use crate::profiling::{ProfilingCollector, ProfilingReport, Stage};
use crate::spectrum::{parabolic_offset, SpectrumLayout, WindowedSpectrum};
use crate::transform::{PlanCache, TransformBackend};

/// Everything one pipeline call produces.
#[derive(Debug, Clone)]
pub struct SpectralResult {
    pub task_id: String,
    pub module_name: String,
    /// One entry per input row, in row order.
    pub rows: Vec<RowPeaks>,
    pub profiling: ProfilingReport,
    /// Windowed spectrum, when requested.
    pub spectrum: Option<WindowedSpectrum>,
    /// Number of device batches the job was split into (1 on the host).
    pub sub_batches: usize,
}

/// Build a row's result from its K raw records and the interpolation
/// offset of its strongest peak.
pub(crate) fn finish_row(
    row: usize,
    peaks: Vec<Peak>,
    offset: f32,
    layout: &SpectrumLayout,
    sample_rate_hz: f64,
) -> RowPeaks {
    let (refined_index, refined_frequency_hz) = match peaks.first().filter(|p| p.is_valid()) {
        Some(top) => {
            let refined = top.index as f32 + offset;
            let bin_hz = sample_rate_hz / layout.transform_len as f64;
            (Some(refined), Some(layout.signed_bin(refined) as f64 * bin_hz))
        }
        None => (None, None),
    };
    RowPeaks { row, peaks, refined_index, refined_frequency_hz }
}

/// Host spectral pipeline over any [`TransformBackend`].
pub struct SpectralPipeline<B: TransformBackend> {
    backend: B,
    plans: PlanCache<B::Plan>,
    sample_rate_hz: f64,
    profiling: bool,
    keep_spectrum: bool,
}

impl<B: TransformBackend> SpectralPipeline<B> {
    pub fn new(backend: B, config: &EngineConfig) -> Self {
        SpectralPipeline {
            backend,
            plans: PlanCache::new(),
            sample_rate_hz: config.sample_rate_hz,
            profiling: config.profiling,
            keep_spectrum: config.keep_spectrum,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn plans(&self) -> &PlanCache<B::Plan> {
        &self.plans
    }

    /// Run `job` over `input` (M·N samples, row-major).
    pub fn process(&self, job: &BatchJob, input: &[Complex32]) -> Result<SpectralResult> {
        job.validate()?;
        job.check_input(input.len())?;

        let mut prof = ProfilingCollector::new(self.profiling);
        let shape = job.shape();
        let layout = SpectrumLayout::for_job(job);

        let padded = prof.time(Stage::PreProcess, || layout.pad_rows(input, job.rows));

        let plan = self.plans.get_or_plan(&shape, || self.backend.plan(&shape))?;
        let mut spectrum = vec![Complex32::new(0.0, 0.0); padded.len()];
        prof.time(Stage::Transform, || self.backend.execute(&plan, &padded, &mut spectrum))?;

        let window = prof.time(Stage::PostProcess, || layout.window_rows(&spectrum, job.rows));

        let rows = prof.time(Stage::Reduction, || {
            (0..job.rows)
                .map(|row| {
                    let mags = window.row_magnitude(row);
                    let peaks = select_top_k(window.row_complex(row), mags, job.max_peaks);
                    let offset = match peaks.first().filter(|p| p.is_valid()) {
                        Some(top) => parabolic_offset(mags, top.index as usize),
                        None => 0.0,
                    };
                    finish_row(row, peaks, offset, &layout, self.sample_rate_hz)
                })
                .collect::<Vec<_>>()
        });

        Ok(SpectralResult {
            task_id: job.task_id.clone(),
            module_name: job.module_name.clone(),
            rows,
            profiling: prof.finish(),
            spectrum: self.keep_spectrum.then_some(window),
            sub_batches: 1,
        })
    }
}
