// transform.rs — pluggable transform backend and the shape-keyed plan cache.
//
// The pipeline never does transform math itself. It asks a backend for a
// plan for a job shape, caches the plan, and executes it on row-major
// batches of L complex samples per row:
//
//   plan(shape)              → Plan        (expensive, cached per shape)
//   execute(plan, in, out)                 (out-of-place, M rows of L)
//
// `RustFftBackend` is the reference backend. GPU pipelines bridge to it by
// reading the padded rows back to the host and uploading the result.

use std::sync::Arc;

use num_complex::Complex32;
use parking_lot::Mutex;
use rustfft::{Fft, FftPlanner};

use crate::cache::{CacheStats, KeyedCache};
use crate::error::{EngineError, Result};
use crate::job::JobShape;

/// A forward transform implementation.
pub trait TransformBackend: Send + Sync {
    type Plan: Send + Sync;

    fn name(&self) -> &str;

    /// Bake a plan for `shape`. Called once per distinct shape.
    fn plan(&self, shape: &JobShape) -> Result<Self::Plan>;

    /// Forward-transform `shape.rows` rows of `shape.transform_len` samples
    /// from `input` into `output`.
    fn execute(&self, plan: &Self::Plan, input: &[Complex32], output: &mut [Complex32])
        -> Result<()>;
}

/// Process-wide plan cache keyed by the full job shape.
///
/// A plan is reused only on an exact shape match. If a later pipeline step
/// fails, plans baked earlier in the same call stay cached.
pub struct PlanCache<P> {
    inner: KeyedCache<JobShape, P>,
}

impl<P> Default for PlanCache<P> {
    fn default() -> Self {
        PlanCache { inner: KeyedCache::new() }
    }
}

impl<P> PlanCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_plan<F>(&self, shape: &JobShape, plan: F) -> Result<Arc<P>>
    where
        F: FnOnce() -> Result<P>,
    {
        self.inner.get_or_try_insert(shape, || {
            log::debug!("baking transform plan for {shape:?}");
            plan()
        })
    }

    pub fn contains(&self, shape: &JobShape) -> bool {
        self.inner.contains(shape)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

// ---------------------------------------------------------------------------
// rustfft backend
// ---------------------------------------------------------------------------

/// CPU backend built on `rustfft`.
pub struct RustFftBackend {
    planner: Mutex<FftPlanner<f32>>,
}

/// A baked rustfft plan: one forward FFT of length L, applied row by row.
pub struct RustFftPlan {
    fft: Arc<dyn Fft<f32>>,
    shape: JobShape,
}

impl RustFftPlan {
    pub fn shape(&self) -> &JobShape {
        &self.shape
    }
}

impl Default for RustFftBackend {
    fn default() -> Self {
        RustFftBackend { planner: Mutex::new(FftPlanner::new()) }
    }
}

impl RustFftBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransformBackend for RustFftBackend {
    type Plan = RustFftPlan;

    fn name(&self) -> &str {
        "rustfft"
    }

    fn plan(&self, shape: &JobShape) -> Result<RustFftPlan> {
        if shape.transform_len == 0 {
            return Err(EngineError::Transform {
                op: "plan",
                message: "transform length must be non-zero".into(),
            });
        }
        let fft = self.planner.lock().plan_fft_forward(shape.transform_len);
        Ok(RustFftPlan { fft, shape: *shape })
    }

    fn execute(&self, plan: &RustFftPlan, input: &[Complex32], output: &mut [Complex32])
        -> Result<()>
    {
        let expected = plan.shape.rows * plan.shape.transform_len;
        if input.len() != expected {
            return Err(EngineError::ShapeMismatch {
                op: "transform input",
                expected,
                actual: input.len(),
            });
        }
        if output.len() != expected {
            return Err(EngineError::ShapeMismatch {
                op: "transform output",
                expected,
                actual: output.len(),
            });
        }

        output.copy_from_slice(input);
        let mut scratch = vec![Complex32::new(0.0, 0.0); plan.fft.get_inplace_scratch_len()];
        // rustfft processes every L-sized chunk of the buffer in turn.
        plan.fft.process_with_scratch(output, &mut scratch);
        Ok(())
    }
}
