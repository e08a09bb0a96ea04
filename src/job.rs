// job.rs — batch job descriptor, shape key and sub-batch planning.
//
// A job is M rows of N complex samples. Each row is zero-padded to the
// transform length L = 2 · next_pow2(N), transformed, cut down to an
// OutLen-wide window centered on zero frequency, and reduced to its K
// strongest bins.
//
// The full shape tuple (M, N, L, OutLen, K) is the plan-cache key. K is part
// of the key even though the transform itself ignores it, because it fixes
// the layout of the peak buffers downstream.

use std::mem::size_of;

use num_complex::Complex32;

use crate::error::{EngineError, Result};
use crate::peaks::Peak;

/// Upper bound on peaks per row. The top-K kernel runs K sequential scans,
/// so K is kept small.
pub const MAX_PEAKS: usize = 8;

/// Transform length for an input row of `n` samples: twice the next power
/// of two. Always even and always ≥ 2n.
pub fn transform_length(n: usize) -> usize {
    2 * n.max(1).next_power_of_two()
}

/// Hashable shape of a job, used as the plan-cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobShape {
    pub rows: usize,
    pub input_len: usize,
    pub transform_len: usize,
    pub out_len: usize,
    pub max_peaks: usize,
}

/// One batch of rows to process, plus metadata echoed into the result.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchJob {
    /// Number of rows (M).
    pub rows: usize,
    /// Samples per input row (N).
    pub input_len: usize,
    /// Width of the zero-centered output window (OutLen).
    pub out_len: usize,
    /// Peaks reported per row (K).
    pub max_peaks: usize,
    pub task_id: String,
    pub module_name: String,
}

impl BatchJob {
    pub fn new(rows: usize, input_len: usize, out_len: usize, max_peaks: usize) -> Self {
        BatchJob {
            rows,
            input_len,
            out_len,
            max_peaks,
            task_id: String::new(),
            module_name: String::from("beamfft"),
        }
    }

    /// Attach task metadata for the report writer.
    pub fn with_task(mut self, task_id: impl Into<String>, module_name: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self.module_name = module_name.into();
        self
    }

    pub fn transform_len(&self) -> usize {
        transform_length(self.input_len)
    }

    pub fn shape(&self) -> JobShape {
        JobShape {
            rows: self.rows,
            input_len: self.input_len,
            transform_len: self.transform_len(),
            out_len: self.out_len,
            max_peaks: self.max_peaks,
        }
    }

    /// Copy of this job restricted to `rows` rows.
    pub fn with_rows(&self, rows: usize) -> BatchJob {
        BatchJob { rows, ..self.clone() }
    }

    /// Elements expected in the input buffer (M · N).
    pub fn input_elements(&self) -> usize {
        self.rows * self.input_len
    }

    /// Check parameter ranges. Runs before any device work.
    pub fn validate(&self) -> Result<()> {
        if self.rows == 0 {
            return Err(EngineError::config("rows", "must be at least 1"));
        }
        if self.input_len == 0 {
            return Err(EngineError::config("input_len", "must be at least 1"));
        }
        if self.out_len == 0 {
            return Err(EngineError::config("out_len", "must be at least 1"));
        }
        let l = self.transform_len();
        if self.out_len > l {
            return Err(EngineError::config(
                "out_len",
                format!("{} exceeds transform length {}", self.out_len, l),
            ));
        }
        if self.max_peaks == 0 || self.max_peaks > MAX_PEAKS {
            return Err(EngineError::config(
                "max_peaks",
                format!("must be in 1..={MAX_PEAKS}, got {}", self.max_peaks),
            ));
        }
        Ok(())
    }

    /// Reject an input whose element count is not M · N.
    pub fn check_input(&self, actual: usize) -> Result<()> {
        let expected = self.input_elements();
        if actual != expected {
            return Err(EngineError::ShapeMismatch { op: "process", expected, actual });
        }
        Ok(())
    }
}

/// Device bytes needed to run `job` in one batch: input rows, padded rows,
/// transform output, windowed spectrum plus magnitudes, peaks and one
/// interpolation offset per row.
pub fn estimate_device_bytes(job: &BatchJob) -> u64 {
    let c = size_of::<Complex32>() as u64;
    let rows = job.rows as u64;
    let input = rows * job.input_len as u64 * c;
    let transform = rows * job.transform_len() as u64 * c * 2;
    let window = rows * job.out_len as u64 * (c + size_of::<f32>() as u64);
    let peaks = rows * job.max_peaks as u64 * size_of::<Peak>() as u64;
    let offsets = rows * size_of::<f32>() as u64;
    input + transform + window + peaks + offsets
}

/// Rows per sub-batch for a split job: `total · ratio`, at least 1 and at
/// most `total`.
pub fn batch_rows(total: usize, ratio: f64) -> usize {
    let rows = (total as f64 * ratio) as usize;
    rows.clamp(1, total.max(1))
}

/// A contiguous run of rows inside a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBatch {
    pub first_row: usize,
    pub rows: usize,
}

/// Whether a sub-batch of `rows` rows stays within `budget` device bytes and
/// keeps its largest buffer (the transform scratch) under `binding_limit`.
pub fn batch_fits(job: &BatchJob, rows: usize, budget: u64, binding_limit: u64) -> bool {
    let sub = job.with_rows(rows);
    let largest = (rows * sub.transform_len() * size_of::<Complex32>()) as u64;
    estimate_device_bytes(&sub) <= budget && largest <= binding_limit
}

/// Split `total` rows into runs of `per_batch`. A trailing run of one or
/// two rows is folded into the run before it when `fits` accepts the merged
/// size; otherwise it stays a run of its own.
pub fn plan_sub_batches<F>(total: usize, per_batch: usize, fits: F) -> Vec<SubBatch>
where
    F: Fn(usize) -> bool,
{
    if total == 0 {
        return Vec::new();
    }
    let per_batch = per_batch.clamp(1, total);
    let mut count = total.div_ceil(per_batch);
    let last = total - (count - 1) * per_batch;
    if count > 1 && last <= 2 && fits(per_batch + last) {
        count -= 1;
    }

    (0..count)
        .map(|i| {
            let first_row = i * per_batch;
            let rows = if i + 1 == count { total - first_row } else { per_batch };
            SubBatch { first_row, rows }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_length_doubles_next_power_of_two() {
        assert_eq!(transform_length(256), 512);
        assert_eq!(transform_length(257), 1024);
        assert_eq!(transform_length(1), 2);
        assert_eq!(transform_length(1000), 2048);
        for n in 1..300 {
            let l = transform_length(n);
            assert!(l >= 2 * n && l % 2 == 0);
        }
    }

    #[test]
    fn validate_rejects_each_bad_parameter() {
        let ok = BatchJob::new(4, 256, 64, 3);
        ok.validate().unwrap();

        let cases = [
            (BatchJob::new(0, 256, 64, 3), "rows"),
            (BatchJob::new(4, 0, 64, 3), "input_len"),
            (BatchJob::new(4, 256, 0, 3), "out_len"),
            (BatchJob::new(4, 256, 513, 3), "out_len"),
            (BatchJob::new(4, 256, 64, 0), "max_peaks"),
            (BatchJob::new(4, 256, 64, 9), "max_peaks"),
        ];
        for (job, expected) in cases {
            match job.validate() {
                Err(EngineError::Config { param, .. }) => assert_eq!(param, expected),
                other => panic!("{job:?}: expected Config({expected}), got {other:?}"),
            }
        }
    }

    #[test]
    fn check_input_reports_mismatch() {
        let job = BatchJob::new(4, 256, 64, 3);
        job.check_input(1024).unwrap();
        let err = job.check_input(1023).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ShapeMismatch { expected: 1024, actual: 1023, .. }
        ));
    }

    #[test]
    fn shape_includes_max_peaks() {
        let a = BatchJob::new(4, 256, 64, 3).shape();
        let b = BatchJob::new(4, 256, 64, 4).shape();
        assert_ne!(a, b);
        assert_eq!(a.transform_len, 512);
    }

    #[test]
    fn batch_rows_is_clamped() {
        assert_eq!(batch_rows(100, 0.2), 20);
        assert_eq!(batch_rows(3, 0.1), 1);
        assert_eq!(batch_rows(10, 1.0), 10);
    }

    #[test]
    fn sub_batches_cover_all_rows_in_order() {
        let plan = plan_sub_batches(100, 30, |_| true);
        assert_eq!(
            plan,
            vec![
                SubBatch { first_row: 0, rows: 30 },
                SubBatch { first_row: 30, rows: 30 },
                SubBatch { first_row: 60, rows: 30 },
                SubBatch { first_row: 90, rows: 10 },
            ]
        );
    }

    #[test]
    fn small_tail_is_merged() {
        // 22 = 2·10 + 2 → the 2-row tail joins the second batch.
        let plan = plan_sub_batches(22, 10, |_| true);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1], SubBatch { first_row: 10, rows: 12 });

        // A 3-row tail stays separate.
        let plan = plan_sub_batches(23, 10, |_| true);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[2].rows, 3);
    }

    #[test]
    fn small_tail_stays_separate_when_merge_would_not_fit() {
        let plan = plan_sub_batches(22, 10, |rows| rows <= 10);
        assert_eq!(
            plan,
            vec![
                SubBatch { first_row: 0, rows: 10 },
                SubBatch { first_row: 10, rows: 10 },
                SubBatch { first_row: 20, rows: 2 },
            ]
        );
    }

    #[test]
    fn single_batch_when_it_fits() {
        assert_eq!(plan_sub_batches(5, 5, |_| true), vec![SubBatch { first_row: 0, rows: 5 }]);
        assert_eq!(plan_sub_batches(2, 1, |_| true), vec![SubBatch { first_row: 0, rows: 2 }]);
    }

    #[test]
    fn batch_fits_checks_budget_and_binding() {
        let job = BatchJob::new(8, 256, 64, 3);
        let two = estimate_device_bytes(&job.with_rows(2));
        let row_bytes = (job.transform_len() * size_of::<Complex32>()) as u64;
        assert!(batch_fits(&job, 2, two, u64::MAX));
        assert!(!batch_fits(&job, 3, two, u64::MAX));
        assert!(batch_fits(&job, 4, u64::MAX, 4 * row_bytes));
        assert!(!batch_fits(&job, 5, u64::MAX, 4 * row_bytes));
    }

    #[test]
    fn estimate_scales_with_rows() {
        let one = estimate_device_bytes(&BatchJob::new(1, 256, 64, 3));
        let four = estimate_device_bytes(&BatchJob::new(4, 256, 64, 3));
        assert_eq!(four, 4 * one);
        // 256·8 + 512·8·2 + 64·12 + 3·16 + 4
        assert_eq!(one, 2048 + 8192 + 768 + 48 + 4);
    }
}
