// spectrum.rs — data-layout callbacks around the transform.
//
// Two pure index maps, shared by the host pipeline and mirrored by the
// WGSL kernels in shaders/pad_gather.wgsl and shaders/shift_scatter.wgsl:
//
//   gather  (before the transform): linear index g over M·L elements →
//           the input sample at (row, pos) when pos < N, zero otherwise.
//           Padding is implicit in the index map.
//
//   scatter (after the transform): transform bin p ∈ [0, L) → slot in the
//           OutLen-wide output window, or nothing.
//
//             half = OutLen / 2
//             p ≥ L − half  →  slot p − (L − half)     (negative frequencies)
//             p < half      →  slot half + p           (positive frequencies)
//             otherwise     →  dropped
//
//           This truncates to a window centered on zero frequency; it is
//           not a full shift of all L bins. Zero frequency lands at slot
//           `half`. When OutLen is odd the last slot (OutLen − 1) has no
//           source bin and stays zero.

use num_complex::Complex32;

use crate::job::BatchJob;

/// Index geometry of one job's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectrumLayout {
    pub input_len: usize,
    pub transform_len: usize,
    pub out_len: usize,
}

impl SpectrumLayout {
    pub fn new(input_len: usize, transform_len: usize, out_len: usize) -> Self {
        SpectrumLayout { input_len, transform_len, out_len }
    }

    pub fn for_job(job: &BatchJob) -> Self {
        SpectrumLayout::new(job.input_len, job.transform_len(), job.out_len)
    }

    fn half(&self) -> usize {
        self.out_len / 2
    }

    /// Gather callback: the sample the transform reads at linear index `g`.
    ///
    /// `input` is row-major with `input_len` samples per row.
    #[inline]
    pub fn gather(&self, input: &[Complex32], g: usize) -> Complex32 {
        let row = g / self.transform_len;
        let pos = g % self.transform_len;
        if pos < self.input_len {
            input[row * self.input_len + pos]
        } else {
            Complex32::new(0.0, 0.0)
        }
    }

    /// Scatter callback: window slot for transform bin `p`, if any.
    #[inline]
    pub fn scatter_slot(&self, p: usize) -> Option<usize> {
        let half = self.half();
        let negative_start = self.transform_len - half;
        if p >= negative_start {
            Some(p - negative_start)
        } else if p < half {
            Some(half + p)
        } else {
            None
        }
    }

    /// Inverse of [`scatter_slot`](Self::scatter_slot): the transform bin
    /// that feeds `slot`, or `None` for the unwritten slot of an odd window.
    pub fn source_bin(&self, slot: usize) -> Option<usize> {
        let half = self.half();
        if slot < half {
            Some(self.transform_len - half + slot)
        } else if slot < 2 * half {
            Some(slot - half)
        } else {
            None
        }
    }

    /// Signed frequency bin of a window slot, relative to zero frequency.
    pub fn signed_bin(&self, slot: f32) -> f32 {
        slot - self.half() as f32
    }

    /// Host pre-pass: materialize the gather for `rows` rows.
    pub fn pad_rows(&self, input: &[Complex32], rows: usize) -> Vec<Complex32> {
        (0..rows * self.transform_len).map(|g| self.gather(input, g)).collect()
    }

    /// Host post-pass: run the scatter over a transformed batch.
    pub fn window_rows(&self, spectrum: &[Complex32], rows: usize) -> WindowedSpectrum {
        let mut out = WindowedSpectrum::zeroed(rows, self.out_len);
        for row in 0..rows {
            let src = &spectrum[row * self.transform_len..(row + 1) * self.transform_len];
            let base = row * self.out_len;
            for (p, &value) in src.iter().enumerate() {
                if let Some(slot) = self.scatter_slot(p) {
                    out.complex[base + slot] = value;
                    out.magnitude[base + slot] = value.norm();
                }
            }
        }
        out
    }
}

/// Windowed transform output: OutLen complex values and their moduli per
/// row, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowedSpectrum {
    pub rows: usize,
    pub out_len: usize,
    pub complex: Vec<Complex32>,
    pub magnitude: Vec<f32>,
}

impl WindowedSpectrum {
    pub fn zeroed(rows: usize, out_len: usize) -> Self {
        WindowedSpectrum {
            rows,
            out_len,
            complex: vec![Complex32::new(0.0, 0.0); rows * out_len],
            magnitude: vec![0.0; rows * out_len],
        }
    }

    pub fn row_complex(&self, row: usize) -> &[Complex32] {
        &self.complex[row * self.out_len..(row + 1) * self.out_len]
    }

    pub fn row_magnitude(&self, row: usize) -> &[f32] {
        &self.magnitude[row * self.out_len..(row + 1) * self.out_len]
    }

    /// Append another batch's rows (sub-batch merging).
    pub fn extend(&mut self, other: WindowedSpectrum) {
        self.rows += other.rows;
        self.complex.extend(other.complex);
        self.magnitude.extend(other.magnitude);
    }
}

/// Parabolic interpolation around bin `index` of a magnitude row.
///
/// Returns the fractional offset in [-0.5, 0.5] of the true peak from
/// `index`. Neighbours past either end of the row reuse the center value;
/// a flat neighbourhood (|denominator| ≤ 1e-10) yields 0.
pub fn parabolic_offset(magnitudes: &[f32], index: usize) -> f32 {
    let yc = magnitudes[index];
    let yl = if index > 0 { magnitudes[index - 1] } else { yc };
    let yr = magnitudes.get(index + 1).copied().unwrap_or(yc);
    let denom = yl - 2.0 * yc + yr;
    if denom.abs() > 1e-10 {
        (0.5 * (yl - yr) / denom).clamp(-0.5, 0.5)
    } else {
        0.0
    }
}
