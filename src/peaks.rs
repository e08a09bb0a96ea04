// peaks.rs — peak records and the host reference top-K selection.
//
// The selection here is the reference the top_k.wgsl kernel is checked
// against. Per row it runs K sequential scans:
//
//   1. sweep the row in ascending index order, replacing the running
//      maximum only on a strictly greater value (ties → lowest index);
//   2. if the winner's magnitude is > 0, record (index, magnitude, phase)
//      and overwrite that slot with -1 so it can never win again;
//   3. otherwise mark this and every later slot with SENTINEL_INDEX.
//
// The kernel reaches the same answer with a parallel strided sweep and a
// tree reduction that breaks ties toward the lower index.

use bytemuck::{Pod, Zeroable};
use num_complex::Complex32;

/// Index value of an unfilled peak slot.
pub const SENTINEL_INDEX: u32 = u32::MAX;

/// Radians → degrees, as used by the kernel.
pub const RAD_TO_DEG: f32 = 57.295_78;

/// One peak: bin index within the output window, magnitude, and phase in
/// degrees. Layout matches the `Peak` struct in top_k.wgsl (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Peak {
    pub index: u32,
    pub magnitude: f32,
    pub phase_degrees: f32,
    pub _pad: u32,
}

impl Peak {
    pub const EMPTY: Peak = Peak {
        index: SENTINEL_INDEX,
        magnitude: 0.0,
        phase_degrees: 0.0,
        _pad: 0,
    };

    pub fn new(index: u32, magnitude: f32, phase_degrees: f32) -> Self {
        Peak { index, magnitude, phase_degrees, _pad: 0 }
    }

    /// False for sentinel slots.
    pub fn is_valid(&self) -> bool {
        self.index != SENTINEL_INDEX
    }
}

/// Phase of `value` in degrees, in (-180, 180].
pub fn phase_degrees(value: Complex32) -> f32 {
    value.im.atan2(value.re) * RAD_TO_DEG
}

/// Top-K selection for one row.
///
/// `window` and `magnitudes` are the row's OutLen complex values and
/// moduli. Always returns exactly `k` records; unfilled ones are
/// [`Peak::EMPTY`]. Only the first `min(window.len(), magnitudes.len())`
/// positions are considered.
pub fn select_top_k(window: &[Complex32], magnitudes: &[f32], k: usize) -> Vec<Peak> {
    let len = window.len().min(magnitudes.len());
    let mut scratch = magnitudes[..len].to_vec();
    let mut peaks = Vec::with_capacity(k);

    for _ in 0..k {
        let mut best = -1.0f32;
        let mut best_index = None;
        for (i, &m) in scratch.iter().enumerate() {
            if m > best {
                best = m;
                best_index = Some(i);
            }
        }

        match best_index {
            Some(i) if best > 0.0 => {
                peaks.push(Peak::new(i as u32, best, phase_degrees(window[i])));
                scratch[i] = -1.0;
            }
            _ => peaks.push(Peak::EMPTY),
        }
    }
    peaks
}

/// Peaks for one row of a job, plus the interpolated refinement of the
/// strongest one.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPeaks {
    pub row: usize,
    /// Exactly K records, strongest first; trailing ones may be sentinels.
    pub peaks: Vec<Peak>,
    /// Window index of the strongest peak plus its parabolic offset.
    pub refined_index: Option<f32>,
    /// `refined_index` converted to a signed frequency in Hz.
    pub refined_frequency_hz: Option<f64>,
}

impl RowPeaks {
    /// Peaks that are not sentinels.
    pub fn valid(&self) -> impl Iterator<Item = &Peak> {
        self.peaks.iter().filter(|p| p.is_valid())
    }

    pub fn strongest(&self) -> Option<&Peak> {
        self.peaks.first().filter(|p| p.is_valid())
    }
}
