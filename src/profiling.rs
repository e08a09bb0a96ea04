// profiling.rs — per-stage timing for the spectral pipeline.
//
// Stages are timed in milliseconds either from device timestamps
// (gpu::timestamps) or from host `Instant`s around blocking calls. The
// collector only aggregates; it does not care where a sample came from.
// A job split into sub-batches sums its stages across batches.

use std::fmt;
use std::time::Instant;

/// Pipeline stages with a slot in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Host → device input transfer.
    Upload,
    /// Zero-padding gather.
    PreProcess,
    /// Forward transform (backend).
    Transform,
    /// Shift/truncate/magnitude scatter.
    PostProcess,
    /// Top-K selection.
    Reduction,
    /// Device → host result transfer.
    Download,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Upload,
        Stage::PreProcess,
        Stage::Transform,
        Stage::PostProcess,
        Stage::Reduction,
        Stage::Download,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::PreProcess => "pre_process",
            Stage::Transform => "transform",
            Stage::PostProcess => "post_process",
            Stage::Reduction => "reduction",
            Stage::Download => "download",
        }
    }
}

/// Elapsed time per stage, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProfilingReport {
    pub upload_ms: f64,
    pub pre_process_ms: f64,
    pub transform_ms: f64,
    pub post_process_ms: f64,
    pub reduction_ms: f64,
    pub download_ms: f64,
    /// Wall time of the whole call, including untimed host work.
    pub total_ms: f64,
}

impl ProfilingReport {
    pub fn stage_ms(&self, stage: Stage) -> f64 {
        match stage {
            Stage::Upload => self.upload_ms,
            Stage::PreProcess => self.pre_process_ms,
            Stage::Transform => self.transform_ms,
            Stage::PostProcess => self.post_process_ms,
            Stage::Reduction => self.reduction_ms,
            Stage::Download => self.download_ms,
        }
    }

    fn stage_mut(&mut self, stage: Stage) -> &mut f64 {
        match stage {
            Stage::Upload => &mut self.upload_ms,
            Stage::PreProcess => &mut self.pre_process_ms,
            Stage::Transform => &mut self.transform_ms,
            Stage::PostProcess => &mut self.post_process_ms,
            Stage::Reduction => &mut self.reduction_ms,
            Stage::Download => &mut self.download_ms,
        }
    }

    /// Sum of the individual stages (excludes untimed work in `total_ms`).
    pub fn stages_ms(&self) -> f64 {
        Stage::ALL.iter().map(|&s| self.stage_ms(s)).sum()
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in Stage::ALL {
            write!(f, "{}={:.3}ms ", stage.name(), self.stage_ms(stage))?;
        }
        write!(f, "total={:.3}ms", self.total_ms)
    }
}

/// Accumulates stage samples for one pipeline call.
#[derive(Debug)]
pub struct ProfilingCollector {
    enabled: bool,
    started: Instant,
    report: ProfilingReport,
}

impl ProfilingCollector {
    /// Start a collector; the total clock starts now. A disabled collector
    /// ignores samples but still runs timed closures.
    pub fn new(enabled: bool) -> Self {
        ProfilingCollector { enabled, started: Instant::now(), report: ProfilingReport::default() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add `ms` to `stage`.
    pub fn record(&mut self, stage: Stage, ms: f64) {
        if self.enabled {
            *self.report.stage_mut(stage) += ms;
        }
    }

    /// Run `f` and charge its host wall time to `stage`.
    pub fn time<R>(&mut self, stage: Stage, f: impl FnOnce() -> R) -> R {
        let t0 = Instant::now();
        let out = f();
        self.record(stage, t0.elapsed().as_secs_f64() * 1e3);
        out
    }

    /// Stop the total clock and return the report. A disabled collector
    /// returns all zeros.
    pub fn finish(mut self) -> ProfilingReport {
        if self.enabled {
            self.report.total_ms = self.started.elapsed().as_secs_f64() * 1e3;
        }
        log::debug!("profiling: {}", self.report);
        self.report
    }
}
