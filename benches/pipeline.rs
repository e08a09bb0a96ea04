// benches/pipeline.rs -- Host pipeline benchmarks.
//
//   cargo bench --bench pipeline
//
// The plan cache is the point of interest: a warm pipeline reuses the
// rustfft plan for a repeated shape, a cold one bakes it on every call.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use num_complex::Complex32;

use beamfft::job::BatchJob;
use beamfft::peaks::select_top_k;
use beamfft::pipeline::SpectralPipeline;
use beamfft::transform::RustFftBackend;
use beamfft::EngineConfig;

// ============================================================
// Helpers
// ============================================================

/// `rows` rows of `n` samples, one tone per row plus a weaker second tone.
fn make_batch(rows: usize, n: usize) -> Vec<Complex32> {
    let mut out = Vec::with_capacity(rows * n);
    for r in 0..rows {
        let f1 = (3 + 7 * r) as f32;
        let f2 = (11 + 5 * r) as f32;
        for t in 0..n {
            let x = std::f32::consts::TAU * t as f32 / n as f32;
            out.push(
                Complex32::from_polar(1.0, f1 * x) + Complex32::from_polar(0.3, -f2 * x),
            );
        }
    }
    out
}

fn quiet_config() -> EngineConfig {
    EngineConfig { profiling: false, ..EngineConfig::default() }
}

// ============================================================
// Full pipeline: warm vs cold plan cache
// ============================================================

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_pipeline");

    for &(rows, n) in &[(4usize, 256usize), (64, 256), (16, 1000), (128, 64)] {
        let job = BatchJob::new(rows, n, 256usize.min(2 * n.next_power_of_two()), 3);
        let input = make_batch(rows, n);
        let label = format!("{rows}x{n}");

        let warm = SpectralPipeline::new(RustFftBackend::new(), &quiet_config());
        group.bench_with_input(BenchmarkId::new("warm_plan", &label), &input, |b, input| {
            b.iter(|| warm.process(&job, input).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("cold_plan", &label), &input, |b, input| {
            b.iter(|| {
                let cold = SpectralPipeline::new(RustFftBackend::new(), &quiet_config());
                cold.process(&job, input).unwrap()
            });
        });
    }
    group.finish();
}

// ============================================================
// Top-K alone
// ============================================================

fn bench_top_k(c: &mut Criterion) {
    let mut group = c.benchmark_group("top_k");
    for &out_len in &[64usize, 512, 2048] {
        let window: Vec<Complex32> = (0..out_len)
            .map(|i| Complex32::new(((i * 37) % 101) as f32, ((i * 13) % 17) as f32))
            .collect();
        let mags: Vec<f32> = window.iter().map(|c| c.norm()).collect();
        for &k in &[1usize, 3, 8] {
            group.bench_function(BenchmarkId::new(format!("k{k}"), out_len), |b| {
                b.iter(|| select_top_k(&window, &mags, k));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline, bench_top_k);
criterion_main!(benches);
