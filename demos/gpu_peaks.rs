// demos/gpu_peaks.rs
//
// Run the spectral peak pipeline on a synthetic multi-channel capture, on
// the GPU, and print each channel's peaks next to the host reference.
//
// Usage:
//   cargo run --example gpu_peaks --release -- [rows] [samples_per_row]
//
// Defaults: 8 rows of 1000 samples. Set RUST_LOG=debug to see adapter
// selection, compiles and plan bakes.

use std::env;
use std::f64::consts::TAU;

use beamfft::gpu::{ComputeSession, GpuSpectralPipeline};
use beamfft::job::BatchJob;
use beamfft::pipeline::SpectralPipeline;
use beamfft::transform::RustFftBackend;
use beamfft::{EngineConfig, RowPeaks};
use num_complex::Complex32;

/// One tone per channel at a channel-dependent offset, with a weak
/// neighbouring tone and a little deterministic noise.
fn synthesize(rows: usize, n: usize, sample_rate: f64) -> Vec<Complex32> {
    let mut out = Vec::with_capacity(rows * n);
    let mut seed = 0x2545_f491_u32;
    for r in 0..rows {
        let f_main = -2.0e6 + 0.5e6 * r as f64;
        let f_side = f_main + 180.0e3;
        for t in 0..n {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let noise = (seed as f64 / u32::MAX as f64 - 0.5) * 0.02;
            let s = t as f64 / sample_rate;
            let re = (TAU * f_main * s).cos() + 0.25 * (TAU * f_side * s).cos() + noise;
            let im = (TAU * f_main * s).sin() + 0.25 * (TAU * f_side * s).sin() - noise;
            out.push(Complex32::new(re as f32, im as f32));
        }
    }
    out
}

fn print_row(tag: &str, row: &RowPeaks) {
    let peaks: Vec<String> = row
        .valid()
        .map(|p| format!("{}:{:.1}@{:+.1}°", p.index, p.magnitude, p.phase_degrees))
        .collect();
    let freq = row
        .refined_frequency_hz
        .map(|f| format!("{:+.1} kHz", f / 1e3))
        .unwrap_or_else(|| "-".into());
    println!("  {tag} row {:>3}  {freq:>12}  {}", row.row, peaks.join("  "));
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let rows: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8);
    let n: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1000);

    let config = EngineConfig::default();
    let session = match ComputeSession::new(config.clone()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let job = BatchJob::new(rows, n, 512, 3).with_task("demo-1", "synthetic-array");
    println!(
        "{} rows × {} samples → L = {}, window {}, K = {}",
        job.rows,
        job.input_len,
        job.transform_len(),
        job.out_len,
        job.max_peaks
    );
    let input = synthesize(rows, n, config.sample_rate_hz);

    let gpu = match GpuSpectralPipeline::new(&session, RustFftBackend::new()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let host = SpectralPipeline::new(RustFftBackend::new(), &config);

    let (device, reference) = match (
        gpu.process_host(&session, &job, &input),
        host.process(&job, &input),
    ) {
        (Ok(d), Ok(r)) => (d, r),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    for (d, r) in device.rows.iter().zip(&reference.rows) {
        print_row("gpu ", d);
        print_row("host", r);
    }
    println!();
    println!("gpu  {}", device.profiling);
    println!("host {}", reference.profiling);
    println!("{}", gpu.statistics(&session).session);
}
