// gpu/timestamps.rs — device timestamps for compute passes.
//
// Each timed pass gets a (begin, end) pair of slots in a timestamp query
// set via `ComputePassTimestampWrites`. After the passes are recorded,
// `resolve` copies the raw ticks into a buffer, and `collect` reads them
// back and converts (end − begin) × period to milliseconds.
//
// Only available when the device was created with TIMESTAMP_QUERY
// (DeviceContext::supports_timestamps). Callers fall back to host clocks
// otherwise.

use crate::error::Result;
use crate::gpu::buffer::map_and_copy;
use crate::gpu::device::DeviceContext;
use crate::profiling::Stage;

pub struct GpuTimer {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    period_ns: f32,
    capacity: u32,
    stages: Vec<Stage>,
}

impl GpuTimer {
    /// Timer with room for `passes` timed passes, or `None` when the device
    /// lacks timestamp support.
    pub fn new(ctx: &DeviceContext, passes: u32) -> Option<Self> {
        if !ctx.supports_timestamps() || passes == 0 {
            return None;
        }
        let count = passes * 2;
        let bytes = count as u64 * wgpu::QUERY_SIZE as u64;
        let query_set = ctx.device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("GpuTimer"),
            ty: wgpu::QueryType::Timestamp,
            count,
        });
        let resolve = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuTimer resolve"),
            size: bytes,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuTimer readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Some(GpuTimer {
            query_set,
            resolve,
            readback,
            period_ns: ctx.queue.get_timestamp_period(),
            capacity: passes,
            stages: Vec::with_capacity(passes as usize),
        })
    }

    /// Reserve the next slot pair for a pass timed under `stage`. Returns
    /// `None` once the timer is full; that pass then goes untimed.
    pub fn pass(&mut self, stage: Stage) -> Option<wgpu::ComputePassTimestampWrites<'_>> {
        let pair = self.stages.len() as u32;
        if pair >= self.capacity {
            log::warn!("GpuTimer full; {} pass untimed", stage.name());
            return None;
        }
        self.stages.push(stage);
        Some(wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(pair * 2),
            end_of_pass_write_index: Some(pair * 2 + 1),
        })
    }

    /// Record the resolve + copy of all reserved slots into `encoder`.
    pub fn resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        let used = self.stages.len() as u32 * 2;
        if used == 0 {
            return;
        }
        let bytes = used as u64 * wgpu::QUERY_SIZE as u64;
        encoder.resolve_query_set(&self.query_set, 0..used, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.resolve, 0, &self.readback, 0, bytes);
    }

    /// Read back the resolved ticks (after the encoder from `resolve` has
    /// been submitted) and return per-stage milliseconds. Resets the timer.
    pub fn collect(&mut self, ctx: &DeviceContext) -> Result<Vec<(Stage, f64)>> {
        let used = self.stages.len() * 2;
        if used == 0 {
            return Ok(Vec::new());
        }
        let bytes = used as u64 * wgpu::QUERY_SIZE as u64;
        let ticks: Vec<u64> = map_and_copy(&ctx.device, &self.readback, bytes, used, "timestamps")?;
        let samples = self
            .stages
            .drain(..)
            .enumerate()
            .map(|(i, stage)| (stage, ticks_to_ms(ticks[2 * i], ticks[2 * i + 1], self.period_ns)))
            .collect();
        Ok(samples)
    }
}

/// Convert a (begin, end) tick pair to milliseconds. Reordered or wrapped
/// pairs yield 0.
pub fn ticks_to_ms(begin: u64, end: u64, period_ns: f32) -> f64 {
    end.saturating_sub(begin) as f64 * period_ns as f64 / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_convert_to_ms() {
        assert_eq!(ticks_to_ms(1_000, 3_000_000, 1.0), 2.999);
        assert_eq!(ticks_to_ms(0, 1_000_000, 2.5), 2.5);
    }

    #[test]
    fn reversed_ticks_are_zero() {
        assert_eq!(ticks_to_ms(10, 5, 1.0), 0.0);
    }
}
