// this_file: src/simulate.rs
//! Synthetic render loop.
//!
//! Each frame acquires one surface per layer in parallel, paints it and
//! lets it go again, the way a compositor cycles its back buffers. The
//! resulting report shows how much allocator traffic the pool absorbed.

use crate::bitmap::{Bitmap, PixelFormat};
use crate::context::{MemoryReport, SurfaceContext};
use crate::error::{Error, Result};
use crate::logging::Timer;
use log::{debug, warn};
use rayon::prelude::*;
use serde::Serialize;

/// Workload shape
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Frames to render
    pub frames: u32,
    /// Surfaces per frame
    pub layers: u32,
    /// Base surface width
    pub width: u32,
    /// Base surface height
    pub height: u32,
    /// Pixel format of every surface
    pub format: PixelFormat,
    /// Distinct widths cycled through by the layers (1 = all equal)
    pub size_variants: u32,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            frames: 60,
            layers: 4,
            width: 800,
            height: 600,
            format: PixelFormat::Rgba32,
            size_variants: 1,
        }
    }
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub frames: u32,
    /// Frames abandoned because a surface could not be obtained
    pub frames_skipped: u32,
    pub surfaces_acquired: u64,
    pub elapsed_ms: f64,
    pub avg_frame_ms: f64,
    pub memory: MemoryReport,
}

fn paint(bitmap: &Bitmap, frame: u32, layer: u32) -> u64 {
    let value = (frame.wrapping_mul(31) ^ layer) as u8;
    // SAFETY: the surface was acquired for this closure alone.
    let pixels = unsafe { bitmap.as_bytes_mut() };
    for row in pixels.chunks_mut(bitmap.bytes_per_row()) {
        row.fill(value);
    }
    pixels.iter().step_by(97).map(|&b| b as u64).sum()
}

fn render_frame(ctx: &SurfaceContext, opts: &SimulationOptions, frame: u32) -> Result<u64> {
    let variants = opts.size_variants.max(1);
    (0..opts.layers)
        .into_par_iter()
        .map(|layer| {
            let width = opts.width + (layer % variants) * 16;
            let bitmap = ctx.acquire(width, opts.height, opts.format)?;
            Ok(paint(&bitmap, frame, layer))
        })
        .collect::<Result<Vec<u64>>>()
        .map(|sums| sums.into_iter().fold(0u64, u64::wrapping_add))
}

/// Run the render loop against `ctx`.
///
/// A frame whose surfaces cannot all be allocated is skipped; invalid
/// options abort the run.
pub fn run_simulation(ctx: &SurfaceContext, opts: &SimulationOptions) -> Result<SimulationReport> {
    if opts.layers == 0 {
        return Err(Error::InvalidRequest("simulation needs at least one layer".into()));
    }
    let timer = Timer::new(format!("simulate {} frames", opts.frames));
    let mut skipped = 0;
    let mut acquired = 0u64;

    for frame in 0..opts.frames {
        match render_frame(ctx, opts, frame) {
            Ok(checksum) => {
                acquired += opts.layers as u64;
                debug!("frame {} checksum {:#x}", frame, checksum);
            }
            Err(e) if e.is_allocation_failure() => {
                warn!("frame {} skipped: {}", frame, e);
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    let elapsed_ms = timer.elapsed_ms();
    Ok(SimulationReport {
        frames: opts.frames,
        frames_skipped: skipped,
        surfaces_acquired: acquired,
        elapsed_ms,
        avg_frame_ms: if opts.frames > 0 {
            elapsed_ms / opts.frames as f64
        } else {
            0.0
        },
        memory: ctx.report(),
    })
}
