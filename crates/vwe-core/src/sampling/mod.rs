//! Sampling engine: bias-corrected coordinate grids over a bounded world.
//!
//! Every grid cell is sampled at its center rather than its corner:
//!
//! ```text
//! S      = 2R / N
//! worldX = (x + 0.5) * S - R
//! worldZ = (z + 0.5) * S - R
//! ```
//!
//! Corner-aligned sampling puts cell (0, 0) exactly on the world boundary,
//! where peripheral categories are over-represented. Center sampling keeps
//! the same sample count and step size while every sample stays strictly
//! inside `(-R, R)` and the grid stays symmetric about the origin.
//!
//! # Modules
//!
//! - [`adaptive`]: coarse pass plus boundary refinement (`AdaptiveSampler`)
//! - [`probe`]: `RasterProbe`, a probe backed by an extracted grid

pub mod adaptive;
pub mod probe;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::metrics::METRICS;

pub use adaptive::{AdaptiveConfig, AdaptiveSampler};
pub use probe::RasterProbe;

/// Name of the sampling rule recorded in plans and metadata.
pub const PIXEL_CENTER_RULE: &str = "pixel_center";

/// Square grid over a world of radius `R`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub world_radius: f64,
    pub resolution: usize,
}

impl GridSpec {
    /// Create a grid spec. Requires `resolution >= 1` and a finite `world_radius > 0`.
    pub fn new(world_radius: f64, resolution: usize) -> Result<Self> {
        if resolution == 0 {
            return Err(PipelineError::InvalidGrid(
                "resolution must be at least 1".to_string(),
            ));
        }
        if !world_radius.is_finite() || world_radius <= 0.0 {
            return Err(PipelineError::InvalidGrid(format!(
                "world radius must be positive and finite, got {world_radius}"
            )));
        }
        Ok(Self {
            world_radius,
            resolution,
        })
    }

    /// Distance between neighbouring samples in world units.
    pub fn step(&self) -> f64 {
        (2.0 * self.world_radius) / self.resolution as f64
    }

    pub fn world_diameter(&self) -> f64 {
        2.0 * self.world_radius
    }

    /// World coordinate of grid index `i` along either axis.
    pub fn coordinate(&self, i: usize) -> f64 {
        (i as f64 + 0.5) * self.step() - self.world_radius
    }

    pub fn sample_count(&self) -> usize {
        self.resolution * self.resolution
    }
}

/// One probe answer: classification and elevation at a world coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeValue {
    pub biome_id: u32,
    pub height: f32,
}

/// Source of classification and elevation for arbitrary world coordinates.
pub trait WorldProbe: Sync {
    fn probe(&self, world_x: f64, world_z: f64) -> ProbeValue;
}

impl<F> WorldProbe for F
where
    F: Fn(f64, f64) -> ProbeValue + Sync,
{
    fn probe(&self, world_x: f64, world_z: f64) -> ProbeValue {
        self(world_x, world_z)
    }
}

/// A single grid sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub world_x: f64,
    pub world_z: f64,
    pub biome_id: u32,
    pub height: f32,
}

/// N×N samples stored row-major (`index = z * N + x`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleGrid {
    spec: GridSpec,
    samples: Vec<Sample>,
}

impl SampleGrid {
    /// Wrap samples produced for `spec`. The sample count must be exactly N².
    pub fn from_samples(spec: GridSpec, samples: Vec<Sample>) -> Result<Self> {
        if samples.len() != spec.sample_count() {
            return Err(PipelineError::InvalidGrid(format!(
                "expected {} samples for resolution {}, got {}",
                spec.sample_count(),
                spec.resolution,
                samples.len()
            )));
        }
        Ok(Self { spec, samples })
    }

    pub fn spec(&self) -> &GridSpec {
        &self.spec
    }

    pub fn resolution(&self) -> usize {
        self.spec.resolution
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn get(&self, x: usize, z: usize) -> Option<&Sample> {
        let n = self.spec.resolution;
        if x >= n || z >= n {
            return None;
        }
        self.samples.get(z * n + x)
    }

    /// Rows in `z` order, each in `x` order.
    pub fn rows(&self) -> impl Iterator<Item = &[Sample]> {
        self.samples.chunks(self.spec.resolution)
    }
}

/// Result of one sampling pass.
#[derive(Debug, Clone)]
pub struct SamplingOutcome {
    pub grid: SampleGrid,
    /// Number of probe calls issued.
    pub probes: usize,
    /// Coarse cells re-sampled at full density (adaptive only).
    pub refined_cells: usize,
}

/// A way of turning a grid spec and a probe into a sample grid.
///
/// Every strategy produces the same contract: N² samples at the
/// pixel-center coordinates of `spec`, in row-major order.
pub trait SamplingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn sample(&self, spec: &GridSpec, probe: &dyn WorldProbe) -> Result<SamplingOutcome>;
}

/// One probe per pixel center.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformSampler;

impl SamplingStrategy for UniformSampler {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn sample(&self, spec: &GridSpec, probe: &dyn WorldProbe) -> Result<SamplingOutcome> {
        let n = spec.resolution;
        let rows: Vec<Vec<Sample>> = (0..n)
            .into_par_iter()
            .map(|z| {
                let world_z = spec.coordinate(z);
                (0..n)
                    .map(|x| {
                        let world_x = spec.coordinate(x);
                        let value = probe.probe(world_x, world_z);
                        Sample {
                            world_x,
                            world_z,
                            biome_id: value.biome_id,
                            height: value.height,
                        }
                    })
                    .collect()
            })
            .collect();

        let probes = spec.sample_count();
        METRICS.add_probes(probes as u64);
        let grid = SampleGrid::from_samples(*spec, rows.into_iter().flatten().collect())?;
        Ok(SamplingOutcome {
            grid,
            probes,
            refined_cells: 0,
        })
    }
}

/// Sampling coordinates handed to the collaborator before launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingPlan {
    pub rule: String,
    pub resolution: usize,
    pub world_radius: f64,
    pub step: f64,
    /// Coordinate of index 0 on either axis.
    pub first_coordinate: f64,
    /// Coordinate of index N-1 on either axis.
    pub last_coordinate: f64,
}

impl SamplingPlan {
    pub fn for_spec(spec: &GridSpec) -> Self {
        Self {
            rule: PIXEL_CENTER_RULE.to_string(),
            resolution: spec.resolution,
            world_radius: spec.world_radius,
            step: spec.step(),
            first_coordinate: spec.coordinate(0),
            last_coordinate: spec.coordinate(spec.resolution - 1),
        }
    }
}
