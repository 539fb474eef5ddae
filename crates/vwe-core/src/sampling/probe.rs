//! Probe backed by an already-extracted sample grid.

use super::{ProbeValue, SampleGrid, WorldProbe};

/// Nearest-cell lookup into an extracted grid.
///
/// Lets the sampling strategies resample a collaborator dump at another
/// resolution, or refine it adaptively, without talking to the collaborator.
#[derive(Debug, Clone)]
pub struct RasterProbe {
    grid: SampleGrid,
}

impl RasterProbe {
    pub fn new(grid: SampleGrid) -> Self {
        Self { grid }
    }

    fn index(&self, world: f64) -> usize {
        let spec = self.grid.spec();
        let n = spec.resolution;
        let cell = ((world + spec.world_radius) / spec.step()).floor();
        if cell <= 0.0 {
            0
        } else {
            (cell as usize).min(n - 1)
        }
    }
}

impl WorldProbe for RasterProbe {
    fn probe(&self, world_x: f64, world_z: f64) -> ProbeValue {
        let n = self.grid.resolution();
        let sample = self.grid.samples()[self.index(world_z) * n + self.index(world_x)];
        ProbeValue {
            biome_id: sample.biome_id,
            height: sample.height,
        }
    }
}
