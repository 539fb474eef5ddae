//! Adaptive multi-resolution sampling.
//!
//! A coarse pass probes one point per `f × f` block. Blocks whose category
//! disagrees with their 8-connected neighbours sit on a classification
//! boundary and are re-sampled at every fine pixel center; interior blocks
//! reuse the coarse value. The probe budget is `ceil(multiplier × N²)`, so
//! what the coarse pass saves in uniform regions pays for boundary detail.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{GridSpec, ProbeValue, Sample, SampleGrid, SamplingOutcome, SamplingStrategy, WorldProbe};
use crate::error::{PipelineError, Result};
use crate::metrics::METRICS;

/// Tuning for [`AdaptiveSampler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Linear subdivision between coarse and fine grids (block edge length).
    pub refinement_factor: usize,
    /// Neighbour disagreement (0..=1) above which a block is refined.
    pub variance_threshold: f64,
    /// Probe budget relative to the uniform pass (N² probes).
    pub budget_multiplier: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            refinement_factor: 4,
            variance_threshold: 0.0,
            budget_multiplier: 1.0,
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.refinement_factor < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "refinement_factor must be at least 2, got {}",
                self.refinement_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.variance_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "variance_threshold must be within [0, 1], got {}",
                self.variance_threshold
            )));
        }
        if !self.budget_multiplier.is_finite() || self.budget_multiplier <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "budget_multiplier must be positive, got {}",
                self.budget_multiplier
            )));
        }
        Ok(())
    }
}

/// Coarse-then-refine sampler.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveSampler {
    config: AdaptiveConfig,
}

impl AdaptiveSampler {
    pub fn new(config: AdaptiveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }
}

/// Fine index range `[lo, hi)` covered by coarse index `c`.
fn block_range(c: usize, factor: usize, n: usize) -> (usize, usize) {
    let lo = c * factor;
    (lo, ((c + 1) * factor).min(n))
}

/// Fraction of in-bounds 8-connected neighbours whose category differs.
fn disagreement(coarse: &[ProbeValue], n0: usize, cx: usize, cz: usize) -> f64 {
    let center = coarse[cz * n0 + cx].biome_id;
    let mut total = 0u32;
    let mut differing = 0u32;
    for dz in -1i64..=1 {
        for dx in -1i64..=1 {
            if dx == 0 && dz == 0 {
                continue;
            }
            let nx = cx as i64 + dx;
            let nz = cz as i64 + dz;
            if nx < 0 || nz < 0 || nx >= n0 as i64 || nz >= n0 as i64 {
                continue;
            }
            total += 1;
            if coarse[nz as usize * n0 + nx as usize].biome_id != center {
                differing += 1;
            }
        }
    }
    if total == 0 {
        0.0
    } else {
        f64::from(differing) / f64::from(total)
    }
}

impl SamplingStrategy for AdaptiveSampler {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn sample(&self, spec: &GridSpec, probe: &dyn WorldProbe) -> Result<SamplingOutcome> {
        let n = spec.resolution;
        let factor = self.config.refinement_factor;
        let n0 = n.div_ceil(factor);

        // Coarse pass: one probe at the world-space center of each block.
        let coarse: Vec<ProbeValue> = (0..n0)
            .into_par_iter()
            .flat_map_iter(|cz| {
                let (z_lo, z_hi) = block_range(cz, factor, n);
                let world_z = (spec.coordinate(z_lo) + spec.coordinate(z_hi - 1)) / 2.0;
                (0..n0).map(move |cx| {
                    let (x_lo, x_hi) = block_range(cx, factor, n);
                    let world_x = (spec.coordinate(x_lo) + spec.coordinate(x_hi - 1)) / 2.0;
                    probe.probe(world_x, world_z)
                })
            })
            .collect();
        let mut probes = n0 * n0;

        let mut candidates: Vec<(usize, f64)> = (0..n0 * n0)
            .map(|idx| (idx, disagreement(&coarse, n0, idx % n0, idx / n0)))
            .filter(|(_, d)| *d > self.config.variance_threshold)
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let budget = (self.config.budget_multiplier * spec.sample_count() as f64).ceil() as usize;
        let mut remaining = budget.saturating_sub(probes);
        let mut refined = vec![false; n0 * n0];
        let mut refined_cells = 0;
        for (idx, _) in candidates {
            let (x_lo, x_hi) = block_range(idx % n0, factor, n);
            let (z_lo, z_hi) = block_range(idx / n0, factor, n);
            let cost = (x_hi - x_lo) * (z_hi - z_lo);
            if cost > remaining {
                continue;
            }
            remaining -= cost;
            probes += cost;
            refined[idx] = true;
            refined_cells += 1;
        }

        let rows: Vec<Vec<Sample>> = (0..n)
            .into_par_iter()
            .map(|z| {
                let world_z = spec.coordinate(z);
                let cz = z / factor;
                (0..n)
                    .map(|x| {
                        let world_x = spec.coordinate(x);
                        let cell = cz * n0 + x / factor;
                        let value = if refined[cell] {
                            probe.probe(world_x, world_z)
                        } else {
                            coarse[cell]
                        };
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

        METRICS.add_probes(probes as u64);
        tracing::debug!(
            strategy = "adaptive",
            resolution = n,
            coarse_resolution = n0,
            refined_cells,
            probes,
            budget,
            "adaptive sampling finished"
        );

        let grid = SampleGrid::from_samples(*spec, rows.into_iter().flatten().collect())?;
        Ok(SamplingOutcome {
            grid,
            probes,
            refined_cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::UniformSampler;

    fn half_plane(x: f64, _z: f64) -> ProbeValue {
        ProbeValue {
            biome_id: if x < 130.0 { 1 } else { 32 },
            height: if x < 130.0 { 50.0 } else { 10.0 },
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(AdaptiveConfig::default().validate().is_ok());
        let bad = AdaptiveConfig {
            refinement_factor: 1,
            ..AdaptiveConfig::default()
        };
        assert!(AdaptiveSampler::new(bad).is_err());
        let bad = AdaptiveConfig {
            budget_multiplier: 0.0,
            ..AdaptiveConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_uniform_world_needs_only_coarse_probes() {
        let spec = GridSpec::new(1000.0, 16).unwrap();
        let sampler = AdaptiveSampler::default();
        let outcome = sampler
            .sample(&spec, &|_x: f64, _z: f64| ProbeValue {
                biome_id: 8,
                height: 12.0,
            })
            .unwrap();
        assert_eq!(outcome.probes, 16);
        assert_eq!(outcome.refined_cells, 0);
        assert!(outcome.grid.samples().iter().all(|s| s.biome_id == 8));
    }

    #[test]
    fn test_boundary_blocks_match_uniform_sampling() {
        let spec = GridSpec::new(1000.0, 32).unwrap();
        let sampler = AdaptiveSampler::default();
        let adaptive = sampler.sample(&spec, &half_plane).unwrap();
        let uniform = UniformSampler.sample(&spec, &half_plane).unwrap();

        assert!(adaptive.refined_cells > 0);
        assert!(adaptive.probes <= spec.sample_count());
        assert_eq!(adaptive.grid.samples(), uniform.grid.samples());
    }

    #[test]
    fn test_budget_caps_refinement() {
        let spec = GridSpec::new(1000.0, 32).unwrap();
        let config = AdaptiveConfig {
            budget_multiplier: 0.1,
            ..AdaptiveConfig::default()
        };
        let outcome = AdaptiveSampler::new(config)
            .unwrap()
            .sample(&spec, &half_plane)
            .unwrap();
        let budget = (0.1 * 1024.0f64).ceil() as usize;
        assert!(outcome.probes <= budget);
        assert_eq!(outcome.grid.samples().len(), 1024);
    }

    #[test]
    fn test_non_divisible_resolution_keeps_shape() {
        let spec = GridSpec::new(1000.0, 10).unwrap();
        let outcome = AdaptiveSampler::default().sample(&spec, &half_plane).unwrap();
        assert_eq!(outcome.grid.samples().len(), 100);
        let last = outcome.grid.get(9, 9).unwrap();
        assert_eq!(last.world_x, spec.coordinate(9));
    }
}
