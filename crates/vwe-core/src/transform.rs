//! Transform and validation: sample grid to layered raster plus a
//! distribution report against a reference.
//!
//! [`transform`] is pure. Maps are `BTreeMap`s and the report carries no
//! timestamps, so identical inputs serialize to identical bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::biome::Biome;
use crate::error::{PipelineError, Result};
use crate::sampling::SampleGrid;

/// Name of the optional aggregate check.
pub const AGGREGATE_CHECK: &str = "aggregate_error";

/// Canonical N×N layers, indexed `[z][x]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayeredRaster {
    pub resolution: usize,
    pub world_radius: f64,
    pub world_diameter: f64,
    pub sample_spacing_meters: f64,
    pub biome_layer: Vec<Vec<u32>>,
    pub height_layer: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightStats {
    pub min: f32,
    pub max: f32,
    pub mean: f64,
}

impl LayeredRaster {
    pub fn from_grid(grid: &SampleGrid) -> Self {
        let spec = grid.spec();
        let biome_layer = grid
            .rows()
            .map(|row| row.iter().map(|s| s.biome_id).collect())
            .collect();
        let height_layer = grid
            .rows()
            .map(|row| row.iter().map(|s| s.height).collect())
            .collect();
        Self {
            resolution: spec.resolution,
            world_radius: spec.world_radius,
            world_diameter: spec.world_diameter(),
            sample_spacing_meters: spec.step(),
            biome_layer,
            height_layer,
        }
    }

    /// Sample counts per category name; unknown ids fold into `Unclassified`.
    pub fn biome_counts(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for id in self.biome_layer.iter().flatten() {
            *counts
                .entry(Biome::from_id(*id).name().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    pub fn height_stats(&self) -> HeightStats {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        let mut n = 0usize;
        for h in self.height_layer.iter().flatten() {
            min = min.min(*h);
            max = max.max(*h);
            sum += f64::from(*h);
            n += 1;
        }
        if n == 0 {
            return HeightStats {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        HeightStats {
            min,
            max,
            mean: sum / n as f64,
        }
    }
}

/// Expected percentage per category name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceDistribution(BTreeMap<String, f64>);

impl Default for ReferenceDistribution {
    /// Distribution measured on the reference seed.
    fn default() -> Self {
        let pairs = [
            ("Ocean", 30.0),
            ("DeepNorth", 15.0),
            ("Meadows", 12.0),
            ("BlackForest", 10.0),
            ("Plains", 10.0),
            ("Mountain", 8.0),
            ("Swamp", 7.0),
            ("Mistlands", 5.0),
            ("Ashlands", 3.0),
        ];
        Self(
            pairs
                .into_iter()
                .map(|(name, pct)| (name.to_string(), pct))
                .collect(),
        )
    }
}

impl ReferenceDistribution {
    pub fn new(percentages: BTreeMap<String, f64>) -> Result<Self> {
        let dist = Self(percentages);
        dist.validate()?;
        Ok(dist)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, pct) in &self.0 {
            if !pct.is_finite() || *pct < 0.0 || *pct > 100.0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "reference percentage for {name} must be within [0, 100], got {pct}"
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Tolerance bands in percentage points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// `|delta| <= tolerance` passes.
    pub tolerance: f64,
    /// `|delta| <= warning` warns; beyond it fails.
    pub warning: f64,
    /// Aggregate error above this warns (check omitted when unset).
    pub aggregate_warning: Option<f64>,
    /// Aggregate error above this fails (check omitted when unset).
    pub aggregate_failure: Option<f64>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            tolerance: 5.0,
            warning: 10.0,
            aggregate_warning: None,
            aggregate_failure: None,
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }
        if !self.warning.is_finite() || self.warning < self.tolerance {
            return Err(PipelineError::InvalidConfig(format!(
                "warning band {} must be at least the tolerance {}",
                self.warning, self.tolerance
            )));
        }
        if let (Some(warn), Some(fail)) = (self.aggregate_warning, self.aggregate_failure) {
            if warn > fail {
                return Err(PipelineError::InvalidConfig(format!(
                    "aggregate_warning {warn} exceeds aggregate_failure {fail}"
                )));
            }
        }
        Ok(())
    }

    fn classify(&self, delta: f64) -> CheckStatus {
        let abs = delta.abs();
        if abs <= self.tolerance {
            CheckStatus::Passed
        } else if abs <= self.warning {
            CheckStatus::Warning
        } else {
            CheckStatus::Failed
        }
    }

    fn has_aggregate_check(&self) -> bool {
        self.aggregate_warning.is_some() || self.aggregate_failure.is_some()
    }

    fn classify_aggregate(&self, aggregate: f64) -> CheckStatus {
        if self.aggregate_failure.is_some_and(|t| aggregate > t) {
            CheckStatus::Failed
        } else if self.aggregate_warning.is_some_and(|t| aggregate > t) {
            CheckStatus::Warning
        } else {
            CheckStatus::Passed
        }
    }
}

/// Ordered from best to worst, so the overall status is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Passed => "passed",
            CheckStatus::Warning => "warning",
            CheckStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub expected: f64,
    pub actual: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub status: CheckStatus,
    pub aggregate_error: f64,
    pub checks: Vec<Check>,
    pub total_samples: u64,
    pub unclassified_count: u64,
    pub counts: BTreeMap<String, u64>,
    pub observed: BTreeMap<String, f64>,
    pub bands: ValidationConfig,
}

impl ValidationReport {
    pub fn failed_checks(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Failed)
            .count()
    }

    pub fn check(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// Build the layered raster and validate its category distribution.
pub fn transform(
    grid: &SampleGrid,
    reference: &ReferenceDistribution,
    config: &ValidationConfig,
) -> (LayeredRaster, ValidationReport) {
    let raster = LayeredRaster::from_grid(grid);
    let report = validate_distribution(&raster, reference, config);
    (raster, report)
}

pub fn validate_distribution(
    raster: &LayeredRaster,
    reference: &ReferenceDistribution,
    config: &ValidationConfig,
) -> ValidationReport {
    let counts = raster.biome_counts();
    let total = (raster.resolution * raster.resolution) as u64;
    let percent = |count: u64| {
        if total == 0 {
            0.0
        } else {
            count as f64 * 100.0 / total as f64
        }
    };
    let observed: BTreeMap<String, f64> = counts
        .iter()
        .map(|(name, count)| (name.clone(), percent(*count)))
        .collect();

    let mut checks: Vec<Check> = reference
        .iter()
        .map(|(name, expected)| {
            let actual = observed.get(name).copied().unwrap_or(0.0);
            let delta = actual - expected;
            Check {
                name: name.to_string(),
                status: config.classify(delta),
                expected,
                actual,
                delta,
            }
        })
        .collect();

    let unreferenced: f64 = observed
        .iter()
        .filter(|(name, _)| reference.get(name).is_none())
        .map(|(_, pct)| pct.abs())
        .sum();
    let aggregate_error = checks.iter().map(|c| c.delta.abs()).sum::<f64>() + unreferenced;

    if config.has_aggregate_check() {
        checks.push(Check {
            name: AGGREGATE_CHECK.to_string(),
            status: config.classify_aggregate(aggregate_error),
            expected: 0.0,
            actual: aggregate_error,
            delta: aggregate_error,
        });
    }

    let status = checks
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(CheckStatus::Passed);

    ValidationReport {
        status,
        aggregate_error,
        checks,
        total_samples: total,
        unclassified_count: counts.get(crate::biome::UNCLASSIFIED).copied().unwrap_or(0),
        counts,
        observed,
        bands: *config,
    }
}
