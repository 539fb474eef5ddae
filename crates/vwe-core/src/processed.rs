//! Processed-stage documents and their writer.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::sampling::PIXEL_CENTER_RULE;
use crate::transform::{HeightStats, LayeredRaster, ValidationReport};

pub const BIOMES_FILE: &str = "biomes.json";
pub const HEIGHTMAP_FILE: &str = "heightmap.json";
pub const REPORT_FILE: &str = "validation_report.json";
pub const METADATA_FILE: &str = "metadata.json";

pub fn required_files() -> Vec<String> {
    [BIOMES_FILE, HEIGHTMAP_FILE, REPORT_FILE, METADATA_FILE]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiomeMetadata {
    pub sample_spacing_meters: f64,
    pub biome_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiomeDocument {
    pub resolution: usize,
    pub world_radius: f64,
    pub world_diameter: f64,
    pub biome_map: Vec<Vec<u32>>,
    pub metadata: BiomeMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeightMetadata {
    pub min_height: f32,
    pub max_height: f32,
    pub sample_spacing_meters: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeightDocument {
    pub resolution: usize,
    pub world_radius: f64,
    pub world_diameter: f64,
    pub heightmap: Vec<Vec<f32>>,
    pub metadata: HeightMetadata,
}

/// Provenance of a processed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub seed: String,
    pub seed_hash: String,
    pub resolution: usize,
    pub source_resolution: usize,
    pub world_radius: f64,
    pub sampling_rule: String,
    pub sampling_strategy: String,
    pub probes: usize,
    pub refined_cells: usize,
    pub height: HeightStats,
}

impl RunMetadata {
    pub fn new(seed: &str, seed_hash: &str, raster: &LayeredRaster, strategy: &str) -> Self {
        Self {
            seed: seed.to_string(),
            seed_hash: seed_hash.to_string(),
            resolution: raster.resolution,
            source_resolution: raster.resolution,
            world_radius: raster.world_radius,
            sampling_rule: PIXEL_CENTER_RULE.to_string(),
            sampling_strategy: strategy.to_string(),
            probes: 0,
            refined_cells: 0,
            height: raster.height_stats(),
        }
    }
}

impl BiomeDocument {
    pub fn from_raster(raster: &LayeredRaster) -> Self {
        Self {
            resolution: raster.resolution,
            world_radius: raster.world_radius,
            world_diameter: raster.world_diameter,
            biome_map: raster.biome_layer.clone(),
            metadata: BiomeMetadata {
                sample_spacing_meters: raster.sample_spacing_meters,
                biome_counts: raster.biome_counts(),
            },
        }
    }
}

impl HeightDocument {
    pub fn from_raster(raster: &LayeredRaster) -> Self {
        let stats = raster.height_stats();
        Self {
            resolution: raster.resolution,
            world_radius: raster.world_radius,
            world_diameter: raster.world_diameter,
            heightmap: raster.height_layer.clone(),
            metadata: HeightMetadata {
                min_height: stats.min,
                max_height: stats.max,
                sample_spacing_meters: raster.sample_spacing_meters,
            },
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

/// Write every processed document into `dir`.
pub fn write_processed(
    dir: &Path,
    raster: &LayeredRaster,
    report: &ValidationReport,
    metadata: &RunMetadata,
) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_json(&dir.join(BIOMES_FILE), &BiomeDocument::from_raster(raster))?;
    write_json(&dir.join(HEIGHTMAP_FILE), &HeightDocument::from_raster(raster))?;
    write_json(&dir.join(REPORT_FILE), report)?;
    write_json(&dir.join(METADATA_FILE), metadata)?;
    Ok(())
}

fn check_square<T>(path: &Path, name: &str, layer: &[Vec<T>], resolution: usize) -> Result<()> {
    if layer.len() != resolution {
        return Err(PipelineError::corrupt(
            path,
            format!("{name} has {} rows, expected {resolution}", layer.len()),
        ));
    }
    if let Some((z, row)) = layer.iter().enumerate().find(|(_, row)| row.len() != resolution) {
        return Err(PipelineError::corrupt(
            path,
            format!("{name} row {z} has {} cells, expected {resolution}", row.len()),
        ));
    }
    Ok(())
}

/// Read the processed layers back into a raster. Both layers must be
/// `resolution`×`resolution` with a positive, matching resolution.
pub fn load_processed(dir: &Path) -> Result<LayeredRaster> {
    let biomes_path = dir.join(BIOMES_FILE);
    let heights_path = dir.join(HEIGHTMAP_FILE);
    let biomes: BiomeDocument = serde_json::from_slice(&fs::read(&biomes_path)?)?;
    let heights: HeightDocument = serde_json::from_slice(&fs::read(&heights_path)?)?;

    if biomes.resolution == 0 {
        return Err(PipelineError::corrupt(&biomes_path, "resolution is zero"));
    }
    if heights.resolution != biomes.resolution {
        return Err(PipelineError::corrupt(
            &heights_path,
            format!(
                "resolution {} disagrees with biomes.json ({})",
                heights.resolution, biomes.resolution
            ),
        ));
    }
    check_square(&biomes_path, "biome_map", &biomes.biome_map, biomes.resolution)?;
    check_square(&heights_path, "heightmap", &heights.heightmap, biomes.resolution)?;

    Ok(LayeredRaster {
        resolution: biomes.resolution,
        world_radius: biomes.world_radius,
        world_diameter: biomes.world_diameter,
        sample_spacing_meters: biomes.metadata.sample_spacing_meters,
        biome_layer: biomes.biome_map,
        height_layer: heights.heightmap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{GridSpec, ProbeValue, SamplingStrategy, UniformSampler};
    use crate::transform::{transform, ReferenceDistribution, ValidationConfig};

    fn written(dir: &Path) -> LayeredRaster {
        let spec = GridSpec::new(1000.0, 4).unwrap();
        let grid = UniformSampler
            .sample(&spec, &|x: f64, _z: f64| ProbeValue {
                biome_id: 1,
                height: x as f32,
            })
            .unwrap()
            .grid;
        let (raster, report) = transform(
            &grid,
            &ReferenceDistribution::default(),
            &ValidationConfig::default(),
        );
        let metadata = RunMetadata::new("s", "h", &raster, "uniform");
        write_processed(dir, &raster, &report, &metadata).unwrap();
        raster
    }

    fn rewrite(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        edit(&mut doc);
        fs::write(path, serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    #[test]
    fn test_ragged_layer_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        written(dir.path());
        rewrite(&dir.path().join(BIOMES_FILE), |doc| {
            doc["biome_map"][2] = serde_json::json!([1, 1]);
        });

        match load_processed(dir.path()).unwrap_err() {
            PipelineError::CorruptArtifact { path, reason } => {
                assert!(path.ends_with(BIOMES_FILE));
                assert!(reason.contains("row 2"), "{reason}");
            }
            other => panic!("expected CorruptArtifact, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_resolution_and_short_heightmap_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        written(dir.path());
        rewrite(&dir.path().join(HEIGHTMAP_FILE), |doc| {
            doc["heightmap"].as_array_mut().unwrap().pop();
        });
        assert!(matches!(
            load_processed(dir.path()),
            Err(PipelineError::CorruptArtifact { .. })
        ));

        rewrite(&dir.path().join(BIOMES_FILE), |doc| {
            doc["resolution"] = serde_json::json!(0);
            doc["biome_map"] = serde_json::json!([]);
        });
        assert!(matches!(
            load_processed(dir.path()),
            Err(PipelineError::CorruptArtifact { .. })
        ));
    }

    #[test]
    fn test_write_then_load_processed() {
        let spec = GridSpec::new(1000.0, 4).unwrap();
        let grid = UniformSampler
            .sample(&spec, &|x: f64, _z: f64| ProbeValue {
                biome_id: if x < 0.0 { 1 } else { 32 },
                height: x as f32,
            })
            .unwrap()
            .grid;
        let (raster, report) = transform(
            &grid,
            &ReferenceDistribution::default(),
            &ValidationConfig::default(),
        );
        let metadata = RunMetadata::new("s", "h", &raster, "uniform");

        let dir = tempfile::tempdir().unwrap();
        write_processed(dir.path(), &raster, &report, &metadata).unwrap();
        for name in required_files() {
            assert!(dir.path().join(name).is_file());
        }

        let doc: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.path().join(BIOMES_FILE)).unwrap()).unwrap();
        assert_eq!(doc["metadata"]["biome_counts"]["Ocean"], 8);
        assert_eq!(doc["world_diameter"], 2000.0);

        assert_eq!(load_processed(dir.path()).unwrap(), raster);
    }
}
