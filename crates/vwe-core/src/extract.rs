//! Parsing of the collaborator's export dump into a [`SampleGrid`].

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::manifest::Stage;
use crate::sampling::{GridSpec, Sample, SampleGrid};

pub const BIOMES_FILE: &str = "biomes.json";
pub const HEIGHTMAP_FILE: &str = "heightmap.json";

/// Files the extracted stage requires.
pub fn required_files() -> Vec<String> {
    vec![BIOMES_FILE.to_string(), HEIGHTMAP_FILE.to_string()]
}

#[derive(Debug, Deserialize)]
struct BiomeDump {
    resolution: Option<usize>,
    world_radius: Option<f64>,
    biome_map: Option<Vec<Vec<u32>>>,
}

#[derive(Debug, Deserialize)]
struct HeightDump {
    resolution: Option<usize>,
    height_map: Option<Vec<Vec<f32>>>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| PipelineError::corrupt(path, e.to_string()))
}

fn check_square<T>(path: &Path, key: &str, rows: &[Vec<T>], resolution: usize) -> Result<()> {
    if rows.len() != resolution {
        return Err(PipelineError::corrupt(
            path,
            format!("{key} has {} rows, expected {resolution}", rows.len()),
        ));
    }
    if let Some((z, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != resolution) {
        return Err(PipelineError::corrupt(
            path,
            format!("{key} row {z} has {} columns, expected {resolution}", row.len()),
        ));
    }
    Ok(())
}

/// Load `biomes.json` and `heightmap.json` from `dir`.
///
/// `world_radius` is the configured radius; a dump declaring a different
/// one was sampled at other coordinates and is rejected.
pub fn load_extracted(dir: &Path, world_radius: f64) -> Result<SampleGrid> {
    let biome_path = dir.join(BIOMES_FILE);
    let height_path = dir.join(HEIGHTMAP_FILE);
    let missing: Vec<String> = [&biome_path, &height_path]
        .iter()
        .filter(|p| !p.is_file())
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::ArtifactMissing {
            stage: Stage::Extracted,
            missing,
        });
    }

    let biomes: BiomeDump = read_json(&biome_path)?;
    let heights: HeightDump = read_json(&height_path)?;

    let biome_map = biomes
        .biome_map
        .ok_or_else(|| PipelineError::corrupt(&biome_path, "missing key biome_map"))?;
    let height_map = heights
        .height_map
        .ok_or_else(|| PipelineError::corrupt(&height_path, "missing key height_map"))?;
    let resolution = biomes
        .resolution
        .ok_or_else(|| PipelineError::corrupt(&biome_path, "missing key resolution"))?;
    let height_resolution = heights
        .resolution
        .ok_or_else(|| PipelineError::corrupt(&height_path, "missing key resolution"))?;

    if height_resolution != resolution {
        return Err(PipelineError::corrupt(
            &height_path,
            format!("resolution {height_resolution} disagrees with biomes resolution {resolution}"),
        ));
    }
    if let Some(declared) = biomes.world_radius {
        if (declared - world_radius).abs() > 1e-6 {
            return Err(PipelineError::corrupt(
                &biome_path,
                format!("world_radius {declared} disagrees with configured {world_radius}"),
            ));
        }
    }
    check_square(&biome_path, "biome_map", &biome_map, resolution)?;
    check_square(&height_path, "height_map", &height_map, resolution)?;

    let spec = GridSpec::new(world_radius, resolution)
        .map_err(|e| PipelineError::corrupt(&biome_path, e.to_string()))?;

    let mut samples = Vec::with_capacity(spec.sample_count());
    for (z, (biome_row, height_row)) in biome_map.iter().zip(&height_map).enumerate() {
        let world_z = spec.coordinate(z);
        for (x, (biome_id, height)) in biome_row.iter().zip(height_row).enumerate() {
            if !height.is_finite() {
                return Err(PipelineError::corrupt(
                    &height_path,
                    format!("non-finite height at ({x}, {z})"),
                ));
            }
            samples.push(Sample {
                world_x: spec.coordinate(x),
                world_z,
                biome_id: *biome_id,
                height: *height,
            });
        }
    }
    SampleGrid::from_samples(spec, samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: serde_json::Value) {
        fs::write(dir.join(name), serde_json::to_vec(&value).unwrap()).unwrap();
    }

    #[test]
    fn test_load_valid_dump() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            BIOMES_FILE,
            json!({"resolution": 2, "world_radius": 100.0, "biome_map": [[1, 2], [32, 512]]}),
        );
        write(
            dir.path(),
            HEIGHTMAP_FILE,
            json!({"resolution": 2, "height_map": [[1.5, 2.0], [-3.0, 40.0]]}),
        );

        let grid = load_extracted(dir.path(), 100.0).unwrap();
        assert_eq!(grid.resolution(), 2);
        let s = grid.get(1, 1).unwrap();
        assert_eq!((s.biome_id, s.height), (512, 40.0));
        assert_eq!((s.world_x, s.world_z), (50.0, 50.0));
        assert_eq!(grid.get(0, 1).unwrap().biome_id, 32);
    }

    #[test]
    fn test_missing_files_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            BIOMES_FILE,
            json!({"resolution": 1, "biome_map": [[1]]}),
        );
        match load_extracted(dir.path(), 100.0) {
            Err(PipelineError::ArtifactMissing { missing, .. }) => {
                assert_eq!(missing, vec![HEIGHTMAP_FILE.to_string()]);
            }
            other => panic!("expected ArtifactMissing, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_shapes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            BIOMES_FILE,
            json!({"resolution": 2, "biome_map": [[1, 2], [4]]}),
        );
        write(
            dir.path(),
            HEIGHTMAP_FILE,
            json!({"resolution": 2, "height_map": [[0.0, 0.0], [0.0, 0.0]]}),
        );
        let err = load_extracted(dir.path(), 100.0).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptArtifact { .. }));
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn test_missing_key_and_bad_json_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), BIOMES_FILE, json!({"resolution": 1}));
        fs::write(dir.path().join(HEIGHTMAP_FILE), b"{not json").unwrap();
        assert!(matches!(
            load_extracted(dir.path(), 100.0),
            Err(PipelineError::CorruptArtifact { .. })
        ));

        write(dir.path(), HEIGHTMAP_FILE, json!({"resolution": 1, "height_map": [[0.0]]}));
        let err = load_extracted(dir.path(), 100.0).unwrap_err();
        assert!(err.to_string().contains("biome_map"));
    }

    #[test]
    fn test_resolution_disagreement_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), BIOMES_FILE, json!({"resolution": 1, "biome_map": [[1]]}));
        write(
            dir.path(),
            HEIGHTMAP_FILE,
            json!({"resolution": 2, "height_map": [[0.0, 0.0], [0.0, 0.0]]}),
        );
        assert!(matches!(
            load_extracted(dir.path(), 100.0),
            Err(PipelineError::CorruptArtifact { .. })
        ));
    }
}
