//! PNG encodings of the processed layers.
//!
//! Image row `y` is layer row `z`, column `x` is layer column `x`. Every
//! image is derived from the raster alone, so rendering is repeatable.

use std::path::Path;

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use crate::biome::Biome;
use crate::error::{PipelineError, Result};
use crate::transform::LayeredRaster;

pub const BIOMES_PNG: &str = "biomes.png";
pub const HEIGHTMAP_PNG: &str = "heightmap.png";
pub const WATER_MASK_PNG: &str = "water_mask.png";
pub const COMPOSITE_PNG: &str = "composite.png";

const DEEP_WATER: [u8; 3] = [0, 0, 139];
const ASH_WATER: [u8; 3] = [200, 80, 40];
const SHALLOW_WATER: [u8; 3] = [120, 180, 220];
const LAND: [u8; 3] = [0, 200, 0];

pub fn required_files() -> Vec<String> {
    [BIOMES_PNG, HEIGHTMAP_PNG, WATER_MASK_PNG, COMPOSITE_PNG]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub enabled: bool,
    /// Output edge length in pixels; defaults to the raster resolution.
    pub target_resolution: Option<u32>,
    /// Heightmap weight in the composite, 0 = biomes only.
    pub opacity: f32,
    /// Heights strictly below this are water.
    pub water_level: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_resolution: None,
            opacity: 0.5,
            water_level: 30.0,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(PipelineError::InvalidConfig(format!(
                "render opacity must be within [0, 1], got {}",
                self.opacity
            )));
        }
        if self.target_resolution == Some(0) {
            return Err(PipelineError::InvalidConfig(
                "render target_resolution must be positive".to_string(),
            ));
        }
        if !self.water_level.is_finite() {
            return Err(PipelineError::InvalidConfig(
                "render water_level must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Renders a raster at a fixed output size.
pub struct Renderer<'a> {
    raster: &'a LayeredRaster,
    config: RenderConfig,
    size: u32,
}

impl<'a> Renderer<'a> {
    pub fn new(raster: &'a LayeredRaster, config: RenderConfig) -> Self {
        let size = config
            .target_resolution
            .unwrap_or(raster.resolution as u32)
            .max(1);
        Self {
            raster,
            config,
            size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Nearest source cell for output pixel `p`.
    fn source(&self, p: u32) -> usize {
        let n = self.raster.resolution;
        ((p as usize * n) / self.size as usize).min(n.saturating_sub(1))
    }

    fn cell(&self, px: u32, py: u32) -> (u32, f32) {
        let x = self.source(px);
        let z = self.source(py);
        (self.raster.biome_layer[z][x], self.raster.height_layer[z][x])
    }

    pub fn biomes(&self) -> RgbImage {
        ImageBuffer::from_fn(self.size, self.size, |px, py| {
            let (id, _) = self.cell(px, py);
            Rgb(Biome::from_id(id).color())
        })
    }

    /// Min-max normalized grayscale; a flat map renders black.
    pub fn heightmap(&self) -> GrayImage {
        let stats = self.raster.height_stats();
        let range = stats.max - stats.min;
        ImageBuffer::from_fn(self.size, self.size, |px, py| {
            let (_, h) = self.cell(px, py);
            let v = if range > 0.0 {
                ((h - stats.min) / range * 255.0).round() as u8
            } else {
                0
            };
            Luma([v])
        })
    }

    pub fn water_mask(&self) -> RgbImage {
        ImageBuffer::from_fn(self.size, self.size, |px, py| {
            let (id, h) = self.cell(px, py);
            let color = if h < self.config.water_level {
                match Biome::from_id(id) {
                    Biome::Ocean => DEEP_WATER,
                    Biome::Ashlands => ASH_WATER,
                    _ => SHALLOW_WATER,
                }
            } else {
                LAND
            };
            Rgb(color)
        })
    }

    /// Biome map blended with the heightmap: `biome * (1 - a) + height * a`.
    pub fn composite(&self) -> RgbImage {
        let biomes = self.biomes();
        let heights = self.heightmap();
        let a = self.config.opacity;
        ImageBuffer::from_fn(self.size, self.size, |px, py| {
            let Rgb(c) = *biomes.get_pixel(px, py);
            let Luma([g]) = *heights.get_pixel(px, py);
            let blend = |ch: u8| (f32::from(ch) * (1.0 - a) + f32::from(g) * a).round() as u8;
            Rgb([blend(c[0]), blend(c[1]), blend(c[2])])
        })
    }

    /// Write all four images into `dir`.
    pub fn write_all(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.biomes().save(dir.join(BIOMES_PNG))?;
        self.heightmap().save(dir.join(HEIGHTMAP_PNG))?;
        self.water_mask().save(dir.join(WATER_MASK_PNG))?;
        self.composite().save(dir.join(COMPOSITE_PNG))?;
        tracing::debug!(size = self.size, dir = %dir.display(), "renders written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster() -> LayeredRaster {
        LayeredRaster {
            resolution: 2,
            world_radius: 100.0,
            world_diameter: 200.0,
            sample_spacing_meters: 100.0,
            biome_layer: vec![vec![32, 512], vec![1, 999]],
            height_layer: vec![vec![0.0, 10.0], vec![50.0, 100.0]],
        }
    }

    #[test]
    fn test_biome_colors_and_unknown_grey() {
        let r = raster();
        let img = Renderer::new(&r, RenderConfig::default()).biomes();
        assert_eq!(img.get_pixel(0, 0).0, Biome::Ocean.color());
        assert_eq!(img.get_pixel(1, 1).0, [128, 128, 128]);
    }

    #[test]
    fn test_heightmap_normalization() {
        let r = raster();
        let img = Renderer::new(&r, RenderConfig::default()).heightmap();
        assert_eq!(img.get_pixel(0, 0).0, [0]);
        assert_eq!(img.get_pixel(1, 1).0, [255]);

        let mut flat = raster();
        flat.height_layer = vec![vec![7.0; 2]; 2];
        let img = Renderer::new(&flat, RenderConfig::default()).heightmap();
        assert!(img.pixels().all(|p| p.0 == [0]));
    }

    #[test]
    fn test_water_mask_classes() {
        let r = raster();
        let img = Renderer::new(&r, RenderConfig::default()).water_mask();
        assert_eq!(img.get_pixel(0, 0).0, DEEP_WATER);
        assert_eq!(img.get_pixel(1, 0).0, ASH_WATER);
        assert_eq!(img.get_pixel(0, 1).0, LAND);
    }

    #[test]
    fn test_upscale_is_nearest_neighbour() {
        let r = raster();
        let config = RenderConfig {
            target_resolution: Some(8),
            ..RenderConfig::default()
        };
        let img = Renderer::new(&r, config).biomes();
        assert_eq!(img.dimensions(), (8, 8));
        assert_eq!(img.get_pixel(3, 3).0, Biome::Ocean.color());
        assert_eq!(img.get_pixel(4, 3).0, Biome::Ashlands.color());
        assert_eq!(img.get_pixel(3, 4).0, Biome::Meadows.color());
    }

    #[test]
    fn test_composite_opacity_extremes() {
        let r = raster();
        let none = RenderConfig {
            opacity: 0.0,
            ..RenderConfig::default()
        };
        let renderer = Renderer::new(&r, none);
        assert_eq!(renderer.composite(), renderer.biomes());

        let full = RenderConfig {
            opacity: 1.0,
            ..RenderConfig::default()
        };
        let img = Renderer::new(&r, full).composite();
        assert_eq!(img.get_pixel(1, 1).0, [255, 255, 255]);
    }

    #[test]
    fn test_write_all_produces_pngs() {
        let r = raster();
        let dir = tempfile::tempdir().unwrap();
        Renderer::new(&r, RenderConfig::default())
            .write_all(dir.path())
            .unwrap();
        for name in required_files() {
            let bytes = std::fs::read(dir.path().join(&name)).unwrap();
            assert_eq!(&bytes[1..4], b"PNG", "{name}");
        }
    }

    #[test]
    fn test_config_rejects_bad_opacity() {
        let bad = RenderConfig {
            opacity: 1.5,
            ..RenderConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
