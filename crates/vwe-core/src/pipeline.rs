//! Post-export stages: extracted dump to processed layers to renders.
//!
//! These steps are synchronous and CPU-bound; async callers run them on the
//! blocking pool and stop them through a shared cancel flag.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{PipelineConfig, StrategyKind};
use crate::error::{PipelineError, Result};
use crate::extract::load_extracted;
use crate::layout::SeedLayout;
use crate::manifest::{ArtifactManifest, Stage};
use crate::obs;
use crate::processed::{self, RunMetadata};
use crate::render::{self, Renderer};
use crate::sampling::{RasterProbe, SamplingOutcome};
use crate::transform::{transform, LayeredRaster, ValidationReport};

/// Output of [`process`].
#[derive(Debug, Clone)]
pub struct Processed {
    pub raster: LayeredRaster,
    pub report: ValidationReport,
    pub metadata: RunMetadata,
}

/// Load the extracted dump, resample it when needed, and transform it.
///
/// The dump is resampled through the configured strategy when its
/// resolution differs from the configured one or the adaptive strategy is
/// selected; otherwise it is used as-is.
pub fn process(layout: &SeedLayout, seed: &str, config: &PipelineConfig) -> Result<Processed> {
    let source = load_extracted(&layout.extracted(), config.world.radius)?;
    let source_resolution = source.resolution();
    let spec = config.grid_spec()?;
    let strategy = config.sampling.build_strategy()?;

    let resample = source_resolution != spec.resolution
        || config.sampling.strategy == StrategyKind::Adaptive;
    let outcome = if resample {
        let probe = RasterProbe::new(source);
        strategy.sample(&spec, &probe)?
    } else {
        SamplingOutcome {
            probes: source.samples().len(),
            refined_cells: 0,
            grid: source,
        }
    };

    let (raster, report) = transform(&outcome.grid, &config.reference, &config.validation);
    let mut metadata = RunMetadata::new(seed, layout.seed_hash(), &raster, strategy.name());
    metadata.source_resolution = source_resolution;
    metadata.probes = outcome.probes;
    metadata.refined_cells = outcome.refined_cells;

    obs::emit_validation_completed(
        report.status.as_str(),
        report.aggregate_error,
        report.failed_checks(),
    );
    Ok(Processed {
        raster,
        report,
        metadata,
    })
}

fn check_cancel(cancel: &AtomicBool, next: Stage) -> Result<()> {
    if cancel.load(Ordering::Acquire) {
        return Err(PipelineError::Cancelled(next));
    }
    Ok(())
}

/// Run every post-export stage against a manifest whose extracted stage is
/// sealed. `cancel` is checked before each stage and before each seal; once
/// set, nothing further is written or sealed.
pub fn run_post_export(
    manifest: &mut ArtifactManifest,
    layout: &SeedLayout,
    seed: &str,
    config: &PipelineConfig,
    cancel: &AtomicBool,
) -> Result<Processed> {
    check_cancel(cancel, Stage::Processed)?;
    let out = process(layout, seed, config)?;

    check_cancel(cancel, Stage::Processed)?;
    let dir = manifest.writable_dir(Stage::Processed)?;
    processed::write_processed(&dir, &out.raster, &out.report, &out.metadata)?;
    check_cancel(cancel, Stage::Processed)?;
    manifest.seal(Stage::Processed, &processed::required_files())?;

    check_cancel(cancel, Stage::Renders)?;
    let dir = manifest.writable_dir(Stage::Renders)?;
    let required = if config.render.enabled {
        Renderer::new(&out.raster, config.render).write_all(&dir)?;
        render::required_files()
    } else {
        Vec::new()
    };
    check_cancel(cancel, Stage::Renders)?;
    manifest.seal(Stage::Renders, &required)?;
    Ok(out)
}
