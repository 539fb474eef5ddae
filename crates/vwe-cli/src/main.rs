//! VWE - Valheim World Engine CLI
//!
//! The `vwe` command drives the world generator and works with the data it
//! leaves behind.
//!
//! ## Commands
//!
//! - `run`: Generate a seed end to end and print the final job status
//! - `plan`: Print the sampling plan handed to the generator
//! - `process`: Re-run transform and validation on an extracted dump
//! - `render`: Re-render PNGs from processed layers
//! - `verify`: Check sealed artifacts against the seed's manifest

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use vwe_core::metrics::METRICS;
use vwe_core::processed::{load_processed, write_processed};
use vwe_core::{
    ArtifactManifest, GridSpec, PipelineConfig, PipelineError, Renderer, SamplingPlan, SeedLayout,
    Stage,
};
use vwe_orchestrator::{JobPhase, Orchestrator, ProcessCollaborator};

#[derive(Parser)]
#[command(name = "vwe")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Valheim World Engine sampling pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file (TOML)
    #[arg(short, long, global = true, env = "VWE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the generator for a seed and wait for the job to finish
    Run {
        /// World seed
        seed: String,

        /// Samples per axis (default: world.resolution from config)
        #[arg(short, long)]
        resolution: Option<usize>,
    },

    /// Print the pixel-center sampling plan
    Plan {
        /// Samples per axis (default: world.resolution from config)
        #[arg(short, long)]
        resolution: Option<usize>,

        /// Write the plan here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Transform and validate a seed's extracted dump again
    Process {
        /// World seed
        seed: String,
    },

    /// Render PNGs from a seed's processed layers
    Render {
        /// World seed
        seed: String,
    },

    /// Re-check every sealed artifact of a seed for drift
    Verify {
        /// World seed
        seed: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    vwe_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Run { seed, resolution } => cmd_run(config, &seed, resolution).await,
        Commands::Plan { resolution, output } => {
            cmd_plan(&config, resolution, output.as_deref())
        }
        Commands::Process { seed } => cmd_process(&config, &seed),
        Commands::Render { seed } => cmd_render(&config, &seed),
        Commands::Verify { seed } => cmd_verify(&config, &seed),
    };

    METRICS.flush();
    result
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

async fn cmd_run(config: PipelineConfig, seed: &str, resolution: Option<usize>) -> Result<()> {
    let orchestrator = Orchestrator::new(config, Arc::new(ProcessCollaborator))
        .context("Invalid pipeline configuration")?;
    let handle = orchestrator
        .submit(seed, resolution)
        .await
        .context("Failed to submit job")?;
    info!(job_id = %handle.id, seed, "job submitted");

    let status = tokio::select! {
        status = orchestrator.wait(&handle) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling job");
            orchestrator.cancel(&handle).await?;
            orchestrator.wait(&handle).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.phase != JobPhase::Complete {
        bail!(
            "Job {} {}: {}",
            status.job_id,
            status.phase,
            status.detail.unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_plan(config: &PipelineConfig, resolution: Option<usize>, output: Option<&Path>) -> Result<()> {
    let resolution = resolution.unwrap_or(config.world.resolution);
    let spec = GridSpec::new(config.world.radius, resolution)?;
    let plan_json = serde_json::to_string_pretty(&SamplingPlan::for_spec(&spec))?;

    if let Some(path) = output {
        std::fs::write(path, &plan_json).context(format!("Failed to write to {:?}", path))?;
        println!("Wrote sampling plan to {:?}", path);
    } else {
        println!("{}", plan_json);
    }
    Ok(())
}

/// Directory an offline command may write `stage` files to. A seed with a
/// manifest only accepts writes the manifest allows; sealed stages and
/// closed manifests are refused.
fn stage_dir(layout: &SeedLayout, stage: Stage) -> Result<PathBuf> {
    let path = layout.manifest_path();
    if !path.exists() {
        return Ok(layout.root().join(stage.as_str()));
    }
    let manifest = ArtifactManifest::load(&path)
        .context(format!("Failed to load manifest {:?}", path))?;
    if manifest.is_sealed(stage) {
        let sealed = layout.root().join(stage.as_str());
        return Err(anyhow::Error::new(PipelineError::StageSealed(stage))
            .context(format!("Refusing to overwrite {:?}", sealed)));
    }
    manifest
        .writable_dir(stage)
        .context(format!("Refusing to write {} files for seed {:?}", stage, manifest.seed))
}

/// Offline re-run over `extracted/`. Nothing is sealed.
fn cmd_process(config: &PipelineConfig, seed: &str) -> Result<()> {
    let layout = SeedLayout::new(&config.world.output_dir, seed);
    let dir = stage_dir(&layout, Stage::Processed)?;
    let out = vwe_core::process(&layout, seed, config)
        .context(format!("Failed to process {:?}", layout.extracted()))?;
    write_processed(&dir, &out.raster, &out.report, &out.metadata)?;

    let report = &out.report;
    println!(
        "Validation {} (aggregate error {:.2}%)",
        report.status.as_str(),
        report.aggregate_error
    );
    for check in &report.checks {
        println!(
            "  {:<24} {:<8} expected {:>6.2} actual {:>6.2} delta {:>6.2}",
            check.name,
            check.status.as_str(),
            check.expected,
            check.actual,
            check.delta
        );
    }
    println!("Wrote processed layers to {:?}", dir);
    Ok(())
}

fn cmd_render(config: &PipelineConfig, seed: &str) -> Result<()> {
    let layout = SeedLayout::new(&config.world.output_dir, seed);
    let dir = stage_dir(&layout, Stage::Renders)?;
    let raster = load_processed(&layout.processed())
        .context(format!("Failed to load processed layers from {:?}", layout.processed()))?;
    let renderer = Renderer::new(&raster, config.render);
    renderer.write_all(&dir)?;
    println!(
        "Rendered {}x{} images to {:?}",
        renderer.size(),
        renderer.size(),
        dir
    );
    Ok(())
}

fn cmd_verify(config: &PipelineConfig, seed: &str) -> Result<()> {
    let layout = SeedLayout::new(&config.world.output_dir, seed);
    let manifest = ArtifactManifest::load(&layout.manifest_path())
        .context(format!("No manifest for seed {:?}", seed))?;
    let drift = manifest.revalidate()?;

    for stage in manifest.stages() {
        println!(
            "{:<10} {:<8} {:>4} files {:>12} bytes",
            stage.stage.as_str(),
            if stage.sealed { "sealed" } else { "open" },
            stage.files.len(),
            stage.total_bytes()
        );
    }
    if drift.is_clean() {
        println!("All sealed artifacts match the manifest");
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&drift)?);
    bail!("Sealed artifacts of seed {:?} have drifted", seed)
}
