//! VWE Core Library
//!
//! Sampling, transform/validation, rendering and artifact bookkeeping for
//! world data exported by an external generator.

pub mod biome;
pub mod config;
pub mod error;
pub mod extract;
pub mod layout;
pub mod manifest;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod processed;
pub mod render;
pub mod sampling;
pub mod telemetry;
pub mod transform;

pub use biome::Biome;

pub use config::{
    ArtifactConfig, CollaboratorConfig, LogConfig, MarkerConfig, PipelineConfig, SamplingConfig,
    StrategyKind, TimeoutConfig, WorldConfig,
};

pub use error::{PipelineError, Result};

pub use extract::load_extracted;

pub use layout::{seed_hash, SeedLayout};

pub use manifest::{ArtifactManifest, FileRecord, Outcome, Revalidation, Stage, StageRecord};

pub use pipeline::{process, run_post_export, Processed};

pub use processed::{BiomeDocument, HeightDocument, RunMetadata};

pub use render::{RenderConfig, Renderer};

pub use sampling::{
    AdaptiveConfig, AdaptiveSampler, GridSpec, ProbeValue, RasterProbe, Sample, SampleGrid,
    SamplingOutcome, SamplingPlan, SamplingStrategy, UniformSampler, WorldProbe,
    PIXEL_CENTER_RULE,
};

pub use transform::{
    transform, Check, CheckStatus, HeightStats, LayeredRaster, ReferenceDistribution,
    ValidationConfig, ValidationReport,
};
