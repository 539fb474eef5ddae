//! Pipeline configuration loaded from TOML.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//!
//! ```toml
//! [world]
//! radius = 10000.0
//! resolution = 256
//!
//! [timeouts]
//! generation_secs = 900
//! export_secs = 300
//!
//! [sampling]
//! strategy = "adaptive"
//! adaptive = { refinement_factor = 4, variance_threshold = 0.0 }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::extract;
use crate::render::RenderConfig;
use crate::sampling::{AdaptiveConfig, AdaptiveSampler, GridSpec, SamplingStrategy, UniformSampler};
use crate::transform::{ReferenceDistribution, ValidationConfig};

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub name: String,
    pub radius: f64,
    pub resolution: usize,
    /// Base directory; seed roots live under `<output_dir>/seeds/`.
    pub output_dir: PathBuf,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            name: "vwe".to_string(),
            radius: 10_000.0,
            resolution: 256,
            output_dir: PathBuf::from("data"),
        }
    }
}

/// How to start the generation process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment passed at launch.
    pub env: BTreeMap<String, String>,
    pub exports_enabled: bool,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            program: "./valheim_server.x86_64".to_string(),
            args: strings(&["-batchmode", "-nographics"]),
            working_dir: None,
            env: BTreeMap::new(),
            exports_enabled: true,
        }
    }
}

/// Log substrings that drive phase transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    /// Any of these ends the generation phase.
    pub generation: Vec<String>,
    /// Any of these ends the export phase; empty means no export wait.
    pub export: Vec<String>,
    /// Any of these fails the job.
    pub critical: Vec<String>,
    /// Lines containing any of these are dropped from the saved log.
    pub noise: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            generation: strings(&["Game server connected", "World saved"]),
            export: strings(&["ALL EXPORTS COMPLETE"]),
            critical: strings(&[
                "FATAL ERROR",
                "CRITICAL ERROR",
                "Failed to start",
                "Bind: address already in use",
                "SteamCMD failed",
                "Valheim server failed",
                "BepInEx failed",
            ]),
            noise: strings(&[
                "ERROR: Shader",
                "WARNING: Shader",
                "The shader",
                "The image effect",
                "DllNotFoundException: party",
                "PlayFab.Party",
                "SteamInternal_SetMinidumpSteamID",
                "[S_API FAIL]",
                "AsyncResourceUpload failed",
                "The referenced script on this Behaviour",
                "OnGUI function detected",
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub generation_secs: u64,
    pub export_secs: u64,
    pub poll_interval_ms: u64,
    pub shutdown_secs: u64,
    /// Total launch attempts before `LaunchFailure`.
    pub launch_retries: u32,
    /// Backoff before attempt `n + 1` is `launch_backoff_ms * 2^(n - 1)`.
    pub launch_backoff_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            generation_secs: 900,
            export_secs: 300,
            poll_interval_ms: 1000,
            shutdown_secs: 10,
            launch_retries: 3,
            launch_backoff_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn generation(&self) -> Duration {
        Duration::from_secs(self.generation_secs)
    }

    pub fn export(&self) -> Duration {
        Duration::from_secs(self.export_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn launch_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.launch_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Files that must exist in `raw/` before it seals.
    pub raw_required: Vec<String>,
    /// Files that must exist in `extracted/` before it seals.
    pub extracted_required: Vec<String>,
    pub normalize_permissions: bool,
    /// Owner override; defaults to the owner of the output directory.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            raw_required: Vec::new(),
            extracted_required: extract::required_files(),
            normalize_permissions: true,
            uid: None,
            gid: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Uniform,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub strategy: StrategyKind,
    pub adaptive: AdaptiveConfig,
}

impl SamplingConfig {
    pub fn build_strategy(&self) -> Result<Box<dyn SamplingStrategy>> {
        Ok(match self.strategy {
            StrategyKind::Uniform => Box::new(UniformSampler),
            StrategyKind::Adaptive => Box::new(AdaptiveSampler::new(self.adaptive)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Lines kept for failure reports.
    pub tail_lines: usize,
    pub save_filtered: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            tail_lines: 50,
            save_filtered: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub world: WorldConfig,
    pub collaborator: CollaboratorConfig,
    pub markers: MarkerConfig,
    pub timeouts: TimeoutConfig,
    pub artifacts: ArtifactConfig,
    pub sampling: SamplingConfig,
    pub validation: ValidationConfig,
    pub reference: ReferenceDistribution,
    pub render: RenderConfig,
    pub logs: LogConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn grid_spec(&self) -> Result<GridSpec> {
        GridSpec::new(self.world.radius, self.world.resolution)
    }

    pub fn validate(&self) -> Result<()> {
        self.grid_spec()
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        if self.collaborator.program.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "collaborator.program must not be empty".to_string(),
            ));
        }
        if self.markers.generation.iter().all(|m| m.is_empty()) {
            return Err(PipelineError::InvalidConfig(
                "markers.generation needs at least one non-empty marker".to_string(),
            ));
        }
        let t = &self.timeouts;
        if t.generation_secs == 0 || t.poll_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "timeouts.generation_secs and timeouts.poll_interval_ms must be positive"
                    .to_string(),
            ));
        }
        if t.generation_secs <= t.export_secs {
            return Err(PipelineError::InvalidConfig(format!(
                "timeouts.generation_secs ({}) must exceed timeouts.export_secs ({})",
                t.generation_secs, t.export_secs
            )));
        }
        if t.launch_retries == 0 {
            return Err(PipelineError::InvalidConfig(
                "timeouts.launch_retries must be at least 1".to_string(),
            ));
        }
        if self.sampling.strategy == StrategyKind::Adaptive {
            self.sampling.adaptive.validate()?;
        }
        self.validation.validate()?;
        self.reference.validate()?;
        self.render.validate()?;
        Ok(())
    }
}
