//! Error taxonomy for the VWE data pipeline.

use std::path::PathBuf;

use crate::manifest::Stage;

/// Errors produced while sampling, transforming, rendering or sealing artifacts.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid sampling grid: {0}")]
    InvalidGrid(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("corrupt artifact {path:?}: {reason}")]
    CorruptArtifact { path: PathBuf, reason: String },

    #[error("artifact missing for stage {stage}: {missing:?}")]
    ArtifactMissing { stage: Stage, missing: Vec<String> },

    #[error("stage {0} is already sealed")]
    StageSealed(Stage),

    #[error("stage {stage} cannot be sealed before {requires}")]
    StageOutOfOrder { stage: Stage, requires: Stage },

    #[error("manifest is closed with a terminal outcome")]
    ManifestClosed,

    #[error("cancelled before {0} was sealed")]
    Cancelled(Stage),

    #[error("render error: {0}")]
    Render(#[from] image::ImageError),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::CorruptArtifact {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_artifact_display() {
        let err = PipelineError::corrupt("extracted/biomes.json", "biome_map is not square");
        let msg = err.to_string();
        assert!(msg.contains("corrupt artifact"));
        assert!(msg.contains("biomes.json"));
        assert!(msg.contains("not square"));
    }

    #[test]
    fn test_artifact_missing_lists_files() {
        let err = PipelineError::ArtifactMissing {
            stage: Stage::Extracted,
            missing: vec!["biomes.json".to_string(), "heightmap.json".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("extracted"));
        assert!(msg.contains("heightmap.json"));
    }

    #[test]
    fn test_stage_out_of_order_display() {
        let err = PipelineError::StageOutOfOrder {
            stage: Stage::Processed,
            requires: Stage::Extracted,
        };
        assert_eq!(
            err.to_string(),
            "stage processed cannot be sealed before extracted"
        );
    }
}
