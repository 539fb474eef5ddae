//! Errors surfaced by the orchestrator API.
//!
//! Job failures are not errors of this type: they are recorded on the job as
//! `JobPhase::Failed(kind)` and observed through `poll`/`wait`.

use uuid::Uuid;
use vwe_core::PipelineError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("a job for seed {seed} is already running")]
    AlreadyRunning { seed: String },

    #[error("unknown job {0}")]
    UnknownJob(Uuid),

    #[error("illegal phase transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_running_display() {
        let err = OrchestratorError::AlreadyRunning {
            seed: "hkLycKKCMI".to_string(),
        };
        assert_eq!(err.to_string(), "a job for seed hkLycKKCMI is already running");
    }

    #[test]
    fn test_pipeline_error_from() {
        let err: OrchestratorError = PipelineError::InvalidGrid("zero".to_string()).into();
        assert!(matches!(err, OrchestratorError::Pipeline(_)));
    }
}
