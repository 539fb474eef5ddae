//! Generation job state machine and its published snapshots.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vwe_core::{CheckStatus, ValidationReport};

use crate::error::{OrchestratorError, Result};

/// Why a job reached `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LaunchFailure,
    TimeoutWaitingForGeneration,
    TimeoutWaitingForExport,
    ArtifactMissing,
    CorruptArtifact,
    CollaboratorError,
    CollaboratorExited,
    Cancelled,
    Io,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::LaunchFailure => "launch_failure",
            FailureKind::TimeoutWaitingForGeneration => "timeout_waiting_for_generation",
            FailureKind::TimeoutWaitingForExport => "timeout_waiting_for_export",
            FailureKind::ArtifactMissing => "artifact_missing",
            FailureKind::CorruptArtifact => "corrupt_artifact",
            FailureKind::CollaboratorError => "collaborator_error",
            FailureKind::CollaboratorExited => "collaborator_exited",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Io => "io",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Launching,
    Generating,
    Exporting,
    Validating,
    Complete,
    Failed(FailureKind),
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Complete | JobPhase::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobPhase::Launching => "launching",
            JobPhase::Generating => "generating",
            JobPhase::Exporting => "exporting",
            JobPhase::Validating => "validating",
            JobPhase::Complete => "complete",
            JobPhase::Failed(_) => "failed",
        }
    }

    /// Legal successors: the next phase in order, or `Failed` from any
    /// non-terminal phase.
    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        match (self, next) {
            (from, JobPhase::Failed(_)) => !from.is_terminal(),
            (JobPhase::Launching, JobPhase::Generating)
            | (JobPhase::Generating, JobPhase::Exporting)
            | (JobPhase::Exporting, JobPhase::Validating)
            | (JobPhase::Validating, JobPhase::Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Failed(kind) => write!(f, "failed({kind})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Non-fatal conditions recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobWarning {
    PermissionNormalizationFailed {
        path: PathBuf,
        failures: usize,
        detail: String,
    },
    ValidationFailed {
        failed_checks: Vec<String>,
        aggregate_error: f64,
    },
}

/// Validation outcome carried on the job status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub status: CheckStatus,
    pub aggregate_error: f64,
    pub failed_checks: usize,
}

impl From<&ValidationReport> for ValidationSummary {
    fn from(report: &ValidationReport) -> Self {
        Self {
            status: report.status,
            aggregate_error: report.aggregate_error,
            failed_checks: report.failed_checks(),
        }
    }
}

/// Caller-side reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub seed: String,
}

/// Immutable snapshot of a job, published on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: Uuid,
    pub seed: String,
    pub seed_hash: String,
    pub resolution: usize,
    pub phase: JobPhase,
    pub error_kind: Option<FailureKind>,
    pub detail: Option<String>,
    /// Last log lines, populated on `Failed`.
    pub log_tail: Vec<String>,
    pub warnings: Vec<JobWarning>,
    pub validation: Option<ValidationSummary>,
    pub manifest_path: PathBuf,
    pub launch_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One generation request. Owned by its runner task.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub id: Uuid,
    pub seed: String,
    pub seed_hash: String,
    pub resolution: usize,
    pub manifest_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub generation_deadline: Option<DateTime<Utc>>,
    pub export_deadline: Option<DateTime<Utc>>,
    pub launch_attempts: u32,
    phase: JobPhase,
    updated_at: DateTime<Utc>,
    detail: Option<String>,
    log_tail: Vec<String>,
    warnings: Vec<JobWarning>,
    validation: Option<ValidationSummary>,
}

impl GenerationJob {
    pub fn new(
        id: Uuid,
        seed: &str,
        seed_hash: &str,
        resolution: usize,
        manifest_path: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            seed: seed.to_string(),
            seed_hash: seed_hash.to_string(),
            resolution,
            manifest_path,
            started_at: now,
            generation_deadline: None,
            export_deadline: None,
            launch_attempts: 0,
            phase: JobPhase::Launching,
            updated_at: now,
            detail: None,
            log_tail: Vec::new(),
            warnings: Vec::new(),
            validation: None,
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            seed: self.seed.clone(),
        }
    }

    /// Move to `next`, rejecting anything but the legal successors.
    pub fn transition(&mut self, next: JobPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(OrchestratorError::IllegalTransition {
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        let from = self.phase;
        self.phase = next;
        self.updated_at = Utc::now();
        vwe_core::obs::emit_phase_changed(&self.id.to_string(), from.name(), next.name());
        Ok(())
    }

    pub fn fail(&mut self, kind: FailureKind, detail: String, log_tail: Vec<String>) -> Result<()> {
        self.transition(JobPhase::Failed(kind))?;
        self.detail = Some(detail);
        self.log_tail = log_tail;
        Ok(())
    }

    pub fn warn(&mut self, warning: JobWarning) {
        self.warnings.push(warning);
        self.updated_at = Utc::now();
    }

    pub fn set_validation(&mut self, summary: ValidationSummary) {
        self.validation = Some(summary);
        self.updated_at = Utc::now();
    }

    pub fn warnings(&self) -> &[JobWarning] {
        &self.warnings
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            seed: self.seed.clone(),
            seed_hash: self.seed_hash.clone(),
            resolution: self.resolution,
            phase: self.phase,
            error_kind: match self.phase {
                JobPhase::Failed(kind) => Some(kind),
                _ => None,
            },
            detail: self.detail.clone(),
            log_tail: self.log_tail.clone(),
            warnings: self.warnings.clone(),
            validation: self.validation.clone(),
            manifest_path: self.manifest_path.clone(),
            launch_attempts: self.launch_attempts,
            started_at: self.started_at,
            updated_at: self.updated_at,
        }
    }
}
