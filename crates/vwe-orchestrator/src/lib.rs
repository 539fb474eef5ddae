//! VWE Orchestrator
//!
//! Drives the external world generator through launch, generation, export
//! and validation for one seed at a time, and records what it produced.

pub mod collaborator;
pub mod error;
pub mod fakes;
pub mod job;
pub mod log_scan;
pub mod orchestrator;
pub mod permissions;
mod runner;

pub use collaborator::{
    CollaboratorProcess, Exit, GenerationCollaborator, LaunchSpec, LogChunk, LogStream,
    ProcessCollaborator,
};

pub use error::{OrchestratorError, Result};

pub use job::{
    FailureKind, GenerationJob, JobHandle, JobPhase, JobStatus, JobWarning, ValidationSummary,
};

pub use log_scan::LogScanner;

pub use orchestrator::Orchestrator;

pub use permissions::{normalize_ownership, target_ownership, NormalizeReport, Ownership};
