//! Structured observability hooks for generation job lifecycle events.
//!
//! This module provides:
//! - Job-scoped tracing spans via the `JobSpan` RAII guard
//! - Emission functions for submission, phase changes, failures, stage seals
//!   and validation results
//!
//! Events are emitted at `info!` level (warnings at `warn!`). Verbosity is
//! controlled through `RUST_LOG`; see [`crate::telemetry::init_tracing`].

use tracing::info;

/// RAII guard that enters a job-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = JobSpan::enter("6e0c...", "42");
/// // every tracing call in scope carries job_id and seed
/// ```
pub struct JobSpan {
    _span: tracing::span::EnteredSpan,
}

impl JobSpan {
    pub fn enter(job_id: &str, seed: &str) -> Self {
        let span = tracing::info_span!("vwe.job", job_id = %job_id, seed = %seed);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: job accepted by the orchestrator.
pub fn emit_job_submitted(job_id: &str, seed: &str, resolution: usize) {
    info!(
        event = "job.submitted",
        job_id = %job_id,
        seed = %seed,
        resolution = resolution,
    );
}

/// Emit event: job moved from one phase to another.
pub fn emit_phase_changed(job_id: &str, from: &str, to: &str) {
    info!(event = "job.phase_changed", job_id = %job_id, from = %from, to = %to);
}

/// Emit event: job reached `Failed` (warning level).
pub fn emit_job_failed(job_id: &str, kind: &str, detail: &str) {
    tracing::warn!(event = "job.failed", job_id = %job_id, kind = %kind, detail = %detail);
}

/// Emit event: manifest stage sealed.
pub fn emit_stage_sealed(stage: &str, files: usize, total_bytes: u64) {
    info!(
        event = "stage.sealed",
        stage = %stage,
        files = files,
        total_bytes = total_bytes,
    );
}

/// Emit event: validation report produced.
pub fn emit_validation_completed(status: &str, aggregate_error: f64, failed_checks: usize) {
    info!(
        event = "validation.completed",
        status = %status,
        aggregate_error = aggregate_error,
        failed_checks = failed_checks,
    );
}

/// Emit event: ownership normalization did not fully succeed (warning level).
pub fn emit_permissions_failed(path: &std::path::Path, error: &dyn std::fmt::Display) {
    tracing::warn!(
        event = "permissions.normalize_failed",
        path = %path.display(),
        error = %error,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_span_create() {
        let _span = JobSpan::enter("job-1", "seed-1");
        emit_phase_changed("job-1", "launching", "generating");
    }
}
