//! Per-job runner task.
//!
//! One task owns one [`GenerationJob`] from submission to its terminal
//! phase. It polls the collaborator at a fixed cadence, infers phase
//! transitions from log markers, enforces per-phase deadlines, seals the
//! manifest stage by stage and publishes a [`JobStatus`] snapshot after
//! every change.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use vwe_core::metrics::METRICS;
use vwe_core::obs::{self, JobSpan};
use vwe_core::{
    ArtifactManifest, CheckStatus, GridSpec, PipelineConfig, PipelineError, Processed,
    SamplingPlan, SeedLayout, Stage,
};

use crate::collaborator::{CollaboratorProcess, GenerationCollaborator, LaunchSpec};
use crate::job::{FailureKind, GenerationJob, JobPhase, JobStatus, JobWarning, ValidationSummary};
use crate::log_scan::LogScanner;
use crate::permissions::{normalize_ownership, target_ownership};

/// Why a job stopped short of `Complete`.
#[derive(Debug)]
struct Failure {
    kind: FailureKind,
    detail: String,
}

impl Failure {
    fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "cancelled by caller")
    }
}

impl From<PipelineError> for Failure {
    fn from(err: PipelineError) -> Self {
        let kind = match &err {
            PipelineError::Cancelled(_) => return Self::cancelled(),
            PipelineError::CorruptArtifact { .. } => FailureKind::CorruptArtifact,
            PipelineError::ArtifactMissing { .. } => FailureKind::ArtifactMissing,
            _ => FailureKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<std::io::Error> for Failure {
    fn from(err: std::io::Error) -> Self {
        Self::new(FailureKind::Io, err.to_string())
    }
}

impl From<crate::error::OrchestratorError> for Failure {
    fn from(err: crate::error::OrchestratorError) -> Self {
        Self::new(FailureKind::Io, err.to_string())
    }
}

/// Resolves once cancellation is requested or the orchestrator is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub(crate) struct JobRunner {
    job: GenerationJob,
    config: Arc<PipelineConfig>,
    layout: SeedLayout,
    collaborator: Arc<dyn GenerationCollaborator>,
    status: watch::Sender<JobStatus>,
    cancel: watch::Receiver<bool>,
    scanner: LogScanner,
    process: Option<Box<dyn CollaboratorProcess>>,
    manifest: ArtifactManifest,
    log_file: Option<File>,
    export_deadline: Option<Instant>,
    normalized: bool,
}

impl JobRunner {
    pub(crate) fn new(
        job: GenerationJob,
        config: Arc<PipelineConfig>,
        layout: SeedLayout,
        collaborator: Arc<dyn GenerationCollaborator>,
        status: watch::Sender<JobStatus>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let scanner = LogScanner::new(&config.markers, config.logs.tail_lines);
        let manifest = ArtifactManifest::new(job.id, &job.seed, &layout);
        Self {
            job,
            config,
            layout,
            collaborator,
            status,
            cancel,
            scanner,
            process: None,
            manifest,
            log_file: None,
            export_deadline: None,
            normalized: false,
        }
    }

    pub(crate) async fn run(mut self) {
        METRICS.inc_jobs_started();
        self.publish();

        let result = self.drive().await;
        if let Err(failure) = result {
            self.stop_collaborator().await;
            self.normalize_permissions();
            self.fail(failure);
        }

        METRICS.flush();
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(self.job.status());
    }

    fn transition(&mut self, next: JobPhase) -> Result<(), Failure> {
        self.job.transition(next)?;
        self.publish();
        Ok(())
    }

    async fn drive(&mut self) -> Result<(), Failure> {
        if *self.cancel.borrow() {
            return Err(Failure::cancelled());
        }
        self.layout.prepare_clean()?;
        self.save_manifest();
        self.open_log();

        let spec = GridSpec::new(self.config.world.radius, self.job.resolution)?;
        let plan = serde_json::to_vec_pretty(&SamplingPlan::for_spec(&spec))
            .map_err(PipelineError::from)?;
        std::fs::write(self.layout.plan_path(), plan)?;

        self.launch().await?;
        self.transition(JobPhase::Generating)?;
        self.await_markers().await?;

        self.stop_collaborator().await;
        self.normalize_permissions();
        self.await_artifacts().await?;

        self.manifest
            .seal(Stage::Raw, &self.config.artifacts.raw_required)?;
        self.manifest
            .seal(Stage::Extracted, &self.config.artifacts.extracted_required)?;
        self.save_manifest();

        self.transition(JobPhase::Validating)?;
        let processed = self.validate().await?;
        self.save_manifest();

        let report = &processed.report;
        if report.status == CheckStatus::Failed {
            let failed_checks = report
                .checks
                .iter()
                .filter(|c| c.status == CheckStatus::Failed)
                .map(|c| c.name.clone())
                .collect();
            self.job.warn(JobWarning::ValidationFailed {
                failed_checks,
                aggregate_error: report.aggregate_error,
            });
        }
        self.job.set_validation(ValidationSummary::from(report));

        self.manifest.mark_complete()?;
        self.save_manifest();
        self.transition(JobPhase::Complete)?;
        METRICS.inc_jobs_completed();
        info!(
            seed = %self.job.seed,
            status = report.status.as_str(),
            aggregate_error = report.aggregate_error,
            "job complete"
        );
        Ok(())
    }

    async fn launch(&mut self) -> Result<(), Failure> {
        let spec = LaunchSpec::new(&self.config, &self.job.seed, self.job.resolution, &self.layout);
        let attempts = self.config.timeouts.launch_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.job.launch_attempts = attempt;
            match self.collaborator.start(&spec).await {
                Ok(process) => {
                    self.process = Some(process);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "collaborator launch failed");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                let delay = self.config.timeouts.launch_backoff(attempt);
                tokio::select! {
                    biased;
                    _ = cancelled(&mut self.cancel) => return Err(Failure::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        Err(Failure::new(
            FailureKind::LaunchFailure,
            format!("{attempts} launch attempts failed, last error: {last_error}"),
        ))
    }

    fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.config.timeouts.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn tick(&mut self, ticker: &mut Interval) -> Result<(), Failure> {
        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => Err(Failure::cancelled()),
            _ = ticker.tick() => Ok(()),
        }
    }

    fn pump_logs(&mut self) {
        if let Some(process) = self.process.as_mut() {
            for chunk in process.drain_logs() {
                self.scanner.feed(&chunk);
            }
        }
        self.flush_lines();
    }

    fn flush_lines(&mut self) {
        let lines = self.scanner.take_lines();
        let Some(file) = self.log_file.as_mut() else {
            return;
        };
        let written = lines.iter().try_for_each(|line| writeln!(file, "{line}"));
        if let Err(e) = written {
            warn!(error = %e, "collaborator log write failed, disabling log capture");
            self.log_file = None;
        }
    }

    fn open_log(&mut self) {
        if !self.config.logs.save_filtered {
            return;
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.log_path())
        {
            Ok(file) => self.log_file = Some(file),
            Err(e) => warn!(error = %e, "cannot open collaborator log file"),
        }
    }

    /// Advance through Generating and Exporting. Returns once the export
    /// phase has completed.
    async fn await_markers(&mut self) -> Result<(), Failure> {
        let mut ticker = self.ticker();
        let mut deadline = Instant::now() + self.config.timeouts.generation();
        self.job.generation_deadline = wall_deadline(self.config.timeouts.generation());
        self.publish();

        loop {
            self.tick(&mut ticker).await?;
            self.pump_logs();
            if self.evaluate_markers(&mut deadline)? {
                return Ok(());
            }

            let exit = match self.process.as_mut() {
                Some(process) => process.try_exit()?,
                None => None,
            };
            if let Some(exit) = exit {
                if let Some(process) = self.process.as_mut() {
                    for chunk in process.drain_to_end().await {
                        self.scanner.feed(&chunk);
                    }
                }
                self.scanner.finish();
                self.flush_lines();
                if self.evaluate_markers(&mut deadline)? {
                    return Ok(());
                }
                let code = exit
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                return Err(Failure::new(
                    FailureKind::CollaboratorExited,
                    format!("collaborator exited ({code}) while {}", self.job.phase().name()),
                ));
            }

            if Instant::now() >= deadline {
                let (kind, timeout) = match self.job.phase() {
                    JobPhase::Generating => (
                        FailureKind::TimeoutWaitingForGeneration,
                        self.config.timeouts.generation(),
                    ),
                    _ => (
                        FailureKind::TimeoutWaitingForExport,
                        self.config.timeouts.export(),
                    ),
                };
                return Err(Failure::new(
                    kind,
                    format!("no marker within {}s", timeout.as_secs()),
                ));
            }
        }
    }

    /// Apply whatever the scanner has seen. `Ok(true)` once export is done.
    fn evaluate_markers(&mut self, deadline: &mut Instant) -> Result<bool, Failure> {
        if let Some(marker) = self.scanner.critical() {
            return Err(Failure::new(
                FailureKind::CollaboratorError,
                format!("critical marker {marker:?} in collaborator log"),
            ));
        }
        if self.job.phase() == JobPhase::Generating && self.scanner.generation_seen() {
            let export = self.config.timeouts.export();
            *deadline = Instant::now() + export;
            self.export_deadline = Some(*deadline);
            self.job.export_deadline = wall_deadline(export);
            self.transition(JobPhase::Exporting)?;
        }
        Ok(self.job.phase() == JobPhase::Exporting && self.scanner.export_seen())
    }

    /// Re-poll required outputs until present or the export deadline passes.
    async fn await_artifacts(&mut self) -> Result<(), Failure> {
        let deadline = self.export_deadline.unwrap_or_else(Instant::now);
        let mut ticker = self.ticker();
        loop {
            let missing = self.missing_artifacts();
            if missing.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Failure::new(
                    FailureKind::ArtifactMissing,
                    format!("missing after export: {}", missing.join(", ")),
                ));
            }
            debug!(missing = ?missing, "waiting for artifacts to be flushed");
            self.tick(&mut ticker).await?;
        }
    }

    fn missing_artifacts(&self) -> Vec<String> {
        let raw = self
            .config
            .artifacts
            .raw_required
            .iter()
            .map(|name| (Stage::Raw, name));
        let extracted = self
            .config
            .artifacts
            .extracted_required
            .iter()
            .map(|name| (Stage::Extracted, name));
        raw.chain(extracted)
            .filter(|(stage, name)| {
                std::fs::metadata(self.layout.stage_dir(*stage).join(name.as_str()))
                    .map(|m| m.len() == 0)
                    .unwrap_or(true)
            })
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Post-export work on the blocking pool. On cancellation the task is
    /// told to stop and awaited, so nothing it writes or seals outlives the
    /// job. Its manifest copy is discarded.
    async fn validate(&mut self) -> Result<Processed, Failure> {
        let mut manifest = self.manifest.clone();
        let layout = self.layout.clone();
        let config = Arc::clone(&self.config);
        let seed = self.job.seed.clone();
        let job_id = self.job.id.to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let task_stop = Arc::clone(&stop);

        let mut task = tokio::task::spawn_blocking(move || {
            let _span = JobSpan::enter(&job_id, &seed);
            let result =
                vwe_core::run_post_export(&mut manifest, &layout, &seed, &config, &task_stop);
            (manifest, result)
        });

        let joined = tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => {
                stop.store(true, Ordering::Release);
                if let Err(e) = (&mut task).await {
                    warn!(error = %e, "validation task failed after cancel");
                }
                return Err(Failure::cancelled());
            }
            joined = &mut task => joined,
        };
        match joined {
            Ok((manifest, result)) => {
                self.manifest = manifest;
                Ok(result?)
            }
            Err(e) => Err(Failure::new(FailureKind::Io, format!("validation task failed: {e}"))),
        }
    }

    async fn stop_collaborator(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        if let Err(e) = process.terminate(self.config.timeouts.shutdown()).await {
            warn!(error = %e, "collaborator termination failed");
        }
        for chunk in process.drain_to_end().await {
            self.scanner.feed(&chunk);
        }
        self.scanner.finish();
        self.flush_lines();
    }

    fn normalize_permissions(&mut self) {
        if self.normalized
            || !self.config.artifacts.normalize_permissions
            || !self.layout.root().exists()
        {
            return;
        }
        self.normalized = true;

        let root = self.layout.root().to_path_buf();
        let owner = target_ownership(&self.config.artifacts);

        let mut report = normalize_ownership(&root, owner);
        if !report.is_clean() {
            report = normalize_ownership(&root, owner);
        }
        if let Some(detail) = report.first_failure() {
            obs::emit_permissions_failed(&root, &detail);
            self.job.warn(JobWarning::PermissionNormalizationFailed {
                path: root,
                failures: report.failures.len(),
                detail,
            });
        } else if report.changed > 0 {
            debug!(changed = report.changed, "artifact ownership normalized");
        }
    }

    fn save_manifest(&self) {
        if let Err(e) = self.manifest.save(&self.layout.manifest_path()) {
            warn!(error = %e, "manifest save failed");
        }
    }

    fn fail(&mut self, failure: Failure) {
        self.scanner.finish();
        self.flush_lines();

        if let Err(e) = self
            .manifest
            .mark_failed(failure.kind.as_str(), &failure.detail)
        {
            debug!(error = %e, "manifest already closed");
        }
        self.save_manifest();

        let job_id = self.job.id.to_string();
        obs::emit_job_failed(&job_id, failure.kind.as_str(), &failure.detail);
        if let Err(e) = self
            .job
            .fail(failure.kind, failure.detail, self.scanner.tail())
        {
            warn!(error = %e, "job already terminal");
        }
        METRICS.inc_jobs_failed();
    }
}

fn wall_deadline(after: std::time::Duration) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::Duration::from_std(after)
        .ok()
        .map(|d| chrono::Utc::now() + d)
}
