//! End-to-end job lifecycle against the scripted collaborator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vwe_core::{ArtifactManifest, Outcome, PipelineConfig, SeedLayout, Stage};
use vwe_orchestrator::fakes::{export_dump, FileTarget, Script, ScriptedCollaborator};
use vwe_orchestrator::{FailureKind, JobPhase, JobWarning, Orchestrator, OrchestratorError};

fn config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.world.output_dir = dir.to_path_buf();
    config.world.resolution = 8;
    config.timeouts.poll_interval_ms = 10;
    config.timeouts.generation_secs = 10;
    config.timeouts.export_secs = 5;
    config.timeouts.shutdown_secs = 1;
    config.timeouts.launch_backoff_ms = 10;
    config
}

fn orchestrator(config: PipelineConfig, script: Script) -> (Orchestrator, Arc<ScriptedCollaborator>) {
    let collaborator = ScriptedCollaborator::new(script);
    let orchestrator = Orchestrator::new(config, collaborator.clone()).unwrap();
    (orchestrator, collaborator)
}

#[tokio::test]
async fn test_happy_path_seals_every_stage() {
    vwe_core::telemetry::init_tracing(false, tracing::Level::DEBUG);
    let dir = tempfile::tempdir().unwrap();
    let (orch, collaborator) = orchestrator(config(dir.path()), Script::happy_path(8));

    let handle = orch.submit("hkLycKKCMI", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();

    assert_eq!(status.phase, JobPhase::Complete, "detail: {:?}", status.detail);
    assert!(status.error_kind.is_none());
    assert_eq!(status.launch_attempts, 1);
    assert_eq!(collaborator.starts(), 1);
    assert_eq!(collaborator.launch_specs()[0].resolution, 8);

    // Half Ocean, half Meadows is far from the reference mix.
    let validation = status.validation.expect("validation summary");
    assert!(validation.failed_checks > 0);
    assert!(status
        .warnings
        .iter()
        .any(|w| matches!(w, JobWarning::ValidationFailed { .. })));

    let manifest = ArtifactManifest::load(&status.manifest_path).unwrap();
    assert_eq!(manifest.outcome(), Some(&Outcome::Complete));
    for stage in Stage::ALL {
        assert!(manifest.is_sealed(stage), "{stage} not sealed");
    }
    assert!(manifest.revalidate().unwrap().is_clean());

    let layout = SeedLayout::new(dir.path(), "hkLycKKCMI");
    assert!(layout.plan_path().is_file());
    assert!(layout.raw().join("world.db").is_file());
    assert!(layout.processed().join("validation_report.json").is_file());
    assert!(layout.renders().join("composite.png").is_file());
    let log = std::fs::read_to_string(layout.log_path()).unwrap();
    assert!(log.contains("Game server connected"));
}

#[tokio::test(start_paused = true)]
async fn test_generation_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.timeouts.generation_secs = 60;
    config.timeouts.poll_interval_ms = 1000;
    let (orch, _) = orchestrator(config, Script::new().log(10, "Loading world\n"));

    let started = tokio::time::Instant::now();
    let handle = orch.submit("slow", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();

    assert_eq!(
        status.phase,
        JobPhase::Failed(FailureKind::TimeoutWaitingForGeneration)
    );
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(60), "{elapsed:?}");
    assert!(elapsed <= Duration::from_secs(62), "{elapsed:?}");
    assert_eq!(status.log_tail, vec!["Loading world".to_string()]);

    let manifest = ArtifactManifest::load(&status.manifest_path).unwrap();
    assert!(matches!(
        manifest.outcome(),
        Some(Outcome::Failed { kind, .. }) if kind == "timeout_waiting_for_generation"
    ));
    assert!(!manifest.is_sealed(Stage::Raw));
}

#[tokio::test(start_paused = true)]
async fn test_export_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = orchestrator(
        config(dir.path()),
        Script::new().log(10, "World saved\n"),
    );

    let handle = orch.submit("no-export", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(
        status.phase,
        JobPhase::Failed(FailureKind::TimeoutWaitingForExport)
    );
    assert!(status.detail.unwrap().contains("5s"));
}

#[tokio::test]
async fn test_duplicate_seed_is_rejected_without_launch() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.timeouts.generation_secs = 60;
    let (orch, collaborator) = orchestrator(config, Script::new());

    let first = orch.submit("dup", None).await.unwrap();
    let err = orch.submit("dup", None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning { ref seed } if seed == "dup"));

    let other = orch.submit("other", None).await.unwrap();
    orch.cancel(&first).await.unwrap();
    orch.cancel(&other).await.unwrap();
    let first = orch.wait(&first).await.unwrap();
    orch.wait(&other).await.unwrap();

    assert_eq!(first.phase, JobPhase::Failed(FailureKind::Cancelled));
    assert_eq!(collaborator.starts(), 2);
}

#[tokio::test]
async fn test_cancel_during_export_keeps_later_stages_unsealed() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = orchestrator(
        config(dir.path()),
        Script::new().log(10, "Game server connected\n"),
    );

    let handle = orch.submit("cancel-me", None).await.unwrap();
    let mut updates = orch.subscribe(&handle).await.unwrap();
    updates
        .wait_for(|s| s.phase == JobPhase::Exporting)
        .await
        .unwrap();
    orch.cancel(&handle).await.unwrap();

    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Failed(FailureKind::Cancelled));

    let manifest = ArtifactManifest::load(&status.manifest_path).unwrap();
    assert!(matches!(
        manifest.outcome(),
        Some(Outcome::Failed { kind, .. }) if kind == "cancelled"
    ));
    assert!(!manifest.is_sealed(Stage::Extracted));
    assert!(!manifest.is_sealed(Stage::Processed));

    // Terminal jobs ignore further cancellation.
    orch.cancel(&handle).await.unwrap();
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn test_cancel_during_validation_stops_post_export_work() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    // Slow enough that cancellation lands while rendering.
    config.render.target_resolution = Some(2048);
    let (orch, _) = orchestrator(config, Script::happy_path(8));

    let handle = orch.submit("cancel-validating", None).await.unwrap();
    let mut updates = orch.subscribe(&handle).await.unwrap();
    updates
        .wait_for(|s| s.phase == JobPhase::Validating)
        .await
        .unwrap();
    orch.cancel(&handle).await.unwrap();

    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Failed(FailureKind::Cancelled));

    let manifest = ArtifactManifest::load(&status.manifest_path).unwrap();
    assert!(matches!(
        manifest.outcome(),
        Some(Outcome::Failed { kind, .. }) if kind == "cancelled"
    ));
    assert!(manifest.is_sealed(Stage::Extracted));
    assert!(!manifest.is_sealed(Stage::Processed));
    assert!(!manifest.is_sealed(Stage::Renders));
    assert!(manifest.revalidate().unwrap().is_clean());

    // The post-export task has finished by the time the job is terminal.
    let layout = SeedLayout::new(dir.path(), "cancel-validating");
    let processed = file_names(&layout.processed());
    let renders = file_names(&layout.renders());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(file_names(&layout.processed()), processed);
    assert_eq!(file_names(&layout.renders()), renders);
    assert_eq!(
        ArtifactManifest::load(&status.manifest_path).unwrap(),
        manifest
    );
}

#[tokio::test]
async fn test_resubmit_after_failure_starts_clean() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.timeouts.launch_retries = 1;
    let (orch, collaborator) = orchestrator(config, Script::happy_path(8).fail_launches(1));

    let first = orch.submit("retry", None).await.unwrap();
    let failed = orch.wait(&first).await.unwrap();
    assert_eq!(failed.phase, JobPhase::Failed(FailureKind::LaunchFailure));

    let layout = SeedLayout::new(dir.path(), "retry");
    let stale = layout.processed().join("leftover.json");
    std::fs::write(&stale, b"{}").unwrap();

    let second = orch.submit("retry", None).await.unwrap();
    assert_ne!(second.id, first.id);
    let done = orch.wait(&second).await.unwrap();
    assert_eq!(done.phase, JobPhase::Complete, "detail: {:?}", done.detail);
    assert!(!stale.exists());
    assert_eq!(collaborator.starts(), 2);

    // The replaced job stays observable.
    let archived = orch.poll(&first).await.unwrap();
    assert_eq!(archived.phase, JobPhase::Failed(FailureKind::LaunchFailure));
}

#[tokio::test]
async fn test_launch_retries_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.timeouts.launch_retries = 3;
    let (orch, collaborator) = orchestrator(config, Script::happy_path(8).fail_launches(2));

    let handle = orch.submit("flaky", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Complete, "detail: {:?}", status.detail);
    assert_eq!(status.launch_attempts, 3);
    assert_eq!(collaborator.starts(), 3);
}

#[tokio::test]
async fn test_launch_failure_after_all_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.timeouts.launch_retries = 2;
    let (orch, collaborator) = orchestrator(config, Script::new().fail_launches(5));

    let handle = orch.submit("broken", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Failed(FailureKind::LaunchFailure));
    assert_eq!(collaborator.starts(), 2);
    assert!(status.detail.unwrap().contains("2 launch attempts"));
}

#[tokio::test]
async fn test_critical_marker_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = orchestrator(
        config(dir.path()),
        Script::new()
            .log(10, "boot\n")
            .log_stderr(20, "FATAL ERROR: disk full\n"),
    );

    let handle = orch.submit("fatal", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Failed(FailureKind::CollaboratorError));
    assert!(status.detail.unwrap().contains("FATAL ERROR"));
    assert!(status
        .log_tail
        .contains(&"FATAL ERROR: disk full".to_string()));
}

#[tokio::test]
async fn test_exit_before_export_marker() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = orchestrator(
        config(dir.path()),
        Script::new()
            .log(10, "Game server connected\n")
            .exit(20, 1),
    );

    let handle = orch.submit("quitter", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Failed(FailureKind::CollaboratorExited));
    let detail = status.detail.unwrap();
    assert!(detail.contains("(1)"), "{detail}");
    assert!(detail.contains("exporting"), "{detail}");
}

#[tokio::test(start_paused = true)]
async fn test_missing_artifacts_after_export_marker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.timeouts.export_secs = 1;
    let (orch, _) = orchestrator(
        config,
        Script::new()
            .log(10, "Game server connected\n")
            .log(20, "ALL EXPORTS COMPLETE\n"),
    );

    let handle = orch.submit("empty", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Failed(FailureKind::ArtifactMissing));
    let detail = status.detail.unwrap();
    assert!(detail.contains("biomes.json"), "{detail}");
    assert!(detail.contains("heightmap.json"), "{detail}");
}

#[tokio::test]
async fn test_corrupt_export_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let (_, heights) = export_dump(8);
    let (orch, _) = orchestrator(
        config(dir.path()),
        Script::new()
            .log(10, "Game server connected\n")
            .write(20, FileTarget::Export, "biomes.json", b"{not json")
            .write(20, FileTarget::Export, "heightmap.json", &heights)
            .log(30, "ALL EXPORTS COMPLETE\n"),
    );

    let handle = orch.submit("corrupt", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Failed(FailureKind::CorruptArtifact));

    let manifest = ArtifactManifest::load(&status.manifest_path).unwrap();
    assert!(manifest.is_sealed(Stage::Extracted));
    assert!(!manifest.is_sealed(Stage::Processed));
}

#[tokio::test]
async fn test_no_export_markers_completes_on_generation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.markers.export = Vec::new();
    let (biomes, heights) = export_dump(8);
    let (orch, _) = orchestrator(
        config,
        Script::new()
            .write(5, FileTarget::Export, "biomes.json", &biomes)
            .write(5, FileTarget::Export, "heightmap.json", &heights)
            .log(10, "World saved\n"),
    );

    let handle = orch.submit("quiet", None).await.unwrap();
    let status = orch.wait(&handle).await.unwrap();
    assert_eq!(status.phase, JobPhase::Complete, "detail: {:?}", status.detail);
}

#[tokio::test]
async fn test_unknown_handle_and_invalid_submit() {
    let dir = tempfile::tempdir().unwrap();
    let (orch, _) = orchestrator(config(dir.path()), Script::new());

    let ghost = vwe_orchestrator::JobHandle {
        id: uuid::Uuid::new_v4(),
        seed: "ghost".to_string(),
    };
    assert!(matches!(
        orch.poll(&ghost).await,
        Err(OrchestratorError::UnknownJob(_))
    ));
    assert!(matches!(
        orch.submit("", None).await,
        Err(OrchestratorError::InvalidConfig(_))
    ));
    assert!(matches!(
        orch.submit("seed", Some(0)).await,
        Err(OrchestratorError::InvalidConfig(_))
    ));
}
