//! Job registry and the public submit / poll / wait / cancel surface.
//!
//! At most one job per seed is active at a time. The registry is only ever
//! touched under its lock, and the duplicate check happens before anything
//! is spawned, so a second submit never launches a collaborator.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, Instrument};
use uuid::Uuid;
use vwe_core::{obs, PipelineConfig, SeedLayout};

use crate::collaborator::GenerationCollaborator;
use crate::error::{OrchestratorError, Result};
use crate::job::{GenerationJob, JobHandle, JobStatus};
use crate::runner::JobRunner;

struct JobSlot {
    job_id: Uuid,
    status: watch::Receiver<JobStatus>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl JobSlot {
    fn is_active(&self) -> bool {
        !self.status.borrow().phase.is_terminal()
    }
}

#[derive(Default)]
struct Registry {
    /// Latest job per seed, active or not.
    by_seed: HashMap<String, JobSlot>,
    /// Final snapshots of jobs replaced by a resubmission.
    archived: HashMap<Uuid, JobStatus>,
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    collaborator: Arc<dyn GenerationCollaborator>,
    registry: Mutex<Registry>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, collaborator: Arc<dyn GenerationCollaborator>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            collaborator,
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Submit a job with the orchestrator's configuration, optionally at a
    /// different resolution.
    pub async fn submit(&self, seed: &str, resolution: Option<usize>) -> Result<JobHandle> {
        self.submit_with(seed, resolution, (*self.config).clone())
            .await
    }

    /// Submit a job with a per-job configuration.
    pub async fn submit_with(
        &self,
        seed: &str,
        resolution: Option<usize>,
        mut config: PipelineConfig,
    ) -> Result<JobHandle> {
        if seed.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig("seed must not be empty".into()));
        }
        if let Some(resolution) = resolution {
            config.world.resolution = resolution;
        }
        config
            .validate()
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;

        let mut registry = self.registry.lock().await;
        if let Some(slot) = registry.by_seed.get(seed) {
            if slot.is_active() {
                return Err(OrchestratorError::AlreadyRunning {
                    seed: seed.to_string(),
                });
            }
        }
        if let Some(previous) = registry.by_seed.remove(seed) {
            let last = previous.status.borrow().clone();
            registry.archived.insert(previous.job_id, last);
        }

        let layout = SeedLayout::new(&config.world.output_dir, seed);
        let job = GenerationJob::new(
            Uuid::new_v4(),
            seed,
            layout.seed_hash(),
            config.world.resolution,
            layout.manifest_path(),
        );
        let handle = job.handle();
        let job_id = job.id.to_string();
        let resolution = job.resolution;

        let (status_tx, status_rx) = watch::channel(job.status());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let span = tracing::info_span!("vwe.job", job_id = %job_id, seed = %seed);
        let runner = JobRunner::new(
            job,
            Arc::new(config),
            layout,
            Arc::clone(&self.collaborator),
            status_tx,
            cancel_rx,
        );
        obs::emit_job_submitted(&job_id, seed, resolution);
        let task = tokio::spawn(runner.run().instrument(span));

        registry.by_seed.insert(
            seed.to_string(),
            JobSlot {
                job_id: handle.id,
                status: status_rx,
                cancel: cancel_tx,
                task: Some(task),
            },
        );
        Ok(handle)
    }

    fn receiver(registry: &Registry, handle: &JobHandle) -> Option<watch::Receiver<JobStatus>> {
        registry
            .by_seed
            .get(&handle.seed)
            .filter(|slot| slot.job_id == handle.id)
            .map(|slot| slot.status.clone())
    }

    /// Current snapshot of a job.
    pub async fn poll(&self, handle: &JobHandle) -> Result<JobStatus> {
        let registry = self.registry.lock().await;
        if let Some(rx) = Self::receiver(&registry, handle) {
            let status = rx.borrow().clone();
            return Ok(status);
        }
        registry
            .archived
            .get(&handle.id)
            .cloned()
            .ok_or(OrchestratorError::UnknownJob(handle.id))
    }

    /// Status updates for an active job.
    pub async fn subscribe(&self, handle: &JobHandle) -> Result<watch::Receiver<JobStatus>> {
        let registry = self.registry.lock().await;
        Self::receiver(&registry, handle).ok_or(OrchestratorError::UnknownJob(handle.id))
    }

    /// Resolve once the job reaches a terminal phase.
    pub async fn wait(&self, handle: &JobHandle) -> Result<JobStatus> {
        let mut rx = {
            let registry = self.registry.lock().await;
            match Self::receiver(&registry, handle) {
                Some(rx) => rx,
                None => {
                    return registry
                        .archived
                        .get(&handle.id)
                        .cloned()
                        .ok_or(OrchestratorError::UnknownJob(handle.id))
                }
            }
        };
        let reached = rx
            .wait_for(|s| s.phase.is_terminal())
            .await
            .map(|status| status.clone());
        // Runner gone: its last publish is final.
        Ok(reached.unwrap_or_else(|_| rx.borrow().clone()))
    }

    /// Request cancellation. A job that is already terminal is left as is.
    pub async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let registry = self.registry.lock().await;
        match registry.by_seed.get(&handle.seed) {
            Some(slot) if slot.job_id == handle.id => {
                if slot.is_active() {
                    info!(job_id = %handle.id, seed = %handle.seed, "cancellation requested");
                    slot.cancel.send_replace(true);
                }
                Ok(())
            }
            _ if registry.archived.contains_key(&handle.id) => Ok(()),
            _ => Err(OrchestratorError::UnknownJob(handle.id)),
        }
    }

    /// Snapshots of every job still tracked per seed.
    pub async fn jobs(&self) -> Vec<JobStatus> {
        let registry = self.registry.lock().await;
        registry
            .by_seed
            .values()
            .map(|slot| slot.status.borrow().clone())
            .collect()
    }

    /// Cancel every active job and wait for the runners to finish.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.lock().await;
            registry
                .by_seed
                .values_mut()
                .filter_map(|slot| {
                    if slot.is_active() {
                        slot.cancel.send_replace(true);
                    }
                    slot.task.take()
                })
                .collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "job runner ended abnormally");
            }
        }
    }
}
